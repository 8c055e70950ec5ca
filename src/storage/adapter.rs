//! Namespaced JSON records on top of a [`PersistentStorage`] backend.
//!
//! Nothing in here fails towards the caller: a stale or corrupt mirror must
//! never stop a fresh network fetch. Backend errors are logged and dropped,
//! records that do not parse are deleted.

use serde_json::Value;
use tracing::{debug, warn};

use crate::error::Error;

use super::traits::{AsyncPersistentStorage, PersistentStorage, Storage};

/// Namespace used when a provider doesn't configure one.
pub const DEFAULT_NAMESPACE: &str = "netquery:";

/// Full storage key of the record for `key`.
pub fn record_key(prefix: &str, key: &str) -> String {
  format!("{}{}", prefix, key)
}

fn decode(record_key: &str, raw: &str) -> Result<Value, Error> {
  serde_json::from_str(raw).map_err(|e| Error::StorageCorrupt {
    key: record_key.to_string(),
    reason: e.to_string(),
  })
}

fn encode(record_key: &str, value: &Value) -> Option<String> {
  match serde_json::to_string(value) {
    Ok(raw) => Some(raw),
    Err(e) => {
      warn!(key = record_key, error = %e, "Failed to encode storage record");
      None
    }
  }
}

/// Read the record for `key`, deleting it when it is not valid JSON.
pub fn get_sync(store: &dyn PersistentStorage, prefix: &str, key: &str) -> Option<Value> {
  let record_key = record_key(prefix, key);
  let raw = match store.get_item(&record_key) {
    Ok(raw) => raw?,
    Err(e) => {
      warn!(key = %record_key, error = %e, "Failed to read storage record");
      return None;
    }
  };

  match decode(&record_key, &raw) {
    Ok(value) => Some(value),
    Err(e) => {
      warn!(error = %e, "Removing corrupt storage record");
      if let Err(e) = store.remove_item(&record_key) {
        warn!(key = %record_key, error = %e, "Failed to remove corrupt storage record");
      }
      None
    }
  }
}

/// Asynchronous counterpart of [`get_sync`].
pub async fn get_async(
  store: &dyn AsyncPersistentStorage,
  prefix: &str,
  key: &str,
) -> Option<Value> {
  let record_key = record_key(prefix, key);
  let raw = match store.get_item(&record_key).await {
    Ok(raw) => raw?,
    Err(e) => {
      warn!(key = %record_key, error = %e, "Failed to read storage record");
      return None;
    }
  };

  match decode(&record_key, &raw) {
    Ok(value) => Some(value),
    Err(e) => {
      warn!(error = %e, "Removing corrupt storage record");
      if let Err(e) = store.remove_item(&record_key).await {
        warn!(key = %record_key, error = %e, "Failed to remove corrupt storage record");
      }
      None
    }
  }
}

pub fn set_sync(store: &dyn PersistentStorage, prefix: &str, key: &str, value: &Value) {
  let record_key = record_key(prefix, key);
  let Some(raw) = encode(&record_key, value) else {
    return;
  };
  if let Err(e) = store.set_item(&record_key, &raw) {
    warn!(key = %record_key, error = %e, "Failed to write storage record");
  }
}

pub async fn set_async(store: &dyn AsyncPersistentStorage, prefix: &str, key: &str, value: &Value) {
  let record_key = record_key(prefix, key);
  let Some(raw) = encode(&record_key, value) else {
    return;
  };
  if let Err(e) = store.set_item(&record_key, &raw).await {
    warn!(key = %record_key, error = %e, "Failed to write storage record");
  }
}

/// Remove every key containing `prefix`. Returns how many were removed.
pub fn purge_namespace_sync(store: &dyn PersistentStorage, prefix: &str) -> usize {
  let keys = match store.keys() {
    Ok(keys) => keys,
    Err(e) => {
      warn!(error = %e, "Failed to list storage keys");
      return 0;
    }
  };

  keys
    .iter()
    .filter(|k| k.contains(prefix))
    .filter(|k| match store.remove_item(k) {
      Ok(()) => true,
      Err(e) => {
        warn!(key = %k, error = %e, "Failed to remove storage record");
        false
      }
    })
    .count()
}

pub async fn purge_namespace_async(store: &dyn AsyncPersistentStorage, prefix: &str) -> usize {
  let keys = match store.keys().await {
    Ok(keys) => keys,
    Err(e) => {
      warn!(error = %e, "Failed to list storage keys");
      return 0;
    }
  };

  let mut removed = 0;
  for key in keys.iter().filter(|k| k.contains(prefix)) {
    match store.remove_item(key).await {
      Ok(()) => removed += 1,
      Err(e) => warn!(key = %key, error = %e, "Failed to remove storage record"),
    }
  }
  removed
}

impl Storage {
  /// Synchronous read. Always `None` for asynchronous backends.
  pub fn read_sync(&self, prefix: &str, key: &str) -> Option<Value> {
    match self {
      Storage::Sync(store) => get_sync(store.as_ref(), prefix, key),
      Storage::Async(_) => None,
    }
  }

  pub async fn read(&self, prefix: &str, key: &str) -> Option<Value> {
    match self {
      Storage::Sync(store) => get_sync(store.as_ref(), prefix, key),
      Storage::Async(store) => get_async(store.as_ref(), prefix, key).await,
    }
  }

  pub async fn write(&self, prefix: &str, key: &str, value: &Value) {
    match self {
      Storage::Sync(store) => set_sync(store.as_ref(), prefix, key, value),
      Storage::Async(store) => set_async(store.as_ref(), prefix, key, value).await,
    }
  }

  pub async fn purge(&self, prefix: &str) -> usize {
    let removed = match self {
      Storage::Sync(store) => purge_namespace_sync(store.as_ref(), prefix),
      Storage::Async(store) => purge_namespace_async(store.as_ref(), prefix).await,
    };
    debug!(prefix, removed, "Purged storage namespace");
    removed
  }
}
