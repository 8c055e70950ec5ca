//! In-process storage backend.

use color_eyre::{eyre::eyre, Result};
use futures::future::{self, BoxFuture};
use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

use super::traits::{AsyncPersistentStorage, PersistentStorage};

/// A map-backed store usable both synchronously and asynchronously.
///
/// Contents live as long as the value does, which makes it a good fit for
/// tests and for sessions that should not leave anything on disk.
#[derive(Debug, Default)]
pub struct MemoryStorage {
  items: Mutex<BTreeMap<String, String>>,
}

impl MemoryStorage {
  pub fn new() -> Self {
    Self::default()
  }

  fn items(&self) -> Result<MutexGuard<'_, BTreeMap<String, String>>> {
    self
      .items
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))
  }
}

impl PersistentStorage for MemoryStorage {
  fn get_item(&self, key: &str) -> Result<Option<String>> {
    Ok(self.items()?.get(key).cloned())
  }

  fn set_item(&self, key: &str, value: &str) -> Result<()> {
    self.items()?.insert(key.to_string(), value.to_string());
    Ok(())
  }

  fn remove_item(&self, key: &str) -> Result<()> {
    self.items()?.remove(key);
    Ok(())
  }

  fn keys(&self) -> Result<Vec<String>> {
    Ok(self.items()?.keys().cloned().collect())
  }
}

impl AsyncPersistentStorage for MemoryStorage {
  fn get_item<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<Option<String>>> {
    Box::pin(future::ready(PersistentStorage::get_item(self, key)))
  }

  fn set_item<'a>(&'a self, key: &'a str, value: &'a str) -> BoxFuture<'a, Result<()>> {
    Box::pin(future::ready(PersistentStorage::set_item(self, key, value)))
  }

  fn remove_item<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<()>> {
    Box::pin(future::ready(PersistentStorage::remove_item(self, key)))
  }

  fn keys(&self) -> BoxFuture<'_, Result<Vec<String>>> {
    Box::pin(future::ready(PersistentStorage::keys(self)))
  }
}
