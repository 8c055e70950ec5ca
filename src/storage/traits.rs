//! Persistence interfaces the engine can mirror its cache into.

use color_eyre::Result;
use futures::future::BoxFuture;
use std::fmt;
use std::sync::Arc;

/// A synchronous key/value store (e.g. SQLite, an in-memory map).
pub trait PersistentStorage: Send + Sync {
  fn get_item(&self, key: &str) -> Result<Option<String>>;

  fn set_item(&self, key: &str, value: &str) -> Result<()>;

  fn remove_item(&self, key: &str) -> Result<()>;

  /// Every key currently held, used for namespace purges.
  fn keys(&self) -> Result<Vec<String>>;
}

/// An asynchronous key/value store.
pub trait AsyncPersistentStorage: Send + Sync {
  fn get_item<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<Option<String>>>;

  fn set_item<'a>(&'a self, key: &'a str, value: &'a str) -> BoxFuture<'a, Result<()>>;

  fn remove_item<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<()>>;

  fn keys(&self) -> BoxFuture<'_, Result<Vec<String>>>;
}

/// The storage backend configured on a provider.
///
/// The variant decides whether records can be restored synchronously at query
/// construction or only once the query mounts.
#[derive(Clone)]
pub enum Storage {
  Sync(Arc<dyn PersistentStorage>),
  Async(Arc<dyn AsyncPersistentStorage>),
}

impl Storage {
  pub fn sync(storage: impl PersistentStorage + 'static) -> Self {
    Storage::Sync(Arc::new(storage))
  }

  pub fn asynchronous(storage: impl AsyncPersistentStorage + 'static) -> Self {
    Storage::Async(Arc::new(storage))
  }

  pub fn is_async(&self) -> bool {
    matches!(self, Storage::Async(_))
  }
}

impl fmt::Debug for Storage {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Storage::Sync(_) => f.write_str("Storage::Sync"),
      Storage::Async(_) => f.write_str("Storage::Async"),
    }
  }
}
