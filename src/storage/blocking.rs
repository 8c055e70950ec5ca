use color_eyre::{eyre::eyre, Result};
use futures::future::BoxFuture;
use std::sync::Arc;

use super::traits::{AsyncPersistentStorage, PersistentStorage};

/// Runs a synchronous backend on tokio's blocking pool so it can be used as
/// an asynchronous one.
pub struct Blocking<S> {
  inner: Arc<S>,
}

impl<S: PersistentStorage + 'static> Blocking<S> {
  pub fn new(inner: S) -> Self {
    Self {
      inner: Arc::new(inner),
    }
  }

  fn run<T, F>(&self, op: F) -> BoxFuture<'static, Result<T>>
  where
    T: Send + 'static,
    F: FnOnce(&S) -> Result<T> + Send + 'static,
  {
    let inner = Arc::clone(&self.inner);
    Box::pin(async move {
      tokio::task::spawn_blocking(move || op(&inner))
        .await
        .map_err(|e| eyre!("Storage task failed: {}", e))?
    })
  }
}

impl<S: PersistentStorage + 'static> AsyncPersistentStorage for Blocking<S> {
  fn get_item<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<Option<String>>> {
    let key = key.to_string();
    self.run(move |s| s.get_item(&key))
  }

  fn set_item<'a>(&'a self, key: &'a str, value: &'a str) -> BoxFuture<'a, Result<()>> {
    let key = key.to_string();
    let value = value.to_string();
    self.run(move |s| s.set_item(&key, &value))
  }

  fn remove_item<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<()>> {
    let key = key.to_string();
    self.run(move |s| s.remove_item(&key))
  }

  fn keys(&self) -> BoxFuture<'_, Result<Vec<String>>> {
    self.run(|s| s.keys())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::storage::{adapter, SqliteStorage};
  use serde_json::json;

  #[tokio::test]
  async fn test_blocking_sqlite() {
    let storage = Blocking::new(SqliteStorage::open_in_memory().unwrap());
    adapter::set_async(&storage, "ns:", "/users", &json!([{"id": 1}])).await;

    assert_eq!(
      adapter::get_async(&storage, "ns:", "/users").await,
      Some(json!([{"id": 1}]))
    );
    assert_eq!(storage.keys().await.unwrap(), vec!["ns:/users".to_string()]);
  }
}
