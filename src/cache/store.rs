//! The shared in-memory cache owned by a provider.

use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;
use tracing::debug;

use super::invalidation::{Generation, Invalidation, InvalidationTarget, Subscription};

#[derive(Debug, Default)]
struct StoreState {
  entries: HashMap<String, Value>,
  generation: Generation,
  pending: InvalidationTarget,
}

#[derive(Debug)]
struct Subscriber {
  endpoint: String,
  tx: mpsc::UnboundedSender<Invalidation>,
}

/// Endpoint key to last known payload, plus the invalidation protocol.
///
/// Entries are never evicted. Locks are only held for the duration of a
/// single read or write, never across an await point, so concurrent tasks
/// interleave at their suspension points and the last write wins.
#[derive(Debug, Default)]
pub struct CacheStore {
  state: Mutex<StoreState>,
  subscribers: Mutex<HashMap<u64, Subscriber>>,
  next_subscriber: AtomicU64,
}

impl CacheStore {
  pub fn new() -> Self {
    Self::default()
  }

  fn state(&self) -> MutexGuard<'_, StoreState> {
    self.state.lock().unwrap_or_else(PoisonError::into_inner)
  }

  fn subscribers(&self) -> MutexGuard<'_, HashMap<u64, Subscriber>> {
    self
      .subscribers
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
  }

  pub fn get(&self, key: &str) -> Option<Value> {
    self.state().entries.get(key).cloned()
  }

  pub fn contains(&self, key: &str) -> bool {
    self.state().entries.contains_key(key)
  }

  pub fn set(&self, key: impl Into<String>, value: Value) {
    self.state().entries.insert(key.into(), value);
  }

  /// Replace the entry for `key` with `f(current)` in one step.
  pub fn update<F>(&self, key: &str, f: F) -> Value
  where
    F: FnOnce(Option<&Value>) -> Value,
  {
    let mut state = self.state();
    let next = f(state.entries.get(key));
    state.entries.insert(key.to_string(), next.clone());
    next
  }

  pub fn remove(&self, key: &str) -> Option<Value> {
    self.state().entries.remove(key)
  }

  /// Snapshot of every entry.
  pub fn entries(&self) -> BTreeMap<String, Value> {
    self
      .state()
      .entries
      .iter()
      .map(|(k, v)| (k.clone(), v.clone()))
      .collect()
  }

  pub fn len(&self) -> usize {
    self.state().entries.len()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  pub fn generation(&self) -> Generation {
    self.state().generation
  }

  /// Endpoints still waiting to honor an invalidation.
  pub fn pending(&self) -> InvalidationTarget {
    self.state().pending.clone()
  }

  /// Bump the generation and notify every subscriber.
  ///
  /// `All` replaces whatever is pending. An explicit endpoint list is added
  /// to an explicit pending set, or replaces a pending `All`.
  pub fn invalidate(&self, target: InvalidationTarget) -> Generation {
    let invalidation = {
      let mut state = self.state();
      state.generation = state.generation.next();

      let pending = std::mem::take(&mut state.pending);
      state.pending = match (pending, &target) {
        (_, InvalidationTarget::All) => InvalidationTarget::All,
        (InvalidationTarget::Endpoints(mut current), InvalidationTarget::Endpoints(new)) => {
          current.extend(new.iter().cloned());
          InvalidationTarget::Endpoints(current)
        }
        (InvalidationTarget::All, InvalidationTarget::Endpoints(new)) => {
          InvalidationTarget::Endpoints(new.clone())
        }
      };

      Invalidation {
        generation: state.generation,
        target,
      }
    };

    let mut subscribers = self.subscribers();
    subscribers.retain(|_, sub| sub.tx.send(invalidation.clone()).is_ok());
    debug!(
      generation = ?invalidation.generation,
      target = ?invalidation.target,
      subscribers = subscribers.len(),
      "Broadcast invalidation"
    );

    invalidation.generation
  }

  /// Mark the invalidation for `key` as honored.
  pub fn acknowledge(&self, key: &str) {
    if let InvalidationTarget::Endpoints(set) = &mut self.state().pending {
      set.remove(key);
    }
  }

  /// Register for invalidation broadcasts.
  pub fn subscribe(self: &Arc<Self>, endpoint: impl Into<String>) -> Subscription {
    let id = self.next_subscriber.fetch_add(1, Ordering::Relaxed);
    let endpoint = endpoint.into();
    let (tx, rx) = mpsc::unbounded_channel();

    self.subscribers().insert(
      id,
      Subscriber {
        endpoint: endpoint.clone(),
        tx,
      },
    );
    debug!(id, endpoint = %endpoint, "Subscribed to invalidations");

    Subscription {
      id,
      endpoint,
      rx,
      store: Arc::downgrade(self),
    }
  }

  pub(crate) fn unsubscribe(&self, id: u64) {
    if let Some(sub) = self.subscribers().remove(&id) {
      debug!(id, endpoint = %sub.endpoint, "Unsubscribed from invalidations");
    }
  }

  pub fn subscriber_count(&self) -> usize {
    self.subscribers().len()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  #[test]
  fn test_get_set_remove() {
    let store = CacheStore::new();
    assert!(store.is_empty());

    store.set("/todos", json!([1]));
    assert_eq!(store.get("/todos"), Some(json!([1])));
    assert!(store.contains("/todos"));

    assert_eq!(store.remove("/todos"), Some(json!([1])));
    assert_eq!(store.get("/todos"), None);
  }

  #[test]
  fn test_update() {
    let store = CacheStore::new();
    let first = store.update("/n", |current| {
      assert!(current.is_none());
      json!(1)
    });
    assert_eq!(first, json!(1));

    let second = store.update("/n", |current| json!(current.and_then(Value::as_i64).unwrap() + 1));
    assert_eq!(second, json!(2));
    assert_eq!(store.get("/n"), Some(json!(2)));
  }

  #[test]
  fn test_generation_changes_on_invalidate() {
    let store = CacheStore::new();
    let before = store.generation();
    let after = store.invalidate(InvalidationTarget::All);
    assert_ne!(before, after);
    assert_eq!(store.generation(), after);
  }

  #[tokio::test]
  async fn test_every_subscriber_sees_each_bump_once() {
    let store = Arc::new(CacheStore::new());
    let mut a = store.subscribe("/a");
    let mut b = store.subscribe("/b");

    let g1 = store.invalidate(InvalidationTarget::endpoints(["/a"]));
    let g2 = store.invalidate(InvalidationTarget::All);

    for sub in [&mut a, &mut b] {
      let first = sub.recv().await.unwrap();
      assert_eq!(first.generation, g1);
      assert_eq!(first.target, InvalidationTarget::endpoints(["/a"]));
      let second = sub.recv().await.unwrap();
      assert_eq!(second.generation, g2);
      assert_eq!(second.target, InvalidationTarget::All);
      assert!(sub.try_recv().is_none());
    }
  }

  #[test]
  fn test_drop_unsubscribes() {
    let store = Arc::new(CacheStore::new());
    let sub = store.subscribe("/a");
    assert_eq!(sub.endpoint(), "/a");
    assert_eq!(store.subscriber_count(), 1);

    drop(sub);
    assert_eq!(store.subscriber_count(), 0);
    store.invalidate(InvalidationTarget::All);
  }

  #[test]
  fn test_pending_set() {
    let store = CacheStore::new();
    assert!(store.pending().is_empty());

    store.invalidate(InvalidationTarget::endpoints(["/a"]));
    store.invalidate(InvalidationTarget::endpoints(["/b"]));
    assert_eq!(store.pending(), InvalidationTarget::endpoints(["/a", "/b"]));

    store.acknowledge("/a");
    assert_eq!(store.pending(), InvalidationTarget::endpoints(["/b"]));

    store.invalidate(InvalidationTarget::All);
    store.acknowledge("/b");
    assert_eq!(store.pending(), InvalidationTarget::All);

    store.invalidate(InvalidationTarget::endpoints(["/c"]));
    assert_eq!(store.pending(), InvalidationTarget::endpoints(["/c"]));
  }

  #[test]
  fn test_stores_are_independent() {
    let one = CacheStore::new();
    let two = CacheStore::new();
    one.set("/x", json!(1));
    one.invalidate(InvalidationTarget::All);

    assert_eq!(two.get("/x"), None);
    assert_eq!(two.generation(), Generation::default());
  }
}
