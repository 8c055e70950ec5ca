//! Invalidation broadcast types.

use std::collections::BTreeSet;
use std::sync::Weak;
use tokio::sync::mpsc;

use super::store::CacheStore;

/// Opaque token that changes on every invalidation request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Generation(u64);

impl Generation {
  pub(crate) fn next(self) -> Self {
    Generation(self.0.wrapping_add(1))
  }
}

/// Which endpoints an invalidation applies to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InvalidationTarget {
  /// Every endpoint
  All,
  /// Only these endpoint templates or keys
  Endpoints(BTreeSet<String>),
}

impl InvalidationTarget {
  pub fn endpoints<I, S>(endpoints: I) -> Self
  where
    I: IntoIterator<Item = S>,
    S: Into<String>,
  {
    InvalidationTarget::Endpoints(endpoints.into_iter().map(Into::into).collect())
  }

  pub fn includes(&self, endpoint: &str) -> bool {
    match self {
      InvalidationTarget::All => true,
      InvalidationTarget::Endpoints(set) => set.contains(endpoint),
    }
  }

  /// True when nothing is targeted.
  pub fn is_empty(&self) -> bool {
    matches!(self, InvalidationTarget::Endpoints(set) if set.is_empty())
  }
}

impl Default for InvalidationTarget {
  fn default() -> Self {
    InvalidationTarget::Endpoints(BTreeSet::new())
  }
}

/// One generation bump, as delivered to each subscriber.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invalidation {
  pub generation: Generation,
  pub target: InvalidationTarget,
}

/// A live registration on a [`CacheStore`].
///
/// Every invalidation issued while the subscription is alive is queued here
/// exactly once. Dropping the subscription unregisters it.
#[derive(Debug)]
pub struct Subscription {
  pub(crate) id: u64,
  pub(crate) endpoint: String,
  pub(crate) rx: mpsc::UnboundedReceiver<Invalidation>,
  pub(crate) store: Weak<CacheStore>,
}

impl Subscription {
  /// The endpoint key this subscription was registered for.
  pub fn endpoint(&self) -> &str {
    &self.endpoint
  }

  /// Wait for the next invalidation. `None` once the store is gone.
  pub async fn recv(&mut self) -> Option<Invalidation> {
    self.rx.recv().await
  }

  /// Take the next queued invalidation without waiting.
  pub fn try_recv(&mut self) -> Option<Invalidation> {
    self.rx.try_recv().ok()
  }
}

impl Drop for Subscription {
  fn drop(&mut self) {
    if let Some(store) = self.store.upgrade() {
      store.unsubscribe(self.id);
    }
  }
}
