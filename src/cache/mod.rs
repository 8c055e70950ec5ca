//! Shared cache and invalidation broadcast.
//!
//! A [`CacheStore`] maps endpoint keys to their last known payload and owns
//! the generation token. Mutations call [`CacheStore::invalidate`]; every
//! live query holds a [`Subscription`] and decides whether the broadcast
//! targets its endpoint.

mod invalidation;
mod store;

pub use invalidation::{Generation, Invalidation, InvalidationTarget, Subscription};
pub use store::CacheStore;
