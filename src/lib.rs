//! Cached queries and mutations over remote JSON endpoints.
//!
//! A [`Provider`] owns a shared [`CacheStore`](cache::CacheStore), a
//! [`Transport`] and an optional persistent [`Storage`] mirror. Queries
//! created from it read through the cache, show persisted data before the
//! network answers and refetch when a [`Mutation`] invalidates their
//! endpoint.
//!
//! ```ignore
//! let provider = Provider::builder()
//!   .base_url("https://api.example.com")
//!   .storage(Storage::sync(SqliteStorage::open()?))
//!   .build()
//!   .await?;
//!
//! let todos = provider.query("/todos", QueryOptions::default())?;
//! todos.mount().await;
//!
//! provider
//!   .mutation(MutationOptions::new("/todos").refetch(Refetch::endpoints(["/todos"])))
//!   .mutate(Some(MutationOverrides::default().body(json!({"title": "new"}))))
//!   .await?;
//! todos.sync().await;
//! ```

pub mod cache;
pub mod config;
pub mod endpoint;
pub mod error;
pub mod mutation;
pub mod provider;
pub mod query;
pub mod storage;
pub mod transport;

#[cfg(test)]
mod test_support;

pub use cache::{Generation, InvalidationTarget};
pub use endpoint::{build_url, interpolate, VariableValue, Variables};
pub use error::{Error, Result, TransportError};
pub use mutation::{Mutation, MutationOptions, MutationOverrides, MutationResult, Refetch};
pub use provider::{Provider, ProviderBuilder};
pub use query::{Accumulation, Query, QueryOptions, QueryResult, QueryStatus};
pub use storage::{MemoryStorage, SqliteStorage, Storage};
pub use transport::{FetchOptions, HttpTransport, Method, Request, Response, Transport};
