//! Persistent mirror of the query cache.
//!
//! Successful responses are written here as namespaced JSON records and read
//! back when a query starts, so previously seen data can be shown before the
//! network answers (stale-while-revalidate).

pub mod adapter;
mod blocking;
mod memory;
mod sqlite;
mod traits;

pub use adapter::DEFAULT_NAMESPACE;
pub use blocking::Blocking;
pub use memory::MemoryStorage;
pub use sqlite::{SqliteStorage, StoredRecord};
pub use traits::{AsyncPersistentStorage, PersistentStorage, Storage};
