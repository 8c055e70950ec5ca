//! The provider: shared cache, transport and storage for a group of queries.

use color_eyre::eyre::eyre;
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use tracing::info;

use crate::cache::{CacheStore, Generation, InvalidationTarget};
use crate::config::{Config, StorageBackend, StorageMode};
use crate::endpoint::build_url;
use crate::error::{Error, Result};
use crate::mutation::{Mutation, MutationOptions};
use crate::query::{Query, QueryOptions};
use crate::storage::{Blocking, MemoryStorage, SqliteStorage, Storage, DEFAULT_NAMESPACE};
use crate::transport::{FetchOptions, HttpTransport, Transport};

struct ProviderInner {
  base_url: Option<String>,
  transport: Arc<dyn Transport>,
  storage: Option<Storage>,
  namespace: String,
  default_options: FetchOptions,
  store: Arc<CacheStore>,
}

/// Owns the state every query and mutation created from it shares.
///
/// Cloning is cheap and yields a handle to the same cache. Separate providers
/// never see each other's entries or invalidations.
#[derive(Clone)]
pub struct Provider {
  inner: Arc<ProviderInner>,
}

impl Provider {
  pub fn builder() -> ProviderBuilder {
    ProviderBuilder::default()
  }

  /// Build a provider from a loaded configuration file.
  pub async fn from_config(config: &Config) -> color_eyre::Result<Self> {
    let storage = match config.storage.backend {
      StorageBackend::None => None,
      StorageBackend::Memory => Some(match config.storage.mode {
        StorageMode::Sync => Storage::sync(MemoryStorage::new()),
        StorageMode::Async => Storage::asynchronous(MemoryStorage::new()),
      }),
      StorageBackend::Sqlite => {
        let sqlite = match &config.storage.path {
          Some(path) => SqliteStorage::open_at(path)?,
          None => SqliteStorage::open()?,
        };
        Some(match config.storage.mode {
          StorageMode::Sync => Storage::sync(sqlite),
          StorageMode::Async => Storage::asynchronous(Blocking::new(sqlite)),
        })
      }
    };

    let mut builder = Provider::builder()
      .namespace(config.namespace.clone())
      .clear_persistent_storage(config.storage.clear_on_start);
    if let Some(url) = &config.base_url {
      builder = builder.base_url(url.clone());
    }
    if let Some(storage) = storage {
      builder = builder.storage(storage);
    }
    for (name, value) in &config.headers {
      builder = builder.header(name.clone(), value.clone());
    }
    if let Some(token) = Config::get_api_token() {
      builder = builder.header("Authorization", format!("Bearer {}", token));
    }

    builder
      .build()
      .await
      .map_err(|e| eyre!("Failed to create provider: {}", e))
  }

  pub fn base_url(&self) -> Option<&str> {
    self.inner.base_url.as_deref()
  }

  /// Resolve an interpolated endpoint against this provider's base url.
  pub fn build_url(&self, endpoint: &str) -> Result<String> {
    build_url(endpoint, self.base_url())
  }

  pub fn store(&self) -> &Arc<CacheStore> {
    &self.inner.store
  }

  pub fn storage(&self) -> Option<&Storage> {
    self.inner.storage.as_ref()
  }

  pub fn namespace(&self) -> &str {
    &self.inner.namespace
  }

  pub(crate) fn transport(&self) -> &Arc<dyn Transport> {
    &self.inner.transport
  }

  pub(crate) fn default_options(&self) -> &FetchOptions {
    &self.inner.default_options
  }

  /// Create a query for `endpoint`. Fails only when no absolute url can be built.
  pub fn query(&self, endpoint: &str, options: QueryOptions) -> Result<Query> {
    Query::new(self.clone(), endpoint, options)
  }

  pub fn mutation(&self, options: MutationOptions) -> Mutation {
    Mutation::new(self.clone(), options)
  }

  /// Ask live queries matching `target` to refetch.
  pub fn invalidate(&self, target: InvalidationTarget) -> Generation {
    self.inner.store.invalidate(target)
  }

  /// Snapshot of every cached entry.
  pub fn data(&self) -> BTreeMap<String, Value> {
    self.inner.store.entries()
  }

  /// Overwrite one cache entry locally.
  pub fn set_data(&self, key: impl Into<String>, value: Value) {
    self.inner.store.set(key, value);
  }

  /// Remove every persisted record in this provider's namespace.
  pub async fn purge_persistent_storage(&self) -> usize {
    match &self.inner.storage {
      Some(storage) => storage.purge(&self.inner.namespace).await,
      None => 0,
    }
  }
}

impl fmt::Debug for Provider {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Provider")
      .field("base_url", &self.inner.base_url)
      .field("storage", &self.inner.storage)
      .field("namespace", &self.inner.namespace)
      .field("entries", &self.inner.store.len())
      .finish_non_exhaustive()
  }
}

/// Builder for [`Provider`].
pub struct ProviderBuilder {
  base_url: Option<String>,
  transport: Option<Arc<dyn Transport>>,
  storage: Option<Storage>,
  namespace: String,
  default_options: FetchOptions,
  clear_persistent_storage: bool,
}

impl Default for ProviderBuilder {
  fn default() -> Self {
    Self {
      base_url: None,
      transport: None,
      storage: None,
      namespace: DEFAULT_NAMESPACE.to_string(),
      default_options: FetchOptions::default(),
      clear_persistent_storage: false,
    }
  }
}

impl ProviderBuilder {
  pub fn base_url(mut self, url: impl Into<String>) -> Self {
    self.base_url = Some(url.into());
    self
  }

  /// Use a custom transport instead of the default HTTP one.
  pub fn transport(mut self, transport: impl Transport + 'static) -> Self {
    self.transport = Some(Arc::new(transport));
    self
  }

  pub fn storage(mut self, storage: Storage) -> Self {
    self.storage = Some(storage);
    self
  }

  /// Prefix of every persisted record key.
  pub fn namespace(mut self, namespace: impl Into<String>) -> Self {
    self.namespace = namespace.into();
    self
  }

  /// Header sent with every query and mutation request.
  pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
    self.default_options = self.default_options.header(name, value);
    self
  }

  /// Purge the namespace from storage when the provider is built.
  pub fn clear_persistent_storage(mut self, clear: bool) -> Self {
    self.clear_persistent_storage = clear;
    self
  }

  pub async fn build(self) -> Result<Provider> {
    let transport = match self.transport {
      Some(transport) => transport,
      None => Arc::new(HttpTransport::new().map_err(Error::from)?),
    };

    let provider = Provider {
      inner: Arc::new(ProviderInner {
        base_url: self.base_url,
        transport,
        storage: self.storage,
        namespace: self.namespace,
        default_options: self.default_options,
        store: Arc::new(CacheStore::new()),
      }),
    };

    if self.clear_persistent_storage {
      let removed = provider.purge_persistent_storage().await;
      info!(removed, namespace = provider.namespace(), "Cleared persistent storage");
    }

    Ok(provider)
  }
}
