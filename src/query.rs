//! Query engine: cached reads of one endpoint.
//!
//! A [`Query`] resolves its endpoint once, shows whatever the cache or the
//! persistent mirror already knows, fetches in the background and keeps the
//! shared cache entry current. Mutations elsewhere can ask it to refetch
//! through the provider's invalidation broadcast.
//!
//! # Example
//!
//! ```ignore
//! let todos = provider.query(
//!   "/users/{{id}}/todos",
//!   QueryOptions::default().variable("id", 7),
//! )?;
//!
//! // Restore, then fetch
//! todos.mount().await;
//!
//! // Keep up with invalidations in the background
//! tokio::spawn({
//!   let todos = todos.clone();
//!   async move { todos.watch().await }
//! });
//!
//! match todos.snapshot().status {
//!   QueryStatus::Ready => render(todos.snapshot().data),
//!   QueryStatus::Error => render_error(),
//!   _ => render_spinner(),
//! }
//! ```

use serde::de::DeserializeOwned;
use serde_json::Value;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, warn};

use crate::cache::{Generation, Invalidation, Subscription};
use crate::endpoint::{interpolate, VariableValue, Variables};
use crate::error::{Result, TransportError};
use crate::provider::Provider;
use crate::transport::{FetchOptions, Method, Request};

/// Called once per completed fetch with its outcome.
pub type QueryCallback = Arc<dyn Fn(std::result::Result<&Value, &TransportError>) + Send + Sync>;

/// How a page from [`Query::load_more`] is combined with the cached value.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Accumulation {
  /// Concatenate sequences
  #[default]
  Append,
  /// Shallow-merge objects, page keys win
  Merge,
}

impl Accumulation {
  /// Combine `page` with the `current` cached value.
  ///
  /// A current value of the wrong shape is replaced by the page.
  pub fn combine(self, current: Option<&Value>, page: Value) -> Value {
    match (self, current) {
      (_, None) | (_, Some(Value::Null)) => page,
      (Accumulation::Append, Some(Value::Array(items))) => {
        let mut items = items.clone();
        match page {
          Value::Array(more) => items.extend(more),
          other => items.push(other),
        }
        Value::Array(items)
      }
      (Accumulation::Merge, Some(Value::Object(fields))) => match page {
        Value::Object(more) => {
          let mut fields = fields.clone();
          fields.extend(more);
          Value::Object(fields)
        }
        other => {
          warn!("Merge page is not an object, replacing cached value");
          other
        }
      },
      (strategy, Some(_)) => {
        warn!(?strategy, "Cached value does not match accumulation strategy, replacing it");
        page
      }
    }
  }
}

/// Options for a [`Query`].
#[derive(Clone, Default)]
pub struct QueryOptions {
  pub variables: Variables,
  pub fetch_options: FetchOptions,
  pub accumulation: Accumulation,
  /// Fetch on mount even when the cache already holds the endpoint
  pub force_fetch: bool,
  pub on_complete: Option<QueryCallback>,
}

impl QueryOptions {
  pub fn variables(mut self, variables: Variables) -> Self {
    self.variables = variables;
    self
  }

  pub fn variable(mut self, name: impl Into<String>, value: impl Into<VariableValue>) -> Self {
    self.variables.insert(name, value);
    self
  }

  pub fn fetch_options(mut self, options: FetchOptions) -> Self {
    self.fetch_options = options;
    self
  }

  pub fn accumulation(mut self, accumulation: Accumulation) -> Self {
    self.accumulation = accumulation;
    self
  }

  pub fn force_fetch(mut self, force: bool) -> Self {
    self.force_fetch = force;
    self
  }

  pub fn on_complete<F>(mut self, callback: F) -> Self
  where
    F: Fn(std::result::Result<&Value, &TransportError>) + Send + Sync + 'static,
  {
    self.on_complete = Some(Arc::new(callback));
    self
  }
}

impl fmt::Debug for QueryOptions {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("QueryOptions")
      .field("variables", &self.variables)
      .field("fetch_options", &self.fetch_options)
      .field("accumulation", &self.accumulation)
      .field("force_fetch", &self.force_fetch)
      .field("on_complete", &self.on_complete.is_some())
      .finish()
  }
}

/// Primary lifecycle state of a query
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryStatus {
  /// Nothing cached and no fetch started yet
  Idle,
  /// First fetch in flight with nothing to show
  Loading,
  /// Data is available
  Ready,
  /// The last fetch failed
  Error,
}

/// Snapshot of a query for the view layer.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryResult {
  pub status: QueryStatus,
  /// Current cache entry; kept after a failed refetch
  pub data: Option<Value>,
  pub error: Option<TransportError>,
  pub is_loading: bool,
  pub is_refetching: bool,
  pub is_loading_more: bool,
}

impl QueryResult {
  /// Deserialize the data into `T`.
  pub fn data_as<T: DeserializeOwned>(&self) -> Option<serde_json::Result<T>> {
    self.data.clone().map(serde_json::from_value)
  }
}

/// A page fetched through `load_more`, replayed on refetch.
#[derive(Debug, Clone)]
struct Page {
  key: String,
  url: String,
  variables: Variables,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FetchKind {
  Initial,
  Refetch,
}

#[derive(Debug)]
struct QueryState {
  status: QueryStatus,
  error: Option<TransportError>,
  is_refetching: bool,
  is_loading_more: bool,
  /// Set once `mount` has been called
  started: bool,
  /// Store generation when the first mount completed
  mounted_at: Option<Generation>,
  /// Whether the cache held the key before this query was created
  cache_hit: bool,
  pages: Vec<Page>,
}

struct QueryInner {
  provider: Provider,
  template: String,
  key: String,
  url: String,
  options: QueryOptions,
  state: Mutex<QueryState>,
  subscription: tokio::sync::Mutex<Subscription>,
}

/// Handle to a query. Clones share state.
#[derive(Clone)]
pub struct Query {
  inner: Arc<QueryInner>,
}

impl Query {
  /// Resolve the endpoint and seed state from the cache or synchronous storage.
  ///
  /// Fails with [`Error::InvalidUrl`](crate::Error::InvalidUrl) when the
  /// endpoint can't be made absolute. Nothing is fetched until [`mount`].
  ///
  /// [`mount`]: Query::mount
  pub fn new(provider: Provider, endpoint: &str, options: QueryOptions) -> Result<Self> {
    let key = interpolate(endpoint, &options.variables);
    let url = provider.build_url(&key)?;
    let store = provider.store();

    let cache_hit = store.contains(&key);
    let mut status = if cache_hit {
      QueryStatus::Ready
    } else {
      QueryStatus::Idle
    };

    if !cache_hit {
      let stored = provider
        .storage()
        .and_then(|s| s.read_sync(provider.namespace(), &key));
      if let Some(value) = stored {
        debug!(key = %key, "Seeded query from persistent storage");
        store.set(key.clone(), value);
        status = QueryStatus::Ready;
      }
    }

    let subscription = tokio::sync::Mutex::new(store.subscribe(key.clone()));

    Ok(Self {
      inner: Arc::new(QueryInner {
        template: endpoint.to_string(),
        key,
        url,
        options,
        state: Mutex::new(QueryState {
          status,
          error: None,
          is_refetching: false,
          is_loading_more: false,
          started: false,
          mounted_at: None,
          cache_hit,
          pages: Vec::new(),
        }),
        subscription,
        provider,
      }),
    })
  }

  fn state(&self) -> MutexGuard<'_, QueryState> {
    self
      .inner
      .state
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
  }

  /// The endpoint template this query was created with.
  pub fn endpoint(&self) -> &str {
    &self.inner.template
  }

  /// The interpolated endpoint, used as the cache key.
  pub fn key(&self) -> &str {
    &self.inner.key
  }

  pub fn url(&self) -> &str {
    &self.inner.url
  }

  /// True once the first [`mount`](Query::mount) has completed.
  pub fn is_mounted(&self) -> bool {
    self.state().mounted_at.is_some()
  }

  /// Current state plus the cache entry.
  pub fn snapshot(&self) -> QueryResult {
    let data = self.inner.provider.store().get(&self.inner.key);
    let state = self.state();
    QueryResult {
      status: state.status,
      data,
      error: state.error.clone(),
      is_loading: state.status == QueryStatus::Loading,
      is_refetching: state.is_refetching,
      is_loading_more: state.is_loading_more,
    }
  }

  pub fn data(&self) -> Option<Value> {
    self.inner.provider.store().get(&self.inner.key)
  }

  /// Start the query.
  ///
  /// Restores from asynchronous storage if configured, then fetches unless
  /// the cache already held this endpoint when the query was created. Only
  /// the first call does anything.
  ///
  /// Invalidations issued before the initial fetch finishes are not honored.
  pub async fn mount(&self) -> QueryResult {
    let fetch_needed = {
      let mut state = self.state();
      if state.started {
        None
      } else {
        state.started = true;
        Some(self.inner.options.force_fetch || !state.cache_hit)
      }
    };
    let Some(fetch_needed) = fetch_needed else {
      return self.snapshot();
    };

    if let Some(storage) = self.inner.provider.storage().filter(|s| s.is_async()) {
      let store = self.inner.provider.store();
      if !store.contains(&self.inner.key) {
        if let Some(value) = storage
          .read(self.inner.provider.namespace(), &self.inner.key)
          .await
        {
          debug!(key = %self.inner.key, "Restored query from persistent storage");
          store.update(&self.inner.key, |current| current.cloned().unwrap_or(value));
          let mut state = self.state();
          if matches!(state.status, QueryStatus::Idle | QueryStatus::Loading) {
            state.status = QueryStatus::Ready;
          }
        }
      }
    }

    if fetch_needed {
      self.run_fetch(FetchKind::Initial).await;
    }

    let generation = self.inner.provider.store().generation();
    self.state().mounted_at = Some(generation);
    self.snapshot()
  }

  /// Fetch the endpoint and overwrite the cache entry.
  pub async fn fetch(&self) -> QueryResult {
    self.run_fetch(FetchKind::Initial).await;
    self.snapshot()
  }

  /// Fetch again in the background, then replay every page loaded with
  /// [`load_more`](Query::load_more). Returns the fresh first page.
  pub async fn refetch(&self) -> Option<Value> {
    self.revalidate().await
  }

  /// Load another page and combine it with the cached value.
  ///
  /// `endpoint` is interpolated with the query's variables overlaid by
  /// `extra_variables`. A persisted copy of the page is shown first when one
  /// exists. Returns the fetched page, or `None` if the request failed.
  pub async fn load_more(
    &self,
    endpoint: &str,
    extra_variables: &Variables,
  ) -> Result<Option<Value>> {
    let variables = self.inner.options.variables.merged(extra_variables);
    let key = interpolate(endpoint, &variables);
    let url = self.inner.provider.build_url(&key)?;
    let page = Page {
      key,
      url,
      variables,
    };

    self.state().is_loading_more = true;
    let result = self.load_page(&page, true).await;

    let mut state = self.state();
    state.is_loading_more = false;
    if result.is_some() && !state.pages.iter().any(|p| p.key == page.key) {
      state.pages.push(page);
    }

    Ok(result)
  }

  /// Overwrite the cache entry locally, without touching network or storage.
  pub fn set_data(&self, value: Value) {
    self.inner.provider.store().set(self.inner.key.clone(), value);
    let mut state = self.state();
    if state.status == QueryStatus::Idle {
      state.status = QueryStatus::Ready;
    }
  }

  /// Honor every invalidation queued since the last call.
  ///
  /// Several queued generations that target this query cause a single
  /// refetch. Returns whether a refetch happened.
  ///
  /// `sync` and [`watch`](Query::watch) are exclusive: while a watcher owns
  /// the subscription this returns `false` right away and the watcher
  /// handles the invalidations.
  pub async fn sync(&self) -> bool {
    let mut applies = false;
    {
      let Ok(mut subscription) = self.inner.subscription.try_lock() else {
        return false;
      };
      while let Some(invalidation) = subscription.try_recv() {
        applies |= self.targets_me(&invalidation);
      }
    }

    if applies {
      self.honor().await;
    }
    applies
  }

  /// Honor invalidations as they arrive. Runs until its task is aborted or
  /// the cache store goes away.
  pub async fn watch(&self) {
    loop {
      let next = self.inner.subscription.lock().await.recv().await;
      let Some(invalidation) = next else {
        break;
      };
      if self.targets_me(&invalidation) {
        self.honor().await;
      }
    }
  }

  fn targets_me(&self, invalidation: &Invalidation) -> bool {
    let Some(mounted_at) = self.state().mounted_at else {
      return false;
    };
    invalidation.generation > mounted_at
      && (invalidation.target.includes(&self.inner.template)
        || invalidation.target.includes(&self.inner.key))
  }

  async fn honor(&self) {
    debug!(key = %self.inner.key, "Refetching after invalidation");
    self.revalidate().await;

    let store = self.inner.provider.store();
    store.acknowledge(&self.inner.template);
    store.acknowledge(&self.inner.key);
  }

  async fn revalidate(&self) -> Option<Value> {
    let data = self.run_fetch(FetchKind::Refetch).await?;

    let pages = self.state().pages.clone();
    if !pages.is_empty() {
      self.state().is_loading_more = true;
      for page in &pages {
        self.load_page(page, false).await;
      }
      self.state().is_loading_more = false;
    }

    Some(data)
  }

  async fn run_fetch(&self, kind: FetchKind) -> Option<Value> {
    {
      let mut state = self.state();
      match kind {
        FetchKind::Initial => {
          if state.status != QueryStatus::Ready {
            state.status = QueryStatus::Loading;
          }
        }
        FetchKind::Refetch => state.is_refetching = true,
      }
    }

    let provider = &self.inner.provider;
    let result = self
      .request(&self.inner.url, &self.inner.options.variables)
      .await;

    let outcome = match result {
      Ok(data) => {
        provider.store().set(self.inner.key.clone(), data.clone());
        if let Some(storage) = provider.storage() {
          storage
            .write(provider.namespace(), &self.inner.key, &data)
            .await;
        }
        debug!(key = %self.inner.key, "Query fetch succeeded");
        Ok(data)
      }
      Err(e) => {
        warn!(key = %self.inner.key, error = %e, "Query fetch failed");
        Err(e)
      }
    };

    {
      let mut state = self.state();
      if kind == FetchKind::Refetch {
        state.is_refetching = false;
      }
      match &outcome {
        Ok(_) => {
          state.status = QueryStatus::Ready;
          state.error = None;
        }
        Err(e) => {
          state.status = QueryStatus::Error;
          state.error = Some(e.clone());
        }
      }
    }

    if let Some(callback) = &self.inner.options.on_complete {
      callback(outcome.as_ref());
    }

    outcome.ok()
  }

  async fn load_page(&self, page: &Page, surface_stored: bool) -> Option<Value> {
    let provider = &self.inner.provider;
    let store = provider.store();
    let strategy = self.inner.options.accumulation;

    // Show a previously persisted copy of the page until the network answers
    let mut provisional: Option<(Option<Value>, Value)> = None;
    if surface_stored {
      if let Some(storage) = provider.storage() {
        if let Some(stored) = storage.read(provider.namespace(), &page.key).await {
          let mut base = None;
          let shown = store.update(&self.inner.key, |current| {
            base = current.cloned();
            strategy.combine(current, stored)
          });
          provisional = Some((base, shown));
        }
      }
    }

    match self.request(&page.url, &page.variables).await {
      Ok(data) => {
        store.update(&self.inner.key, |current| match &provisional {
          Some((base, shown)) if current == Some(shown) => {
            strategy.combine(base.as_ref(), data.clone())
          }
          _ => strategy.combine(current, data.clone()),
        });
        if let Some(storage) = provider.storage() {
          storage.write(provider.namespace(), &page.key, &data).await;
        }
        debug!(key = %self.inner.key, page = %page.key, "Loaded page");
        Some(data)
      }
      Err(e) => {
        warn!(key = %self.inner.key, page = %page.key, error = %e, "Loading page failed");
        self.state().error = Some(e);
        None
      }
    }
  }

  async fn request(
    &self,
    url: &str,
    variables: &Variables,
  ) -> std::result::Result<Value, TransportError> {
    let provider = &self.inner.provider;
    let request = Request {
      url: url.to_string(),
      method: Method::Get,
      body: None,
      options: provider
        .default_options()
        .merged(&self.inner.options.fetch_options),
      variables: variables.clone(),
    };

    provider
      .transport()
      .send(request)
      .await
      .map(|response| response.data)
  }
}

impl fmt::Debug for Query {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Query")
      .field("endpoint", &self.inner.template)
      .field("key", &self.inner.key)
      .field("url", &self.inner.url)
      .field("state", &*self.state())
      .finish_non_exhaustive()
  }
}
