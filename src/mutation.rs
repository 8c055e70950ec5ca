//! Mutation engine: writes that can trigger refetches.

use serde_json::Value;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, warn};

use crate::cache::InvalidationTarget;
use crate::endpoint::{interpolate, VariableValue, Variables};
use crate::error::{Result, TransportError};
use crate::provider::Provider;
use crate::transport::{FetchOptions, Method, Request};

/// Called once per completed mutation with its outcome.
pub type MutationCallback =
  Arc<dyn Fn(std::result::Result<&Value, &TransportError>) + Send + Sync>;

/// Which queries to refetch after a successful mutation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum Refetch {
  #[default]
  None,
  All,
  /// Endpoint templates or interpolated keys
  Endpoints(Vec<String>),
}

impl Refetch {
  pub fn endpoints<I, S>(endpoints: I) -> Self
  where
    I: IntoIterator<Item = S>,
    S: Into<String>,
  {
    Refetch::Endpoints(endpoints.into_iter().map(Into::into).collect())
  }

  fn target(&self) -> Option<InvalidationTarget> {
    match self {
      Refetch::None => None,
      Refetch::All => Some(InvalidationTarget::All),
      Refetch::Endpoints(endpoints) => Some(InvalidationTarget::endpoints(endpoints.iter().cloned())),
    }
  }
}

/// Base configuration of a [`Mutation`].
#[derive(Clone)]
pub struct MutationOptions {
  pub endpoint: String,
  pub method: Method,
  pub body: Option<Value>,
  pub variables: Variables,
  pub fetch_options: FetchOptions,
  pub refetch: Refetch,
  pub on_complete: Option<MutationCallback>,
}

impl MutationOptions {
  /// A `POST` to `endpoint` with no body.
  pub fn new(endpoint: impl Into<String>) -> Self {
    Self {
      endpoint: endpoint.into(),
      method: Method::Post,
      body: None,
      variables: Variables::default(),
      fetch_options: FetchOptions::default(),
      refetch: Refetch::None,
      on_complete: None,
    }
  }

  pub fn method(mut self, method: Method) -> Self {
    self.method = method;
    self
  }

  pub fn body(mut self, body: Value) -> Self {
    self.body = Some(body);
    self
  }

  pub fn variable(mut self, name: impl Into<String>, value: impl Into<VariableValue>) -> Self {
    self.variables.insert(name, value);
    self
  }

  pub fn variables(mut self, variables: Variables) -> Self {
    self.variables = variables;
    self
  }

  pub fn fetch_options(mut self, options: FetchOptions) -> Self {
    self.fetch_options = options;
    self
  }

  pub fn refetch(mut self, refetch: Refetch) -> Self {
    self.refetch = refetch;
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

impl fmt::Debug for MutationOptions {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("MutationOptions")
      .field("endpoint", &self.endpoint)
      .field("method", &self.method)
      .field("body", &self.body)
      .field("variables", &self.variables)
      .field("refetch", &self.refetch)
      .finish_non_exhaustive()
  }
}

/// Per-call overrides; each field set here replaces the base value.
#[derive(Debug, Clone, Default)]
pub struct MutationOverrides {
  pub endpoint: Option<String>,
  pub method: Option<Method>,
  pub body: Option<Value>,
  pub variables: Option<Variables>,
  /// Merged over the base fetch options
  pub fetch_options: Option<FetchOptions>,
}

impl MutationOverrides {
  pub fn endpoint(mut self, endpoint: impl Into<String>) -> Self {
    self.endpoint = Some(endpoint.into());
    self
  }

  pub fn method(mut self, method: Method) -> Self {
    self.method = Some(method);
    self
  }

  pub fn body(mut self, body: Value) -> Self {
    self.body = Some(body);
    self
  }

  pub fn variables(mut self, variables: Variables) -> Self {
    self.variables = Some(variables);
    self
  }

  pub fn fetch_options(mut self, options: FetchOptions) -> Self {
    self.fetch_options = Some(options);
    self
  }
}

/// Snapshot of a mutation for the view layer.
#[derive(Debug, Clone, PartialEq)]
pub struct MutationResult {
  pub is_mutating: bool,
  pub error: Option<TransportError>,
}

struct MutationInner {
  provider: Provider,
  options: MutationOptions,
  in_flight: AtomicUsize,
  error: Mutex<Option<TransportError>>,
}

/// Handle to a mutation. Clones share state.
///
/// Calls are not serialized: a second `mutate` may start while the first is
/// still in flight.
#[derive(Clone)]
pub struct Mutation {
  inner: Arc<MutationInner>,
}

/// Counts a call as in flight until dropped.
struct InFlight<'a>(&'a AtomicUsize);

impl<'a> InFlight<'a> {
  fn enter(counter: &'a AtomicUsize) -> Self {
    counter.fetch_add(1, Ordering::SeqCst);
    Self(counter)
  }
}

impl Drop for InFlight<'_> {
  fn drop(&mut self) {
    self.0.fetch_sub(1, Ordering::SeqCst);
  }
}

impl Mutation {
  pub fn new(provider: Provider, options: MutationOptions) -> Self {
    Self {
      inner: Arc::new(MutationInner {
        provider,
        options,
        in_flight: AtomicUsize::new(0),
        error: Mutex::new(None),
      }),
    }
  }

  fn error_slot(&self) -> MutexGuard<'_, Option<TransportError>> {
    self
      .inner
      .error
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
  }

  pub fn is_mutating(&self) -> bool {
    self.inner.in_flight.load(Ordering::SeqCst) > 0
  }

  /// Error of the most recent failed call, cleared by a successful one.
  pub fn error(&self) -> Option<TransportError> {
    self.error_slot().clone()
  }

  pub fn snapshot(&self) -> MutationResult {
    MutationResult {
      is_mutating: self.is_mutating(),
      error: self.error(),
    }
  }

  /// Perform the mutation.
  ///
  /// Only an unusable url is returned as `Err`. A transport failure is
  /// recorded in [`error`](Mutation::error), reported to the callback and
  /// yields `Ok(None)`; the cache is left untouched in that case.
  pub async fn mutate(&self, overrides: Option<MutationOverrides>) -> Result<Option<Value>> {
    let base = &self.inner.options;
    let provider = &self.inner.provider;
    let overrides = overrides.unwrap_or_default();

    let endpoint = overrides.endpoint.as_deref().unwrap_or(&base.endpoint);
    let variables = overrides.variables.unwrap_or_else(|| base.variables.clone());
    let key = interpolate(endpoint, &variables);
    let url = provider.build_url(&key)?;

    let mut options = provider.default_options().merged(&base.fetch_options);
    if let Some(extra) = &overrides.fetch_options {
      options = options.merged(extra);
    }

    let request = Request {
      url,
      method: overrides.method.unwrap_or(base.method),
      body: overrides.body.or_else(|| base.body.clone()),
      options,
      variables,
    };

    let _in_flight = InFlight::enter(&self.inner.in_flight);
    debug!(method = %request.method, key = %key, "Mutating");

    match provider.transport().send(request).await {
      Ok(response) => {
        *self.error_slot() = None;
        if let Some(target) = base.refetch.target() {
          provider.invalidate(target);
        }
        if let Some(callback) = &base.on_complete {
          callback(Ok(&response.data));
        }
        Ok(Some(response.data))
      }
      Err(e) => {
        warn!(key = %key, error = %e, "Mutation failed");
        if let Some(callback) = &base.on_complete {
          callback(Err(&e));
        }
        *self.error_slot() = Some(e);
        Ok(None)
      }
    }
  }
}

impl fmt::Debug for Mutation {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Mutation")
      .field("options", &self.inner.options)
      .field("in_flight", &self.inner.in_flight.load(Ordering::SeqCst))
      .finish_non_exhaustive()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::error::Error;
  use crate::query::QueryOptions;
  use crate::test_support::FakeServer;
  use crate::transport::Response;
  use serde_json::json;
  use tokio::sync::Notify;

  #[tokio::test]
  async fn test_mutate_sends_base_options() {
    let server = FakeServer::default();
    server.route("/todos", json!({"id": 9}));
    let provider = server.provider(None).await;

    let completions = Arc::new(Mutex::new(Vec::new()));
    let seen = completions.clone();
    let mutation = provider.mutation(
      MutationOptions::new("/todos")
        .body(json!({"title": "write tests"}))
        .on_complete(move |outcome| seen.lock().unwrap().push(outcome.ok().cloned())),
    );

    let generation = provider.store().generation();
    let data = mutation.mutate(None).await.unwrap();

    assert_eq!(data, Some(json!({"id": 9})));
    assert_eq!(*completions.lock().unwrap(), vec![Some(json!({"id": 9}))]);
    // No refetch requested, so nothing is invalidated
    assert_eq!(provider.store().generation(), generation);

    let request = &server.requests()[0];
    assert_eq!(request.url, "http://api.test/todos");
    assert_eq!(request.method, Method::Post);
    assert_eq!(request.body, Some(json!({"title": "write tests"})));
  }

  #[tokio::test]
  async fn test_overrides_replace_fields() {
    let server = FakeServer::default();
    server.route("/todos/3", json!(null));
    let provider = server
      .provider_builder()
      .base_url("http://api.test")
      .header("X-Client", "netquery")
      .build()
      .await
      .unwrap();

    let mutation = provider.mutation(
      MutationOptions::new("/todos/{{id}}")
        .variable("id", 1)
        .body(json!({"done": false}))
        .fetch_options(FetchOptions::default().header("X-Base", "1")),
    );

    let overrides = MutationOverrides::default()
      .method(Method::Delete)
      .variables(Variables::new().with("id", 3))
      .fetch_options(FetchOptions::default().header("X-Call", "2"));
    mutation.mutate(Some(overrides)).await.unwrap();

    let request = &server.requests()[0];
    assert_eq!(request.url, "http://api.test/todos/3");
    assert_eq!(request.method, Method::Delete);
    // Not overridden, so the base body is kept
    assert_eq!(request.body, Some(json!({"done": false})));
    assert_eq!(request.variables, Variables::new().with("id", 3));
    assert_eq!(request.options.headers.get("X-Client").map(String::as_str), Some("netquery"));
    assert_eq!(request.options.headers.get("X-Base").map(String::as_str), Some("1"));
    assert_eq!(request.options.headers.get("X-Call").map(String::as_str), Some("2"));
  }

  #[tokio::test]
  async fn test_endpoint_override() {
    let server = FakeServer::default();
    server.route("/archive", json!({"archived": true}));
    let provider = server.provider(None).await;

    let mutation = provider.mutation(MutationOptions::new("/todos"));
    let data = mutation
      .mutate(Some(MutationOverrides::default().endpoint("/archive")))
      .await
      .unwrap();

    assert_eq!(data, Some(json!({"archived": true})));
    assert_eq!(server.calls_to("/todos"), 0);
  }

  #[tokio::test]
  async fn test_refetch_list_invalidates_targets() {
    let server = FakeServer::default();
    server.route("/todos", json!({}));
    let provider = server.provider(None).await;

    let mutation = provider.mutation(
      MutationOptions::new("/todos").refetch(Refetch::endpoints(["/todos", "/stats"])),
    );
    let before = provider.store().generation();
    mutation.mutate(None).await.unwrap();

    assert_ne!(provider.store().generation(), before);
    assert_eq!(
      provider.store().pending(),
      InvalidationTarget::endpoints(["/stats", "/todos"])
    );
  }

  #[tokio::test]
  async fn test_failure_is_captured() {
    let server = FakeServer::default();
    server.fail(
      "/todos",
      TransportError::Status {
        status: 422,
        body: "title missing".to_string(),
      },
    );
    let provider = server.provider(None).await;

    let failures = Arc::new(AtomicUsize::new(0));
    let counter = failures.clone();
    let mutation = provider.mutation(
      MutationOptions::new("/todos")
        .refetch(Refetch::All)
        .on_complete(move |outcome| {
          if outcome.is_err() {
            counter.fetch_add(1, Ordering::SeqCst);
          }
        }),
    );

    let before = provider.store().generation();
    let data = mutation.mutate(None).await.unwrap();

    assert_eq!(data, None);
    assert!(matches!(
      mutation.error(),
      Some(TransportError::Status { status: 422, .. })
    ));
    assert_eq!(failures.load(Ordering::SeqCst), 1);
    // A failed write invalidates nothing
    assert_eq!(provider.store().generation(), before);
    assert!(provider.store().pending().is_empty());

    // The next successful call clears the error
    server.route("/todos", json!({"id": 1}));
    mutation.mutate(None).await.unwrap();
    assert_eq!(mutation.snapshot(), MutationResult { is_mutating: false, error: None });
  }

  #[tokio::test]
  async fn test_invalid_url() {
    let server = FakeServer::default();
    let provider = server.provider_builder().build().await.unwrap();

    let mutation = provider.mutation(MutationOptions::new("/todos"));
    let err = mutation.mutate(None).await.unwrap_err();

    assert!(matches!(err, Error::InvalidUrl { .. }));
    assert!(!mutation.is_mutating());
    assert!(server.requests().is_empty());
  }

  #[tokio::test]
  async fn test_is_mutating_while_in_flight() {
    let gate = Arc::new(Notify::new());
    let transport = {
      let gate = gate.clone();
      move |_request: Request| {
        let gate = gate.clone();
        async move {
          gate.notified().await;
          Ok::<_, TransportError>(Response::new(json!({"ok": true})))
        }
      }
    };
    let provider = Provider::builder()
      .base_url("http://api.test")
      .transport(transport)
      .build()
      .await
      .unwrap();

    let mutation = provider.mutation(MutationOptions::new("/slow"));
    assert!(!mutation.is_mutating());

    let task = tokio::spawn({
      let mutation = mutation.clone();
      async move { mutation.mutate(None).await }
    });
    while !mutation.is_mutating() {
      tokio::task::yield_now().await;
    }

    gate.notify_one();
    let data = task.await.unwrap().unwrap();

    assert_eq!(data, Some(json!({"ok": true})));
    assert!(!mutation.is_mutating());
  }

  #[tokio::test]
  async fn test_refetch_reaches_mounted_queries() {
    let server = FakeServer::default();
    server.route("/todos", json!([]));
    server.route("/todos/new", json!({"id": 1}));
    let provider = server.provider(None).await;

    let todos = provider.query("/todos", QueryOptions::default()).unwrap();
    todos.mount().await;

    server.route("/todos", json!([{"id": 1}]));
    provider
      .mutation(MutationOptions::new("/todos/new").refetch(Refetch::endpoints(["/todos"])))
      .mutate(None)
      .await
      .unwrap();

    assert!(todos.sync().await);
    assert_eq!(todos.data(), Some(json!([{"id": 1}])));
  }
}
