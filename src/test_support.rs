//! In-process fake server for engine tests.

use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::error::TransportError;
use crate::provider::{Provider, ProviderBuilder};
use crate::storage::Storage;
use crate::transport::{Request, Response, Transport};

pub const BASE_URL: &str = "http://api.test";

#[derive(Clone, Default)]
pub struct FakeServer {
  routes: Arc<Mutex<HashMap<String, Result<Value, TransportError>>>>,
  requests: Arc<Mutex<Vec<Request>>>,
}

impl FakeServer {
  /// Answer requests to `path` (relative to [`BASE_URL`]) with `data`.
  pub fn route(&self, path: &str, data: Value) {
    self
      .routes
      .lock()
      .unwrap()
      .insert(format!("{}{}", BASE_URL, path), Ok(data));
  }

  pub fn fail(&self, path: &str, error: TransportError) {
    self
      .routes
      .lock()
      .unwrap()
      .insert(format!("{}{}", BASE_URL, path), Err(error));
  }

  pub fn calls_to(&self, path: &str) -> usize {
    let url = format!("{}{}", BASE_URL, path);
    self
      .requests
      .lock()
      .unwrap()
      .iter()
      .filter(|r| r.url == url)
      .count()
  }

  pub fn requests(&self) -> Vec<Request> {
    self.requests.lock().unwrap().clone()
  }

  fn handle(&self, request: Request) -> Result<Response, TransportError> {
    let outcome = self.routes.lock().unwrap().get(&request.url).cloned();
    self.requests.lock().unwrap().push(request);
    match outcome {
      Some(result) => result.map(Response::new),
      None => Err(TransportError::Status {
        status: 404,
        body: "not found".to_string(),
      }),
    }
  }

  pub fn transport(&self) -> impl Transport + 'static {
    let server = self.clone();
    move |request: Request| {
      let server = server.clone();
      async move { server.handle(request) }
    }
  }

  pub fn provider_builder(&self) -> ProviderBuilder {
    Provider::builder().transport(self.transport())
  }

  pub async fn provider(&self, storage: Option<Storage>) -> Provider {
    let mut builder = self.provider_builder().base_url(BASE_URL);
    if let Some(storage) = storage {
      builder = builder.storage(storage);
    }
    builder.build().await.unwrap()
  }
}
