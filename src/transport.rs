//! The request transport used by queries and mutations.
//!
//! Anything implementing [`Transport`] can perform requests for a provider.
//! Closures of the shape `Fn(Request) -> impl Future<Output = Result<Response,
//! TransportError>>` implement it directly, so applications can plug in their
//! own client and tests can count calls without a server.

use futures::future::BoxFuture;
use reqwest::header::{CONTENT_TYPE, USER_AGENT};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::str::FromStr;
use tracing::debug;

use crate::endpoint::Variables;
use crate::error::TransportError;

/// HTTP method of a request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Method {
  #[default]
  Get,
  Post,
  Put,
  Patch,
  Delete,
}

impl Method {
  pub fn as_str(&self) -> &'static str {
    match self {
      Method::Get => "GET",
      Method::Post => "POST",
      Method::Put => "PUT",
      Method::Patch => "PATCH",
      Method::Delete => "DELETE",
    }
  }
}

impl fmt::Display for Method {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

impl FromStr for Method {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s.to_ascii_uppercase().as_str() {
      "GET" => Ok(Method::Get),
      "POST" => Ok(Method::Post),
      "PUT" => Ok(Method::Put),
      "PATCH" => Ok(Method::Patch),
      "DELETE" => Ok(Method::Delete),
      other => Err(format!("Unsupported method: {}", other)),
    }
  }
}

impl From<Method> for reqwest::Method {
  fn from(method: Method) -> Self {
    match method {
      Method::Get => reqwest::Method::GET,
      Method::Post => reqwest::Method::POST,
      Method::Put => reqwest::Method::PUT,
      Method::Patch => reqwest::Method::PATCH,
      Method::Delete => reqwest::Method::DELETE,
    }
  }
}

/// Per-request options passed through to the transport.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FetchOptions {
  #[serde(default)]
  pub headers: BTreeMap<String, String>,
}

impl FetchOptions {
  pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
    self.headers.insert(name.into(), value.into());
    self
  }

  pub fn is_empty(&self) -> bool {
    self.headers.is_empty()
  }

  /// Combine two option sets; entries from `other` win.
  pub fn merged(&self, other: &FetchOptions) -> FetchOptions {
    let mut headers = self.headers.clone();
    headers.extend(other.headers.clone());
    FetchOptions { headers }
  }
}

/// A fully resolved request.
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
  pub url: String,
  pub method: Method,
  pub body: Option<Value>,
  pub options: FetchOptions,
  /// Variables the endpoint was interpolated with
  pub variables: Variables,
}

impl Request {
  pub fn get(url: impl Into<String>) -> Self {
    Self {
      url: url.into(),
      method: Method::Get,
      body: None,
      options: FetchOptions::default(),
      variables: Variables::default(),
    }
  }
}

/// Normalized transport response.
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
  pub data: Value,
}

impl Response {
  pub fn new(data: Value) -> Self {
    Self { data }
  }
}

/// Performs requests on behalf of queries and mutations.
pub trait Transport: Send + Sync {
  fn send(&self, request: Request) -> BoxFuture<'static, Result<Response, TransportError>>;
}

impl<F, Fut> Transport for F
where
  F: Fn(Request) -> Fut + Send + Sync,
  Fut: Future<Output = Result<Response, TransportError>> + Send + 'static,
{
  fn send(&self, request: Request) -> BoxFuture<'static, Result<Response, TransportError>> {
    Box::pin(self(request))
  }
}

/// Default transport: JSON over HTTP with reqwest.
///
/// Successful JSON responses become `data`; successful responses of any other
/// content type yield `null`. Non-success statuses fail with the response
/// body attached.
#[derive(Debug, Clone)]
pub struct HttpTransport {
  client: reqwest::Client,
}

impl HttpTransport {
  pub fn new() -> Result<Self, TransportError> {
    let client = reqwest::Client::builder()
      .build()
      .map_err(|e| TransportError::Network(format!("Failed to create HTTP client: {}", e)))?;

    Ok(Self::from_client(client))
  }

  /// Wrap an already configured reqwest client.
  pub fn from_client(client: reqwest::Client) -> Self {
    Self { client }
  }
}

impl Transport for HttpTransport {
  fn send(&self, request: Request) -> BoxFuture<'static, Result<Response, TransportError>> {
    let client = self.client.clone();

    Box::pin(async move {
      debug!(method = %request.method, url = %request.url, "Sending request");

      let mut builder = client
        .request(request.method.into(), &request.url)
        .header(USER_AGENT, concat!("netquery/", env!("CARGO_PKG_VERSION")));
      for (name, value) in &request.options.headers {
        builder = builder.header(name.as_str(), value.as_str());
      }
      if let Some(body) = &request.body {
        builder = builder
          .header(CONTENT_TYPE, "application/json")
          .body(body.to_string());
      }

      let response = builder
        .send()
        .await
        .map_err(|e| TransportError::Network(e.to_string()))?;

      let status = response.status();
      let is_json = response
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.contains("application/json"))
        .unwrap_or(false);

      let bytes = response
        .bytes()
        .await
        .map_err(|e| TransportError::Network(e.to_string()))?;

      if !status.is_success() {
        return Err(TransportError::Status {
          status: status.as_u16(),
          body: String::from_utf8_lossy(&bytes).into_owned(),
        });
      }

      if !is_json {
        return Ok(Response::new(Value::Null));
      }

      let data =
        serde_json::from_slice(&bytes).map_err(|e| TransportError::Decode(e.to_string()))?;
      Ok(Response::new(data))
    })
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;
  use tokio::io::{AsyncReadExt, AsyncWriteExt};
  use tokio::net::TcpListener;

  /// Serve a single canned HTTP response and return the base url.
  async fn serve_once(status_line: &'static str, content_type: &'static str, body: &'static str) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
      let (mut socket, _) = listener.accept().await.unwrap();
      let mut buf = [0u8; 4096];
      let _ = socket.read(&mut buf).await;
      let response = format!(
        "HTTP/1.1 {}\r\nContent-Type: {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        status_line,
        content_type,
        body.len(),
        body
      );
      socket.write_all(response.as_bytes()).await.unwrap();
      let _ = socket.shutdown().await;
    });

    format!("http://{}", addr)
  }

  fn local_transport() -> HttpTransport {
    let client = reqwest::Client::builder().no_proxy().build().unwrap();
    HttpTransport::from_client(client)
  }

  #[tokio::test]
  async fn test_closure_transport() {
    let transport = |request: Request| async move {
      Ok::<_, TransportError>(Response::new(json!({ "url": request.url })))
    };

    let response = transport.send(Request::get("http://x.dev/a")).await.unwrap();
    assert_eq!(response.data, json!({"url": "http://x.dev/a"}));
  }

  #[tokio::test]
  async fn test_http_json_response() {
    let base = serve_once("200 OK", "application/json; charset=utf-8", r#"{"id":7}"#).await;
    let transport = local_transport();

    let response = transport
      .send(Request::get(format!("{}/todos/7", base)))
      .await
      .unwrap();
    assert_eq!(response.data, json!({"id": 7}));
  }

  #[tokio::test]
  async fn test_http_non_json_response_is_null() {
    let base = serve_once("200 OK", "text/plain", "hello").await;
    let transport = local_transport();

    let response = transport.send(Request::get(base)).await.unwrap();
    assert_eq!(response.data, Value::Null);
  }

  #[tokio::test]
  async fn test_http_error_status() {
    let base = serve_once("404 Not Found", "application/json", r#"{"error":"missing"}"#).await;
    let transport = local_transport();

    let err = transport.send(Request::get(base)).await.unwrap_err();
    assert_eq!(
      err,
      TransportError::Status {
        status: 404,
        body: r#"{"error":"missing"}"#.to_string()
      }
    );
  }

  /// Answer one request with a JSON `body` and hand back the request head.
  async fn capture_request(body: &'static str) -> (String, tokio::sync::oneshot::Receiver<String>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (tx, rx) = tokio::sync::oneshot::channel();

    tokio::spawn(async move {
      let (mut socket, _) = listener.accept().await.unwrap();
      let mut buf = [0u8; 4096];
      let n = socket.read(&mut buf).await.unwrap();
      let _ = tx.send(String::from_utf8_lossy(&buf[..n]).into_owned());
      let response = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        body.len(),
        body
      );
      socket.write_all(response.as_bytes()).await.unwrap();
      let _ = socket.shutdown().await;
    });

    (format!("http://{}", addr), rx)
  }

  #[tokio::test]
  async fn test_http_sends_provider_headers() {
    let (base, head) = capture_request(r#"{"ok":true}"#).await;
    let provider = crate::provider::Provider::builder()
      .base_url(base)
      .transport(local_transport())
      .header("X-Client", "netquery")
      .build()
      .await
      .unwrap();

    let result = provider
      .query("/ping", crate::query::QueryOptions::default())
      .unwrap()
      .mount()
      .await;
    assert_eq!(result.data, Some(json!({"ok": true})));

    let head = head.await.unwrap().to_ascii_lowercase();
    assert!(head.starts_with("get /ping "));
    assert!(head.contains("x-client: netquery\r\n"));
  }

  #[test]
  fn test_fetch_options_merge() {
    let base = FetchOptions::default()
      .header("Accept", "application/json")
      .header("X-Trace", "1");
    let merged = base.merged(&FetchOptions::default().header("X-Trace", "2"));

    assert_eq!(merged.headers.get("Accept").map(String::as_str), Some("application/json"));
    assert_eq!(merged.headers.get("X-Trace").map(String::as_str), Some("2"));
  }

  #[test]
  fn test_method_parse() {
    assert_eq!("patch".parse::<Method>(), Ok(Method::Patch));
    assert!("TRACE".parse::<Method>().is_err());
  }
}
