//! Error taxonomy for the query engine.
//!
//! Only [`Error::InvalidUrl`] ever crosses an engine boundary as an `Err`.
//! Transport failures are captured into query/mutation state and corrupt
//! storage records are repaired in place.

use thiserror::Error;

/// Errors produced by the engine.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
  /// Neither the endpoint nor the base URL is a usable absolute URL.
  #[error("Endpoint '{endpoint}' is not a valid url, provide a base url or an absolute endpoint")]
  InvalidUrl { endpoint: String },

  #[error(transparent)]
  Transport(#[from] TransportError),

  /// A persisted record could not be decoded.
  #[error("Corrupt storage record '{key}': {reason}")]
  StorageCorrupt { key: String, reason: String },
}

/// Failure reported by a [`Transport`](crate::transport::Transport).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
  /// The server answered with a non-success status.
  #[error("Request failed with status {status}: {body}")]
  Status { status: u16, body: String },

  /// The request never produced a response.
  #[error("Network error: {0}")]
  Network(String),

  /// The response body could not be decoded.
  #[error("Failed to decode response: {0}")]
  Decode(String),

  #[error("{0}")]
  Other(String),
}

impl TransportError {
  /// Build an error from any displayable message.
  pub fn other(message: impl std::fmt::Display) -> Self {
    Self::Other(message.to_string())
  }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
