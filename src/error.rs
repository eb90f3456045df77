use thiserror::Error;

/// Failure to get any response from the network.
///
/// An HTTP error status is not a transport error: the server answered, and the
/// response is handed back untouched.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
  /// Connectivity is known to be down; no request was issued.
  #[error("network is offline")]
  Offline,

  #[error("request timed out")]
  Timeout,

  /// DNS failure, refused or reset connection.
  #[error("connection failed: {0}")]
  Connect(String),

  #[error("request failed: {0}")]
  Request(String),
}

impl From<reqwest::Error> for TransportError {
  fn from(e: reqwest::Error) -> Self {
    if e.is_timeout() {
      Self::Timeout
    } else if e.is_connect() {
      Self::Connect(e.to_string())
    } else {
      Self::Request(e.to_string())
    }
  }
}

/// Why a queued operation could not be replayed.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ReplayError {
  #[error("server rejected replay with status {0}")]
  Rejected(u16),

  #[error(transparent)]
  Transport(#[from] TransportError),

  /// The stored payload no longer forms a valid request.
  #[error("invalid stored request: {0}")]
  InvalidPayload(String),
}
