use chrono::{DateTime, Utc};

use crate::http::Response;

/// A response handed back to the caller, with metadata about its source.
#[derive(Debug, Clone)]
pub struct Served {
  pub response: Response,
  pub source: ResponseSource,
  /// When the snapshot was cached (if from cache)
  pub cached_at: Option<DateTime<Utc>>,
}

impl Served {
  /// Fresh response from the network.
  pub fn from_network(response: Response) -> Self {
    Self {
      response,
      source: ResponseSource::Network,
      cached_at: None,
    }
  }

  /// Cached snapshot served in place of (or ahead of) the network.
  pub fn from_cache(response: Response, cached_at: DateTime<Utc>) -> Self {
    Self {
      response,
      source: ResponseSource::Cache,
      cached_at: Some(cached_at),
    }
  }

  /// Cached offline page served because the network failed.
  pub fn fallback(response: Response, cached_at: DateTime<Utc>) -> Self {
    Self {
      response,
      source: ResponseSource::Fallback,
      cached_at: Some(cached_at),
    }
  }

  /// Response fabricated by this layer (503 offline, 503 external).
  pub fn synthetic(response: Response) -> Self {
    Self {
      response,
      source: ResponseSource::Synthetic,
      cached_at: None,
    }
  }

  /// 202 for a mutation persisted for later replay.
  pub fn queued(response: Response) -> Self {
    Self {
      response,
      source: ResponseSource::Queued,
      cached_at: None,
    }
  }

  pub fn status(&self) -> u16 {
    self.response.status
  }
}

/// Indicates where a response came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseSource {
  Network,
  Cache,
  /// Offline page standing in for the requested resource
  Fallback,
  Synthetic,
  Queued,
}
