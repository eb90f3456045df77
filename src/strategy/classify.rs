//! Request classification: which caching policy applies to a request.

use color_eyre::Result;
use url::Url;

use crate::config::Config;
use crate::http::Request;

/// The path a request takes through the interceptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
  /// Non-GET: network, or queue on failure
  Mutation,
  /// Other origin: network only, failure becomes a plain 503
  CrossOrigin,
  /// Excluded path: network only, failure propagates
  Bypass,
  /// Static asset
  CacheFirst,
  /// API namespace
  NetworkFirst,
  /// Everything else
  StaleWhileRevalidate,
}

/// A path pattern with an optional `*` wildcard at either end.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathPattern {
  Exact(String),
  Prefix(String),
  Suffix(String),
  Contains(String),
}

impl PathPattern {
  pub fn parse(pattern: &str) -> Self {
    let leading = pattern.starts_with('*');
    let trailing = pattern.len() > 1 && pattern.ends_with('*');
    let core = pattern.trim_start_matches('*').trim_end_matches('*');

    match (leading, trailing) {
      (true, true) => Self::Contains(core.to_string()),
      (true, false) => Self::Suffix(core.to_string()),
      (false, true) => Self::Prefix(core.to_string()),
      (false, false) => Self::Exact(core.to_string()),
    }
  }

  pub fn matches(&self, path: &str) -> bool {
    match self {
      Self::Exact(p) => path == p,
      Self::Prefix(p) => path.starts_with(p.as_str()),
      Self::Suffix(p) => path.ends_with(p.as_str()),
      Self::Contains(p) => path.contains(p.as_str()),
    }
  }
}

/// Classification rules, built once from configuration.
#[derive(Debug, Clone)]
pub struct Classifier {
  origin: Url,
  api_prefix: String,
  static_extensions: Vec<String>,
  root_documents: Vec<String>,
  exclude: Vec<PathPattern>,
}

impl Classifier {
  pub fn from_config(config: &Config) -> Result<Self> {
    Ok(Self {
      origin: config.origin_url()?,
      api_prefix: config.api_prefix.clone(),
      static_extensions: config
        .cache
        .static_extensions
        .iter()
        .map(|e| e.trim_start_matches('.').to_ascii_lowercase())
        .collect(),
      root_documents: config.cache.root_documents.clone(),
      exclude: config
        .cache
        .exclude
        .iter()
        .map(|p| PathPattern::parse(p))
        .collect(),
    })
  }

  /// First matching rule wins.
  pub fn classify(&self, request: &Request) -> Route {
    if !request.is_get() {
      return Route::Mutation;
    }
    if !self.is_same_origin(&request.url) {
      return Route::CrossOrigin;
    }

    let path = request.path();
    if self.is_excluded(path) {
      Route::Bypass
    } else if self.is_static(path) {
      Route::CacheFirst
    } else if self.is_api(path) {
      Route::NetworkFirst
    } else {
      Route::StaleWhileRevalidate
    }
  }

  pub fn is_same_origin(&self, url: &Url) -> bool {
    url.origin() == self.origin.origin()
  }

  pub fn is_excluded(&self, path: &str) -> bool {
    self.exclude.iter().any(|p| p.matches(path))
  }

  pub fn is_static(&self, path: &str) -> bool {
    if self.root_documents.iter().any(|doc| doc == path) {
      return true;
    }

    let file_name = path.rsplit('/').next().unwrap_or("");
    match file_name.rsplit_once('.') {
      Some((_, ext)) => {
        let ext = ext.to_ascii_lowercase();
        self.static_extensions.iter().any(|e| *e == ext)
      }
      None => false,
    }
  }

  pub fn is_api(&self, path: &str) -> bool {
    path.starts_with(&self.api_prefix)
  }

  pub fn api_prefix(&self) -> &str {
    &self.api_prefix
  }
}
