use color_eyre::{eyre::eyre, Result};
use reqwest::Method;
use serde::{de::DeserializeOwned, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use url::Url;

/// Human text carried by the synthetic offline API response.
pub const OFFLINE_MESSAGE: &str = "You are offline and no cached data is available";

/// Human text carried by the synthetic queued-mutation response.
pub const QUEUED_MESSAGE: &str = "Operation queued, it will be synced when the connection returns";

/// Plain-text body returned when an external origin is unreachable.
pub const EXTERNAL_OFFLINE_BODY: &str = "Offline";

/// An outgoing request as seen by the interceptor.
#[derive(Debug, Clone)]
pub struct Request {
  pub method: Method,
  pub url: Url,
  /// Header names are stored lowercased
  pub headers: BTreeMap<String, String>,
  pub body: Option<Vec<u8>>,
}

impl Request {
  pub fn new(method: Method, url: Url) -> Self {
    Self {
      method,
      url,
      headers: BTreeMap::new(),
      body: None,
    }
  }

  pub fn get(url: Url) -> Self {
    Self::new(Method::GET, url)
  }

  pub fn with_header(mut self, name: &str, value: &str) -> Self {
    self
      .headers
      .insert(name.to_ascii_lowercase(), value.to_string());
    self
  }

  pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
    self.body = Some(body.into());
    self
  }

  pub fn is_get(&self) -> bool {
    self.method == Method::GET
  }

  pub fn path(&self) -> &str {
    self.url.path()
  }

  /// URL used for cache addressing (fragment stripped).
  pub fn cache_url(&self) -> String {
    let mut url = self.url.clone();
    url.set_fragment(None);
    url.to_string()
  }

  /// Stable, fixed-length key derived from method and URL.
  pub fn cache_key(&self) -> String {
    let input = format!("{} {}", self.method.as_str(), self.cache_url());

    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    hex::encode(hasher.finalize())
  }
}

/// A response snapshot: status, headers and the full body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
  pub status: u16,
  /// Header names are stored lowercased
  pub headers: BTreeMap<String, String>,
  pub body: Vec<u8>,
}

#[derive(Serialize)]
struct OfflineBody<'a> {
  error: &'a str,
  message: &'a str,
  cached: bool,
}

#[derive(Serialize)]
struct QueuedBody<'a> {
  queued: bool,
  message: &'a str,
}

impl Response {
  pub fn new(status: u16, headers: BTreeMap<String, String>, body: Vec<u8>) -> Self {
    Self {
      status,
      headers,
      body,
    }
  }

  /// Build a JSON response from any serializable value.
  pub fn json<T: Serialize>(status: u16, value: &T) -> Self {
    // Serializing plain structs and `Value`s cannot fail
    let body = serde_json::to_vec(value).unwrap_or_default();
    let mut headers = BTreeMap::new();
    headers.insert("content-type".to_string(), "application/json".to_string());
    Self::new(status, headers, body)
  }

  pub fn text(status: u16, text: &str) -> Self {
    let mut headers = BTreeMap::new();
    headers.insert(
      "content-type".to_string(),
      "text/plain; charset=utf-8".to_string(),
    );
    Self::new(status, headers, text.as_bytes().to_vec())
  }

  /// 503 `{error:"offline", message, cached:false}`
  pub fn offline_api() -> Self {
    Self::json(
      503,
      &OfflineBody {
        error: "offline",
        message: OFFLINE_MESSAGE,
        cached: false,
      },
    )
  }

  /// 202 `{queued:true, message}`
  pub fn queued() -> Self {
    Self::json(
      202,
      &QueuedBody {
        queued: true,
        message: QUEUED_MESSAGE,
      },
    )
  }

  /// 503 plain text, used for unreachable external origins and when no
  /// offline page has been cached.
  pub fn unavailable() -> Self {
    Self::text(503, EXTERNAL_OFFLINE_BODY)
  }

  pub fn is_success(&self) -> bool {
    (200..300).contains(&self.status)
  }

  pub fn header(&self, name: &str) -> Option<&str> {
    self
      .headers
      .get(&name.to_ascii_lowercase())
      .map(String::as_str)
  }

  pub fn content_type(&self) -> Option<&str> {
    self.header("content-type")
  }

  pub fn text_body(&self) -> String {
    String::from_utf8_lossy(&self.body).into_owned()
  }

  pub fn json_body<T: DeserializeOwned>(&self) -> Result<T> {
    serde_json::from_slice(&self.body)
      .map_err(|e| eyre!("Failed to parse response body as JSON: {}", e))
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::Value;

  fn url(s: &str) -> Url {
    Url::parse(s).unwrap()
  }

  #[test]
  fn test_cache_key_ignores_fragment() {
    let a = Request::get(url("http://localhost/app.js#top"));
    let b = Request::get(url("http://localhost/app.js"));
    assert_eq!(a.cache_key(), b.cache_key());
    assert_eq!(a.cache_key().len(), 64);
  }

  #[test]
  fn test_cache_key_depends_on_method() {
    let get = Request::get(url("http://localhost/api/tasks"));
    let post = Request::new(Method::POST, url("http://localhost/api/tasks"));
    assert_ne!(get.cache_key(), post.cache_key());
  }

  #[test]
  fn test_offline_api_shape() {
    let response = Response::offline_api();
    assert_eq!(response.status, 503);
    assert_eq!(response.content_type(), Some("application/json"));
    assert!(response
      .text_body()
      .starts_with(r#"{"error":"offline","message":"#));

    let body: Value = response.json_body().unwrap();
    assert_eq!(body["error"], "offline");
    assert_eq!(body["cached"], false);
    assert_eq!(body["message"], OFFLINE_MESSAGE);
  }

  #[test]
  fn test_queued_shape() {
    let response = Response::queued();
    assert_eq!(response.status, 202);
    let body: Value = response.json_body().unwrap();
    assert_eq!(body["queued"], true);
    assert_eq!(body["message"], QUEUED_MESSAGE);
  }

  #[test]
  fn test_unavailable_is_plain_text() {
    let response = Response::unavailable();
    assert_eq!(response.status, 503);
    assert_eq!(response.text_body(), EXTERNAL_OFFLINE_BODY);
    assert!(response.content_type().unwrap().starts_with("text/plain"));
  }

  #[test]
  fn test_header_lookup_is_case_insensitive() {
    let request = Request::get(url("http://localhost/")).with_header("X-Trace", "1");
    assert_eq!(request.headers.get("x-trace").map(String::as_str), Some("1"));

    let response = Response::json(200, &serde_json::json!({}));
    assert_eq!(response.header("Content-Type"), Some("application/json"));
  }
}
