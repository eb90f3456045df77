use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::watch;
use url::Url;

use crate::config::Config;
use crate::error::TransportError;
use crate::http::{Method, Request, Response, Transport};

pub const ORIGIN: &str = "http://localhost:8080";

pub fn url(path: &str) -> Url {
  Url::parse(ORIGIN).unwrap().join(path).unwrap()
}

pub fn get(path: &str) -> Request {
  Request::get(url(path))
}

pub fn request(method: Method, path: &str) -> Request {
  Request::new(method, url(path))
}

pub fn test_config() -> Config {
  Config {
    origin: ORIGIN.to_string(),
    ..Config::default()
  }
}

/// Poll `condition` until it holds, failing the test after two seconds.
pub async fn wait_until(mut condition: impl FnMut() -> bool) {
  for _ in 0..200 {
    if condition() {
      return;
    }
    tokio::time::sleep(Duration::from_millis(10)).await;
  }
  panic!("condition not reached in time");
}

/// Scripted network: fixed responses per (method, url), an online switch and
/// a gate that holds every request until released.
pub struct MockTransport {
  routes: Mutex<HashMap<(String, String), Response>>,
  online: AtomicBool,
  calls: Mutex<Vec<Request>>,
  gate: watch::Sender<bool>,
}

impl MockTransport {
  pub fn new() -> Self {
    let (gate, _rx) = watch::channel(true);
    Self {
      routes: Mutex::new(HashMap::new()),
      online: AtomicBool::new(true),
      calls: Mutex::new(Vec::new()),
      gate,
    }
  }

  pub fn route(&self, method: Method, path: &str, response: Response) {
    self
      .routes
      .lock()
      .unwrap()
      .insert((method.to_string(), url(path).to_string()), response);
  }

  pub fn route_get(&self, path: &str, response: Response) {
    self.route(Method::GET, path, response);
  }

  pub fn set_online(&self, online: bool) {
    self.online.store(online, Ordering::SeqCst);
  }

  /// Hold every request until [`release`](Self::release).
  pub fn hold(&self) {
    self.gate.send_replace(false);
  }

  pub fn release(&self) {
    self.gate.send_replace(true);
  }

  pub fn calls(&self) -> Vec<Request> {
    self.calls.lock().unwrap().clone()
  }

  /// "METHOD path" of every request issued, in order.
  pub fn call_log(&self) -> Vec<String> {
    self
      .calls()
      .iter()
      .map(|r| format!("{} {}", r.method, r.path()))
      .collect()
  }

  pub fn calls_to(&self, path: &str) -> usize {
    self.calls().iter().filter(|r| r.path() == path).count()
  }
}

impl Transport for MockTransport {
  async fn send(&self, request: &Request) -> Result<Response, TransportError> {
    self.calls.lock().unwrap().push(request.clone());

    let mut gate = self.gate.subscribe();
    while !*gate.borrow_and_update() {
      if gate.changed().await.is_err() {
        break;
      }
    }

    if !self.online.load(Ordering::SeqCst) {
      return Err(TransportError::Connect("connection refused".to_string()));
    }

    let key = (request.method.to_string(), request.url.to_string());
    let response = self
      .routes
      .lock()
      .unwrap()
      .get(&key)
      .cloned()
      .unwrap_or_else(|| Response::text(404, "not found"));
    Ok(response)
  }
}
