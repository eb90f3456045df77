//! The chokepoint every outgoing request passes through.

use color_eyre::{eyre::Report, Result};
use std::sync::Arc;
use tracing::{info, warn};

use crate::cache::Served;
use crate::db::{Database, OperationType, RequestPayload};
use crate::event::{ClientMessage, EventBus};
use crate::http::{Request, Response, Transport};
use crate::strategy::{Route, StrategyEngine};

/// Routes GET requests to the strategy engine and sends mutations to the
/// network, queueing them when the network is unreachable.
///
/// A queued mutation is answered with a synthetic 202 so callers can treat
/// "queued for later" as its own outcome, distinct from success and failure.
///
/// Only methods that map to a create, update or delete are queued (POST, PUT,
/// PATCH, DELETE). Other non-GET methods such as HEAD and OPTIONS have nothing
/// to replay, so their network failure is returned as the error.
pub struct Interceptor<T: Transport> {
  engine: StrategyEngine<T>,
  queue: Arc<Database>,
  clients: EventBus<ClientMessage>,
}

impl<T: Transport> Interceptor<T> {
  pub fn new(
    engine: StrategyEngine<T>,
    queue: Arc<Database>,
    clients: EventBus<ClientMessage>,
  ) -> Self {
    Self {
      engine,
      queue,
      clients,
    }
  }

  pub fn engine(&self) -> &StrategyEngine<T> {
    &self.engine
  }

  pub async fn handle(&self, request: Request) -> Result<Served> {
    match self.engine.classify(&request) {
      Route::Mutation => self.mutate(&request).await,
      _ => self.engine.handle(&request).await,
    }
  }

  /// Network first, unconditionally. Mutation responses are never cached.
  async fn mutate(&self, request: &Request) -> Result<Served> {
    let error = match self.engine.fetch(request).await {
      Ok(response) => return Ok(Served::from_network(response)),
      Err(e) => e,
    };

    let Some(op_type) = OperationType::for_request(request, self.engine.classifier().api_prefix())
    else {
      // Not a create/update/delete, nothing sensible to replay
      return Err(Report::new(error));
    };

    warn!(url = %request.url, "{} failed ({}), queueing for sync", request.method, error);
    let id = self
      .queue
      .enqueue(&op_type, &RequestPayload::from_request(request))?;
    info!(id, %op_type, "Queued pending operation");

    self.clients.emit(ClientMessage::QueueRequest {
      id,
      method: request.method.to_string(),
      url: request.url.to_string(),
      body: request
        .body
        .as_deref()
        .map(|b| String::from_utf8_lossy(b).into_owned())
        .unwrap_or_default(),
      headers: request.headers.clone(),
    });

    Ok(Served::queued(Response::queued()))
  }
}

impl<T: Transport> Clone for Interceptor<T> {
  fn clone(&self) -> Self {
    Self {
      engine: self.engine.clone(),
      queue: Arc::clone(&self.queue),
      clients: self.clients.clone(),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::{CacheStore, Namespaces, ResponseSource, SqliteStorage};
  use crate::connectivity::Connectivity;
  use crate::db::MutationAction;
  use crate::error::TransportError;
  use crate::http::Method;
  use crate::strategy::Classifier;
  use crate::testing::{get, request, test_config, url, MockTransport};
  use crate::QUEUED_MESSAGE;
  use serde_json::{json, Value};

  struct Fixture {
    interceptor: Interceptor<MockTransport>,
    transport: Arc<MockTransport>,
    queue: Arc<Database>,
    caches: CacheStore,
    clients: EventBus<ClientMessage>,
  }

  fn fixture() -> Fixture {
    let config = test_config();
    let transport = Arc::new(MockTransport::new());
    let caches = CacheStore::new(
      SqliteStorage::open_in_memory().unwrap(),
      Namespaces::from_config(&config.cache),
    );
    let engine = StrategyEngine::new(
      Arc::clone(&transport),
      caches.clone(),
      Classifier::from_config(&config).unwrap(),
      Connectivity::new(true),
      url(&config.offline_page),
    );
    let queue = Arc::new(Database::open_in_memory().unwrap());
    let clients = EventBus::new(16);

    Fixture {
      interceptor: Interceptor::new(engine, Arc::clone(&queue), clients.clone()),
      transport,
      queue,
      caches,
      clients,
    }
  }

  fn post_task() -> Request {
    request(Method::POST, "/api/tasks")
      .with_header("Content-Type", "application/json")
      .with_body(r#"{"name":"x"}"#)
  }

  #[tokio::test]
  async fn test_offline_post_is_queued() {
    let f = fixture();
    let mut messages = f.clients.subscribe();
    f.transport.set_online(false);

    let served = f.interceptor.handle(post_task()).await.unwrap();
    assert_eq!(served.source, ResponseSource::Queued);
    assert_eq!(served.status(), 202);
    let body: Value = served.response.json_body().unwrap();
    assert_eq!(body, json!({"queued": true, "message": QUEUED_MESSAGE}));

    let ops = f.queue.list_unsynced().unwrap();
    assert_eq!(ops.len(), 1);
    assert_eq!(ops[0].op_type.action, MutationAction::Create);
    assert_eq!(ops[0].op_type.resource, "tasks");
    assert!(!ops[0].synced);
    assert_eq!(ops[0].retry_count, 0);
    assert_eq!(
      ops[0].payload.headers.get("content-type").map(String::as_str),
      Some("application/json")
    );

    match messages.next().await {
      Some(ClientMessage::QueueRequest {
        id, method, body, ..
      }) => {
        assert_eq!(id, ops[0].id);
        assert_eq!(method, "POST");
        assert_eq!(body, r#"{"name":"x"}"#);
      }
      other => panic!("unexpected message {:?}", other),
    }
  }

  #[tokio::test]
  async fn test_failed_enqueue_is_an_error() {
    let f = fixture();
    let mut messages = f.clients.subscribe();
    f.transport.set_online(false);
    f.queue
      .conn()
      .unwrap()
      .execute_batch("DROP TABLE pending_operations")
      .unwrap();

    assert!(f.interceptor.handle(post_task()).await.is_err());
    assert_eq!(messages.try_next(), None);
  }

  #[tokio::test]
  async fn test_online_mutation_returns_network_response_untouched() {
    let f = fixture();
    let created = Response::json(201, &json!({"id": 7, "name": "x"}));
    f.transport.route(Method::POST, "/api/tasks", created.clone());

    let served = f.interceptor.handle(post_task()).await.unwrap();
    assert_eq!(served.source, ResponseSource::Network);
    assert_eq!(served.response, created);
    assert!(f.queue.list_unsynced().unwrap().is_empty());
    assert!(f.caches.keys().unwrap().is_empty());
  }

  #[tokio::test]
  async fn test_server_error_is_not_queued() {
    let f = fixture();
    f.transport
      .route(Method::DELETE, "/api/tasks/1", Response::text(500, "boom"));

    let served = f
      .interceptor
      .handle(request(Method::DELETE, "/api/tasks/1"))
      .await
      .unwrap();
    assert_eq!(served.status(), 500);
    assert!(f.queue.list_unsynced().unwrap().is_empty());
  }

  #[tokio::test]
  async fn test_unqueueable_method_propagates_error() {
    let f = fixture();
    f.transport.set_online(false);

    let err = f
      .interceptor
      .handle(request(Method::OPTIONS, "/api/tasks"))
      .await
      .unwrap_err();
    assert!(err.downcast_ref::<TransportError>().is_some());
    assert!(f.queue.list_unsynced().unwrap().is_empty());
  }

  #[tokio::test]
  async fn test_get_goes_through_strategy() {
    let f = fixture();
    f.transport
      .route_get("/api/agents", Response::json(200, &json!([1, 2])));

    let served = f.interceptor.handle(get("/api/agents")).await.unwrap();
    assert_eq!(served.source, ResponseSource::Network);

    f.transport.set_online(false);
    let served = f.interceptor.handle(get("/api/agents")).await.unwrap();
    assert_eq!(served.source, ResponseSource::Cache);
    assert_eq!(served.response.json_body::<Value>().unwrap(), json!([1, 2]));
  }
}
