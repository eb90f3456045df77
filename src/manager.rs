//! The page context: tracks connectivity, relays worker messages to the UI
//! layer and drives sync passes.

use color_eyre::{eyre::eyre, Result};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::cache::ResponseSource;
use crate::config::Config;
use crate::connectivity::Connectivity;
use crate::context::OfflineContext;
use crate::db::{Database, UserRecord};
use crate::event::{ClientMessage, ControlMessage, EventBus, EventStream, OfflineEvent};
use crate::http::{Request, Transport};
use crate::sync::{SyncCoordinator, SyncReport, SyncTrigger};
use crate::worker::WorkerHandle;

pub struct OfflineManager<T: Transport> {
  config: Arc<Config>,
  worker: WorkerHandle<T>,
  sync: SyncCoordinator<T>,
  queue: Arc<Database>,
  connectivity: Connectivity,
  events: EventBus<OfflineEvent>,
}

impl<T: Transport> OfflineManager<T> {
  pub fn new(ctx: &OfflineContext<T>, worker: WorkerHandle<T>) -> Self {
    let events = EventBus::new(64);
    Self {
      config: Arc::clone(&ctx.config),
      worker,
      sync: ctx.sync_coordinator(events.clone()),
      queue: Arc::clone(&ctx.queue),
      connectivity: ctx.connectivity.clone(),
      events,
    }
  }

  /// Events for the UI layer.
  pub fn subscribe(&self) -> EventStream<OfflineEvent> {
    self.events.subscribe()
  }

  pub fn worker(&self) -> &WorkerHandle<T> {
    &self.worker
  }

  /// Announce the restored state and start listening for connectivity
  /// changes and worker messages.
  pub fn start(&self) -> Result<JoinHandle<()>> {
    let pending = self.queue.unsynced_count()?;
    let mut connectivity = self.connectivity.subscribe();
    let online = *connectivity.borrow_and_update();
    let clients = self.worker.subscribe();

    info!(online, pending, "Offline manager initialized");
    self.events.emit(OfflineEvent::Initialized {
      online,
      sync_pending: pending > 0,
    });

    Ok(tokio::spawn(self.clone().run(online, connectivity, clients)))
  }

  async fn run(
    self,
    mut was_online: bool,
    mut connectivity: watch::Receiver<bool>,
    mut clients: EventStream<ClientMessage>,
  ) {
    loop {
      tokio::select! {
        changed = connectivity.changed() => {
          if changed.is_err() {
            break;
          }
          let online = *connectivity.borrow_and_update();
          if online == was_online {
            continue;
          }
          was_online = online;

          self.events.emit(OfflineEvent::StatusChange { online });
          if online {
            self.spawn_sync(SyncTrigger::Reconnect);
          }
        }
        message = clients.next() => match message {
          Some(message) => self.on_client_message(message),
          None => break,
        },
      }
    }
    debug!("Offline manager stopped");
  }

  fn on_client_message(&self, message: ClientMessage) {
    match message {
      ClientMessage::QueueRequest {
        id, method, url, ..
      } => {
        self.events.emit(OfflineEvent::Queued { id, method, url });
      }
      ClientMessage::SyncStart => self.spawn_sync(SyncTrigger::Background),
      ClientMessage::UpdateAvailable => self.events.emit(OfflineEvent::UpdateAvailable),
    }
  }

  /// Sync runs detached so worker messages keep flowing during a pass.
  fn spawn_sync(&self, trigger: SyncTrigger) {
    let sync = self.sync.clone();
    tokio::spawn(async move {
      if let Err(e) = sync.sync(trigger).await {
        error!(?trigger, "Sync failed: {}", e);
      }
    });
  }

  pub fn is_online(&self) -> bool {
    self.connectivity.is_online()
  }

  /// Feed a connectivity transition from the host network stack.
  pub fn set_online(&self, online: bool) {
    self.connectivity.set_online(online);
  }

  pub fn pending_count(&self) -> Result<usize> {
    self.queue.unsynced_count()
  }

  /// Replay the queue now, ignoring backoff. Does nothing while offline.
  pub async fn trigger_sync(&self) -> Result<Option<SyncReport>> {
    if !self.is_online() {
      warn!("Offline, cannot trigger sync");
      return Ok(None);
    }
    self.sync.sync(SyncTrigger::Manual).await
  }

  /// Ask the worker to relay a background-sync signal for the configured tag.
  pub fn request_background_sync(&self) -> Result<()> {
    self.worker.post_message(ControlMessage::BackgroundSync {
      tag: self.config.sync.tag.clone(),
    })
  }

  /// Fetch JSON, keeping a copy in the API cache for offline reads.
  ///
  /// Offline, the cached copy is returned without touching the network. Online,
  /// the request goes through the worker; when the worker reports the network
  /// unavailable the cached copy is used instead.
  pub async fn fetch_with_cache(&self, url: &str, cache_key: Option<&str>) -> Result<Value> {
    let url = self.config.resolve(url)?;
    let key = cache_key.map_or_else(|| url.to_string(), str::to_string);

    if !self.is_online() {
      return self
        .cached_json(&key, url.as_str())?
        .ok_or_else(|| eyre!("Offline and no cached data for {}", url));
    }

    let served = match self.worker.fetch(Request::get(url.clone())).await {
      Ok(served) => served,
      Err(e) => {
        return self
          .cached_json(&key, url.as_str())?
          .ok_or(e);
      }
    };

    if served.status() == 503 {
      return self
        .cached_json(&key, url.as_str())?
        .ok_or_else(|| eyre!("{} is unavailable and not cached", url));
    }
    if !served.response.is_success() {
      return Err(eyre!("{} returned status {}", url, served.status()));
    }

    let body: Value = served.response.json_body()?;
    if served.source == ResponseSource::Network {
      self.queue.api_cache_put(&key, &body, self.config.api_ttl())?;
    }
    Ok(body)
  }

  fn cached_json(&self, key: &str, url: &str) -> Result<Option<Value>> {
    let cached = self.queue.api_cache_get(key)?;
    if cached.is_some() {
      self.events.emit(OfflineEvent::CacheHit {
        url: url.to_string(),
      });
    }
    Ok(cached)
  }

  pub fn save_user_data(&self, key: &str, data: &Value, category: &str) -> Result<()> {
    self.queue.save_user_data(key, data, category)
  }

  pub fn get_user_data(&self, key: &str) -> Result<Option<Value>> {
    self.queue.get_user_data(key)
  }

  pub fn list_user_data(&self, category: &str) -> Result<Vec<UserRecord>> {
    self.queue.list_user_data(category)
  }

  /// Drop every response cache plus the API cache and user data. Pending
  /// operations are kept.
  pub fn clear_cache(&self) -> Result<()> {
    self.worker.post_message(ControlMessage::ClearCache)?;
    self.queue.clear_caches()?;
    info!("Cleared cached data");
    Ok(())
  }

  pub fn precache(&self, resources: Vec<String>) -> Result<()> {
    self
      .worker
      .post_message(ControlMessage::Precache { resources })
  }
}

impl<T: Transport> Clone for OfflineManager<T> {
  fn clone(&self) -> Self {
    Self {
      config: Arc::clone(&self.config),
      worker: self.worker.clone(),
      sync: self.sync.clone(),
      queue: Arc::clone(&self.queue),
      connectivity: self.connectivity.clone(),
      events: self.events.clone(),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::http::{Method, Response};
  use crate::testing::{get, request, test_config, wait_until, MockTransport};
  use crate::worker::{ServiceWorker, WorkerState};
  use serde_json::json;

  struct Fixture {
    ctx: OfflineContext<MockTransport>,
    manager: OfflineManager<MockTransport>,
    events: EventStream<OfflineEvent>,
  }

  async fn fixture(online: bool) -> Fixture {
    let ctx = OfflineContext::in_memory(test_config(), MockTransport::new()).unwrap();
    ctx.connectivity.set_online(online);

    let worker = ServiceWorker::new(&ctx).unwrap().spawn();
    worker.wait_for_state(WorkerState::Active).await.unwrap();

    let manager = OfflineManager::new(&ctx, worker);
    let events = manager.subscribe();
    manager.start().unwrap();

    Fixture {
      ctx,
      manager,
      events,
    }
  }

  #[tokio::test]
  async fn test_initialized_reports_state() {
    let mut f = fixture(false).await;
    assert_eq!(
      f.events.next().await,
      Some(OfflineEvent::Initialized {
        online: false,
        sync_pending: false
      })
    );
    assert!(!f.manager.is_online());
  }

  #[tokio::test]
  async fn test_queued_post_replays_on_reconnect() {
    let mut f = fixture(false).await;
    f.events.next().await;
    f.ctx
      .transport
      .route(Method::POST, "/api/tasks", Response::json(201, &json!({"id": 1})));

    let served = f
      .manager
      .worker()
      .fetch(request(Method::POST, "/api/tasks").with_body(r#"{"name":"x"}"#))
      .await
      .unwrap();
    assert_eq!(served.status(), 202);
    assert!(f.ctx.transport.calls().is_empty());

    match f.events.next().await {
      Some(OfflineEvent::Queued { method, .. }) => assert_eq!(method, "POST"),
      other => panic!("unexpected event {:?}", other),
    }
    assert_eq!(f.manager.pending_count().unwrap(), 1);

    f.manager.set_online(true);
    assert_eq!(
      f.events.next().await,
      Some(OfflineEvent::StatusChange { online: true })
    );
    assert_eq!(f.events.next().await, Some(OfflineEvent::SyncStart));
    assert_eq!(
      f.events.next().await,
      Some(OfflineEvent::SyncComplete {
        count: 1,
        synced: 1,
        failed: 0
      })
    );

    assert_eq!(f.manager.pending_count().unwrap(), 0);
    assert_eq!(f.ctx.transport.call_log(), vec!["POST /api/tasks"]);
  }

  async fn wait_for_event(events: &mut EventStream<OfflineEvent>, expected: OfflineEvent) {
    while let Some(event) = events.next().await {
      if event == expected {
        return;
      }
    }
    panic!("event stream closed before {:?}", expected);
  }

  #[tokio::test]
  async fn test_reconnect_during_pass_drains_new_work() {
    let mut f = fixture(true).await;
    f.events.next().await;
    f.ctx
      .transport
      .route(Method::POST, "/api/tasks", Response::json(201, &json!({})));
    let first = request(Method::POST, "/api/tasks").with_body(r#"{"name":"first"}"#);
    f.ctx
      .queue
      .enqueue(
        &crate::db::OperationType::for_request(&first, "/api/").unwrap(),
        &crate::db::RequestPayload::from_request(&first),
      )
      .unwrap();

    f.ctx.transport.hold();
    let pass = {
      let manager = f.manager.clone();
      tokio::spawn(async move { manager.trigger_sync().await })
    };
    let transport = Arc::clone(&f.ctx.transport);
    wait_until(move || !transport.calls().is_empty()).await;

    f.manager.set_online(false);
    wait_for_event(&mut f.events, OfflineEvent::StatusChange { online: false }).await;
    let served = f
      .manager
      .worker()
      .fetch(request(Method::POST, "/api/tasks").with_body(r#"{"name":"second"}"#))
      .await
      .unwrap();
    assert_eq!(served.status(), 202);

    f.manager.set_online(true);
    wait_for_event(&mut f.events, OfflineEvent::StatusChange { online: true }).await;
    f.ctx.transport.release();

    pass.await.unwrap().unwrap();
    let manager = f.manager.clone();
    wait_until(move || manager.pending_count().unwrap() == 0).await;
    assert_eq!(f.ctx.transport.calls_to("/api/tasks"), 2);
  }

  #[tokio::test]
  async fn test_going_offline_emits_status_only() {
    let mut f = fixture(true).await;
    f.events.next().await;

    f.manager.set_online(false);
    assert_eq!(
      f.events.next().await,
      Some(OfflineEvent::StatusChange { online: false })
    );
    assert_eq!(f.events.try_next(), None);
  }

  #[tokio::test]
  async fn test_background_sync_signal_runs_a_pass() {
    let mut f = fixture(true).await;
    f.events.next().await;

    f.manager.request_background_sync().unwrap();
    assert_eq!(f.events.next().await, Some(OfflineEvent::SyncStart));
    assert_eq!(
      f.events.next().await,
      Some(OfflineEvent::SyncComplete {
        count: 0,
        synced: 0,
        failed: 0
      })
    );
  }

  #[tokio::test]
  async fn test_trigger_sync_offline_does_nothing() {
    let f = fixture(false).await;
    assert!(f.manager.trigger_sync().await.unwrap().is_none());
  }

  #[tokio::test]
  async fn test_fetch_with_cache_round_trip() {
    let mut f = fixture(true).await;
    f.events.next().await;
    let agents = json!({"agents": ["scout"]});
    f.ctx
      .transport
      .route_get("/api/agents", Response::json(200, &agents));

    let body = f
      .manager
      .fetch_with_cache("/api/agents", None)
      .await
      .unwrap();
    assert_eq!(body, agents);

    let entry = f
      .ctx
      .queue
      .api_cache_entry("http://localhost:8080/api/agents")
      .unwrap()
      .unwrap();
    assert_eq!(entry.body, agents);
    assert_eq!((entry.expires_at - entry.stored_at).num_seconds(), 300);

    f.manager.set_online(false);
    assert_eq!(
      f.events.next().await,
      Some(OfflineEvent::StatusChange { online: false })
    );
    let body = f
      .manager
      .fetch_with_cache("/api/agents", None)
      .await
      .unwrap();
    assert_eq!(body, agents);
    assert_eq!(
      f.events.next().await,
      Some(OfflineEvent::CacheHit {
        url: "http://localhost:8080/api/agents".to_string()
      })
    );
  }

  #[tokio::test]
  async fn test_fetch_with_cache_offline_without_copy_fails() {
    let f = fixture(false).await;
    assert!(f
      .manager
      .fetch_with_cache("/api/agents", Some("agents"))
      .await
      .is_err());
  }

  #[tokio::test]
  async fn test_fetch_with_cache_falls_back_when_network_drops() {
    let f = fixture(true).await;
    f.ctx
      .queue
      .api_cache_put("agents", &json!([1]), std::time::Duration::from_secs(60))
      .unwrap();
    f.ctx.transport.set_online(false);

    let body = f
      .manager
      .fetch_with_cache("/api/agents", Some("agents"))
      .await
      .unwrap();
    assert_eq!(body, json!([1]));
  }

  #[tokio::test]
  async fn test_clear_cache_keeps_pending_operations() {
    let f = fixture(false).await;
    f.manager
      .worker()
      .fetch(request(Method::DELETE, "/api/tasks/3"))
      .await
      .unwrap();
    f.manager
      .save_user_data("theme", &json!("dark"), "prefs")
      .unwrap();
    f.ctx
      .caches
      .for_class(crate::cache::ResourceClass::Dynamic)
      .put(&get("/dashboard/"), &Response::text(200, "page"))
      .unwrap();

    f.manager.clear_cache().unwrap();

    assert!(f.manager.get_user_data("theme").unwrap().is_none());
    assert_eq!(f.manager.pending_count().unwrap(), 1);
    let caches = f.ctx.caches.clone();
    wait_until(move || caches.keys().unwrap().is_empty()).await;
  }

  #[tokio::test]
  async fn test_user_data_by_category() {
    let f = fixture(true).await;
    f.manager
      .save_user_data("layout", &json!({"cols": 3}), "prefs")
      .unwrap();
    f.manager
      .save_user_data("draft", &json!("hello"), "notes")
      .unwrap();

    assert_eq!(
      f.manager.get_user_data("layout").unwrap(),
      Some(json!({"cols": 3}))
    );
    let prefs = f.manager.list_user_data("prefs").unwrap();
    assert_eq!(prefs.len(), 1);
    assert_eq!(prefs[0].key, "layout");
  }
}
