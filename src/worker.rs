//! The interception context: owns the request interceptor and the cache
//! lifecycle, and answers control messages from the page context.

use color_eyre::{eyre::eyre, Result};
use futures::{stream, StreamExt};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::cache::{CacheStore, ResourceClass, Served};
use crate::config::Config;
use crate::context::OfflineContext;
use crate::event::{ClientMessage, ControlMessage, EventBus, EventStream};
use crate::http::{Request, Response, Transport};
use crate::interceptor::Interceptor;
use crate::strategy::StrategyEngine;

/// Precache fetches in flight at once.
const PRECACHE_CONCURRENCY: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
  /// Populating the static cache
  Installing,
  /// Installed, waiting to take over from the previous version
  Waiting,
  /// Old cache versions collected, serving requests
  Active,
}

/// Background worker. Build with [`ServiceWorker::new`], then
/// [`spawn`](ServiceWorker::spawn) it and talk to it through the handle.
pub struct ServiceWorker<T: Transport> {
  config: Arc<Config>,
  caches: CacheStore,
  interceptor: Interceptor<T>,
  clients: EventBus<ClientMessage>,
  state: watch::Sender<WorkerState>,
}

impl<T: Transport> ServiceWorker<T> {
  pub fn new(ctx: &OfflineContext<T>) -> Result<Self> {
    let clients = EventBus::new(64);
    let interceptor = Interceptor::new(ctx.engine()?, Arc::clone(&ctx.queue), clients.clone());
    let (state, _rx) = watch::channel(WorkerState::Installing);

    Ok(Self {
      config: Arc::clone(&ctx.config),
      caches: ctx.caches.clone(),
      interceptor,
      clients,
      state,
    })
  }

  /// Start the worker task: install, activate if allowed, then serve control
  /// messages until every handle is dropped.
  pub fn spawn(self) -> WorkerHandle<T> {
    let (control_tx, control_rx) = mpsc::unbounded_channel();
    WorkerHandle {
      interceptor: self.interceptor.clone(),
      clients: self.clients.clone(),
      control: control_tx,
      state: self.state.subscribe(),
      task: Arc::new(tokio::spawn(self.run(control_rx))),
    }
  }

  async fn run(self, mut control: mpsc::UnboundedReceiver<ControlMessage>) {
    if let Err(e) = self.install().await {
      error!("Worker install failed: {}", e);
    }

    while let Some(message) = control.recv().await {
      if let Err(e) = self.handle_control(message).await {
        warn!("Control message failed: {}", e);
      }
    }
    debug!("Control channel closed, worker stopping");
  }

  async fn install(&self) -> Result<()> {
    self.state.send_replace(WorkerState::Installing);
    let cached = self.precache(&self.config.cache.precache).await?;
    info!(cached, "Worker installed");
    self.state.send_replace(WorkerState::Waiting);

    if self.config.worker.skip_waiting {
      self.activate()
    } else {
      self.clients.emit(ClientMessage::UpdateAvailable);
      Ok(())
    }
  }

  fn activate(&self) -> Result<()> {
    let removed = self.caches.collect_garbage()?;
    info!(removed = removed.len(), "Worker activated");
    self.state.send_replace(WorkerState::Active);
    Ok(())
  }

  pub async fn handle_control(&self, message: ControlMessage) -> Result<()> {
    debug!(?message, "Control message");
    match message {
      ControlMessage::SkipWaiting => {
        let waiting = *self.state.borrow() == WorkerState::Waiting;
        if waiting {
          self.activate()?;
        }
      }
      ControlMessage::ClearCache => {
        self.caches.clear()?;
        info!("Caches cleared");
      }
      ControlMessage::Precache { resources } => {
        let cached = self.precache(&resources).await?;
        info!(cached, requested = resources.len(), "Precached resources");
      }
      ControlMessage::BackgroundSync { tag } => {
        if tag == self.config.sync.tag {
          self.clients.emit(ClientMessage::SyncStart);
        } else {
          debug!(tag, "Ignoring unknown sync tag");
        }
      }
    }
    Ok(())
  }

  /// Fetch each resource into the static cache. A resource that fails is
  /// logged and skipped; returns how many were stored.
  async fn precache(&self, resources: &[String]) -> Result<usize> {
    let engine = self.interceptor.engine();
    let cache = self.caches.open(&self.caches.namespaces().name(ResourceClass::Static))?;

    let results: Vec<(String, Option<(Request, Response)>)> = stream::iter(resources.to_vec())
      .map(|resource| {
        let engine = engine.clone();
        let config = Arc::clone(&self.config);
        async move {
          let fetched = match config.resolve(&resource) {
            Ok(url) => fetch_resource(&engine, Request::get(url)).await,
            Err(e) => {
              warn!("Skipping precache of {}: {}", resource, e);
              None
            }
          };
          (resource, fetched)
        }
      })
      .buffer_unordered(PRECACHE_CONCURRENCY)
      .collect()
      .await;

    let mut stored = 0;
    for (resource, fetched) in results {
      if let Some((request, response)) = fetched {
        cache.put(&request, &response)?;
        debug!(resource, "Precached");
        stored += 1;
      }
    }
    Ok(stored)
  }
}

async fn fetch_resource<T: Transport>(
  engine: &StrategyEngine<T>,
  request: Request,
) -> Option<(Request, Response)> {
  match engine.fetch(&request).await {
    Ok(response) if response.is_success() => Some((request, response)),
    Ok(response) => {
      warn!(url = %request.url, status = response.status, "Precache got error status");
      None
    }
    Err(e) => {
      warn!(url = %request.url, "Precache failed: {}", e);
      None
    }
  }
}

/// Page-side handle to a running worker.
pub struct WorkerHandle<T: Transport> {
  interceptor: Interceptor<T>,
  clients: EventBus<ClientMessage>,
  control: mpsc::UnboundedSender<ControlMessage>,
  state: watch::Receiver<WorkerState>,
  task: Arc<JoinHandle<()>>,
}

impl<T: Transport> WorkerHandle<T> {
  /// Route a request through the interceptor.
  pub async fn fetch(&self, request: Request) -> Result<Served> {
    self.interceptor.handle(request).await
  }

  pub fn post_message(&self, message: ControlMessage) -> Result<()> {
    self
      .control
      .send(message)
      .map_err(|_| eyre!("Worker is not running"))
  }

  /// Messages the worker posts to its clients.
  pub fn subscribe(&self) -> EventStream<ClientMessage> {
    self.clients.subscribe()
  }

  pub fn state(&self) -> WorkerState {
    *self.state.borrow()
  }

  pub async fn wait_for_state(&self, state: WorkerState) -> Result<()> {
    let mut rx = self.state.clone();
    rx.wait_for(|s| *s == state)
      .await
      .map(|_| ())
      .map_err(|_| eyre!("Worker stopped before reaching {:?}", state))
  }

  pub fn is_finished(&self) -> bool {
    self.task.is_finished()
  }
}

impl<T: Transport> Clone for WorkerHandle<T> {
  fn clone(&self) -> Self {
    Self {
      interceptor: self.interceptor.clone(),
      clients: self.clients.clone(),
      control: self.control.clone(),
      state: self.state.clone(),
      task: Arc::clone(&self.task),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::{Namespaces, ResponseSource};
  use crate::config::WorkerConfig;
  use crate::testing::{get, test_config, wait_until, MockTransport};

  fn context(config: Config) -> OfflineContext<MockTransport> {
    OfflineContext::in_memory(config, MockTransport::new()).unwrap()
  }

  fn static_len(ctx: &OfflineContext<MockTransport>) -> usize {
    ctx.caches.for_class(ResourceClass::Static).len().unwrap()
  }

  #[tokio::test]
  async fn test_install_precaches_and_activates() {
    let ctx = context(test_config());
    ctx.transport.route_get("/", Response::text(200, "root"));
    ctx.transport.route_get("/index.html", Response::text(200, "index"));
    ctx
      .transport
      .route_get("/offline.html", Response::text(200, "offline"));

    let worker = ServiceWorker::new(&ctx).unwrap().spawn();
    worker.wait_for_state(WorkerState::Active).await.unwrap();
    assert_eq!(static_len(&ctx), 3);

    // Offline page now available for fallback
    ctx.transport.set_online(false);
    let served = worker.fetch(get("/dashboard/")).await.unwrap();
    assert_eq!(served.source, ResponseSource::Fallback);
    assert_eq!(served.response.text_body(), "offline");
  }

  #[tokio::test]
  async fn test_precache_continues_past_failures() {
    let ctx = context(test_config());
    ctx
      .transport
      .route_get("/offline.html", Response::text(200, "offline"));

    let worker = ServiceWorker::new(&ctx).unwrap().spawn();
    worker.wait_for_state(WorkerState::Active).await.unwrap();
    assert_eq!(static_len(&ctx), 1);
  }

  #[tokio::test]
  async fn test_activation_collects_old_versions() {
    let ctx = context(test_config());
    let old = Namespaces::new("tether", "v0");
    ctx
      .caches
      .open(&old.name(ResourceClass::Static))
      .unwrap()
      .put(&get("/app.js"), &Response::text(200, "old"))
      .unwrap();
    ctx.caches.open("unrelated-cache").unwrap();

    let worker = ServiceWorker::new(&ctx).unwrap().spawn();
    worker.wait_for_state(WorkerState::Active).await.unwrap();

    let keys = ctx.caches.keys().unwrap();
    assert!(!keys.contains(&"tether-static-v0".to_string()));
    assert!(keys.contains(&"unrelated-cache".to_string()));
  }

  #[tokio::test]
  async fn test_waits_for_skip_waiting() {
    let config = Config {
      worker: WorkerConfig {
        skip_waiting: false,
      },
      ..test_config()
    };
    let ctx = context(config);
    let worker = ServiceWorker::new(&ctx).unwrap();
    let mut messages = worker.clients.subscribe();
    let worker = worker.spawn();

    assert_eq!(messages.next().await, Some(ClientMessage::UpdateAvailable));
    assert_eq!(worker.state(), WorkerState::Waiting);

    worker.post_message(ControlMessage::SkipWaiting).unwrap();
    worker.wait_for_state(WorkerState::Active).await.unwrap();
  }

  #[tokio::test]
  async fn test_background_sync_tag_posts_sync_start() {
    let ctx = context(test_config());
    let worker = ServiceWorker::new(&ctx).unwrap().spawn();
    let mut messages = worker.subscribe();

    worker
      .post_message(ControlMessage::BackgroundSync {
        tag: "something-else".to_string(),
      })
      .unwrap();
    worker
      .post_message(ControlMessage::BackgroundSync {
        tag: "tether-sync".to_string(),
      })
      .unwrap();

    assert_eq!(messages.next().await, Some(ClientMessage::SyncStart));
    assert_eq!(messages.try_next(), None);
  }

  #[tokio::test]
  async fn test_clear_cache_and_precache_messages() {
    let ctx = context(test_config());
    ctx.transport.route_get("/app.js", Response::text(200, "js"));
    let worker = ServiceWorker::new(&ctx).unwrap().spawn();
    worker.wait_for_state(WorkerState::Active).await.unwrap();

    worker
      .post_message(ControlMessage::Precache {
        resources: vec!["/app.js".to_string()],
      })
      .unwrap();
    let watched = ctx.clone();
    wait_until(move || static_len(&watched) == 1).await;

    worker.post_message(ControlMessage::ClearCache).unwrap();
    let watched = ctx.clone();
    wait_until(move || watched.caches.keys().unwrap().is_empty()).await;
  }
}
