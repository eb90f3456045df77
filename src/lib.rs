//! Offline-first HTTP layer.
//!
//! Requests pass through an [`Interceptor`] that applies a caching strategy to
//! reads and queues mutations that cannot reach the network. A
//! [`SyncCoordinator`] replays the queue once connectivity returns. The
//! [`ServiceWorker`] and [`OfflineManager`] wire these into two cooperating
//! tasks that talk only through messages.

pub mod cache;
pub mod config;
pub mod connectivity;
pub mod context;
pub mod db;
pub mod error;
pub mod event;
pub mod http;
pub mod interceptor;
pub mod logging;
pub mod manager;
pub mod strategy;
pub mod sync;
pub mod worker;

#[cfg(test)]
mod testing;

pub use cache::{CacheStore, ResponseSource, Served};
pub use config::Config;
pub use connectivity::Connectivity;
pub use context::OfflineContext;
pub use db::Database;
pub use error::{ReplayError, TransportError};
pub use event::{ClientMessage, ControlMessage, OfflineEvent};
pub use http::{
  HttpClient, Request, Response, Transport, EXTERNAL_OFFLINE_BODY, OFFLINE_MESSAGE,
  QUEUED_MESSAGE,
};
pub use interceptor::Interceptor;
pub use manager::OfflineManager;
pub use strategy::{Route, StrategyEngine};
pub use sync::{RetryPolicy, SyncCoordinator, SyncReport, SyncTrigger};
pub use worker::{ServiceWorker, WorkerHandle, WorkerState};
