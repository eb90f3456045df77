//! Messages exchanged between the worker, the offline manager and the UI.
//!
//! The worker (interception context) and the manager (page context) share no
//! state; everything crossing between them is one of these messages.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tokio::sync::broadcast;
use tracing::{debug, warn};

/// Control messages accepted by the worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum ControlMessage {
  /// Activate a waiting worker immediately
  #[serde(rename = "offline:skipwaiting")]
  SkipWaiting,
  /// Drop every cache namespace of the current version
  #[serde(rename = "offline:clearcache")]
  ClearCache,
  /// Eagerly populate the static cache
  #[serde(rename = "offline:precache")]
  Precache { resources: Vec<String> },
  /// Platform background-sync signal
  #[serde(rename = "offline:sync")]
  BackgroundSync { tag: String },
}

/// Messages posted by the worker to its clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ClientMessage {
  /// A mutation could not reach the network and was queued
  #[serde(rename = "offline:queuerequest")]
  QueueRequest {
    id: i64,
    method: String,
    url: String,
    body: String,
    headers: BTreeMap<String, String>,
  },
  /// The manager should drain the queue
  #[serde(rename = "offline:syncstart")]
  SyncStart,
  /// A new worker version is installed and waiting
  #[serde(rename = "offline:updateavailable")]
  UpdateAvailable,
}

/// Notifications from the offline manager to the UI layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all_fields = "camelCase")]
pub enum OfflineEvent {
  #[serde(rename = "offline:initialized")]
  Initialized { online: bool, sync_pending: bool },
  #[serde(rename = "offline:statuschange")]
  StatusChange { online: bool },
  #[serde(rename = "offline:queued")]
  Queued { id: i64, method: String, url: String },
  #[serde(rename = "offline:syncstart")]
  SyncStart,
  #[serde(rename = "offline:synccomplete")]
  SyncComplete {
    /// Operations attempted in the pass
    count: usize,
    synced: usize,
    failed: usize,
  },
  #[serde(rename = "offline:cachehit")]
  CacheHit { url: String },
  #[serde(rename = "offline:updateavailable")]
  UpdateAvailable,
}

/// Fan-out channel for one message type.
#[derive(Debug, Clone)]
pub struct EventBus<T> {
  tx: broadcast::Sender<T>,
}

impl<T: Clone + std::fmt::Debug> EventBus<T> {
  pub fn new(capacity: usize) -> Self {
    let (tx, _rx) = broadcast::channel(capacity);
    Self { tx }
  }

  /// Deliver to every current subscriber. Having none is not an error.
  pub fn emit(&self, event: T) {
    if let Err(broadcast::error::SendError(event)) = self.tx.send(event) {
      debug!("No subscribers for {:?}", event);
    }
  }

  pub fn subscribe(&self) -> EventStream<T> {
    EventStream {
      rx: self.tx.subscribe(),
    }
  }
}

/// Receiving end of an [`EventBus`].
pub struct EventStream<T> {
  rx: broadcast::Receiver<T>,
}

impl<T: Clone> EventStream<T> {
  /// Receive the next event, or `None` once every sender is gone.
  pub async fn next(&mut self) -> Option<T> {
    loop {
      match self.rx.recv().await {
        Ok(event) => return Some(event),
        Err(broadcast::error::RecvError::Lagged(skipped)) => {
          warn!("Event subscriber lagged, {} events skipped", skipped);
        }
        Err(broadcast::error::RecvError::Closed) => return None,
      }
    }
  }

  /// Non-blocking receive.
  pub fn try_next(&mut self) -> Option<T> {
    loop {
      match self.rx.try_recv() {
        Ok(event) => return Some(event),
        Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
        Err(_) => return None,
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::{json, Value};

  #[test]
  fn test_control_message_wire_format() {
    let msg = ControlMessage::Precache {
      resources: vec!["/app.js".to_string()],
    };
    let value: Value = serde_json::to_value(&msg).unwrap();
    assert_eq!(
      value,
      json!({"type": "offline:precache", "data": {"resources": ["/app.js"]}})
    );

    let parsed: ControlMessage =
      serde_json::from_value(json!({"type": "offline:skipwaiting"})).unwrap();
    assert_eq!(parsed, ControlMessage::SkipWaiting);
  }

  #[test]
  fn test_queue_request_wire_format() {
    let msg = ClientMessage::QueueRequest {
      id: 1,
      method: "POST".to_string(),
      url: "http://localhost/api/tasks".to_string(),
      body: r#"{"name":"x"}"#.to_string(),
      headers: BTreeMap::new(),
    };
    let value: Value = serde_json::to_value(&msg).unwrap();
    assert_eq!(value["type"], "offline:queuerequest");
    assert_eq!(value["method"], "POST");
    assert_eq!(value["body"], r#"{"name":"x"}"#);

    let value: Value = serde_json::to_value(OfflineEvent::Queued {
      id: 1,
      method: "POST".to_string(),
      url: "http://localhost/api/tasks".to_string(),
    })
    .unwrap();
    assert_eq!(value["type"], "offline:queued");
  }

  #[test]
  fn test_sync_complete_wire_format() {
    let value: Value = serde_json::to_value(OfflineEvent::SyncComplete {
      count: 3,
      synced: 2,
      failed: 1,
    })
    .unwrap();
    assert_eq!(value["type"], "offline:synccomplete");
    assert_eq!(value["count"], 3);

    let value: Value = serde_json::to_value(OfflineEvent::Initialized {
      online: true,
      sync_pending: false,
    })
    .unwrap();
    assert_eq!(value["syncPending"], false);
  }

  #[tokio::test]
  async fn test_bus_fans_out() {
    let bus = EventBus::new(8);
    let mut a = bus.subscribe();
    let mut b = bus.subscribe();

    bus.emit(OfflineEvent::SyncStart);
    assert_eq!(a.next().await, Some(OfflineEvent::SyncStart));
    assert_eq!(b.next().await, Some(OfflineEvent::SyncStart));
    assert_eq!(a.try_next(), None);
  }

  #[test]
  fn test_emit_without_subscribers() {
    let bus: EventBus<OfflineEvent> = EventBus::new(8);
    bus.emit(OfflineEvent::SyncStart);
  }
}
