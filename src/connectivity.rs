use std::sync::Arc;
use tokio::sync::watch;
use tracing::info;

/// Shared connectivity flag. Clones observe the same state.
#[derive(Debug, Clone)]
pub struct Connectivity {
  tx: Arc<watch::Sender<bool>>,
}

impl Connectivity {
  pub fn new(online: bool) -> Self {
    let (tx, _rx) = watch::channel(online);
    Self { tx: Arc::new(tx) }
  }

  pub fn is_online(&self) -> bool {
    *self.tx.borrow()
  }

  /// Record a transition reported by the host network stack.
  ///
  /// Returns whether the state changed; subscribers are only woken on change.
  pub fn set_online(&self, online: bool) -> bool {
    let changed = self.tx.send_if_modified(|state| {
      if *state == online {
        false
      } else {
        *state = online;
        true
      }
    });

    if changed {
      info!(online, "Connectivity changed");
    }
    changed
  }

  pub fn subscribe(&self) -> watch::Receiver<bool> {
    self.tx.subscribe()
  }
}

impl Default for Connectivity {
  fn default() -> Self {
    Self::new(true)
  }
}
