//! Sync coordinator: drains the durable queue against the network.

use chrono::Utc;
use color_eyre::{eyre::eyre, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::config::SyncConfig;
use crate::connectivity::Connectivity;
use crate::db::{Database, PendingOperation};
use crate::error::ReplayError;
use crate::event::{EventBus, OfflineEvent};
use crate::http::Transport;
use crate::strategy::fetch_network;

/// What started a sync pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncTrigger {
  /// Connectivity went from offline to online
  Reconnect,
  /// Background-sync signal relayed by the worker
  Background,
  /// Explicit user request; ignores backoff
  Manual,
}

/// Retry bookkeeping for failed replays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
  pub max_retries: u32,
  pub base: Duration,
  pub cap: Duration,
}

impl RetryPolicy {
  pub fn from_config(config: &SyncConfig) -> Self {
    Self {
      max_retries: config.max_retries,
      base: config.backoff_base(),
      cap: config.backoff_cap(),
    }
  }

  /// Delay before the next automatic attempt after `retry_count` failures:
  /// `base * 2^(retry_count - 1)`, capped.
  pub fn backoff(&self, retry_count: u32) -> Duration {
    let exponent = retry_count.saturating_sub(1).min(31);
    self
      .base
      .checked_mul(1 << exponent)
      .map_or(self.cap, |delay| delay.min(self.cap))
  }

  pub fn is_exhausted(&self, retry_count: u32) -> bool {
    retry_count >= self.max_retries
  }
}

/// Outcome of one sync pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncReport {
  /// Operations replayed in this pass
  pub processed: usize,
  pub synced: usize,
  pub failed: usize,
  /// Failures that exhausted their retries
  pub parked: usize,
  /// Left for a later pass (backoff pending, or connectivity lost mid-pass)
  pub deferred: usize,
}

impl SyncReport {
  fn absorb(&mut self, pass: SyncReport) {
    self.processed += pass.processed;
    self.synced += pass.synced;
    self.failed += pass.failed;
    self.parked += pass.parked;
    self.deferred = pass.deferred;
  }
}

/// Replays pending operations in enqueue order, one at a time.
///
/// At most one pass runs at a time. A trigger that arrives while a pass is
/// running is folded into it: the running coordinator re-lists the queue and
/// runs another pass before it lets go.
pub struct SyncCoordinator<T: Transport> {
  transport: Arc<T>,
  queue: Arc<Database>,
  connectivity: Connectivity,
  events: EventBus<OfflineEvent>,
  policy: RetryPolicy,
  retention: Duration,
  idempotency_header: Option<String>,
  running: Arc<AtomicBool>,
  rerun: Arc<AtomicBool>,
}

/// Clears the running flag when a pass ends, including on error.
struct RunningGuard(Arc<AtomicBool>);

impl Drop for RunningGuard {
  fn drop(&mut self) {
    self.0.store(false, Ordering::SeqCst);
  }
}

impl<T: Transport> SyncCoordinator<T> {
  pub fn new(
    transport: Arc<T>,
    queue: Arc<Database>,
    connectivity: Connectivity,
    events: EventBus<OfflineEvent>,
    config: &SyncConfig,
  ) -> Self {
    Self {
      transport,
      queue,
      connectivity,
      events,
      policy: RetryPolicy::from_config(config),
      retention: config.synced_retention(),
      idempotency_header: config.idempotency_header.clone(),
      running: Arc::new(AtomicBool::new(false)),
      rerun: Arc::new(AtomicBool::new(false)),
    }
  }

  pub fn policy(&self) -> &RetryPolicy {
    &self.policy
  }

  pub fn is_running(&self) -> bool {
    self.running.load(Ordering::SeqCst)
  }

  /// Drain the queue.
  ///
  /// Returns `None` when skipped because the network is offline, or because
  /// another pass is in progress; that pass picks up this request and runs
  /// again once it finishes. The report sums every pass run here.
  pub async fn sync(&self, trigger: SyncTrigger) -> Result<Option<SyncReport>> {
    if !self.connectivity.is_online() {
      debug!(?trigger, "Offline, skipping sync");
      return Ok(None);
    }

    // Flag first so a pass finishing right now still sees the request
    self.rerun.store(true, Ordering::SeqCst);
    let Some(mut guard) = self.try_start() else {
      debug!(?trigger, "Sync already running, another pass requested");
      return Ok(None);
    };

    let mut report = SyncReport::default();
    loop {
      self.rerun.store(false, Ordering::SeqCst);
      report.absorb(self.run_pass(trigger).await?);
      drop(guard);

      if !self.rerun.load(Ordering::SeqCst) || !self.connectivity.is_online() {
        break;
      }
      match self.try_start() {
        Some(next) => {
          debug!(?trigger, "Sync requested during pass, running again");
          guard = next;
        }
        None => break,
      }
    }
    Ok(Some(report))
  }

  fn try_start(&self) -> Option<RunningGuard> {
    self
      .running
      .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
      .ok()
      .map(|_| RunningGuard(Arc::clone(&self.running)))
  }

  /// Replay every unsynced operation once, in enqueue order.
  async fn run_pass(&self, trigger: SyncTrigger) -> Result<SyncReport> {
    let operations = self.queue.list_unsynced()?;
    info!(?trigger, pending = operations.len(), "Starting sync");
    self.events.emit(OfflineEvent::SyncStart);

    let now = Utc::now();
    let mut report = SyncReport::default();

    for (index, op) in operations.iter().enumerate() {
      if !self.connectivity.is_online() {
        warn!("Connectivity lost during sync, deferring the rest");
        report.deferred += operations.len() - index;
        break;
      }
      if trigger != SyncTrigger::Manual && !op.is_due(now) {
        report.deferred += 1;
        continue;
      }

      report.processed += 1;
      match self.replay(op).await {
        Ok(()) => {
          self.queue.mark_synced(op.id)?;
          debug!(id = op.id, op = %op.op_type, "Operation synced");
          report.synced += 1;
        }
        Err(e) => {
          report.failed += 1;
          if self.record_failure(op, &e)? {
            report.parked += 1;
          }
        }
      }
    }

    info!(
      processed = report.processed,
      synced = report.synced,
      failed = report.failed,
      deferred = report.deferred,
      "Sync complete"
    );
    self.events.emit(OfflineEvent::SyncComplete {
      count: report.processed,
      synced: report.synced,
      failed: report.failed,
    });

    self.prune()?;
    Ok(report)
  }

  /// Reissue the queued request. Only a 2xx answer counts as success.
  async fn replay(&self, op: &PendingOperation) -> Result<(), ReplayError> {
    let mut request = op
      .payload
      .to_request()
      .map_err(|e| ReplayError::InvalidPayload(e.to_string()))?;
    if let Some(header) = &self.idempotency_header {
      request = request.with_header(header, &op.idempotency_key);
    }

    let response = fetch_network(self.transport.as_ref(), &self.connectivity, &request).await?;
    if response.is_success() {
      Ok(())
    } else {
      Err(ReplayError::Rejected(response.status))
    }
  }

  /// Bump the retry count and schedule or park. Returns whether the operation
  /// was parked.
  fn record_failure(&self, op: &PendingOperation, error: &ReplayError) -> Result<bool> {
    let retries = self.queue.increment_retry(op.id)?;

    if self.policy.is_exhausted(retries) {
      warn!(id = op.id, op = %op.op_type, retries, "Replay failed ({}), parking", error);
      self.queue.note_failure(op.id, &error.to_string(), None, true)?;
      return Ok(true);
    }

    let delay = self.policy.backoff(retries);
    let next_attempt = Utc::now()
      + chrono::Duration::from_std(delay).map_err(|e| eyre!("Invalid backoff: {}", e))?;
    warn!(
      id = op.id,
      op = %op.op_type,
      retries,
      "Replay failed ({}), retrying in {}s",
      error,
      delay.as_secs()
    );
    self
      .queue
      .note_failure(op.id, &error.to_string(), Some(next_attempt), false)?;
    Ok(false)
  }

  /// Drop synced operations past retention and expired API-cache rows.
  pub fn prune(&self) -> Result<()> {
    let now = Utc::now();
    let retention =
      chrono::Duration::from_std(self.retention).map_err(|e| eyre!("Invalid retention: {}", e))?;

    let operations = self.queue.prune_synced(now - retention)?;
    let api_entries = self.queue.prune_expired_api_cache(now)?;
    if operations > 0 || api_entries > 0 {
      debug!(operations, api_entries, "Pruned stale rows");
    }
    Ok(())
  }
}

impl<T: Transport> Clone for SyncCoordinator<T> {
  fn clone(&self) -> Self {
    Self {
      transport: Arc::clone(&self.transport),
      queue: Arc::clone(&self.queue),
      connectivity: self.connectivity.clone(),
      events: self.events.clone(),
      policy: self.policy,
      retention: self.retention,
      idempotency_header: self.idempotency_header.clone(),
      running: Arc::clone(&self.running),
      rerun: Arc::clone(&self.rerun),
    }
  }
}
