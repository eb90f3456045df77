use color_eyre::Result;
use std::sync::Arc;
use tracing::info;

use crate::cache::{CacheStore, Namespaces, SqliteStorage};
use crate::config::Config;
use crate::connectivity::Connectivity;
use crate::db::Database;
use crate::event::{EventBus, OfflineEvent};
use crate::http::Transport;
use crate::strategy::{Classifier, StrategyEngine};
use crate::sync::SyncCoordinator;

const RESPONSE_DB: &str = "responses.db";
const QUEUE_DB: &str = "offline.db";

/// Everything the two execution contexts are built from. Cloning shares the
/// underlying stores.
pub struct OfflineContext<T: Transport> {
  pub config: Arc<Config>,
  pub transport: Arc<T>,
  pub caches: CacheStore,
  pub queue: Arc<Database>,
  pub connectivity: Connectivity,
}

impl<T: Transport> OfflineContext<T> {
  /// Open the on-disk stores under the configured data directory.
  pub fn open(config: Config, transport: T) -> Result<Self> {
    let dir = config.data_dir()?;
    info!(dir = %dir.display(), "Opening offline stores");

    let storage = SqliteStorage::open(&dir.join(RESPONSE_DB))?;
    let queue = Database::open(&dir.join(QUEUE_DB))?;
    Ok(Self::assemble(config, transport, storage, queue))
  }

  pub fn in_memory(config: Config, transport: T) -> Result<Self> {
    let storage = SqliteStorage::open_in_memory()?;
    let queue = Database::open_in_memory()?;
    Ok(Self::assemble(config, transport, storage, queue))
  }

  fn assemble(config: Config, transport: T, storage: SqliteStorage, queue: Database) -> Self {
    let namespaces = Namespaces::from_config(&config.cache);
    Self {
      config: Arc::new(config),
      transport: Arc::new(transport),
      caches: CacheStore::new(storage, namespaces),
      queue: Arc::new(queue),
      connectivity: Connectivity::default(),
    }
  }

  pub fn engine(&self) -> Result<StrategyEngine<T>> {
    Ok(StrategyEngine::new(
      Arc::clone(&self.transport),
      self.caches.clone(),
      Classifier::from_config(&self.config)?,
      self.connectivity.clone(),
      self.config.resolve(&self.config.offline_page)?,
    ))
  }

  pub fn sync_coordinator(&self, events: EventBus<OfflineEvent>) -> SyncCoordinator<T> {
    SyncCoordinator::new(
      Arc::clone(&self.transport),
      Arc::clone(&self.queue),
      self.connectivity.clone(),
      events,
      &self.config.sync,
    )
  }
}

impl<T: Transport> Clone for OfflineContext<T> {
  fn clone(&self) -> Self {
    Self {
      config: Arc::clone(&self.config),
      transport: Arc::clone(&self.transport),
      caches: self.caches.clone(),
      queue: Arc::clone(&self.queue),
      connectivity: self.connectivity.clone(),
    }
  }
}
