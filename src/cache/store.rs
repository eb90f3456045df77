use color_eyre::Result;
use std::sync::Arc;
use tracing::info;

use super::namespace::{Namespaces, ResourceClass};
use super::storage::{CacheEntry, SqliteStorage};
use crate::http::{Request, Response};

/// All response caches of one cache family.
#[derive(Clone)]
pub struct CacheStore {
  storage: Arc<SqliteStorage>,
  namespaces: Namespaces,
}

impl CacheStore {
  pub fn new(storage: SqliteStorage, namespaces: Namespaces) -> Self {
    Self {
      storage: Arc::new(storage),
      namespaces,
    }
  }

  pub fn namespaces(&self) -> &Namespaces {
    &self.namespaces
  }

  /// Open (creating if needed) the cache with the given name.
  pub fn open(&self, name: &str) -> Result<Cache> {
    self.storage.open_cache(name)?;
    Ok(Cache {
      name: name.to_string(),
      storage: Arc::clone(&self.storage),
    })
  }

  /// Handle to the current-version cache of a resource class.
  ///
  /// The cache itself is created lazily on the first write.
  pub fn for_class(&self, class: ResourceClass) -> Cache {
    Cache {
      name: self.namespaces.name(class),
      storage: Arc::clone(&self.storage),
    }
  }

  pub fn keys(&self) -> Result<Vec<String>> {
    self.storage.cache_names()
  }

  pub fn delete(&self, name: &str) -> Result<bool> {
    self.storage.delete_cache(name)
  }

  /// Delete every cache of this family that is not of the current version.
  pub fn collect_garbage(&self) -> Result<Vec<String>> {
    let mut deleted = Vec::new();
    for name in self.keys()? {
      if self.namespaces.is_obsolete(&name) {
        info!("Deleting obsolete cache {}", name);
        self.storage.delete_cache(&name)?;
        deleted.push(name);
      }
    }
    Ok(deleted)
  }

  /// Drop the static, dynamic and API caches of the current version.
  pub fn clear(&self) -> Result<()> {
    for name in self.namespaces.current() {
      self.storage.delete_cache(&name)?;
    }
    Ok(())
  }
}

/// A single named cache.
#[derive(Clone)]
pub struct Cache {
  name: String,
  storage: Arc<SqliteStorage>,
}

impl Cache {
  pub fn name(&self) -> &str {
    &self.name
  }

  pub fn match_request(&self, request: &Request) -> Result<Option<CacheEntry>> {
    self.storage.lookup(&self.name, request)
  }

  /// Store a snapshot, replacing any previous one for the same request.
  pub fn put(&self, request: &Request, response: &Response) -> Result<()> {
    self.storage.put(&self.name, request, response)
  }

  pub fn delete_all(&self) -> Result<bool> {
    self.storage.delete_cache(&self.name)
  }

  pub fn len(&self) -> Result<usize> {
    self.storage.entry_count(&self.name)
  }
}
