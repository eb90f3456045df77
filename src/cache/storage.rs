//! SQLite storage for HTTP response snapshots.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use crate::db::datetime_from_millis;
use crate::http::{Request, Response};

/// A stored response snapshot.
#[derive(Debug, Clone)]
pub struct CacheEntry {
  pub cache_name: String,
  pub request_key: String,
  pub url: String,
  pub response: Response,
  pub stored_at: DateTime<Utc>,
}

/// SQLite-based response cache, partitioned into named caches.
pub struct SqliteStorage {
  conn: Mutex<Connection>,
}

/// Schema for cache tables.
const CACHE_SCHEMA: &str = r#"
-- Known cache namespaces (a cache exists once opened, even when empty)
CREATE TABLE IF NOT EXISTS cache_names (
    name TEXT PRIMARY KEY,
    created_at INTEGER NOT NULL
);

-- Response snapshots, one row per (cache, method + url)
CREATE TABLE IF NOT EXISTS cache_entries (
    cache_name TEXT NOT NULL,
    request_key TEXT NOT NULL,
    method TEXT NOT NULL,
    url TEXT NOT NULL,
    status INTEGER NOT NULL,
    headers TEXT NOT NULL,
    body BLOB NOT NULL,
    stored_at INTEGER NOT NULL,
    PRIMARY KEY (cache_name, request_key)
);
"#;

impl SqliteStorage {
  /// Open or create the response cache at the given path.
  pub fn open(path: &Path) -> Result<Self> {
    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create cache directory: {}", e))?;
    }

    let conn = Connection::open(path)
      .map_err(|e| eyre!("Failed to open cache database at {}: {}", path.display(), e))?;

    Self::with_connection(conn)
  }

  pub fn open_in_memory() -> Result<Self> {
    let conn = Connection::open_in_memory()
      .map_err(|e| eyre!("Failed to open in-memory cache database: {}", e))?;

    Self::with_connection(conn)
  }

  fn with_connection(conn: Connection) -> Result<Self> {
    let storage = Self {
      conn: Mutex::new(conn),
    };
    storage.run_migrations()?;
    Ok(storage)
  }

  /// Run database migrations for cache tables.
  fn run_migrations(&self) -> Result<()> {
    self
      .conn()?
      .execute_batch(CACHE_SCHEMA)
      .map_err(|e| eyre!("Failed to run cache migrations: {}", e))?;

    Ok(())
  }

  fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
    self.conn.lock().map_err(|e| eyre!("Lock poisoned: {}", e))
  }

  #[cfg(test)]
  pub(crate) fn execute_batch(&self, sql: &str) -> Result<()> {
    self
      .conn()?
      .execute_batch(sql)
      .map_err(|e| eyre!("Failed to execute batch: {}", e))
  }

  /// Register a cache namespace. Opening an existing cache is a no-op.
  pub fn open_cache(&self, name: &str) -> Result<()> {
    self
      .conn()?
      .execute(
        "INSERT OR IGNORE INTO cache_names (name, created_at) VALUES (?, ?)",
        params![name, Utc::now().timestamp_millis()],
      )
      .map_err(|e| eyre!("Failed to open cache {}: {}", name, e))?;

    Ok(())
  }

  /// Store a response for a GET request, replacing any previous snapshot.
  pub fn put(&self, cache_name: &str, request: &Request, response: &Response) -> Result<()> {
    if !request.is_get() {
      return Err(eyre!(
        "Only GET requests can be cached, got {}",
        request.method
      ));
    }

    let headers = serde_json::to_string(&response.headers)
      .map_err(|e| eyre!("Failed to serialize headers: {}", e))?;

    let mut conn = self.conn()?;
    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    tx.execute(
      "INSERT OR IGNORE INTO cache_names (name, created_at) VALUES (?, ?)",
      params![cache_name, Utc::now().timestamp_millis()],
    )
    .map_err(|e| eyre!("Failed to open cache {}: {}", cache_name, e))?;

    tx.execute(
      "INSERT OR REPLACE INTO cache_entries
         (cache_name, request_key, method, url, status, headers, body, stored_at)
       VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
      params![
        cache_name,
        request.cache_key(),
        request.method.as_str(),
        request.cache_url(),
        response.status,
        headers,
        response.body,
        Utc::now().timestamp_millis(),
      ],
    )
    .map_err(|e| eyre!("Failed to store response: {}", e))?;

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

    Ok(())
  }

  /// Look up the snapshot stored for a request.
  pub fn lookup(&self, cache_name: &str, request: &Request) -> Result<Option<CacheEntry>> {
    let conn = self.conn()?;

    let row: Option<(String, u16, String, Vec<u8>, i64)> = conn
      .query_row(
        "SELECT url, status, headers, body, stored_at FROM cache_entries
         WHERE cache_name = ? AND request_key = ?",
        params![cache_name, request.cache_key()],
        |row| {
          Ok((
            row.get(0)?,
            row.get(1)?,
            row.get(2)?,
            row.get(3)?,
            row.get(4)?,
          ))
        },
      )
      .optional()
      .map_err(|e| eyre!("Failed to query cache {}: {}", cache_name, e))?;

    let Some((url, status, headers, body, stored_at)) = row else {
      return Ok(None);
    };

    let headers: BTreeMap<String, String> = serde_json::from_str(&headers)
      .map_err(|e| eyre!("Failed to deserialize cached headers: {}", e))?;

    Ok(Some(CacheEntry {
      cache_name: cache_name.to_string(),
      request_key: request.cache_key(),
      url,
      response: Response::new(status, headers, body),
      stored_at: datetime_from_millis(stored_at)?,
    }))
  }

  /// Delete a cache and all of its entries. Returns whether it existed.
  pub fn delete_cache(&self, name: &str) -> Result<bool> {
    let mut conn = self.conn()?;
    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    tx.execute(
      "DELETE FROM cache_entries WHERE cache_name = ?",
      params![name],
    )
    .map_err(|e| eyre!("Failed to delete entries of cache {}: {}", name, e))?;

    let removed = tx
      .execute("DELETE FROM cache_names WHERE name = ?", params![name])
      .map_err(|e| eyre!("Failed to delete cache {}: {}", name, e))?;

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

    Ok(removed > 0)
  }

  /// Names of all caches, sorted.
  pub fn cache_names(&self) -> Result<Vec<String>> {
    let conn = self.conn()?;
    let mut stmt = conn
      .prepare("SELECT name FROM cache_names ORDER BY name")
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let names = stmt
      .query_map([], |row| row.get(0))
      .map_err(|e| eyre!("Failed to list caches: {}", e))?
      .collect::<rusqlite::Result<Vec<String>>>()
      .map_err(|e| eyre!("Failed to read cache name: {}", e))?;

    Ok(names)
  }

  pub fn entry_count(&self, cache_name: &str) -> Result<usize> {
    let count: i64 = self
      .conn()?
      .query_row(
        "SELECT COUNT(*) FROM cache_entries WHERE cache_name = ?",
        params![cache_name],
        |row| row.get(0),
      )
      .map_err(|e| eyre!("Failed to count entries of {}: {}", cache_name, e))?;

    Ok(count as usize)
  }
}
