use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, OptionalExtension};
use serde_json::Value;
use std::time::Duration;

use super::{datetime_from_millis, Database};

/// A cached JSON body.
#[derive(Debug, Clone, PartialEq)]
pub struct ApiCacheEntry {
  pub key: String,
  pub body: Value,
  pub stored_at: DateTime<Utc>,
  pub expires_at: DateTime<Utc>,
}

impl ApiCacheEntry {
  pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
    now >= self.expires_at
  }
}

impl Database {
  /// Store a JSON body under `key` for `ttl`, replacing any previous entry.
  pub fn api_cache_put(&self, key: &str, body: &Value, ttl: Duration) -> Result<ApiCacheEntry> {
    let stored_at = Utc::now();
    let ttl = chrono::Duration::from_std(ttl).map_err(|e| eyre!("Invalid TTL: {}", e))?;
    let expires_at = stored_at + ttl;
    let json = serde_json::to_string(body).map_err(|e| eyre!("Failed to serialize body: {}", e))?;

    self
      .conn()?
      .execute(
        "INSERT OR REPLACE INTO api_cache (key, body, stored_at, expires_at)
         VALUES (?, ?, ?, ?)",
        params![
          key,
          json,
          stored_at.timestamp_millis(),
          expires_at.timestamp_millis()
        ],
      )
      .map_err(|e| eyre!("Failed to cache API response {}: {}", key, e))?;

    Ok(ApiCacheEntry {
      key: key.to_string(),
      body: body.clone(),
      stored_at,
      expires_at,
    })
  }

  /// Cached body for `key`, or `None` when missing or expired.
  pub fn api_cache_get(&self, key: &str) -> Result<Option<Value>> {
    self.api_cache_get_at(key, Utc::now())
  }

  /// Expired entries are left in place; they are only removed by pruning.
  pub fn api_cache_get_at(&self, key: &str, now: DateTime<Utc>) -> Result<Option<Value>> {
    Ok(
      self
        .api_cache_entry(key)?
        .filter(|entry| !entry.is_expired_at(now))
        .map(|entry| entry.body),
    )
  }

  /// Raw entry, expired or not.
  pub fn api_cache_entry(&self, key: &str) -> Result<Option<ApiCacheEntry>> {
    let conn = self.conn()?;
    let row: Option<(String, i64, i64)> = conn
      .query_row(
        "SELECT body, stored_at, expires_at FROM api_cache WHERE key = ?",
        params![key],
        |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
      )
      .optional()
      .map_err(|e| eyre!("Failed to query API cache {}: {}", key, e))?;

    let Some((body, stored_at, expires_at)) = row else {
      return Ok(None);
    };

    Ok(Some(ApiCacheEntry {
      key: key.to_string(),
      body: serde_json::from_str(&body)
        .map_err(|e| eyre!("Failed to deserialize cached body {}: {}", key, e))?,
      stored_at: datetime_from_millis(stored_at)?,
      expires_at: datetime_from_millis(expires_at)?,
    }))
  }

  /// Delete entries that expired at or before `now`.
  pub fn prune_expired_api_cache(&self, now: DateTime<Utc>) -> Result<usize> {
    self
      .conn()?
      .execute(
        "DELETE FROM api_cache WHERE expires_at <= ?",
        params![now.timestamp_millis()],
      )
      .map_err(|e| eyre!("Failed to prune API cache: {}", e))
  }
}
