use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, OptionalExtension};
use serde_json::Value;

use super::{datetime_from_millis, Database};

#[derive(Debug, Clone, PartialEq)]
pub struct UserRecord {
  pub key: String,
  pub data: Value,
  pub category: String,
  pub stored_at: DateTime<Utc>,
}

impl Database {
  pub fn save_user_data(&self, key: &str, data: &Value, category: &str) -> Result<()> {
    let json = serde_json::to_string(data).map_err(|e| eyre!("Failed to serialize data: {}", e))?;

    self
      .conn()?
      .execute(
        "INSERT OR REPLACE INTO user_data (key, data, category, stored_at) VALUES (?, ?, ?, ?)",
        params![key, json, category, Utc::now().timestamp_millis()],
      )
      .map_err(|e| eyre!("Failed to save user data {}: {}", key, e))?;

    Ok(())
  }

  pub fn get_user_data(&self, key: &str) -> Result<Option<Value>> {
    let data: Option<String> = self
      .conn()?
      .query_row(
        "SELECT data FROM user_data WHERE key = ?",
        params![key],
        |row| row.get(0),
      )
      .optional()
      .map_err(|e| eyre!("Failed to load user data {}: {}", key, e))?;

    data
      .map(|d| serde_json::from_str(&d))
      .transpose()
      .map_err(|e| eyre!("Failed to deserialize user data {}: {}", key, e))
  }

  pub fn list_user_data(&self, category: &str) -> Result<Vec<UserRecord>> {
    let conn = self.conn()?;
    let mut stmt = conn
      .prepare(
        "SELECT key, data, stored_at FROM user_data WHERE category = ? ORDER BY key",
      )
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let rows = stmt
      .query_map(params![category], |row| {
        Ok((
          row.get::<_, String>(0)?,
          row.get::<_, String>(1)?,
          row.get::<_, i64>(2)?,
        ))
      })
      .map_err(|e| eyre!("Failed to query user data: {}", e))?
      .collect::<rusqlite::Result<Vec<_>>>()
      .map_err(|e| eyre!("Failed to read user data: {}", e))?;

    rows
      .into_iter()
      .map(|(key, data, stored_at)| {
        Ok(UserRecord {
          data: serde_json::from_str(&data)
            .map_err(|e| eyre!("Failed to deserialize user data {}: {}", key, e))?,
          key,
          category: category.to_string(),
          stored_at: datetime_from_millis(stored_at)?,
        })
      })
      .collect()
  }
}
