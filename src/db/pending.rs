//! Pending mutations awaiting replay.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, OptionalExtension, Row};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;
use url::Url;

use super::{datetime_from_millis, Database};
use crate::http::{Method, Request};

/// The closed set of mutation kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationAction {
  Create,
  Update,
  Delete,
}

impl MutationAction {
  /// POST creates, PUT/PATCH update, DELETE deletes. Anything else cannot be
  /// queued.
  pub fn from_method(method: &Method) -> Option<Self> {
    if method == Method::POST {
      Some(Self::Create)
    } else if method == Method::PUT || method == Method::PATCH {
      Some(Self::Update)
    } else if method == Method::DELETE {
      Some(Self::Delete)
    } else {
      None
    }
  }

  pub fn as_str(&self) -> &'static str {
    match self {
      Self::Create => "create",
      Self::Update => "update",
      Self::Delete => "delete",
    }
  }

  fn parse(s: &str) -> Result<Self> {
    match s {
      "create" => Ok(Self::Create),
      "update" => Ok(Self::Update),
      "delete" => Ok(Self::Delete),
      other => Err(eyre!("Unknown mutation action: {}", other)),
    }
  }
}

/// What a pending operation does: an action against a named resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperationType {
  pub action: MutationAction,
  pub resource: String,
}

impl OperationType {
  pub fn new(action: MutationAction, resource: impl Into<String>) -> Self {
    Self {
      action,
      resource: resource.into(),
    }
  }

  /// Derive the operation type of a mutating request.
  ///
  /// The resource is the first path segment below the API prefix
  /// (`/api/tasks/42` -> `tasks`), or the first path segment otherwise.
  pub fn for_request(request: &Request, api_prefix: &str) -> Option<Self> {
    let action = MutationAction::from_method(&request.method)?;
    let path = request.path();
    let rest = path.strip_prefix(api_prefix).unwrap_or(path);
    let resource = rest
      .split('/')
      .find(|segment| !segment.is_empty())
      .unwrap_or("root");

    Some(Self::new(action, resource))
  }
}

impl fmt::Display for OperationType {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}:{}", self.action.as_str(), self.resource)
  }
}

/// Everything needed to reissue the request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestPayload {
  pub method: String,
  pub url: String,
  pub headers: BTreeMap<String, String>,
  pub body: Option<Vec<u8>>,
}

impl RequestPayload {
  pub fn from_request(request: &Request) -> Self {
    Self {
      method: request.method.as_str().to_string(),
      url: request.url.to_string(),
      headers: request.headers.clone(),
      body: request.body.clone(),
    }
  }

  pub fn to_request(&self) -> Result<Request> {
    let method = Method::from_bytes(self.method.as_bytes())
      .map_err(|e| eyre!("Invalid stored method '{}': {}", self.method, e))?;
    let url =
      Url::parse(&self.url).map_err(|e| eyre!("Invalid stored URL '{}': {}", self.url, e))?;

    Ok(Request {
      method,
      url,
      headers: self.headers.clone(),
      body: self.body.clone(),
    })
  }
}

/// A queued mutation.
#[derive(Debug, Clone)]
pub struct PendingOperation {
  /// Monotonic; replay follows id order
  pub id: i64,
  pub op_type: OperationType,
  pub payload: RequestPayload,
  /// Sent on replay so the server can drop duplicates
  pub idempotency_key: String,
  pub created_at: DateTime<Utc>,
  pub synced: bool,
  pub synced_at: Option<DateTime<Utc>>,
  pub retry_count: u32,
  /// Retries exhausted; skipped by sync passes until re-queued
  pub parked: bool,
  pub last_error: Option<String>,
  /// Earliest time an automatic sync pass will replay it again
  pub next_attempt_at: Option<DateTime<Utc>>,
}

impl PendingOperation {
  pub fn is_due(&self, now: DateTime<Utc>) -> bool {
    self.next_attempt_at.map_or(true, |at| at <= now)
  }
}

const OPERATION_COLUMNS: &str = "id, action, resource, method, url, headers, body, \
  idempotency_key, created_at, synced, synced_at, parked, retry_count, last_error, next_attempt_at";

struct OperationRow {
  id: i64,
  action: String,
  resource: String,
  method: String,
  url: String,
  headers: String,
  body: Option<Vec<u8>>,
  idempotency_key: String,
  created_at: i64,
  synced: bool,
  synced_at: Option<i64>,
  parked: bool,
  retry_count: u32,
  last_error: Option<String>,
  next_attempt_at: Option<i64>,
}

impl OperationRow {
  fn read(row: &Row<'_>) -> rusqlite::Result<Self> {
    Ok(Self {
      id: row.get(0)?,
      action: row.get(1)?,
      resource: row.get(2)?,
      method: row.get(3)?,
      url: row.get(4)?,
      headers: row.get(5)?,
      body: row.get(6)?,
      idempotency_key: row.get(7)?,
      created_at: row.get(8)?,
      synced: row.get(9)?,
      synced_at: row.get(10)?,
      parked: row.get(11)?,
      retry_count: row.get(12)?,
      last_error: row.get(13)?,
      next_attempt_at: row.get(14)?,
    })
  }

  fn into_operation(self) -> Result<PendingOperation> {
    let headers: BTreeMap<String, String> = serde_json::from_str(&self.headers)
      .map_err(|e| eyre!("Failed to deserialize headers of operation {}: {}", self.id, e))?;

    Ok(PendingOperation {
      id: self.id,
      op_type: OperationType::new(MutationAction::parse(&self.action)?, self.resource),
      payload: RequestPayload {
        method: self.method,
        url: self.url,
        headers,
        body: self.body,
      },
      idempotency_key: self.idempotency_key,
      created_at: datetime_from_millis(self.created_at)?,
      synced: self.synced,
      synced_at: self.synced_at.map(datetime_from_millis).transpose()?,
      retry_count: self.retry_count,
      parked: self.parked,
      last_error: self.last_error,
      next_attempt_at: self.next_attempt_at.map(datetime_from_millis).transpose()?,
    })
  }
}

fn idempotency_key(id: i64, created_at: DateTime<Utc>, payload: &RequestPayload) -> String {
  let mut hasher = Sha256::new();
  hasher.update(id.to_be_bytes());
  hasher.update(created_at.timestamp_nanos_opt().unwrap_or_default().to_be_bytes());
  hasher.update(payload.method.as_bytes());
  hasher.update(payload.url.as_bytes());
  if let Some(body) = &payload.body {
    hasher.update(body);
  }
  hex::encode(hasher.finalize())
}

impl Database {
  /// Persist a mutation for later replay. Returns its id.
  pub fn enqueue(&self, op_type: &OperationType, payload: &RequestPayload) -> Result<i64> {
    let created_at = Utc::now();
    let headers = serde_json::to_string(&payload.headers)
      .map_err(|e| eyre!("Failed to serialize headers: {}", e))?;

    let mut conn = self.conn()?;
    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    tx.execute(
      "INSERT INTO pending_operations (action, resource, method, url, headers, body, created_at)
       VALUES (?, ?, ?, ?, ?, ?, ?)",
      params![
        op_type.action.as_str(),
        op_type.resource,
        payload.method,
        payload.url,
        headers,
        payload.body,
        created_at.timestamp_millis(),
      ],
    )
    .map_err(|e| eyre!("Failed to enqueue operation: {}", e))?;

    let id = tx.last_insert_rowid();
    tx.execute(
      "UPDATE pending_operations SET idempotency_key = ? WHERE id = ?",
      params![idempotency_key(id, created_at, payload), id],
    )
    .map_err(|e| eyre!("Failed to store idempotency key: {}", e))?;

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

    Ok(id)
  }

  pub fn get_operation(&self, id: i64) -> Result<Option<PendingOperation>> {
    let conn = self.conn()?;
    let row = conn
      .query_row(
        &format!("SELECT {OPERATION_COLUMNS} FROM pending_operations WHERE id = ?"),
        params![id],
        OperationRow::read,
      )
      .optional()
      .map_err(|e| eyre!("Failed to load operation {}: {}", id, e))?;

    row.map(OperationRow::into_operation).transpose()
  }

  /// Operations waiting for replay, in enqueue order. Parked operations are
  /// not included.
  pub fn list_unsynced(&self) -> Result<Vec<PendingOperation>> {
    self.list_where("synced = 0 AND parked = 0")
  }

  /// Operations whose retries are exhausted.
  pub fn list_parked(&self) -> Result<Vec<PendingOperation>> {
    self.list_where("synced = 0 AND parked = 1")
  }

  fn list_where(&self, filter: &str) -> Result<Vec<PendingOperation>> {
    let conn = self.conn()?;
    let mut stmt = conn
      .prepare(&format!(
        "SELECT {OPERATION_COLUMNS} FROM pending_operations WHERE {filter} ORDER BY id"
      ))
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let rows = stmt
      .query_map([], OperationRow::read)
      .map_err(|e| eyre!("Failed to query operations: {}", e))?
      .collect::<rusqlite::Result<Vec<_>>>()
      .map_err(|e| eyre!("Failed to read operation: {}", e))?;

    rows.into_iter().map(OperationRow::into_operation).collect()
  }

  pub fn unsynced_count(&self) -> Result<usize> {
    let count: i64 = self
      .conn()?
      .query_row(
        "SELECT COUNT(*) FROM pending_operations WHERE synced = 0 AND parked = 0",
        [],
        |row| row.get(0),
      )
      .map_err(|e| eyre!("Failed to count operations: {}", e))?;

    Ok(count as usize)
  }

  pub fn mark_synced(&self, id: i64) -> Result<()> {
    let updated = self
      .conn()?
      .execute(
        "UPDATE pending_operations
         SET synced = 1, synced_at = ?, next_attempt_at = NULL, last_error = NULL
         WHERE id = ?",
        params![Utc::now().timestamp_millis(), id],
      )
      .map_err(|e| eyre!("Failed to mark operation {} synced: {}", id, e))?;

    if updated == 0 {
      return Err(eyre!("Pending operation {} not found", id));
    }
    Ok(())
  }

  /// Bump the retry counter. Returns the new count.
  pub fn increment_retry(&self, id: i64) -> Result<u32> {
    self
      .conn()?
      .query_row(
        "UPDATE pending_operations SET retry_count = retry_count + 1
         WHERE id = ? RETURNING retry_count",
        params![id],
        |row| row.get(0),
      )
      .optional()
      .map_err(|e| eyre!("Failed to increment retry count of {}: {}", id, e))?
      .ok_or_else(|| eyre!("Pending operation {} not found", id))
  }

  /// Record why a replay failed and when it may be attempted again.
  pub fn note_failure(
    &self,
    id: i64,
    error: &str,
    next_attempt_at: Option<DateTime<Utc>>,
    park: bool,
  ) -> Result<()> {
    self
      .conn()?
      .execute(
        "UPDATE pending_operations SET last_error = ?, next_attempt_at = ?, parked = ?
         WHERE id = ?",
        params![
          error,
          next_attempt_at.map(|t| t.timestamp_millis()),
          park,
          id
        ],
      )
      .map_err(|e| eyre!("Failed to record failure of {}: {}", id, e))?;
    Ok(())
  }

  /// Put every parked operation back in line with a fresh retry budget.
  pub fn requeue_parked(&self) -> Result<usize> {
    self
      .conn()?
      .execute(
        "UPDATE pending_operations SET parked = 0, retry_count = 0, next_attempt_at = NULL
         WHERE synced = 0 AND parked = 1",
        [],
      )
      .map_err(|e| eyre!("Failed to requeue parked operations: {}", e))
  }

  /// Delete operations synced before the cutoff.
  pub fn prune_synced(&self, synced_before: DateTime<Utc>) -> Result<usize> {
    self
      .conn()?
      .execute(
        "DELETE FROM pending_operations WHERE synced = 1 AND synced_at < ?",
        params![synced_before.timestamp_millis()],
      )
      .map_err(|e| eyre!("Failed to prune synced operations: {}", e))
  }
}
