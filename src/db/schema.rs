/// Schema of the durable queue: pending mutations, parsed API responses with
/// a TTL, and user-scoped key/value data.
pub const SCHEMA: &str = r#"
-- Mutations waiting for replay (id order is enqueue order)
CREATE TABLE IF NOT EXISTS pending_operations (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    action TEXT NOT NULL,
    resource TEXT NOT NULL,
    method TEXT NOT NULL,
    url TEXT NOT NULL,
    headers TEXT NOT NULL,
    body BLOB,
    idempotency_key TEXT NOT NULL DEFAULT '',
    created_at INTEGER NOT NULL,
    synced INTEGER NOT NULL DEFAULT 0,
    synced_at INTEGER,
    parked INTEGER NOT NULL DEFAULT 0,
    retry_count INTEGER NOT NULL DEFAULT 0,
    last_error TEXT,
    next_attempt_at INTEGER
);

CREATE INDEX IF NOT EXISTS idx_pending_operations_synced
    ON pending_operations(synced, parked, id);

CREATE INDEX IF NOT EXISTS idx_pending_operations_created
    ON pending_operations(created_at);

-- Parsed API responses, expired lazily on read
CREATE TABLE IF NOT EXISTS api_cache (
    key TEXT PRIMARY KEY,
    body TEXT NOT NULL,
    stored_at INTEGER NOT NULL,
    expires_at INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_api_cache_expiry ON api_cache(expires_at);

-- Arbitrary user data
CREATE TABLE IF NOT EXISTS user_data (
    key TEXT PRIMARY KEY,
    data TEXT NOT NULL,
    category TEXT NOT NULL,
    stored_at INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_user_data_category ON user_data(category);
"#;
