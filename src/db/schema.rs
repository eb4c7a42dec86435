//! SQL DDL for initializing the database schema.
//! SQLite-first design; can be adapted for other RDBMS.

/// SQLite schema includes:
/// - `api_keys` table (one credential string per row)
/// - `key_health` table (one row per (key, model), cascade-deleted with the key)
/// - `request_logs` table (append-only, purged by age)
/// - `banned_ips` table (operator-managed, never expired by the core)
pub const SQLITE_INIT: &str = r#"
-- ---------------------------------------------------------------------------
-- Credential pool
-- ---------------------------------------------------------------------------
CREATE TABLE IF NOT EXISTS api_keys (
    id INTEGER PRIMARY KEY NOT NULL,
    key_value TEXT UNIQUE NOT NULL,
    created_at TEXT NOT NULL -- RFC3339
);

-- ---------------------------------------------------------------------------
-- Per-(key, model) health state
-- ---------------------------------------------------------------------------
CREATE TABLE IF NOT EXISTS key_health (
    id INTEGER PRIMARY KEY NOT NULL,
    key_id INTEGER NOT NULL,
    model_name TEXT NOT NULL,
    last_tested TEXT NULL, -- RFC3339
    next_test_time TEXT NOT NULL, -- RFC3339
    status_code INTEGER NULL,
    test_count INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL, -- RFC3339
    updated_at TEXT NOT NULL, -- RFC3339
    UNIQUE(key_id, model_name),
    FOREIGN KEY (key_id) REFERENCES api_keys(id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_key_health_model_status ON key_health(model_name, status_code);

-- ---------------------------------------------------------------------------
-- Request log (append-only)
-- ---------------------------------------------------------------------------
CREATE TABLE IF NOT EXISTS request_logs (
    id INTEGER PRIMARY KEY NOT NULL,
    key_id INTEGER NULL REFERENCES api_keys(id),
    model_name TEXT NOT NULL,
    status_code INTEGER NOT NULL,
    request_path TEXT NOT NULL,
    response_time_ms INTEGER NOT NULL,
    created_at TEXT NOT NULL -- RFC3339
);

CREATE INDEX IF NOT EXISTS idx_request_logs_created_at ON request_logs(created_at);

-- ---------------------------------------------------------------------------
-- Banned IPs
-- ---------------------------------------------------------------------------
CREATE TABLE IF NOT EXISTS banned_ips (
    id INTEGER PRIMARY KEY NOT NULL,
    ip_address TEXT UNIQUE NOT NULL,
    banned_at TEXT NOT NULL -- RFC3339
);
"#;
