//! Database schema definitions.

/// Current schema version.
pub const SCHEMA_VERSION: u32 = 1;

/// Full DDL for the automation state database.
///
/// Timestamps are RFC 3339 UTC text with a fixed width so that text
/// comparison orders them chronologically.
pub const CREATE_SCHEMA: &str = r#"
-- Schema version tracking
CREATE TABLE IF NOT EXISTS schema_version (
    version INTEGER NOT NULL
);

-- Signed automation policies
CREATE TABLE IF NOT EXISTS policies (
    id               TEXT PRIMARY KEY,
    public_key_ecdsa TEXT NOT NULL,
    public_key_eddsa TEXT NOT NULL DEFAULT '',
    plugin_id        TEXT NOT NULL,
    plugin_version   TEXT NOT NULL,
    policy_version   TEXT NOT NULL,
    plugin_type      TEXT NOT NULL,
    is_ecdsa         INTEGER NOT NULL DEFAULT 1,
    chain_code_hex   TEXT NOT NULL DEFAULT '',
    derive_path      TEXT NOT NULL DEFAULT '',
    active           INTEGER NOT NULL DEFAULT 1,
    progress         TEXT NOT NULL DEFAULT '',
    signature        TEXT NOT NULL DEFAULT '',
    policy_json      TEXT NOT NULL DEFAULT '{}',
    created_at       TEXT NOT NULL,
    updated_at       TEXT NOT NULL
);

-- One schedulable trigger per policy
CREATE TABLE IF NOT EXISTS time_triggers (
    policy_id       TEXT PRIMARY KEY REFERENCES policies(id) ON DELETE CASCADE,
    frequency       TEXT NOT NULL,
    interval        INTEGER NOT NULL DEFAULT 1,
    cron_expression TEXT NOT NULL DEFAULT '',
    start_time      TEXT NOT NULL,
    end_time        TEXT,
    last_execution  TEXT,
    status          TEXT NOT NULL DEFAULT 'PENDING'
);

CREATE INDEX IF NOT EXISTS idx_time_triggers_start ON time_triggers(start_time);

-- Proposed transactions and their signing / broadcast status
CREATE TABLE IF NOT EXISTS transaction_history (
    id            TEXT PRIMARY KEY,
    policy_id     TEXT NOT NULL REFERENCES policies(id) ON DELETE CASCADE,
    tx_body       TEXT NOT NULL,
    tx_hash       TEXT NOT NULL UNIQUE,
    status        TEXT NOT NULL DEFAULT 'PENDING',
    metadata_json TEXT NOT NULL DEFAULT '{}',
    created_at    TEXT NOT NULL,
    updated_at    TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_transaction_history_policy ON transaction_history(policy_id);

-- Durable task queue
CREATE TABLE IF NOT EXISTS tasks (
    id           TEXT PRIMARY KEY,
    queue        TEXT NOT NULL,
    kind         TEXT NOT NULL,
    payload      TEXT NOT NULL,
    state        TEXT NOT NULL,
    max_retry    INTEGER NOT NULL DEFAULT 0,
    retried      INTEGER NOT NULL DEFAULT 0,
    timeout_ms   INTEGER NOT NULL,
    retention_ms INTEGER NOT NULL,
    result       TEXT,
    last_error   TEXT,
    process_at   TEXT NOT NULL,
    expires_at   TEXT,
    created_at   TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_tasks_claim ON tasks(queue, state, process_at);
"#;
