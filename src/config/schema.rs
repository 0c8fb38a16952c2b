//! Configuration schema for automation.toml.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Which side of the two-party deployment this process runs as.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// Knows the business policy, proposes and broadcasts transactions.
    Plugin,
    /// Co-holds signing authority, accepts co-sign requests.
    Verifier,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Plugin => write!(f, "plugin"),
            Self::Verifier => write!(f, "verifier"),
        }
    }
}

/// Root configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AutomationConfig {
    /// Deployment role of this process.
    pub role: Role,

    /// Path to SQLite database.
    pub db_path: String,

    /// Base URL of the counterpart server (sync + co-sign endpoints).
    pub counterpart_url: String,

    /// Base URL of the signing session relay.
    pub relay_url: String,

    /// Party id this server uses in signing sessions.
    pub local_party_id: String,

    /// Party id of the counterpart in signing sessions.
    pub counterpart_party_id: String,

    /// Task queue name.
    pub queue_name: String,

    /// Seconds between scheduler ticks.
    pub scheduler_tick_secs: u64,

    /// Maximum number of tasks processed concurrently by the worker.
    pub worker_concurrency: usize,

    /// Milliseconds between task queue polls (worker claim loop and result polling).
    pub task_poll_interval_ms: u64,

    /// Upper bound on how long the pipeline waits for a signing task.
    pub task_poll_timeout_secs: u64,

    /// Attempts per sync call.
    pub sync_max_retries: u32,

    /// First backoff between sync attempts; doubles on every retry.
    pub sync_base_delay_ms: u64,

    /// HTTP timeout for a single sync request.
    pub sync_timeout_secs: u64,

    /// How long a signer waits for all parties to join the session.
    pub session_start_timeout_secs: u64,

    /// Milliseconds between relay message downloads.
    pub relay_poll_interval_ms: u64,

    /// Signing attempts per message.
    pub keysign_attempts: u32,

    /// Shared secret for per-cycle sync tokens (hex or plain text).
    pub token_secret: String,

    /// Lifetime of a per-cycle sync token.
    pub token_ttl_secs: u64,

    /// Log level (debug, info, warn, error).
    pub log_level: String,
}

impl Default for AutomationConfig {
    fn default() -> Self {
        Self {
            role: Role::Plugin,
            db_path: "~/.policy-automaton/state.db".into(),
            counterpart_url: "http://127.0.0.1:8080".into(),
            relay_url: "http://127.0.0.1:8090".into(),
            local_party_id: "1".into(),
            counterpart_party_id: "2".into(),
            queue_name: "default_queue".into(),
            scheduler_tick_secs: 30,
            worker_concurrency: 10,
            task_poll_interval_ms: 1_000,
            task_poll_timeout_secs: 120,
            sync_max_retries: 3,
            sync_base_delay_ms: 100,
            sync_timeout_secs: 10,
            session_start_timeout_secs: 183,
            relay_poll_interval_ms: 1_000,
            keysign_attempts: 3,
            token_secret: String::new(),
            token_ttl_secs: 600,
            log_level: "info".into(),
        }
    }
}

impl AutomationConfig {
    /// Resolve a path that may contain `~` to an absolute path.
    pub fn resolve_path(&self, path: &str) -> String {
        shellexpand::tilde(path).into_owned()
    }

    /// Resolved database path.
    pub fn resolved_db_path(&self) -> String {
        self.resolve_path(&self.db_path)
    }

    pub fn scheduler_tick(&self) -> Duration {
        Duration::from_secs(self.scheduler_tick_secs.max(1))
    }

    pub fn task_poll_interval(&self) -> Duration {
        Duration::from_millis(self.task_poll_interval_ms.max(1))
    }

    pub fn task_poll_timeout(&self) -> Duration {
        Duration::from_secs(self.task_poll_timeout_secs)
    }

    pub fn sync_base_delay(&self) -> Duration {
        Duration::from_millis(self.sync_base_delay_ms)
    }

    pub fn sync_timeout(&self) -> Duration {
        Duration::from_secs(self.sync_timeout_secs)
    }

    pub fn session_start_timeout(&self) -> Duration {
        Duration::from_secs(self.session_start_timeout_secs)
    }

    pub fn relay_poll_interval(&self) -> Duration {
        Duration::from_millis(self.relay_poll_interval_ms.max(1))
    }

    pub fn token_ttl(&self) -> Duration {
        Duration::from_secs(self.token_ttl_secs)
    }
}
