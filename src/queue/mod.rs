//! Durable task queue: the only channel from the scheduler to the pipeline.

pub mod server;
pub mod sqlite;

pub use server::{Task, TaskHandler, TaskServer};
pub use sqlite::SqliteTaskQueue;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Task kind for "policy is due" events.
pub const TYPE_PLUGIN_TRANSACTION: &str = "plugin:transaction";

/// Task kind for a local signing session.
pub const TYPE_KEY_SIGN: &str = "key:sign";

/// Lifecycle state of a queued task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Pending,
    Active,
    Scheduled,
    Retry,
    Aggregating,
    Completed,
    Archived,
}

impl TaskState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Active => "active",
            Self::Scheduled => "scheduled",
            Self::Retry => "retry",
            Self::Aggregating => "aggregating",
            Self::Completed => "completed",
            Self::Archived => "archived",
        }
    }

    /// The task has not reached a final state yet.
    pub fn is_in_progress(&self) -> bool {
        matches!(
            self,
            Self::Pending | Self::Active | Self::Scheduled | Self::Retry | Self::Aggregating
        )
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "active" => Ok(Self::Active),
            "scheduled" => Ok(Self::Scheduled),
            "retry" => Ok(Self::Retry),
            "aggregating" => Ok(Self::Aggregating),
            "completed" => Ok(Self::Completed),
            "archived" => Ok(Self::Archived),
            other => Err(format!("unknown task state: {other}")),
        }
    }
}

/// Per-task delivery options.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskOptions {
    pub queue: String,
    pub max_retry: u32,
    pub timeout: Duration,
    /// How long a completed task (and its result) stays inspectable.
    pub retention: Duration,
    /// Delay before the task becomes runnable.
    pub process_in: Option<Duration>,
}

impl TaskOptions {
    /// Options for a "policy is due" event.
    pub fn plugin_transaction(queue: &str) -> Self {
        Self {
            queue: queue.to_string(),
            max_retry: 0,
            timeout: Duration::from_secs(5 * 60),
            retention: Duration::from_secs(10 * 60),
            process_in: None,
        }
    }

    /// Options for a local signing task.
    pub fn key_sign(queue: &str) -> Self {
        Self {
            queue: queue.to_string(),
            max_retry: 0,
            timeout: Duration::from_secs(2 * 60),
            retention: Duration::from_secs(5 * 60),
            process_in: None,
        }
    }
}

/// Inspector view of a task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskInfo {
    pub id: String,
    pub queue: String,
    pub kind: String,
    pub state: TaskState,
    pub result: Option<String>,
    pub last_error: Option<String>,
}

/// Producer and inspector side of the queue.
#[async_trait]
pub trait TaskQueue: Send + Sync {
    /// Persist a task. The returned info carries the task id.
    async fn enqueue(&self, kind: &str, payload: String, opts: TaskOptions) -> Result<TaskInfo>;

    /// Current state, result and last error of a task.
    async fn task_info(&self, queue: &str, id: &str) -> Result<TaskInfo>;
}

/// Serialize `payload` as JSON and enqueue it.
pub async fn enqueue_json<T: Serialize + ?Sized>(
    queue: &dyn TaskQueue,
    kind: &str,
    payload: &T,
    opts: TaskOptions,
) -> Result<TaskInfo> {
    let payload = serde_json::to_string(payload)
        .with_context(|| format!("Failed to serialize {kind} payload"))?;
    queue.enqueue(kind, payload, opts).await
}
