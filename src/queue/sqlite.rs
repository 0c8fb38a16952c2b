//! SQLite-backed queue sharing the state database.

use super::{TaskInfo, TaskOptions, TaskQueue, TaskState};
use crate::state::tasks::{self, TaskRecord};
use crate::state::SharedDb;
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::Utc;
use tracing::debug;

/// Task queue persisted in the `tasks` table.
#[derive(Clone)]
pub struct SqliteTaskQueue {
    db: SharedDb,
}

impl SqliteTaskQueue {
    pub fn new(db: SharedDb) -> Self {
        Self { db }
    }
}

impl From<&TaskRecord> for TaskInfo {
    fn from(task: &TaskRecord) -> Self {
        Self {
            id: task.id.clone(),
            queue: task.queue.clone(),
            kind: task.kind.clone(),
            state: task.state,
            result: task.result.clone(),
            last_error: task.last_error.clone(),
        }
    }
}

#[async_trait]
impl TaskQueue for SqliteTaskQueue {
    async fn enqueue(&self, kind: &str, payload: String, opts: TaskOptions) -> Result<TaskInfo> {
        let now = Utc::now();
        let delay = opts.process_in.filter(|d| !d.is_zero());
        let (state, process_at) = match delay {
            Some(d) => (TaskState::Scheduled, now + chrono::Duration::from_std(d)?),
            None => (TaskState::Pending, now),
        };

        let record = TaskRecord {
            id: ulid::Ulid::new().to_string(),
            queue: opts.queue,
            kind: kind.to_string(),
            payload,
            state,
            max_retry: opts.max_retry,
            retried: 0,
            timeout_ms: opts.timeout.as_millis() as u64,
            retention_ms: opts.retention.as_millis() as u64,
            result: None,
            last_error: None,
            process_at,
        };

        {
            let db = self.db.lock().await;
            tasks::insert(db.conn(), &record)?;
        }
        debug!(task_id = %record.id, kind, queue = %record.queue, "Enqueued task");
        Ok(TaskInfo::from(&record))
    }

    async fn task_info(&self, queue: &str, id: &str) -> Result<TaskInfo> {
        let db = self.db.lock().await;
        let record = tasks::get(db.conn(), queue, id)?
            .ok_or_else(|| anyhow!("task {id} not found in queue {queue}"))?;
        Ok(TaskInfo::from(&record))
    }
}
