//! Queue consumer: claims tasks and runs them through registered handlers.

use super::TaskState;
use crate::error::TaskError;
use crate::state::tasks::{self, KindFilter, TaskRecord};
use crate::state::SharedDb;
use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// A claimed task as seen by a handler.
#[derive(Debug, Clone)]
pub struct Task {
    pub id: String,
    pub kind: String,
    pub payload: String,
    pub retried: u32,
}

impl Task {
    /// Decode the JSON payload. A malformed payload is never retried.
    pub fn decode<T: serde::de::DeserializeOwned>(&self) -> Result<T, TaskError> {
        serde_json::from_str(&self.payload).map_err(|e| {
            TaskError::skip_retry(format!("invalid {} payload: {e}", self.kind))
        })
    }
}

/// Handles one kind of task. The returned string is stored as the task result.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn handle(&self, task: &Task) -> Result<String, TaskError>;
}

/// Consumer loop over one queue.
///
/// Kinds given their own pool with [`TaskServer::reserve`] are claimed by a
/// separate lane, so a handler waiting on such a task can never starve it of
/// a worker slot.
pub struct TaskServer {
    db: SharedDb,
    queue: String,
    concurrency: usize,
    poll_interval: Duration,
    handlers: HashMap<String, Arc<dyn TaskHandler>>,
    reserved: Vec<(String, usize)>,
}

impl TaskServer {
    pub fn new(db: SharedDb, queue: &str, concurrency: usize, poll_interval: Duration) -> Self {
        Self {
            db,
            queue: queue.to_string(),
            concurrency: concurrency.max(1),
            poll_interval,
            handlers: HashMap::new(),
            reserved: Vec::new(),
        }
    }

    /// Route tasks of `kind` to `handler`.
    pub fn handle(mut self, kind: &str, handler: Arc<dyn TaskHandler>) -> Self {
        self.handlers.insert(kind.to_string(), handler);
        self
    }

    /// Run tasks of `kind` on a pool of their own with `concurrency` slots.
    pub fn reserve(mut self, kind: &str, concurrency: usize) -> Self {
        self.reserved.retain(|(k, _)| k != kind);
        self.reserved.push((kind.to_string(), concurrency.max(1)));
        self
    }

    /// Run until `cancel` fires, then wait for in-flight tasks.
    pub async fn run(&self, cancel: CancellationToken) -> Result<()> {
        let mut lanes = JoinSet::new();
        for lane in self.lanes() {
            lanes.spawn(lane.run(cancel.clone()));
        }
        while let Some(joined) = lanes.join_next().await {
            match joined {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!("Task lane failed: {e:#}"),
                Err(e) => error!("Task lane panicked: {e}"),
            }
        }
        Ok(())
    }

    /// Claim and run a single task of any kind inline. Returns false when the
    /// queue is idle.
    pub async fn process_one(&self) -> Result<bool> {
        let claimed = {
            let db = self.db.lock().await;
            tasks::claim_next(db.conn(), &self.queue, Utc::now(), &KindFilter::Any)?
        };
        match claimed {
            Some(task) => {
                let handler = self.handlers.get(&task.kind).cloned();
                execute(self.db.clone(), handler, task).await;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn lanes(&self) -> Vec<Lane> {
        let reserved_kinds = self.reserved.iter().map(|(kind, _)| kind.clone()).collect();
        let lane = |name: &str, kinds: KindFilter, concurrency: usize, purge: bool| Lane {
            name: name.to_string(),
            db: self.db.clone(),
            queue: self.queue.clone(),
            kinds,
            concurrency,
            poll_interval: self.poll_interval,
            handlers: self.handlers.clone(),
            purge,
        };

        let mut lanes = vec![lane("default", KindFilter::Except(reserved_kinds), self.concurrency, true)];
        for (kind, concurrency) in &self.reserved {
            lanes.push(lane(kind, KindFilter::Only(vec![kind.clone()]), *concurrency, false));
        }
        lanes
    }
}

/// One claim loop with its own worker slots.
struct Lane {
    name: String,
    db: SharedDb,
    queue: String,
    kinds: KindFilter,
    concurrency: usize,
    poll_interval: Duration,
    handlers: HashMap<String, Arc<dyn TaskHandler>>,
    purge: bool,
}

impl Lane {
    async fn run(self, cancel: CancellationToken) -> Result<()> {
        info!(queue = %self.queue, lane = %self.name, concurrency = self.concurrency, "Task lane started");

        let permits = Arc::new(Semaphore::new(self.concurrency));
        let mut workers = JoinSet::new();

        loop {
            while let Some(joined) = workers.try_join_next() {
                if let Err(e) = joined {
                    error!("Task worker panicked: {e}");
                }
            }

            let permit = tokio::select! {
                permit = permits.clone().acquire_owned() => permit?,
                _ = cancel.cancelled() => break,
            };

            // Cancellation is checked before every unit of work.
            if cancel.is_cancelled() {
                break;
            }

            match self.claim().await {
                Ok(Some(task)) => {
                    let db = self.db.clone();
                    let handler = self.handlers.get(&task.kind).cloned();
                    workers.spawn(async move {
                        execute(db, handler, task).await;
                        drop(permit);
                    });
                }
                Ok(None) => {
                    drop(permit);
                    if self.purge {
                        self.purge().await;
                    }
                    tokio::select! {
                        _ = tokio::time::sleep(self.poll_interval) => {}
                        _ = cancel.cancelled() => break,
                    }
                }
                Err(e) => {
                    drop(permit);
                    error!(lane = %self.name, "Failed to claim task: {e:#}");
                    tokio::select! {
                        _ = tokio::time::sleep(self.poll_interval) => {}
                        _ = cancel.cancelled() => break,
                    }
                }
            }
        }

        info!(queue = %self.queue, lane = %self.name, in_flight = workers.len(), "Task lane shutting down");
        while let Some(joined) = workers.join_next().await {
            if let Err(e) = joined {
                error!("Task worker panicked: {e}");
            }
        }
        Ok(())
    }

    async fn claim(&self) -> Result<Option<TaskRecord>> {
        let db = self.db.lock().await;
        tasks::claim_next(db.conn(), &self.queue, Utc::now(), &self.kinds)
    }

    async fn purge(&self) {
        let db = self.db.lock().await;
        match tasks::purge_expired(db.conn(), Utc::now()) {
            Ok(0) => {}
            Ok(n) => debug!("Purged {} expired tasks", n),
            Err(e) => warn!("Failed to purge expired tasks: {e:#}"),
        }
    }
}

async fn execute(db: SharedDb, handler: Option<Arc<dyn TaskHandler>>, record: TaskRecord) {
    let task = Task {
        id: record.id.clone(),
        kind: record.kind.clone(),
        payload: record.payload.clone(),
        retried: record.retried,
    };

    let outcome = match handler {
        Some(handler) => {
            let timeout = Duration::from_millis(record.timeout_ms);
            match tokio::time::timeout(timeout, handler.handle(&task)).await {
                Ok(result) => result,
                Err(_) => Err(TaskError::Retryable(anyhow::anyhow!(
                    "task timed out after {}s",
                    timeout.as_secs()
                ))),
            }
        }
        None => Err(TaskError::skip_retry(format!(
            "no handler registered for task kind {}",
            task.kind
        ))),
    };

    let now = Utc::now();
    let db = db.lock().await;
    let stored = match &outcome {
        Ok(result) => {
            debug!(task_id = %task.id, kind = %task.kind, "Task completed");
            tasks::complete(db.conn(), &record, result, now).map(|_| TaskState::Completed)
        }
        Err(e) => {
            let retryable = matches!(e, TaskError::Retryable(_));
            let message = match e {
                TaskError::Retryable(inner) => format!("{inner:#}"),
                TaskError::SkipRetry(msg) => msg.clone(),
            };
            let retry_at = now + chrono::Duration::seconds(5 * (i64::from(record.retried) + 1));
            let state = tasks::fail(db.conn(), &record, &message, retryable, retry_at);
            if let Ok(state) = &state {
                warn!(task_id = %task.id, kind = %task.kind, %state, "Task failed: {message}");
            }
            state
        }
    };

    if let Err(e) = stored {
        error!(task_id = %task.id, "Failed to record task outcome: {e:#}");
    }
}
