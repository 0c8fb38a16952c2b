//! Polling loop over due triggers.

use super::{Clock, SystemClock};
use crate::queue::{enqueue_json, TaskOptions, TaskQueue, TYPE_PLUGIN_TRANSACTION};
use crate::schedule::Schedule;
use crate::state::{triggers, SharedDb};
use crate::types::{Trigger, TriggerEvent, TriggerStatus};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// What happened to one trigger during a tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TriggerOutcome {
    /// Marked RUNNING and handed to the queue.
    Fired { task_id: String },
    /// Next occurrence is still in the future.
    NotDue { next: DateTime<Utc> },
    /// Another tick or instance owns the current execution.
    AlreadyRunning,
    /// Removed because the schedule is unusable or has ended.
    Deleted { reason: String },
}

/// Counters for one tick.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    pub fired: usize,
    pub skipped: usize,
    pub deleted: usize,
    pub failed: usize,
}

/// Periodically fires due triggers.
pub struct TriggerScheduler {
    db: SharedDb,
    queue: Arc<dyn TaskQueue>,
    queue_name: String,
    tick_interval: Duration,
    clock: Arc<dyn Clock>,
}

impl TriggerScheduler {
    pub fn new(db: SharedDb, queue: Arc<dyn TaskQueue>, queue_name: &str, tick: Duration) -> Self {
        Self {
            db,
            queue,
            queue_name: queue_name.to_string(),
            tick_interval: tick,
            clock: Arc::new(SystemClock),
        }
    }

    /// Replace the time source.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Run the scheduler loop (call from a tokio::spawn).
    ///
    /// The loop exits cooperatively when `cancel` is triggered.
    pub async fn run(&self, cancel: CancellationToken) -> Result<()> {
        info!("Trigger scheduler started (tick every {}s)", self.tick_interval.as_secs());

        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.tick_interval) => {
                    match self.tick().await {
                        Ok(report) if report != TickReport::default() => debug!(?report, "Scheduler tick"),
                        Ok(_) => {}
                        Err(e) => error!("Scheduler tick failed: {e:#}"),
                    }
                }
                _ = cancel.cancelled() => {
                    info!("Trigger scheduler shutting down");
                    return Ok(());
                }
            }
        }
    }

    /// Process every started trigger once.
    ///
    /// Per-trigger failures are logged and counted; they never stop the tick.
    pub async fn tick(&self) -> Result<TickReport> {
        let now = self.clock.now();
        let started = {
            let db = self.db.lock().await;
            triggers::list_started(db.conn(), now).context("Failed to list due triggers")?
        };

        let mut report = TickReport::default();
        for trigger in &started {
            match self.process_trigger(trigger, now).await {
                Ok(TriggerOutcome::Fired { task_id }) => {
                    info!(policy_id = %trigger.policy_id, %task_id, "Trigger fired");
                    report.fired += 1;
                }
                Ok(TriggerOutcome::Deleted { reason }) => {
                    warn!(policy_id = %trigger.policy_id, "Trigger deleted: {reason}");
                    report.deleted += 1;
                }
                Ok(TriggerOutcome::NotDue { .. }) | Ok(TriggerOutcome::AlreadyRunning) => {
                    report.skipped += 1;
                }
                Err(e) => {
                    error!(policy_id = %trigger.policy_id, "Failed to process trigger: {e:#}");
                    report.failed += 1;
                }
            }
        }
        Ok(report)
    }

    /// Decide whether one trigger is due and, if so, fire it.
    pub async fn process_trigger(&self, trigger: &Trigger, now: DateTime<Utc>) -> Result<TriggerOutcome> {
        let policy_id = trigger.policy_id.as_str();

        let schedule = match Schedule::from_trigger(trigger) {
            Ok(schedule) => schedule,
            Err(e) => return self.delete(policy_id, e.to_string()).await,
        };

        if let Some(end) = trigger.end_time {
            if end <= now {
                return self.delete(policy_id, format!("end time {end} has passed")).await;
            }
        }

        // A fresh trigger fires at its first slot at or after the start time.
        let after = match trigger.last_execution {
            Some(last) => last,
            None => trigger.start_time - chrono::Duration::seconds(1),
        };
        let Some(next) = schedule.next(after) else {
            return self
                .delete(policy_id, "schedule has no further occurrences".into())
                .await;
        };
        if now < next {
            return Ok(TriggerOutcome::NotDue { next });
        }
        if trigger.status == TriggerStatus::Running {
            return Ok(TriggerOutcome::AlreadyRunning);
        }

        {
            let db = self.db.lock().await;
            if !triggers::try_mark_running(db.conn(), policy_id)? {
                return Ok(TriggerOutcome::AlreadyRunning);
            }
        }

        let event = TriggerEvent {
            policy_id: policy_id.to_string(),
        };
        let enqueued = enqueue_json(
            self.queue.as_ref(),
            TYPE_PLUGIN_TRANSACTION,
            &event,
            TaskOptions::plugin_transaction(&self.queue_name),
        )
        .await;

        match enqueued {
            Ok(info) => Ok(TriggerOutcome::Fired { task_id: info.id }),
            Err(e) => {
                // Nothing will release the trigger if the event never reached the queue.
                let db = self.db.lock().await;
                triggers::set_status(db.conn(), policy_id, TriggerStatus::Pending)?;
                Err(e.context(format!("Failed to enqueue trigger event for policy {policy_id}")))
            }
        }
    }

    async fn delete(&self, policy_id: &str, reason: String) -> Result<TriggerOutcome> {
        let db = self.db.lock().await;
        triggers::delete(db.conn(), policy_id)?;
        Ok(TriggerOutcome::Deleted { reason })
    }
}
