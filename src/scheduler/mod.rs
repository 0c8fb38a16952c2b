//! Trigger scheduler: decides when a policy is due and hands it to the queue.

pub mod service;
pub mod trigger;

pub use service::{TickReport, TriggerOutcome, TriggerScheduler};
pub use trigger::{create_time_trigger, trigger_from_policy, update_time_trigger};

use chrono::{DateTime, Utc};

/// Source of the current time.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}
