//! Building triggers from policy schedules.

use crate::error::ScheduleError;
use crate::schedule::ScheduleSpec;
use crate::state::triggers;
use crate::types::{Policy, Trigger, TriggerStatus};
use anyhow::Result;
use rusqlite::Connection;

/// A fresh PENDING trigger for a policy, validated against its schedule.
pub fn trigger_from_policy(policy: &Policy) -> Result<Trigger, ScheduleError> {
    let spec = ScheduleSpec::from_policy_body(&policy.policy)?;
    Ok(Trigger {
        policy_id: policy.id.clone(),
        frequency: spec.frequency.to_string(),
        interval: spec.interval,
        cron_expression: spec.cron_expression,
        start_time: spec.start_time,
        end_time: spec.end_time,
        last_execution: None,
        status: TriggerStatus::Pending,
    })
}

/// Create the trigger of a new policy.
pub fn create_time_trigger(conn: &Connection, policy: &Policy) -> Result<Trigger> {
    let trigger = trigger_from_policy(policy)?;
    triggers::insert(conn, &trigger)?;
    Ok(trigger)
}

/// Replace the schedule of an existing policy's trigger, creating it if missing.
pub fn update_time_trigger(conn: &Connection, policy: &Policy) -> Result<Trigger> {
    let trigger = trigger_from_policy(policy)?;
    if !triggers::update_schedule(conn, &trigger)? {
        triggers::insert(conn, &trigger)?;
    }
    Ok(trigger)
}
