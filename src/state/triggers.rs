//! Time trigger queries.

use crate::state::database::{opt_ts_col, parsed_col, ts, ts_col};
use crate::types::{Trigger, TriggerStatus};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};

const COLUMNS: &str = "t.policy_id, t.frequency, t.interval, t.cron_expression, t.start_time, \
     t.end_time, t.last_execution, t.status";

fn from_row(row: &Row<'_>) -> rusqlite::Result<Trigger> {
    Ok(Trigger {
        policy_id: row.get(0)?,
        frequency: row.get(1)?,
        interval: row.get(2)?,
        cron_expression: row.get(3)?,
        start_time: ts_col(row, 4)?,
        end_time: opt_ts_col(row, 5)?,
        last_execution: opt_ts_col(row, 6)?,
        status: parsed_col(row, 7)?,
    })
}

/// Insert the trigger for a policy.
pub fn insert(conn: &Connection, trigger: &Trigger) -> Result<()> {
    conn.execute(
        "INSERT INTO time_triggers (policy_id, frequency, interval, cron_expression, start_time,
            end_time, last_execution, status)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![
            trigger.policy_id,
            trigger.frequency,
            trigger.interval,
            trigger.cron_expression,
            ts(trigger.start_time),
            trigger.end_time.map(ts),
            trigger.last_execution.map(ts),
            trigger.status.as_str(),
        ],
    )
    .with_context(|| format!("Failed to insert trigger for policy {}", trigger.policy_id))?;
    Ok(())
}

/// Replace the schedule fields, keeping status and the last-execution watermark.
pub fn update_schedule(conn: &Connection, trigger: &Trigger) -> Result<bool> {
    let changed = conn.execute(
        "UPDATE time_triggers SET frequency = ?2, interval = ?3, cron_expression = ?4,
            start_time = ?5, end_time = ?6
         WHERE policy_id = ?1",
        params![
            trigger.policy_id,
            trigger.frequency,
            trigger.interval,
            trigger.cron_expression,
            ts(trigger.start_time),
            trigger.end_time.map(ts),
        ],
    )?;
    Ok(changed > 0)
}

/// Load the trigger of a policy.
pub fn get(conn: &Connection, policy_id: &str) -> Result<Option<Trigger>> {
    let sql = format!("SELECT {COLUMNS} FROM time_triggers t WHERE t.policy_id = ?1");
    Ok(conn.query_row(&sql, params![policy_id], from_row).optional()?)
}

/// Triggers of active policies whose start time has passed.
///
/// Triggers past their end time are still returned so the scheduler can
/// delete them.
pub fn list_started(conn: &Connection, now: DateTime<Utc>) -> Result<Vec<Trigger>> {
    let sql = format!(
        "SELECT {COLUMNS} FROM time_triggers t
         JOIN policies p ON p.id = t.policy_id
         WHERE p.active = 1 AND t.start_time <= ?1
         ORDER BY t.start_time"
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params![ts(now)], from_row)?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

/// All triggers (for status output).
pub fn list(conn: &Connection) -> Result<Vec<Trigger>> {
    let sql = format!("SELECT {COLUMNS} FROM time_triggers t ORDER BY t.policy_id");
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map([], from_row)?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

/// Compare-and-set PENDING -> RUNNING. Returns false when the trigger is
/// missing or already RUNNING.
pub fn try_mark_running(conn: &Connection, policy_id: &str) -> Result<bool> {
    let changed = conn.execute(
        "UPDATE time_triggers SET status = 'RUNNING' WHERE policy_id = ?1 AND status = 'PENDING'",
        params![policy_id],
    )?;
    Ok(changed == 1)
}

/// Set the status unconditionally.
pub fn set_status(conn: &Connection, policy_id: &str, status: TriggerStatus) -> Result<()> {
    conn.execute(
        "UPDATE time_triggers SET status = ?2 WHERE policy_id = ?1",
        params![policy_id, status.as_str()],
    )?;
    Ok(())
}

/// Advance the last-execution watermark and make the trigger schedulable again.
pub fn release(conn: &Connection, policy_id: &str, executed_at: DateTime<Utc>) -> Result<()> {
    conn.execute(
        "UPDATE time_triggers SET status = 'PENDING', last_execution = ?2 WHERE policy_id = ?1",
        params![policy_id, ts(executed_at)],
    )?;
    Ok(())
}

/// Delete the trigger of a policy.
pub fn delete(conn: &Connection, policy_id: &str) -> Result<bool> {
    let changed = conn.execute(
        "DELETE FROM time_triggers WHERE policy_id = ?1",
        params![policy_id],
    )?;
    Ok(changed > 0)
}
