//! Task queue storage.

use crate::queue::TaskState;
use crate::state::database::{parsed_col, ts, ts_col};
use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row, ToSql};

const COLUMNS: &str = "id, queue, kind, payload, state, max_retry, retried, timeout_ms, \
     retention_ms, result, last_error, process_at";

/// A persisted task.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskRecord {
    pub id: String,
    pub queue: String,
    pub kind: String,
    pub payload: String,
    pub state: TaskState,
    pub max_retry: u32,
    pub retried: u32,
    pub timeout_ms: u64,
    pub retention_ms: u64,
    pub result: Option<String>,
    pub last_error: Option<String>,
    pub process_at: DateTime<Utc>,
}

fn from_row(row: &Row<'_>) -> rusqlite::Result<TaskRecord> {
    Ok(TaskRecord {
        id: row.get(0)?,
        queue: row.get(1)?,
        kind: row.get(2)?,
        payload: row.get(3)?,
        state: parsed_col(row, 4)?,
        max_retry: row.get(5)?,
        retried: row.get(6)?,
        timeout_ms: row.get::<_, i64>(7)?.max(0) as u64,
        retention_ms: row.get::<_, i64>(8)?.max(0) as u64,
        result: row.get(9)?,
        last_error: row.get(10)?,
        process_at: ts_col(row, 11)?,
    })
}

fn millis(ms: u64) -> Duration {
    Duration::milliseconds(i64::try_from(ms).unwrap_or(i64::MAX))
}

/// Persist a new task.
pub fn insert(conn: &Connection, task: &TaskRecord) -> Result<()> {
    conn.execute(
        "INSERT INTO tasks (id, queue, kind, payload, state, max_retry, retried, timeout_ms,
            retention_ms, result, last_error, process_at, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
        params![
            task.id,
            task.queue,
            task.kind,
            task.payload,
            task.state.as_str(),
            task.max_retry,
            task.retried,
            task.timeout_ms as i64,
            task.retention_ms as i64,
            task.result,
            task.last_error,
            ts(task.process_at),
            ts(Utc::now()),
        ],
    )
    .with_context(|| format!("Failed to enqueue task {}", task.id))?;
    Ok(())
}

/// Which task kinds a claim may pick up.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum KindFilter {
    #[default]
    Any,
    Only(Vec<String>),
    Except(Vec<String>),
}

/// Atomically move the oldest runnable task of `queue` matching `kinds` to `active`.
pub fn claim_next(
    conn: &Connection,
    queue: &str,
    now: DateTime<Utc>,
    kinds: &KindFilter,
) -> Result<Option<TaskRecord>> {
    let (clause, listed) = match kinds {
        KindFilter::Any => ("", &[][..]),
        KindFilter::Only(listed) => ("AND kind IN", listed.as_slice()),
        KindFilter::Except(listed) if listed.is_empty() => ("", &[][..]),
        KindFilter::Except(listed) => ("AND kind NOT IN", listed.as_slice()),
    };
    let kind_clause = if clause.is_empty() {
        String::new()
    } else {
        let placeholders: Vec<String> = (0..listed.len()).map(|i| format!("?{}", i + 3)).collect();
        format!("{clause} ({})", placeholders.join(", "))
    };
    let sql = format!(
        "UPDATE tasks SET state = 'active'
         WHERE id = (
            SELECT id FROM tasks
            WHERE queue = ?1 AND state IN ('pending', 'scheduled', 'retry') AND process_at <= ?2
            {kind_clause}
            ORDER BY process_at, created_at
            LIMIT 1
         )
         RETURNING {COLUMNS}"
    );

    let now = ts(now);
    let mut values: Vec<&dyn ToSql> = vec![&queue, &now];
    values.extend(listed.iter().map(|kind| kind as &dyn ToSql));
    Ok(conn
        .query_row(&sql, values.as_slice(), from_row)
        .optional()?)
}

/// Mark a task completed and start its retention window.
pub fn complete(conn: &Connection, task: &TaskRecord, result: &str, now: DateTime<Utc>) -> Result<()> {
    conn.execute(
        "UPDATE tasks SET state = 'completed', result = ?2, expires_at = ?3 WHERE id = ?1",
        params![task.id, result, ts(now + millis(task.retention_ms))],
    )?;
    Ok(())
}

/// Record a failure: schedule a retry while attempts remain, otherwise archive.
/// Returns the resulting state.
pub fn fail(
    conn: &Connection,
    task: &TaskRecord,
    error: &str,
    retryable: bool,
    retry_at: DateTime<Utc>,
) -> Result<TaskState> {
    if retryable && task.retried < task.max_retry {
        conn.execute(
            "UPDATE tasks SET state = 'retry', retried = retried + 1, last_error = ?2,
                process_at = ?3
             WHERE id = ?1",
            params![task.id, error, ts(retry_at)],
        )?;
        Ok(TaskState::Retry)
    } else {
        conn.execute(
            "UPDATE tasks SET state = 'archived', last_error = ?2 WHERE id = ?1",
            params![task.id, error],
        )?;
        Ok(TaskState::Archived)
    }
}

/// Load a task of a queue by id.
pub fn get(conn: &Connection, queue: &str, id: &str) -> Result<Option<TaskRecord>> {
    let sql = format!("SELECT {COLUMNS} FROM tasks WHERE queue = ?1 AND id = ?2");
    Ok(conn.query_row(&sql, params![queue, id], from_row).optional()?)
}

/// Drop completed tasks whose retention window has passed.
pub fn purge_expired(conn: &Connection, now: DateTime<Utc>) -> Result<usize> {
    Ok(conn.execute(
        "DELETE FROM tasks WHERE state = 'completed' AND expires_at <= ?1",
        params![ts(now)],
    )?)
}

/// Task counts per state for a queue.
pub fn count_by_state(conn: &Connection, queue: &str) -> Result<Vec<(String, u64)>> {
    let mut stmt = conn.prepare(
        "SELECT state, COUNT(*) FROM tasks WHERE queue = ?1 GROUP BY state ORDER BY state",
    )?;
    let rows = stmt.query_map(params![queue], |row| {
        Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?.max(0) as u64))
    })?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::Database;

    fn task(id: &str, process_at: DateTime<Utc>, max_retry: u32) -> TaskRecord {
        TaskRecord {
            id: id.into(),
            queue: "q".into(),
            kind: "k".into(),
            payload: "{}".into(),
            state: TaskState::Pending,
            max_retry,
            retried: 0,
            timeout_ms: 1_000,
            retention_ms: 60_000,
            result: None,
            last_error: None,
            process_at,
        }
    }

    #[test]
    fn claim_takes_oldest_due_task_once() {
        let db = Database::open_memory().unwrap();
        let now = Utc::now();
        insert(db.conn(), &task("later", now + Duration::minutes(5), 0)).unwrap();
        insert(db.conn(), &task("first", now - Duration::seconds(2), 0)).unwrap();
        insert(db.conn(), &task("second", now - Duration::seconds(1), 0)).unwrap();

        let claimed = claim_next(db.conn(), "q", now, &KindFilter::Any).unwrap().unwrap();
        assert_eq!(claimed.id, "first");
        assert_eq!(claimed.state, TaskState::Active);

        assert_eq!(claim_next(db.conn(), "q", now, &KindFilter::Any).unwrap().unwrap().id, "second");
        assert!(claim_next(db.conn(), "q", now, &KindFilter::Any).unwrap().is_none());
        assert!(claim_next(db.conn(), "other", now + Duration::hours(1), &KindFilter::Any).unwrap().is_none());
    }

    #[test]
    fn claim_respects_kind_filter() {
        let db = Database::open_memory().unwrap();
        let now = Utc::now();
        insert(db.conn(), &task("plain", now - Duration::seconds(2), 0)).unwrap();
        let mut signing = task("signing", now - Duration::seconds(1), 0);
        signing.kind = "sign".into();
        insert(db.conn(), &signing).unwrap();

        let except = KindFilter::Except(vec!["sign".into()]);
        let only = KindFilter::Only(vec!["sign".into()]);
        assert_eq!(claim_next(db.conn(), "q", now, &only).unwrap().unwrap().id, "signing");
        assert!(claim_next(db.conn(), "q", now, &only).unwrap().is_none());
        assert_eq!(claim_next(db.conn(), "q", now, &except).unwrap().unwrap().id, "plain");
        assert!(claim_next(db.conn(), "q", now, &except).unwrap().is_none());
    }

    #[test]
    fn failure_retries_then_archives() {
        let db = Database::open_memory().unwrap();
        let now = Utc::now();
        insert(db.conn(), &task("t", now, 1)).unwrap();

        let claimed = claim_next(db.conn(), "q", now, &KindFilter::Any).unwrap().unwrap();
        assert_eq!(fail(db.conn(), &claimed, "boom", true, now).unwrap(), TaskState::Retry);

        let claimed = claim_next(db.conn(), "q", now, &KindFilter::Any).unwrap().unwrap();
        assert_eq!(claimed.retried, 1);
        assert_eq!(fail(db.conn(), &claimed, "boom again", true, now).unwrap(), TaskState::Archived);

        let stored = get(db.conn(), "q", "t").unwrap().unwrap();
        assert_eq!(stored.state, TaskState::Archived);
        assert_eq!(stored.last_error.as_deref(), Some("boom again"));
    }

    #[test]
    fn skip_retry_archives_immediately() {
        let db = Database::open_memory().unwrap();
        let now = Utc::now();
        insert(db.conn(), &task("t", now, 5)).unwrap();
        let claimed = claim_next(db.conn(), "q", now, &KindFilter::Any).unwrap().unwrap();
        assert_eq!(fail(db.conn(), &claimed, "fatal", false, now).unwrap(), TaskState::Archived);
    }

    #[test]
    fn completed_tasks_expire_after_retention() {
        let db = Database::open_memory().unwrap();
        let now = Utc::now();
        insert(db.conn(), &task("t", now, 0)).unwrap();
        let claimed = claim_next(db.conn(), "q", now, &KindFilter::Any).unwrap().unwrap();
        complete(db.conn(), &claimed, "\"ok\"", now).unwrap();

        assert_eq!(purge_expired(db.conn(), now + Duration::seconds(30)).unwrap(), 0);
        assert_eq!(
            get(db.conn(), "q", "t").unwrap().unwrap().result.as_deref(),
            Some("\"ok\"")
        );
        assert_eq!(purge_expired(db.conn(), now + Duration::seconds(61)).unwrap(), 1);
        assert!(get(db.conn(), "q", "t").unwrap().is_none());
    }
}
