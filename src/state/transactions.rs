//! Transaction history queries.

use crate::state::database::{json_col, parsed_col, ts, ts_col};
use crate::types::{Metadata, TransactionHistory, TransactionStatus};
use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension, Row};

const COLUMNS: &str =
    "id, policy_id, tx_body, tx_hash, status, metadata_json, created_at, updated_at";

/// Metadata keys describing a previous failed attempt, dropped on retry.
const ATTEMPT_KEYS: [&str; 3] = ["error", "stage", "task_id"];

fn from_row(row: &Row<'_>) -> rusqlite::Result<TransactionHistory> {
    Ok(TransactionHistory {
        id: row.get(0)?,
        policy_id: row.get(1)?,
        tx_body: row.get(2)?,
        tx_hash: row.get(3)?,
        status: parsed_col(row, 4)?,
        metadata: json_col(row, 5)?,
        created_at: ts_col(row, 6)?,
        updated_at: ts_col(row, 7)?,
    })
}

/// What an upsert did with a proposal.
#[derive(Debug, Clone, PartialEq)]
pub enum UpsertOutcome {
    /// New row.
    Inserted(TransactionHistory),
    /// Existing failed or abandoned row reset to PENDING.
    Retried(TransactionHistory),
    /// Existing row is SIGNED or MINED and is left untouched.
    Immutable(TransactionHistory),
}

impl UpsertOutcome {
    pub fn record(&self) -> &TransactionHistory {
        match self {
            Self::Inserted(tx) | Self::Retried(tx) | Self::Immutable(tx) => tx,
        }
    }

    /// Whether the caller should proceed to sign this record.
    pub fn should_sign(&self) -> bool {
        matches!(self, Self::Inserted(_) | Self::Retried(_))
    }
}

/// Insert a PENDING record keyed by tx hash, or retry an existing one.
///
/// A row still PENDING when its policy is proposed again belongs to a cycle
/// that never finished, since a trigger runs one cycle at a time, so it is
/// retried like a failed row. Must run inside a transaction so the read and
/// the write see the same row.
pub fn upsert(conn: &Connection, tx: &TransactionHistory) -> Result<UpsertOutcome> {
    let Some(existing) = get_by_hash(conn, &tx.tx_hash)? else {
        let metadata = serde_json::to_string(&tx.metadata)?;
        conn.execute(
            "INSERT INTO transaction_history (id, policy_id, tx_body, tx_hash, status,
                metadata_json, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                tx.id,
                tx.policy_id,
                tx.tx_body,
                tx.tx_hash,
                TransactionStatus::Pending.as_str(),
                metadata,
                ts(tx.created_at),
                ts(tx.updated_at),
            ],
        )
        .with_context(|| format!("Failed to insert transaction {}", tx.tx_hash))?;
        let inserted = get(conn, &tx.id)?
            .ok_or_else(|| anyhow!("Transaction {} vanished after insert", tx.id))?;
        return Ok(UpsertOutcome::Inserted(inserted));
    };

    if existing.status.is_final() {
        return Ok(UpsertOutcome::Immutable(existing));
    }

    let mut metadata = existing.metadata.clone();
    for key in ATTEMPT_KEYS {
        metadata.remove(key);
    }
    metadata.extend(tx.metadata.clone());

    conn.execute(
        "UPDATE transaction_history SET status = ?2, tx_body = ?3, metadata_json = ?4,
            updated_at = ?5
         WHERE id = ?1",
        params![
            existing.id,
            TransactionStatus::Pending.as_str(),
            tx.tx_body,
            serde_json::to_string(&metadata)?,
            ts(Utc::now()),
        ],
    )?;
    let retried = get(conn, &existing.id)?
        .ok_or_else(|| anyhow!("Transaction {} vanished after retry", existing.id))?;
    Ok(UpsertOutcome::Retried(retried))
}

/// Set the status and merge `extra` into the metadata. Returns the updated row.
pub fn update_status(
    conn: &Connection,
    id: &str,
    status: TransactionStatus,
    extra: Metadata,
) -> Result<TransactionHistory> {
    let mut current =
        get(conn, id)?.ok_or_else(|| anyhow!("Transaction {id} not found"))?;
    current.metadata.extend(extra);

    conn.execute(
        "UPDATE transaction_history SET status = ?2, metadata_json = ?3, updated_at = ?4
         WHERE id = ?1",
        params![
            id,
            status.as_str(),
            serde_json::to_string(&current.metadata)?,
            ts(Utc::now()),
        ],
    )?;
    get(conn, id)?.ok_or_else(|| anyhow!("Transaction {id} vanished after update"))
}

/// Move every PENDING row of a policy to SIGNING_FAILED, merging `extra`
/// into each. Returns the updated rows.
pub fn fail_pending(
    conn: &Connection,
    policy_id: &str,
    extra: &Metadata,
) -> Result<Vec<TransactionHistory>> {
    let sql = format!(
        "SELECT {COLUMNS} FROM transaction_history WHERE policy_id = ?1 AND status = ?2"
    );
    let mut stmt = conn.prepare(&sql)?;
    let pending = stmt
        .query_map(params![policy_id, TransactionStatus::Pending.as_str()], from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    pending
        .iter()
        .map(|tx| update_status(conn, &tx.id, TransactionStatus::SigningFailed, extra.clone()))
        .collect()
}

/// Store a row exactly as the counterpart reported it, keyed by tx hash.
pub fn replicate(conn: &Connection, tx: &TransactionHistory) -> Result<TransactionHistory> {
    conn.execute(
        "INSERT INTO transaction_history (id, policy_id, tx_body, tx_hash, status,
            metadata_json, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
         ON CONFLICT(tx_hash) DO UPDATE SET status = excluded.status,
            tx_body = excluded.tx_body, metadata_json = excluded.metadata_json,
            updated_at = excluded.updated_at",
        params![
            tx.id,
            tx.policy_id,
            tx.tx_body,
            tx.tx_hash,
            tx.status.as_str(),
            serde_json::to_string(&tx.metadata)?,
            ts(tx.created_at),
            ts(tx.updated_at),
        ],
    )
    .with_context(|| format!("Failed to replicate transaction {}", tx.tx_hash))?;
    get_by_hash(conn, &tx.tx_hash)?
        .ok_or_else(|| anyhow!("Transaction {} vanished after replication", tx.tx_hash))
}

/// Load a transaction by id.
pub fn get(conn: &Connection, id: &str) -> Result<Option<TransactionHistory>> {
    let sql = format!("SELECT {COLUMNS} FROM transaction_history WHERE id = ?1");
    Ok(conn.query_row(&sql, params![id], from_row).optional()?)
}

/// Load a transaction by its hash.
pub fn get_by_hash(conn: &Connection, tx_hash: &str) -> Result<Option<TransactionHistory>> {
    let sql = format!("SELECT {COLUMNS} FROM transaction_history WHERE tx_hash = ?1");
    Ok(conn.query_row(&sql, params![tx_hash], from_row).optional()?)
}

/// Most recent transactions of a policy.
pub fn list_by_policy(
    conn: &Connection,
    policy_id: &str,
    limit: u32,
) -> Result<Vec<TransactionHistory>> {
    let sql = format!(
        "SELECT {COLUMNS} FROM transaction_history WHERE policy_id = ?1
         ORDER BY created_at DESC LIMIT ?2"
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params![policy_id, limit], from_row)?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

/// Most recent transactions across all policies.
pub fn list_recent(conn: &Connection, limit: u32) -> Result<Vec<TransactionHistory>> {
    let sql = format!(
        "SELECT {COLUMNS} FROM transaction_history ORDER BY updated_at DESC LIMIT ?1"
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params![limit], from_row)?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

/// Delete every transaction of a policy.
pub fn delete_by_policy(conn: &Connection, policy_id: &str) -> Result<usize> {
    Ok(conn.execute(
        "DELETE FROM transaction_history WHERE policy_id = ?1",
        params![policy_id],
    )?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::policies::{self, tests::sample_policy};
    use crate::state::Database;
    use serde_json::json;

    fn meta(pairs: &[(&str, serde_json::Value)]) -> Metadata {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    fn db_with_policy() -> Database {
        let db = Database::open_memory().unwrap();
        policies::insert(db.conn(), &sample_policy("p-1")).unwrap();
        db
    }

    fn upsert_in_tx(db: &Database, tx: &TransactionHistory) -> UpsertOutcome {
        db.with_transaction(|conn| upsert(conn, tx)).unwrap()
    }

    #[test]
    fn new_hash_is_inserted_pending() {
        let db = db_with_policy();
        let tx = TransactionHistory::pending("p-1", "0xbody", "0xhash", meta(&[("plugin_id", json!("dca"))]));
        let outcome = upsert_in_tx(&db, &tx);
        assert!(matches!(outcome, UpsertOutcome::Inserted(_)));
        assert_eq!(outcome.record().status, TransactionStatus::Pending);
        assert_eq!(outcome.record().metadata["plugin_id"], json!("dca"));
    }

    #[test]
    fn failed_hash_is_retried_in_place() {
        let db = db_with_policy();
        let first = TransactionHistory::pending("p-1", "0xbody", "0xhash", Metadata::new());
        let id = upsert_in_tx(&db, &first).record().id.clone();
        update_status(
            db.conn(),
            &id,
            TransactionStatus::SigningFailed,
            meta(&[("error", json!("timeout")), ("task_id", json!("t-1"))]),
        )
        .unwrap();

        let again = TransactionHistory::pending("p-1", "0xbody", "0xhash", meta(&[("timestamp", json!("now"))]));
        let outcome = upsert_in_tx(&db, &again);
        assert!(matches!(outcome, UpsertOutcome::Retried(_)));
        assert!(outcome.should_sign());

        let row = outcome.record();
        assert_eq!(row.id, id);
        assert_eq!(row.status, TransactionStatus::Pending);
        assert!(row.metadata.get("error").is_none());
        assert_eq!(row.metadata["timestamp"], json!("now"));

        let count: i64 = db
            .conn()
            .query_row("SELECT COUNT(*) FROM transaction_history", [], |r| r.get(0))
            .unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn rejected_hash_is_retried() {
        let db = db_with_policy();
        let tx = TransactionHistory::pending("p-1", "0xbody", "0xhash", Metadata::new());
        let id = upsert_in_tx(&db, &tx).record().id.clone();
        update_status(db.conn(), &id, TransactionStatus::Rejected, Metadata::new()).unwrap();
        assert!(matches!(upsert_in_tx(&db, &tx), UpsertOutcome::Retried(_)));
    }

    #[test]
    fn mined_and_signed_rows_are_immutable() {
        let db = db_with_policy();
        let tx = TransactionHistory::pending("p-1", "0xbody", "0xhash", Metadata::new());
        let id = upsert_in_tx(&db, &tx).record().id.clone();

        for status in [TransactionStatus::Signed, TransactionStatus::Mined] {
            update_status(db.conn(), &id, status, Metadata::new()).unwrap();
            let outcome = upsert_in_tx(&db, &tx);
            assert!(matches!(outcome, UpsertOutcome::Immutable(_)));
            assert!(!outcome.should_sign());
            assert_eq!(get(db.conn(), &id).unwrap().unwrap().status, status);
        }
    }

    #[test]
    fn abandoned_pending_row_is_retried() {
        let db = db_with_policy();
        let tx = TransactionHistory::pending("p-1", "0xbody", "0xhash", Metadata::new());
        let id = upsert_in_tx(&db, &tx).record().id.clone();

        let outcome = upsert_in_tx(&db, &tx);
        assert!(matches!(outcome, UpsertOutcome::Retried(_)));
        assert!(outcome.should_sign());
        assert_eq!(outcome.record().id, id);
    }

    #[test]
    fn fail_pending_only_touches_pending_rows_of_the_policy() {
        let db = db_with_policy();
        policies::insert(db.conn(), &sample_policy("p-2")).unwrap();
        let open = upsert_in_tx(&db, &TransactionHistory::pending("p-1", "0xb", "0x01", Metadata::new()));
        let mined = upsert_in_tx(&db, &TransactionHistory::pending("p-1", "0xb", "0x02", Metadata::new()));
        update_status(db.conn(), &mined.record().id, TransactionStatus::Mined, Metadata::new()).unwrap();
        upsert_in_tx(&db, &TransactionHistory::pending("p-2", "0xb", "0x03", Metadata::new()));

        let failed = fail_pending(db.conn(), "p-1", &meta(&[("stage", json!("cycle"))])).unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].id, open.record().id);
        assert_eq!(failed[0].status, TransactionStatus::SigningFailed);
        assert_eq!(failed[0].metadata["stage"], json!("cycle"));

        assert_eq!(get_by_hash(db.conn(), "0x02").unwrap().unwrap().status, TransactionStatus::Mined);
        assert_eq!(get_by_hash(db.conn(), "0x03").unwrap().unwrap().status, TransactionStatus::Pending);
    }

    #[test]
    fn status_update_merges_metadata() {
        let db = db_with_policy();
        let tx = TransactionHistory::pending("p-1", "0xbody", "0xhash", meta(&[("plugin_id", json!("dca"))]));
        let id = upsert_in_tx(&db, &tx).record().id.clone();
        let updated = update_status(
            db.conn(),
            &id,
            TransactionStatus::Signed,
            meta(&[("signed_at", json!("t"))]),
        )
        .unwrap();
        assert_eq!(updated.metadata["plugin_id"], json!("dca"));
        assert_eq!(updated.metadata["signed_at"], json!("t"));
        assert_eq!(get_by_hash(db.conn(), "0xhash").unwrap().unwrap(), updated);
    }
}
