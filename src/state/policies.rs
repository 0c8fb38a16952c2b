//! Policy queries.

use crate::state::database::{json_col, ts};
use crate::types::Policy;
use anyhow::{bail, Context, Result};
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension, Row};

const COLUMNS: &str = "id, public_key_ecdsa, public_key_eddsa, plugin_id, plugin_version, \
     policy_version, plugin_type, is_ecdsa, chain_code_hex, derive_path, active, progress, \
     signature, policy_json";

fn from_row(row: &Row<'_>) -> rusqlite::Result<Policy> {
    Ok(Policy {
        id: row.get(0)?,
        public_key_ecdsa: row.get(1)?,
        public_key_eddsa: row.get(2)?,
        plugin_id: row.get(3)?,
        plugin_version: row.get(4)?,
        policy_version: row.get(5)?,
        plugin_type: row.get(6)?,
        is_ecdsa: row.get::<_, i32>(7)? != 0,
        chain_code_hex: row.get(8)?,
        derive_path: row.get(9)?,
        active: row.get::<_, i32>(10)? != 0,
        progress: row.get(11)?,
        signature: row.get(12)?,
        policy: json_col(row, 13)?,
    })
}

/// Insert a new policy.
pub fn insert(conn: &Connection, policy: &Policy) -> Result<()> {
    let now = ts(Utc::now());
    let body = serde_json::to_string(&policy.policy)?;
    conn.execute(
        "INSERT INTO policies (id, public_key_ecdsa, public_key_eddsa, plugin_id, plugin_version,
            policy_version, plugin_type, is_ecdsa, chain_code_hex, derive_path, active, progress,
            signature, policy_json, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?15)",
        params![
            policy.id,
            policy.public_key_ecdsa,
            policy.public_key_eddsa,
            policy.plugin_id,
            policy.plugin_version,
            policy.policy_version,
            policy.plugin_type,
            policy.is_ecdsa as i32,
            policy.chain_code_hex,
            policy.derive_path,
            policy.active as i32,
            policy.progress,
            policy.signature,
            body,
            now,
        ],
    )
    .with_context(|| format!("Failed to insert policy {}", policy.id))?;
    Ok(())
}

/// Replace every mutable field of an existing policy.
pub fn update(conn: &Connection, policy: &Policy) -> Result<()> {
    let body = serde_json::to_string(&policy.policy)?;
    let changed = conn.execute(
        "UPDATE policies SET public_key_ecdsa = ?2, public_key_eddsa = ?3, plugin_id = ?4,
            plugin_version = ?5, policy_version = ?6, plugin_type = ?7, is_ecdsa = ?8,
            chain_code_hex = ?9, derive_path = ?10, active = ?11, progress = ?12,
            signature = ?13, policy_json = ?14, updated_at = ?15
         WHERE id = ?1",
        params![
            policy.id,
            policy.public_key_ecdsa,
            policy.public_key_eddsa,
            policy.plugin_id,
            policy.plugin_version,
            policy.policy_version,
            policy.plugin_type,
            policy.is_ecdsa as i32,
            policy.chain_code_hex,
            policy.derive_path,
            policy.active as i32,
            policy.progress,
            policy.signature,
            body,
            ts(Utc::now()),
        ],
    )?;
    if changed == 0 {
        bail!("Policy {} not found", policy.id);
    }
    Ok(())
}

/// Set only the plugin-defined progress marker.
pub fn update_progress(conn: &Connection, id: &str, progress: &str) -> Result<()> {
    conn.execute(
        "UPDATE policies SET progress = ?2, updated_at = ?3 WHERE id = ?1",
        params![id, progress, ts(Utc::now())],
    )?;
    Ok(())
}

/// Load a policy by id.
pub fn get(conn: &Connection, id: &str) -> Result<Option<Policy>> {
    let sql = format!("SELECT {COLUMNS} FROM policies WHERE id = ?1");
    let policy = conn
        .query_row(&sql, params![id], from_row)
        .optional()
        .with_context(|| format!("Failed to load policy {id}"))?;
    Ok(policy)
}

/// All policies, newest first.
pub fn list(conn: &Connection) -> Result<Vec<Policy>> {
    let sql = format!("SELECT {COLUMNS} FROM policies ORDER BY created_at DESC");
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map([], from_row)?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

/// Delete a policy row. Call inside a transaction together with the
/// trigger and history deletes.
pub fn delete(conn: &Connection, id: &str) -> Result<bool> {
    let changed = conn.execute("DELETE FROM policies WHERE id = ?1", params![id])?;
    Ok(changed > 0)
}
