//! Receiving side of replication: applies the counterpart's policy and
//! transaction writes to the local store.

use super::SyncAction;
use crate::auth::TokenIssuer;
use crate::error::ReceiveError;
use crate::policy::verify_policy_signature;
use crate::state::{policies, transactions, SharedDb};
use crate::types::{Policy, TransactionHistory};
use tracing::info;

pub struct SyncReceiver {
    db: SharedDb,
    tokens: TokenIssuer,
}

impl SyncReceiver {
    pub fn new(db: SharedDb, tokens: TokenIssuer) -> Self {
        Self { db, tokens }
    }

    /// Store a signed policy. A create for an id already held replaces it.
    pub async fn apply_policy(&self, action: SyncAction, policy: &Policy) -> Result<(), ReceiveError> {
        verify_policy_signature(policy).map_err(|e| ReceiveError::Forbidden(format!("{e:#}")))?;

        let db = self.db.lock().await;
        let exists = policies::get(db.conn(), &policy.id)?.is_some();
        match (action, exists) {
            (_, true) => policies::update(db.conn(), policy)?,
            (SyncAction::Create, false) => policies::insert(db.conn(), policy)?,
            (SyncAction::Update, false) => return Err(ReceiveError::NotFound(format!("policy {}", policy.id))),
        }
        info!(policy_id = %policy.id, %action, "Replicated policy applied");
        Ok(())
    }

    /// Remove a policy and its history once the owner signature checks out.
    pub async fn delete_policy(&self, policy_id: &str, signature: &str) -> Result<(), ReceiveError> {
        let db = self.db.lock().await;
        let mut stored = policies::get(db.conn(), policy_id)?
            .ok_or_else(|| ReceiveError::NotFound(format!("policy {policy_id}")))?;
        stored.signature = signature.to_string();
        verify_policy_signature(&stored).map_err(|e| ReceiveError::Forbidden(format!("{e:#}")))?;

        db.with_transaction(|tx| {
            transactions::delete_by_policy(tx, policy_id)?;
            policies::delete(tx, policy_id)?;
            Ok(())
        })?;
        info!(policy_id, "Replicated policy deletion applied");
        Ok(())
    }

    /// Store a transaction row. The token must be valid and issued for the
    /// row's policy.
    pub async fn apply_transaction(
        &self,
        action: SyncAction,
        token: &str,
        tx: &TransactionHistory,
    ) -> Result<TransactionHistory, ReceiveError> {
        let claims = self.tokens.verify(token)?;
        if claims.sub != tx.policy_id {
            return Err(ReceiveError::Forbidden(format!(
                "token for policy {} cannot write policy {}",
                claims.sub, tx.policy_id
            )));
        }

        let db = self.db.lock().await;
        if policies::get(db.conn(), &tx.policy_id)?.is_none() {
            return Err(ReceiveError::NotFound(format!("policy {}", tx.policy_id)));
        }
        let stored = db.with_transaction(|conn| {
            if action == SyncAction::Update && transactions::get_by_hash(conn, &tx.tx_hash)?.is_none() {
                return Ok(None);
            }
            transactions::replicate(conn, tx).map(Some)
        })?;
        let stored = stored.ok_or_else(|| ReceiveError::NotFound(format!("transaction {}", tx.tx_hash)))?;
        info!(policy_id = %tx.policy_id, tx_hash = %tx.tx_hash, status = %stored.status, "Replicated transaction applied");
        Ok(stored)
    }
}
