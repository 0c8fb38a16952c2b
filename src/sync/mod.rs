//! Push replication of policy and transaction state to the counterpart server.

pub mod http;
pub mod receiver;

pub use http::HttpSyncer;
pub use receiver::SyncReceiver;

use crate::error::SyncError;
use crate::types::{Policy, TransactionHistory};
use async_trait::async_trait;
use std::fmt;

/// Whether a replicated transaction is new or an update of an existing row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncAction {
    Create,
    Update,
}

impl fmt::Display for SyncAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Create => write!(f, "create"),
            Self::Update => write!(f, "update"),
        }
    }
}

/// Replicates local mutations. Failures are reported, never rolled back locally.
#[async_trait]
pub trait PolicySyncer: Send + Sync {
    async fn create_policy(&self, policy: &Policy) -> Result<(), SyncError>;

    async fn update_policy(&self, policy: &Policy) -> Result<(), SyncError>;

    async fn delete_policy(&self, policy_id: &str, signature: &str) -> Result<(), SyncError>;

    /// Replicate a transaction row, authenticated with the cycle token.
    async fn sync_transaction(
        &self,
        action: SyncAction,
        token: &str,
        tx: &TransactionHistory,
    ) -> Result<(), SyncError>;
}
