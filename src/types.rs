//! Shared types used across the automation engine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Free-form metadata attached to a transaction history row.
pub type Metadata = serde_json::Map<String, serde_json::Value>;

/// Signatures produced by one keysign run, keyed by the signed message.
pub type Signatures = BTreeMap<String, KeysignResponse>;

// ---------------------------------------------------------------------------
// Policy
// ---------------------------------------------------------------------------

/// A user-authorized, signed description of a recurring action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Policy {
    pub id: String,
    pub public_key_ecdsa: String,
    #[serde(default)]
    pub public_key_eddsa: String,
    pub plugin_id: String,
    pub plugin_version: String,
    pub policy_version: String,
    /// Selects which plugin implements this policy.
    pub plugin_type: String,
    #[serde(default = "default_true")]
    pub is_ecdsa: bool,
    #[serde(default)]
    pub chain_code_hex: String,
    #[serde(default)]
    pub derive_path: String,
    #[serde(default = "default_true")]
    pub active: bool,
    /// Plugin-defined progress marker ("IN PROGRESS", "DONE", ...).
    #[serde(default)]
    pub progress: String,
    #[serde(default)]
    pub signature: String,
    /// Opaque policy body owned by the plugin. Carries the `schedule` object.
    pub policy: serde_json::Value,
}

fn default_true() -> bool {
    true
}

/// Progress value a plugin sets once the policy has no work left.
pub const PROGRESS_DONE: &str = "DONE";

/// Progress value for policies with outstanding work.
pub const PROGRESS_IN_PROGRESS: &str = "IN PROGRESS";

// ---------------------------------------------------------------------------
// Trigger
// ---------------------------------------------------------------------------

/// Execution status of a trigger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TriggerStatus {
    Pending,
    Running,
}

impl TriggerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Running => "RUNNING",
        }
    }
}

impl fmt::Display for TriggerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TriggerStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(Self::Pending),
            "RUNNING" => Ok(Self::Running),
            other => Err(format!("unknown trigger status: {other}")),
        }
    }
}

/// The schedulable record for one policy.
///
/// `frequency` is kept as the stored text so that a corrupt value surfaces as
/// a schedule error (and deletes the trigger) instead of a row decode failure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trigger {
    pub policy_id: String,
    pub frequency: String,
    pub interval: u32,
    pub cron_expression: String,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub last_execution: Option<DateTime<Utc>>,
    pub status: TriggerStatus,
}

/// Event handed from the scheduler to the pipeline through the task queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriggerEvent {
    pub policy_id: String,
}

// ---------------------------------------------------------------------------
// Transaction history
// ---------------------------------------------------------------------------

/// Lifecycle status of a proposed transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransactionStatus {
    Pending,
    Signed,
    Mined,
    SigningFailed,
    Rejected,
}

impl TransactionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Signed => "SIGNED",
            Self::Mined => "MINED",
            Self::SigningFailed => "SIGNING_FAILED",
            Self::Rejected => "REJECTED",
        }
    }

    /// States whose row must never be reset by an upsert.
    pub fn is_final(&self) -> bool {
        matches!(self, Self::Signed | Self::Mined)
    }
}

impl fmt::Display for TransactionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransactionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(Self::Pending),
            "SIGNED" => Ok(Self::Signed),
            "MINED" => Ok(Self::Mined),
            "SIGNING_FAILED" => Ok(Self::SigningFailed),
            "REJECTED" => Ok(Self::Rejected),
            other => Err(format!("unknown transaction status: {other}")),
        }
    }
}

/// One proposed on-chain action and its signing/broadcast status.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransactionHistory {
    pub id: String,
    pub policy_id: String,
    pub tx_body: String,
    pub tx_hash: String,
    pub status: TransactionStatus,
    #[serde(default)]
    pub metadata: Metadata,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TransactionHistory {
    /// A fresh PENDING record for a proposal.
    pub fn pending(policy_id: &str, tx_body: &str, tx_hash: &str, metadata: Metadata) -> Self {
        let now = Utc::now();
        Self {
            id: ulid::Ulid::new().to_string(),
            policy_id: policy_id.to_string(),
            tx_body: tx_body.to_string(),
            tx_hash: tx_hash.to_string(),
            status: TransactionStatus::Pending,
            metadata,
            created_at: now,
            updated_at: now,
        }
    }
}

// ---------------------------------------------------------------------------
// Signing
// ---------------------------------------------------------------------------

/// Parameters for one two-party signing session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeysignRequest {
    pub public_key: String,
    /// Hex-encoded messages (hashes) to sign.
    pub messages: Vec<String>,
    pub session_id: String,
    pub hex_encryption_key: String,
    #[serde(default)]
    pub derive_path: String,
    #[serde(default = "default_true")]
    pub is_ecdsa: bool,
    /// True for the party that opens the relay session.
    #[serde(default)]
    pub start_session: bool,
    #[serde(default)]
    pub parties: Vec<String>,
}

/// A transaction proposal returned by a plugin.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignRequest {
    #[serde(flatten)]
    pub keysign_request: KeysignRequest,
    /// Unsigned transaction payload, chain-specific encoding.
    pub transaction: String,
    pub plugin_id: String,
    pub policy_id: String,
    #[serde(default)]
    pub transaction_type: String,
}

impl SignRequest {
    /// Transaction hash used as the idempotency key (the first message).
    pub fn tx_hash(&self) -> Option<&str> {
        self.keysign_request.messages.first().map(String::as_str)
    }
}

/// One signature produced by the signing engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeysignResponse {
    pub msg: String,
    pub r: String,
    pub s: String,
    #[serde(default)]
    pub der_signature: String,
    #[serde(default)]
    pub recovery_id: String,
}
