//! Error types for the seams where callers branch on the kind of failure.
//!
//! Everything else propagates `anyhow::Error` with context.

use thiserror::Error;

/// Schedule construction failures.
///
/// `InvalidFrequency`, `InvalidInterval` and `InvalidCron` are schedule-fatal:
/// a stored trigger that produces one of them is deleted, never retried.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ScheduleError {
    #[error("invalid schedule: unsupported frequency '{0}'")]
    InvalidFrequency(String),

    #[error("invalid schedule: interval must be a positive integer, got '{0}'")]
    InvalidInterval(String),

    #[error("invalid schedule: cron expression '{expr}': {reason}")]
    InvalidCron { expr: String, reason: String },

    #[error("invalid schedule: {0}")]
    Validation(String),
}

/// Failures reported by a policy plugin.
#[derive(Debug, Error)]
pub enum PluginError {
    /// The policy's total work is complete. A successful no-op cycle.
    #[error("nothing to do: policy work is complete")]
    NothingToDo,

    #[error("unknown plugin type '{0}'")]
    UnknownType(String),

    #[error("invalid policy: {0}")]
    InvalidPolicy(String),

    #[error("failed to propose transactions: {0}")]
    Proposal(String),

    /// Building the signed transaction from the signature failed.
    #[error("failed to assemble signed transaction: {0}")]
    Assembly(String),

    /// The chain refused or never acknowledged the submission.
    #[error("failed to broadcast transaction: {0}")]
    Broadcast(String),
}

impl PluginError {
    /// Short label recorded in transaction metadata.
    pub fn stage(&self) -> &'static str {
        match self {
            Self::NothingToDo => "complete",
            Self::UnknownType(_) | Self::InvalidPolicy(_) => "validation",
            Self::Proposal(_) => "proposal",
            Self::Assembly(_) => "assembly",
            Self::Broadcast(_) => "broadcast",
        }
    }
}

/// Replication failures.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("{context}: {source}")]
    Http {
        context: &'static str,
        #[source]
        source: reqwest::Error,
    },

    #[error("{context}, status: {status}, body: {body}")]
    Status {
        context: &'static str,
        status: u16,
        body: String,
    },

    #[error("sync failed after {attempts} attempts: {last}")]
    Exhausted {
        attempts: u32,
        #[source]
        last: Box<SyncError>,
    },
}

/// Failure returned by a task handler; decides whether the queue retries.
#[derive(Debug, Error)]
pub enum TaskError {
    /// Fatal for this task: archive immediately without retrying.
    #[error("{0}")]
    SkipRetry(String),

    #[error(transparent)]
    Retryable(#[from] anyhow::Error),
}

impl TaskError {
    pub fn skip_retry(msg: impl Into<String>) -> Self {
        Self::SkipRetry(msg.into())
    }
}

/// Signing session failures.
#[derive(Debug, Error)]
pub enum SigningError {
    #[error("failed to start session {0}: {1}")]
    SessionStart(String, String),

    #[error("timed out waiting for session {0} to start")]
    SessionTimeout(String),

    #[error("decrypt failed: {0}")]
    Decrypt(String),

    #[error("signing engine failed: {0}")]
    Engine(String),

    #[error("no signature produced for message {0}")]
    MissingSignature(String),
}

/// Policy write failures, split by who is at fault.
#[derive(Debug, Error)]
pub enum PolicyError {
    #[error("invalid policy signature: {0}")]
    InvalidSignature(String),

    #[error("invalid policy: {0}")]
    Invalid(String),

    #[error("policy {0} not found")]
    NotFound(String),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

/// Why a co-sign request was not accepted.
#[derive(Debug, Error)]
pub enum CosignError {
    /// The request itself is unacceptable; the proposer should not retry it as is.
    #[error("co-sign request rejected: {0}")]
    Rejected(String),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

/// Why a replicated write from the counterpart was refused.
#[derive(Debug, Error)]
pub enum ReceiveError {
    #[error("unauthorized: {0}")]
    Unauthorized(#[from] TokenError),

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("{0} not found")]
    NotFound(String),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

/// Per-cycle token failures.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TokenError {
    #[error("malformed token")]
    Malformed,

    #[error("token signature mismatch")]
    BadSignature,

    #[error("token expired")]
    Expired,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plugin_error_stages() {
        assert_eq!(PluginError::Assembly("x".into()).stage(), "assembly");
        assert_eq!(PluginError::Broadcast("x".into()).stage(), "broadcast");
    }

    #[test]
    fn exhausted_sync_error_names_last_failure() {
        let err = SyncError::Exhausted {
            attempts: 3,
            last: Box::new(SyncError::Status {
                context: "fail to sync policy with verifier server",
                status: 500,
                body: "boom".into(),
            }),
        };
        let msg = err.to_string();
        assert!(msg.starts_with("sync failed after 3 attempts"));
        assert!(msg.contains("status: 500"));
    }
}
