//! The co-sign handshake between the two servers.
//!
//! The proposing side calls [`CosignClient::request_cosign`]; the counterpart
//! runs [`CosignService::accept`], which checks the proposal against its own
//! copy of the policy and transaction before enqueueing its signing task.

use crate::error::CosignError;
use crate::plugin::PluginRegistry;
use crate::queue::{enqueue_json, TaskOptions, TaskQueue, TYPE_KEY_SIGN};
use crate::state::{policies, transactions, SharedDb};
use crate::types::{Metadata, SignRequest, TransactionStatus};
use anyhow::{Context, Result};
use serde_json::json;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

const COSIGN_ENDPOINT: &str = "/signFromPlugin";

/// How long an accepted session id is remembered for duplicate detection.
const SESSION_MEMORY: Duration = Duration::from_secs(30 * 60);

// ---------------------------------------------------------------------------
// Proposing side
// ---------------------------------------------------------------------------

/// Counterpart's answer to a co-sign request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CosignOutcome {
    Accepted,
    /// The counterpart refused the proposal (4xx).
    Rejected { status: u16, body: String },
}

#[derive(Debug, Clone)]
pub struct CosignClient {
    base_url: String,
    http: reqwest::Client,
}

impl CosignClient {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build co-sign http client")?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            http,
        })
    }

    /// Ask the counterpart to join signing `request`. Server errors and
    /// transport failures are errors; client errors are a refusal.
    pub async fn request_cosign(&self, request: &SignRequest) -> Result<CosignOutcome> {
        let resp = self
            .http
            .post(format!("{}{COSIGN_ENDPOINT}", self.base_url))
            .json(request)
            .send()
            .await
            .context("Failed to request co-signature")?;

        let status = resp.status();
        if status.is_success() {
            return Ok(CosignOutcome::Accepted);
        }
        let body = resp.text().await.unwrap_or_default();
        if status.is_client_error() {
            return Ok(CosignOutcome::Rejected {
                status: status.as_u16(),
                body,
            });
        }
        anyhow::bail!("Co-sign request failed with status {status}: {body}")
    }
}

// ---------------------------------------------------------------------------
// Accepting side
// ---------------------------------------------------------------------------

/// Result of an accepted co-sign request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CosignAccepted {
    /// A signing task was enqueued.
    Enqueued { task_id: String },
    /// The session was already accepted earlier; nothing new was enqueued.
    Duplicate,
}

pub struct CosignService {
    db: SharedDb,
    queue: Arc<dyn TaskQueue>,
    plugins: PluginRegistry,
    queue_name: String,
    parties: Vec<String>,
    sessions: Mutex<HashMap<String, Instant>>,
}

impl CosignService {
    /// `parties` is the session membership, proposer first.
    pub fn new(
        db: SharedDb,
        queue: Arc<dyn TaskQueue>,
        plugins: PluginRegistry,
        queue_name: &str,
        parties: Vec<String>,
    ) -> Self {
        Self {
            db,
            queue,
            plugins,
            queue_name: queue_name.to_string(),
            parties,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Validate a proposal from the counterpart and enqueue the local signing task.
    pub async fn accept(&self, mut request: SignRequest) -> Result<CosignAccepted, CosignError> {
        let messages = &request.keysign_request.messages;
        if messages.len() != 1 {
            return Err(CosignError::Rejected(format!(
                "plugin signing requires exactly one message hash, got {}",
                messages.len()
            )));
        }
        let message = messages[0].clone();

        let (policy, tx) = {
            let db = self.db.lock().await;
            let policy = policies::get(db.conn(), &request.policy_id)?.ok_or_else(|| {
                CosignError::Rejected(format!("policy {} not found", request.policy_id))
            })?;
            let tx = transactions::get_by_hash(db.conn(), &message)?;
            (policy, tx)
        };

        if policy.plugin_id != request.plugin_id {
            return Err(CosignError::Rejected("policy plugin id mismatch".into()));
        }

        let plugin = self
            .plugins
            .resolve(&policy.plugin_type)
            .map_err(|e| CosignError::Rejected(e.to_string()))?;
        plugin
            .validate_proposal(&policy, &request)
            .await
            .map_err(|e| CosignError::Rejected(format!("invalid transaction proposal: {e}")))?;

        let tx = tx.ok_or_else(|| {
            CosignError::Rejected(format!("message {message} does not match a known transaction"))
        })?;
        if tx.policy_id != policy.id || tx.tx_body != request.transaction {
            return Err(CosignError::Rejected(format!(
                "message hash does not match transaction {}",
                tx.id
            )));
        }

        if !self.remember_session(&request.keysign_request.session_id) {
            info!(session = %request.keysign_request.session_id, "Co-sign session already accepted");
            return Ok(CosignAccepted::Duplicate);
        }

        request.keysign_request.start_session = false;
        request.keysign_request.parties = self.parties.clone();

        let enqueued = enqueue_json(
            self.queue.as_ref(),
            TYPE_KEY_SIGN,
            &request.keysign_request,
            TaskOptions::key_sign(&self.queue_name),
        )
        .await;

        let db = self.db.lock().await;
        match enqueued {
            Ok(info) => {
                let mut extra = Metadata::new();
                extra.insert("task_id".into(), json!(info.id));
                if let Err(e) =
                    transactions::update_status(db.conn(), &tx.id, tx.status, extra)
                {
                    warn!(tx_id = %tx.id, "Failed to record keysign task id: {e:#}");
                }
                info!(policy_id = %policy.id, task_id = %info.id, "Accepted co-sign request");
                Ok(CosignAccepted::Enqueued { task_id: info.id })
            }
            Err(e) => {
                let mut extra = Metadata::new();
                extra.insert("error".into(), json!(format!("{e:#}")));
                if let Err(update_err) = transactions::update_status(
                    db.conn(),
                    &tx.id,
                    TransactionStatus::SigningFailed,
                    extra,
                ) {
                    error!(tx_id = %tx.id, "Failed to update transaction status: {update_err:#}");
                }
                Err(CosignError::Internal(e.context("Failed to enqueue keysign task")))
            }
        }
    }

    /// Record `session_id`; false if it was seen within the memory window.
    fn remember_session(&self, session_id: &str) -> bool {
        let now = Instant::now();
        let mut sessions = match self.sessions.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        sessions.retain(|_, seen| now.duration_since(*seen) < SESSION_MEMORY);
        if sessions.contains_key(session_id) {
            return false;
        }
        sessions.insert(session_id.to_string(), now);
        true
    }
}
