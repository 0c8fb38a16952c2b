//! Per-cycle execution of a due policy.
//!
//! One `plugin:transaction` task runs one cycle: propose, record, co-sign,
//! wait for the local signing task, finalize. Every proposal in a batch is
//! handled independently, and the trigger is released whatever happens.

use super::cosign::{CosignClient, CosignOutcome};
use crate::auth::TokenIssuer;
use crate::config::AutomationConfig;
use crate::error::{PluginError, TaskError};
use crate::plugin::{Plugin, PluginRegistry};
use crate::queue::server::{Task, TaskHandler};
use crate::queue::{enqueue_json, TaskOptions, TaskQueue, TaskState, TYPE_KEY_SIGN};
use crate::scheduler::{Clock, SystemClock};
use crate::state::transactions::UpsertOutcome;
use crate::state::{policies, transactions, triggers, SharedDb};
use crate::sync::{PolicySyncer, SyncAction};
use crate::types::{
    Metadata, Policy, SignRequest, Signatures, TransactionHistory, TransactionStatus,
    TriggerEvent, PROGRESS_DONE,
};
use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Knobs for one pipeline instance.
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub queue_name: String,
    pub local_party_id: String,
    pub counterpart_party_id: String,
    pub task_poll_interval: Duration,
    pub task_poll_timeout: Duration,
}

impl PipelineSettings {
    pub fn from_config(config: &AutomationConfig) -> Self {
        Self {
            queue_name: config.queue_name.clone(),
            local_party_id: config.local_party_id.clone(),
            counterpart_party_id: config.counterpart_party_id.clone(),
            task_poll_interval: config.task_poll_interval(),
            task_poll_timeout: config.task_poll_timeout(),
        }
    }

    fn parties(&self) -> Vec<String> {
        vec![self.local_party_id.clone(), self.counterpart_party_id.clone()]
    }
}

/// Handler for `plugin:transaction` tasks.
pub struct WorkerService {
    db: SharedDb,
    queue: Arc<dyn TaskQueue>,
    plugins: PluginRegistry,
    syncer: Arc<dyn PolicySyncer>,
    cosign: CosignClient,
    tokens: TokenIssuer,
    clock: Arc<dyn Clock>,
    settings: PipelineSettings,
}

impl WorkerService {
    pub fn new(
        db: SharedDb,
        queue: Arc<dyn TaskQueue>,
        plugins: PluginRegistry,
        syncer: Arc<dyn PolicySyncer>,
        cosign: CosignClient,
        tokens: TokenIssuer,
        settings: PipelineSettings,
    ) -> Self {
        Self {
            db,
            queue,
            plugins,
            syncer,
            cosign,
            tokens,
            clock: Arc::new(SystemClock),
            settings,
        }
    }

    /// Replace the time source used for the trigger watermark.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Run one automation cycle for `policy_id`, then release its trigger.
    ///
    /// If the cycle is dropped before it finishes, its guard fails the rows
    /// it left PENDING and releases the trigger in the background.
    pub async fn handle_trigger(&self, policy_id: &str) -> Result<String, TaskError> {
        let mut guard = CycleGuard {
            db: self.db.clone(),
            syncer: self.syncer.clone(),
            tokens: self.tokens.clone(),
            clock: self.clock.clone(),
            policy_id: policy_id.to_string(),
            armed: true,
        };
        let result = self.run_cycle(policy_id).await;
        guard.armed = false;

        let now = self.clock.now();
        let released = {
            let db = self.db.lock().await;
            triggers::release(db.conn(), policy_id, now)
        };
        if let Err(e) = released {
            error!(policy_id, "Failed to release trigger: {e:#}");
        }

        result
    }

    async fn run_cycle(&self, policy_id: &str) -> Result<String, TaskError> {
        let policy = {
            let db = self.db.lock().await;
            policies::get(db.conn(), policy_id).context("Failed to load policy")?
        }
        .ok_or_else(|| TaskError::skip_retry(format!("policy {policy_id} not found")))?;

        let plugin = self.plugins.resolve(&policy.plugin_type).map_err(|e| match e {
            PluginError::UnknownType(_) => TaskError::skip_retry(e.to_string()),
            other => TaskError::Retryable(anyhow!(other)),
        })?;

        let proposals = match plugin.propose_transactions(&policy).await {
            Ok(proposals) => proposals,
            Err(PluginError::NothingToDo) => {
                self.mark_policy_done(&policy).await?;
                return Ok(json!({ "policy_id": policy.id, "status": PROGRESS_DONE }).to_string());
            }
            Err(e) => {
                return Err(anyhow!(e)
                    .context(format!("Failed to propose transactions for policy {policy_id}"))
                    .into());
            }
        };

        info!(policy_id, proposals = proposals.len(), "Executing automation cycle");
        let token = self.tokens.issue(&policy.id)?;

        let mut statuses = Vec::with_capacity(proposals.len());
        for proposal in proposals {
            match self.execute_proposal(&policy, plugin.as_ref(), &token, proposal).await {
                Ok(tx) => statuses.push(json!({ "tx_hash": tx.tx_hash, "status": tx.status })),
                Err(e) => {
                    error!(policy_id, "Proposal failed: {e:#}");
                    statuses.push(json!({ "error": format!("{e:#}") }));
                }
            }
        }

        Ok(json!({ "policy_id": policy.id, "transactions": statuses }).to_string())
    }

    async fn mark_policy_done(&self, policy: &Policy) -> Result<()> {
        let updated = {
            let db = self.db.lock().await;
            policies::update_progress(db.conn(), &policy.id, PROGRESS_DONE)?;
            policies::get(db.conn(), &policy.id)?
        };
        info!(policy_id = %policy.id, "Policy work complete");
        if let Some(updated) = updated {
            if let Err(e) = self.syncer.update_policy(&updated).await {
                warn!(policy_id = %policy.id, "Failed to sync policy progress: {e}");
            }
        }
        Ok(())
    }

    /// Carry one proposal through signing and broadcast.
    ///
    /// Failures after the record exists are written to it and reported as
    /// `Ok` with the failed status; `Err` means the proposal never got a record.
    async fn execute_proposal(
        &self,
        policy: &Policy,
        plugin: &dyn Plugin,
        token: &str,
        request: SignRequest,
    ) -> Result<TransactionHistory> {
        let tx_hash = request
            .tx_hash()
            .ok_or_else(|| anyhow!("Proposal for policy {} has no message to sign", policy.id))?
            .to_string();

        let mut metadata = Metadata::new();
        metadata.insert("timestamp".into(), json!(Utc::now().to_rfc3339()));
        metadata.insert("plugin_id".into(), json!(policy.plugin_id));
        metadata.insert("public_key".into(), json!(policy.public_key_ecdsa));
        let pending = TransactionHistory::pending(&policy.id, &request.transaction, &tx_hash, metadata);

        let outcome = {
            let db = self.db.lock().await;
            db.with_transaction(|conn| transactions::upsert(conn, &pending))?
        };
        let action = match &outcome {
            UpsertOutcome::Inserted(_) => SyncAction::Create,
            UpsertOutcome::Retried(_) => SyncAction::Update,
            UpsertOutcome::Immutable(tx) => {
                info!(policy_id = %policy.id, tx_hash = %tx_hash, status = %tx.status, "Transaction already handled, skipping");
                return Ok(tx.clone());
            }
        };
        let tx = outcome.record().clone();
        self.sync_transaction(action, token, &tx).await;

        let parties = self.settings.parties();

        let mut counterpart_request = request.clone();
        counterpart_request.keysign_request.start_session = false;
        counterpart_request.keysign_request.parties = parties.clone();
        match self.cosign.request_cosign(&counterpart_request).await {
            Ok(CosignOutcome::Accepted) => {}
            Ok(CosignOutcome::Rejected { status, body }) => {
                let extra = failure(format!("counterpart rejected co-sign ({status}): {body}"), "cosign", None);
                return self.transition(token, &tx.id, TransactionStatus::Rejected, extra).await;
            }
            Err(e) => {
                let extra = failure(format!("{e:#}"), "cosign", None);
                return self.transition(token, &tx.id, TransactionStatus::SigningFailed, extra).await;
            }
        }

        let mut local = request.keysign_request.clone();
        local.start_session = true;
        local.parties = parties;
        let task = match enqueue_json(
            self.queue.as_ref(),
            TYPE_KEY_SIGN,
            &local,
            TaskOptions::key_sign(&self.settings.queue_name),
        )
        .await
        {
            Ok(task) => task,
            Err(e) => {
                let extra = failure(format!("{e:#}"), "keysign", None);
                return self.transition(token, &tx.id, TransactionStatus::SigningFailed, extra).await;
            }
        };
        debug!(policy_id = %policy.id, task_id = %task.id, "Enqueued local keysign");

        let signature = match self
            .wait_for_task_result(&task.queue, &task.id)
            .await
            .and_then(|raw| {
                let signatures: Signatures =
                    serde_json::from_str(&raw).context("Failed to parse keysign result")?;
                signatures
                    .get(&tx_hash)
                    .cloned()
                    .ok_or_else(|| anyhow!("Keysign result has no signature for {tx_hash}"))
            }) {
            Ok(signature) => signature,
            Err(e) => {
                let extra = failure(format!("{e:#}"), "keysign", Some(&task.id));
                return self.transition(token, &tx.id, TransactionStatus::SigningFailed, extra).await;
            }
        };

        if let Err(e) = plugin.signing_complete(&signature, &request, policy).await {
            let extra = failure(e.to_string(), e.stage(), Some(&task.id));
            return self.transition(token, &tx.id, TransactionStatus::SigningFailed, extra).await;
        }

        let mut extra = Metadata::new();
        extra.insert("task_id".into(), json!(task.id));
        self.transition(token, &tx.id, TransactionStatus::Signed, extra).await?;
        let mined = self
            .transition(token, &tx.id, TransactionStatus::Mined, Metadata::new())
            .await?;
        info!(policy_id = %policy.id, tx_hash = %tx_hash, "Transaction broadcast");
        Ok(mined)
    }

    /// Poll the queue until the task completes, is archived, or the timeout passes.
    pub async fn wait_for_task_result(&self, queue: &str, task_id: &str) -> Result<String> {
        let deadline = Instant::now() + self.settings.task_poll_timeout;
        loop {
            let info = self
                .queue
                .task_info(queue, task_id)
                .await
                .with_context(|| format!("Failed to get info for task {task_id}"))?;
            match info.state {
                TaskState::Completed => return Ok(info.result.unwrap_or_default()),
                TaskState::Archived => {
                    bail!("task archived: {}", info.last_error.unwrap_or_default())
                }
                state => debug!(task_id, %state, "Waiting for task"),
            }
            if Instant::now() >= deadline {
                bail!(
                    "timed out after {}s waiting for task {task_id}",
                    self.settings.task_poll_timeout.as_secs()
                );
            }
            tokio::time::sleep(self.settings.task_poll_interval).await;
        }
    }

    /// Persist a status change and replicate it. Sync failures are logged only.
    async fn transition(
        &self,
        token: &str,
        tx_id: &str,
        status: TransactionStatus,
        extra: Metadata,
    ) -> Result<TransactionHistory> {
        let updated = {
            let db = self.db.lock().await;
            transactions::update_status(db.conn(), tx_id, status, extra)
                .with_context(|| format!("Failed to set transaction {tx_id} to {status}"))?
        };
        if status == TransactionStatus::SigningFailed || status == TransactionStatus::Rejected {
            warn!(
                tx_id,
                %status,
                error = updated.metadata.get("error").and_then(|v| v.as_str()).unwrap_or_default(),
                "Transaction failed"
            );
        }
        self.sync_transaction(SyncAction::Update, token, &updated).await;
        Ok(updated)
    }

    async fn sync_transaction(&self, action: SyncAction, token: &str, tx: &TransactionHistory) {
        if let Err(e) = self.syncer.sync_transaction(action, token, tx).await {
            warn!(tx_id = %tx.id, %action, "Failed to sync transaction: {e}");
        }
    }
}

/// Cleans up after a cycle whose future was dropped mid-flight.
struct CycleGuard {
    db: SharedDb,
    syncer: Arc<dyn PolicySyncer>,
    tokens: TokenIssuer,
    clock: Arc<dyn Clock>,
    policy_id: String,
    armed: bool,
}

impl Drop for CycleGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let policy_id = std::mem::take(&mut self.policy_id);
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            error!(policy_id = %policy_id, "No runtime left to release the trigger of an abandoned cycle");
            return;
        };
        runtime.spawn(abandon_cycle(
            self.db.clone(),
            self.syncer.clone(),
            self.tokens.clone(),
            self.clock.now(),
            policy_id,
        ));
    }
}

async fn abandon_cycle(
    db: SharedDb,
    syncer: Arc<dyn PolicySyncer>,
    tokens: TokenIssuer,
    now: chrono::DateTime<Utc>,
    policy_id: String,
) {
    let extra = failure("cycle ended before the transaction was signed".into(), "cycle", None);
    let failed = {
        let db = db.lock().await;
        let failed = db.with_transaction(|conn| transactions::fail_pending(conn, &policy_id, &extra));
        if let Err(e) = triggers::release(db.conn(), &policy_id, now) {
            error!(policy_id = %policy_id, "Failed to release trigger: {e:#}");
        }
        failed
    };
    warn!(policy_id = %policy_id, "Automation cycle abandoned, trigger released");

    let failed = match failed {
        Ok(failed) => failed,
        Err(e) => {
            error!(policy_id = %policy_id, "Failed to close pending transactions: {e:#}");
            return;
        }
    };
    if failed.is_empty() {
        return;
    }
    let token = match tokens.issue(&policy_id) {
        Ok(token) => token,
        Err(e) => {
            warn!(policy_id = %policy_id, "Failed to issue sync token: {e:#}");
            return;
        }
    };
    for tx in &failed {
        if let Err(e) = syncer.sync_transaction(SyncAction::Update, &token, tx).await {
            warn!(tx_id = %tx.id, "Failed to sync transaction: {e}");
        }
    }
}

fn failure(error: String, stage: &str, task_id: Option<&str>) -> Metadata {
    let mut extra = Metadata::new();
    extra.insert("error".into(), json!(error));
    extra.insert("stage".into(), json!(stage));
    if let Some(task_id) = task_id {
        extra.insert("task_id".into(), json!(task_id));
    }
    extra
}

#[async_trait]
impl TaskHandler for WorkerService {
    async fn handle(&self, task: &Task) -> Result<String, TaskError> {
        let event: TriggerEvent = task.decode()?;
        self.handle_trigger(&event.policy_id).await
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::error::SyncError;
    use crate::queue::{SqliteTaskQueue, TaskInfo, TaskServer, TYPE_PLUGIN_TRANSACTION};
    use crate::state::policies::tests::sample_policy;
    use crate::state::triggers::tests::sample_trigger;
    use crate::state::{self, Database};
    use crate::types::{KeysignRequest, KeysignResponse, TriggerStatus};
    use axum::http::StatusCode;
    use axum::routing::post;
    use axum::Router;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Records every sync call as "kind:detail".
    #[derive(Default)]
    pub(crate) struct RecordingSyncer {
        pub calls: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl PolicySyncer for RecordingSyncer {
        async fn create_policy(&self, policy: &Policy) -> Result<(), SyncError> {
            self.calls.lock().unwrap().push(format!("create_policy:{}", policy.id));
            Ok(())
        }
        async fn update_policy(&self, policy: &Policy) -> Result<(), SyncError> {
            self.calls
                .lock()
                .unwrap()
                .push(format!("update_policy:{}:{}", policy.id, policy.progress));
            Ok(())
        }
        async fn delete_policy(&self, policy_id: &str, _signature: &str) -> Result<(), SyncError> {
            self.calls.lock().unwrap().push(format!("delete_policy:{policy_id}"));
            Ok(())
        }
        async fn sync_transaction(
            &self,
            action: SyncAction,
            _token: &str,
            tx: &TransactionHistory,
        ) -> Result<(), SyncError> {
            self.calls
                .lock()
                .unwrap()
                .push(format!("{action}_tx:{}", tx.status));
            Ok(())
        }
    }

    /// Plugin proposing a fixed batch.
    pub(crate) struct BatchPlugin {
        pub proposals: Vec<SignRequest>,
        pub completed: AtomicUsize,
        pub broadcast_error: Option<String>,
    }

    #[async_trait]
    impl Plugin for BatchPlugin {
        async fn validate_policy(&self, _policy: &Policy) -> Result<(), PluginError> {
            Ok(())
        }
        async fn propose_transactions(&self, _policy: &Policy) -> Result<Vec<SignRequest>, PluginError> {
            if self.proposals.is_empty() {
                return Err(PluginError::NothingToDo);
            }
            Ok(self.proposals.clone())
        }
        async fn signing_complete(
            &self,
            _signature: &KeysignResponse,
            _request: &SignRequest,
            _policy: &Policy,
        ) -> Result<(), PluginError> {
            self.completed.fetch_add(1, Ordering::SeqCst);
            match &self.broadcast_error {
                Some(msg) => Err(PluginError::Broadcast(msg.clone())),
                None => Ok(()),
            }
        }
    }

    pub(crate) fn proposal(hash: &str) -> SignRequest {
        SignRequest {
            keysign_request: KeysignRequest {
                public_key: "02ab".into(),
                messages: vec![hash.into()],
                session_id: format!("session-{hash}"),
                hex_encryption_key: "00".repeat(32),
                derive_path: String::new(),
                is_ecdsa: true,
                start_session: false,
                parties: vec![],
            },
            transaction: format!("0xbody-{hash}"),
            plugin_id: "dca-plugin".into(),
            policy_id: "p-1".into(),
            transaction_type: String::new(),
        }
    }

    /// Queue whose task_info walks through a fixed list of states.
    struct ScriptedQueue {
        states: Mutex<Vec<(TaskState, Option<&'static str>)>>,
        polls: AtomicUsize,
    }

    #[async_trait]
    impl TaskQueue for ScriptedQueue {
        async fn enqueue(&self, kind: &str, _payload: String, opts: TaskOptions) -> Result<TaskInfo> {
            Ok(TaskInfo {
                id: "t-1".into(),
                queue: opts.queue,
                kind: kind.into(),
                state: TaskState::Pending,
                result: None,
                last_error: None,
            })
        }
        async fn task_info(&self, queue: &str, id: &str) -> Result<TaskInfo> {
            self.polls.fetch_add(1, Ordering::SeqCst);
            let mut states = self.states.lock().unwrap();
            let (state, text) = if states.len() > 1 { states.remove(0) } else { states[0] };
            Ok(TaskInfo {
                id: id.into(),
                queue: queue.into(),
                kind: TYPE_KEY_SIGN.into(),
                state,
                result: (state == TaskState::Completed).then(|| text.unwrap_or_default().to_string()),
                last_error: (state == TaskState::Archived).then(|| text.unwrap_or_default().to_string()),
            })
        }
    }

    async fn spawn_counterpart(status: StatusCode) -> String {
        let app = Router::new().route("/signFromPlugin", post(move || async move { status }));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });
        format!("http://{addr}")
    }

    fn settings() -> PipelineSettings {
        PipelineSettings {
            queue_name: "default_queue".into(),
            local_party_id: "1".into(),
            counterpart_party_id: "2".into(),
            task_poll_interval: Duration::from_millis(10),
            task_poll_timeout: Duration::from_millis(200),
        }
    }

    async fn seeded_db() -> SharedDb {
        let db = state::shared(Database::open_memory().unwrap());
        {
            let guard = db.lock().await;
            let mut policy = sample_policy("p-1");
            policy.plugin_id = "dca-plugin".into();
            policies::insert(guard.conn(), &policy).unwrap();
            let mut trigger = sample_trigger("p-1", Utc::now() - chrono::Duration::days(1));
            trigger.status = TriggerStatus::Running;
            triggers::insert(guard.conn(), &trigger).unwrap();
        }
        db
    }

    fn worker(
        db: SharedDb,
        queue: Arc<dyn TaskQueue>,
        plugin: Arc<BatchPlugin>,
        syncer: Arc<RecordingSyncer>,
        counterpart: &str,
    ) -> WorkerService {
        let plugins = PluginRegistry::new().register("dca", move || {
            Ok::<_, anyhow::Error>(plugin.clone() as Arc<dyn Plugin>)
        });
        WorkerService::new(
            db,
            queue,
            plugins,
            syncer,
            CosignClient::new(counterpart, Duration::from_secs(5)).unwrap(),
            TokenIssuer::new(b"secret", Duration::from_secs(60)),
            settings(),
        )
    }

    fn scripted(states: Vec<(TaskState, Option<&'static str>)>) -> Arc<ScriptedQueue> {
        Arc::new(ScriptedQueue {
            states: Mutex::new(states),
            polls: AtomicUsize::new(0),
        })
    }

    fn plugin(proposals: Vec<SignRequest>) -> Arc<BatchPlugin> {
        Arc::new(BatchPlugin {
            proposals,
            completed: AtomicUsize::new(0),
            broadcast_error: None,
        })
    }

    async fn trigger_status(db: &SharedDb) -> (TriggerStatus, bool) {
        let guard = db.lock().await;
        let trigger = triggers::get(guard.conn(), "p-1").unwrap().unwrap();
        (trigger.status, trigger.last_execution.is_some())
    }

    const SIGNED: &str = r#"{"0xaa":{"msg":"qg==","r":"01","s":"02","der_signature":"","recovery_id":"00"}}"#;

    #[tokio::test]
    async fn successful_cycle_walks_pending_signed_mined() {
        let db = seeded_db().await;
        let url = spawn_counterpart(StatusCode::OK).await;
        let queue = scripted(vec![(TaskState::Pending, None), (TaskState::Active, None), (TaskState::Completed, Some(SIGNED))]);
        let syncer = Arc::new(RecordingSyncer::default());
        let plugin = plugin(vec![proposal("0xaa")]);
        let w = worker(db.clone(), queue.clone(), plugin.clone(), syncer.clone(), &url);

        w.handle_trigger("p-1").await.unwrap();

        let guard = db.lock().await;
        let tx = transactions::get_by_hash(guard.conn(), "0xaa").unwrap().unwrap();
        assert_eq!(tx.status, TransactionStatus::Mined);
        assert_eq!(tx.metadata["task_id"], json!("t-1"));
        assert_eq!(tx.metadata["plugin_id"], json!("dca-plugin"));
        drop(guard);

        assert_eq!(plugin.completed.load(Ordering::SeqCst), 1);
        assert_eq!(queue.polls.load(Ordering::SeqCst), 3);
        assert_eq!(
            syncer.calls.lock().unwrap().as_slice(),
            ["create_tx:PENDING", "update_tx:SIGNED", "update_tx:MINED"]
        );
        assert_eq!(trigger_status(&db).await, (TriggerStatus::Pending, true));
    }

    #[tokio::test]
    async fn keysign_timeout_records_task_id_and_releases_trigger() {
        let db = seeded_db().await;
        let url = spawn_counterpart(StatusCode::OK).await;
        let queue = scripted(vec![(TaskState::Active, None)]);
        let syncer = Arc::new(RecordingSyncer::default());
        let w = worker(db.clone(), queue, plugin(vec![proposal("0xaa")]), syncer.clone(), &url);

        w.handle_trigger("p-1").await.unwrap();

        let guard = db.lock().await;
        let tx = transactions::get_by_hash(guard.conn(), "0xaa").unwrap().unwrap();
        assert_eq!(tx.status, TransactionStatus::SigningFailed);
        assert_eq!(tx.metadata["task_id"], json!("t-1"));
        assert!(tx.metadata["error"].as_str().unwrap().contains("t-1"));
        drop(guard);

        assert_eq!(
            syncer.calls.lock().unwrap().last().unwrap(),
            "update_tx:SIGNING_FAILED"
        );
        assert_eq!(trigger_status(&db).await, (TriggerStatus::Pending, true));
    }

    #[tokio::test]
    async fn archived_task_error_is_captured() {
        let db = seeded_db().await;
        let url = spawn_counterpart(StatusCode::OK).await;
        let queue = scripted(vec![(TaskState::Archived, Some("relay unreachable"))]);
        let w = worker(db.clone(), queue, plugin(vec![proposal("0xaa")]), Arc::default(), &url);

        w.handle_trigger("p-1").await.unwrap();

        let guard = db.lock().await;
        let tx = transactions::get_by_hash(guard.conn(), "0xaa").unwrap().unwrap();
        assert_eq!(tx.status, TransactionStatus::SigningFailed);
        assert_eq!(tx.metadata["error"], json!("task archived: relay unreachable"));
    }

    #[tokio::test]
    async fn counterpart_refusal_marks_rejected_without_local_keysign() {
        let db = seeded_db().await;
        let url = spawn_counterpart(StatusCode::BAD_REQUEST).await;
        let queue = scripted(vec![(TaskState::Completed, Some(SIGNED))]);
        let w = worker(db.clone(), queue.clone(), plugin(vec![proposal("0xaa")]), Arc::default(), &url);

        w.handle_trigger("p-1").await.unwrap();

        let guard = db.lock().await;
        let tx = transactions::get_by_hash(guard.conn(), "0xaa").unwrap().unwrap();
        assert_eq!(tx.status, TransactionStatus::Rejected);
        assert_eq!(queue.polls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn broadcast_failure_records_stage() {
        let db = seeded_db().await;
        let url = spawn_counterpart(StatusCode::OK).await;
        let queue = scripted(vec![(TaskState::Completed, Some(SIGNED))]);
        let plugin = Arc::new(BatchPlugin {
            proposals: vec![proposal("0xaa")],
            completed: AtomicUsize::new(0),
            broadcast_error: Some("nonce too low".into()),
        });
        let w = worker(db.clone(), queue, plugin, Arc::default(), &url);

        w.handle_trigger("p-1").await.unwrap();

        let guard = db.lock().await;
        let tx = transactions::get_by_hash(guard.conn(), "0xaa").unwrap().unwrap();
        assert_eq!(tx.status, TransactionStatus::SigningFailed);
        assert_eq!(tx.metadata["stage"], json!("broadcast"));
        assert!(tx.metadata["error"].as_str().unwrap().contains("nonce too low"));
    }

    #[tokio::test]
    async fn proposals_are_independent() {
        let db = seeded_db().await;
        let url = spawn_counterpart(StatusCode::OK).await;
        // Only 0xaa has a signature in the result; 0xbb fails, 0xaa still mines.
        let queue = scripted(vec![(TaskState::Completed, Some(SIGNED))]);
        let w = worker(
            db.clone(),
            queue,
            plugin(vec![proposal("0xbb"), proposal("0xaa")]),
            Arc::default(),
            &url,
        );

        w.handle_trigger("p-1").await.unwrap();

        let guard = db.lock().await;
        let bb = transactions::get_by_hash(guard.conn(), "0xbb").unwrap().unwrap();
        let aa = transactions::get_by_hash(guard.conn(), "0xaa").unwrap().unwrap();
        assert_eq!(bb.status, TransactionStatus::SigningFailed);
        assert_eq!(aa.status, TransactionStatus::Mined);
    }

    #[tokio::test]
    async fn mined_hash_is_not_signed_again() {
        let db = seeded_db().await;
        let url = spawn_counterpart(StatusCode::OK).await;
        let queue = scripted(vec![(TaskState::Completed, Some(SIGNED))]);
        let plugin = plugin(vec![proposal("0xaa")]);
        let w = worker(db.clone(), queue.clone(), plugin.clone(), Arc::default(), &url);

        w.handle_trigger("p-1").await.unwrap();
        w.handle_trigger("p-1").await.unwrap();

        assert_eq!(plugin.completed.load(Ordering::SeqCst), 1);
        let guard = db.lock().await;
        assert_eq!(transactions::list_by_policy(guard.conn(), "p-1", 10).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn pending_row_left_by_an_earlier_cycle_is_signed() {
        let db = seeded_db().await;
        {
            let guard = db.lock().await;
            let stale = TransactionHistory::pending("p-1", "0xbody-0xaa", "0xaa", Metadata::new());
            guard.with_transaction(|conn| transactions::upsert(conn, &stale)).unwrap();
        }
        let url = spawn_counterpart(StatusCode::OK).await;
        let queue = scripted(vec![(TaskState::Completed, Some(SIGNED))]);
        let syncer = Arc::new(RecordingSyncer::default());
        let plugin = plugin(vec![proposal("0xaa")]);
        let w = worker(db.clone(), queue, plugin.clone(), syncer.clone(), &url);

        w.handle_trigger("p-1").await.unwrap();

        assert_eq!(plugin.completed.load(Ordering::SeqCst), 1);
        let guard = db.lock().await;
        let tx = transactions::get_by_hash(guard.conn(), "0xaa").unwrap().unwrap();
        assert_eq!(tx.status, TransactionStatus::Mined);
        assert_eq!(transactions::list_by_policy(guard.conn(), "p-1", 10).unwrap().len(), 1);
        drop(guard);
        assert_eq!(syncer.calls.lock().unwrap()[0], "update_tx:PENDING");
    }

    #[tokio::test]
    async fn cycle_cut_off_by_task_timeout_still_releases_trigger() {
        let db = seeded_db().await;
        let url = spawn_counterpart(StatusCode::OK).await;
        // Nothing claims key:sign, so every proposal waits out its poll timeout.
        let queue = Arc::new(SqliteTaskQueue::new(db.clone()));
        let syncer = Arc::new(RecordingSyncer::default());
        let w = worker(
            db.clone(),
            queue.clone(),
            plugin(vec![proposal("0xaa"), proposal("0xbb")]),
            syncer.clone(),
            &url,
        );
        let server = TaskServer::new(db.clone(), "default_queue", 1, Duration::from_millis(10))
            .handle(TYPE_PLUGIN_TRANSACTION, Arc::new(w));

        let opts = TaskOptions {
            timeout: Duration::from_millis(300),
            ..TaskOptions::plugin_transaction("default_queue")
        };
        let event = TriggerEvent { policy_id: "p-1".into() };
        let task = enqueue_json(queue.as_ref(), TYPE_PLUGIN_TRANSACTION, &event, opts).await.unwrap();
        assert!(server.process_one().await.unwrap());

        let mut released = false;
        for _ in 0..100 {
            if trigger_status(&db).await == (TriggerStatus::Pending, true) {
                released = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(released, "trigger stayed RUNNING after the cycle was cut off");

        let info = queue.task_info("default_queue", &task.id).await.unwrap();
        assert_eq!(info.state, TaskState::Archived);

        for _ in 0..100 {
            if syncer.calls.lock().unwrap().len() >= 4 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        let guard = db.lock().await;
        let aa = transactions::get_by_hash(guard.conn(), "0xaa").unwrap().unwrap();
        let bb = transactions::get_by_hash(guard.conn(), "0xbb").unwrap().unwrap();
        assert_eq!(aa.status, TransactionStatus::SigningFailed);
        assert_eq!(aa.metadata["stage"], json!("keysign"));
        assert_eq!(bb.status, TransactionStatus::SigningFailed);
        assert_eq!(bb.metadata["stage"], json!("cycle"));
        drop(guard);
        assert_eq!(
            syncer.calls.lock().unwrap().last().map(String::as_str),
            Some("update_tx:SIGNING_FAILED")
        );
    }

    #[tokio::test]
    async fn nothing_to_do_marks_policy_done() {
        let db = seeded_db().await;
        let syncer = Arc::new(RecordingSyncer::default());
        let w = worker(
            db.clone(),
            scripted(vec![(TaskState::Pending, None)]),
            plugin(vec![]),
            syncer.clone(),
            "http://127.0.0.1:1",
        );

        w.handle_trigger("p-1").await.unwrap();

        let guard = db.lock().await;
        assert!(transactions::list_by_policy(guard.conn(), "p-1", 10).unwrap().is_empty());
        assert_eq!(policies::get(guard.conn(), "p-1").unwrap().unwrap().progress, PROGRESS_DONE);
        drop(guard);
        assert_eq!(syncer.calls.lock().unwrap().as_slice(), ["update_policy:p-1:DONE"]);
        assert_eq!(trigger_status(&db).await, (TriggerStatus::Pending, true));
    }

    #[tokio::test]
    async fn missing_policy_is_fatal() {
        let db = state::shared(Database::open_memory().unwrap());
        let w = worker(
            db,
            scripted(vec![(TaskState::Pending, None)]),
            plugin(vec![]),
            Arc::default(),
            "http://127.0.0.1:1",
        );
        assert!(matches!(
            w.handle_trigger("ghost").await,
            Err(TaskError::SkipRetry(msg)) if msg.contains("ghost")
        ));
    }

    #[tokio::test]
    async fn real_queue_task_info_is_polled() {
        let db = seeded_db().await;
        let queue = Arc::new(SqliteTaskQueue::new(db.clone()));
        let w = worker(db.clone(), queue.clone(), plugin(vec![]), Arc::default(), "http://127.0.0.1:1");

        let info = queue
            .enqueue(TYPE_KEY_SIGN, "{}".into(), TaskOptions::key_sign("default_queue"))
            .await
            .unwrap();
        let err = w.wait_for_task_result("default_queue", &info.id).await.unwrap_err();
        assert!(err.to_string().contains(&info.id));
    }
}
