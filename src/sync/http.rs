//! HTTP implementation of the sync replicator.

use super::{PolicySyncer, SyncAction};
use crate::config::AutomationConfig;
use crate::error::SyncError;
use crate::types::{Policy, TransactionHistory};
use async_trait::async_trait;
use serde::Serialize;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

const POLICY_ENDPOINT: &str = "/plugin/policy";
const TRANSACTION_ENDPOINT: &str = "/sync/transaction";

const POLICY_CONTEXT: &str = "fail to sync policy with verifier server";
const DELETE_CONTEXT: &str = "fail to delete policy on verifier server";
const TRANSACTION_CONTEXT: &str = "fail to sync transaction with verifier server";

#[derive(Debug, Serialize)]
struct DeletePolicyRequest<'a> {
    signature: &'a str,
}

/// Replicator talking to the counterpart's sync endpoints.
#[derive(Debug, Clone)]
pub struct HttpSyncer {
    base_url: String,
    http: reqwest::Client,
    max_retries: u32,
    base_delay: Duration,
}

impl HttpSyncer {
    pub fn new(
        base_url: &str,
        timeout: Duration,
        max_retries: u32,
        base_delay: Duration,
    ) -> Result<Self, SyncError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|source| SyncError::Http {
                context: "fail to build sync http client",
                source,
            })?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            http,
            max_retries: max_retries.max(1),
            base_delay,
        })
    }

    pub fn from_config(config: &AutomationConfig) -> Result<Self, SyncError> {
        Self::new(
            &config.counterpart_url,
            config.sync_timeout(),
            config.sync_max_retries,
            config.sync_base_delay(),
        )
    }

    /// Run `attempt` up to `max_retries` times, sleeping `base_delay`,
    /// `2 * base_delay`, ... between attempts.
    async fn retry_with_backoff<F, Fut>(&self, operation: &str, attempt: F) -> Result<(), SyncError>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<(), SyncError>>,
    {
        let mut backoff = self.base_delay;
        let mut last = None;

        for n in 0..self.max_retries {
            if n > 0 {
                debug!(operation, attempt = n, backoff_ms = backoff.as_millis() as u64, "Retrying sync");
                tokio::time::sleep(backoff).await;
                backoff *= 2;
            }
            match attempt().await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    warn!(operation, attempt = n, "Sync failed, will retry: {e}");
                    last = Some(e);
                }
            }
        }

        Err(SyncError::Exhausted {
            attempts: self.max_retries,
            last: Box::new(last.unwrap_or(SyncError::Status {
                context: "sync never attempted",
                status: 0,
                body: String::new(),
            })),
        })
    }

    async fn send(
        &self,
        request: reqwest::RequestBuilder,
        expected: reqwest::StatusCode,
        context: &'static str,
    ) -> Result<(), SyncError> {
        let resp = request
            .send()
            .await
            .map_err(|source| SyncError::Http { context, source })?;
        let status = resp.status();
        if status != expected {
            let body = resp.text().await.unwrap_or_default();
            return Err(SyncError::Status {
                context,
                status: status.as_u16(),
                body,
            });
        }
        Ok(())
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }
}

#[async_trait]
impl PolicySyncer for HttpSyncer {
    async fn create_policy(&self, policy: &Policy) -> Result<(), SyncError> {
        self.retry_with_backoff("create_policy", || {
            let request = self.http.post(self.url(POLICY_ENDPOINT)).json(policy);
            self.send(request, reqwest::StatusCode::OK, POLICY_CONTEXT)
        })
        .await
    }

    async fn update_policy(&self, policy: &Policy) -> Result<(), SyncError> {
        self.retry_with_backoff("update_policy", || {
            let request = self.http.put(self.url(POLICY_ENDPOINT)).json(policy);
            self.send(request, reqwest::StatusCode::OK, POLICY_CONTEXT)
        })
        .await
    }

    async fn delete_policy(&self, policy_id: &str, signature: &str) -> Result<(), SyncError> {
        let url = self.url(&format!("{POLICY_ENDPOINT}/{policy_id}"));
        self.retry_with_backoff("delete_policy", || {
            let request = self
                .http
                .delete(&url)
                .json(&DeletePolicyRequest { signature });
            self.send(request, reqwest::StatusCode::NO_CONTENT, DELETE_CONTEXT)
        })
        .await
    }

    async fn sync_transaction(
        &self,
        action: SyncAction,
        token: &str,
        tx: &TransactionHistory,
    ) -> Result<(), SyncError> {
        let operation = match action {
            SyncAction::Create => "create_transaction",
            SyncAction::Update => "update_transaction",
        };
        self.retry_with_backoff(operation, || {
            let url = self.url(TRANSACTION_ENDPOINT);
            let request = match action {
                SyncAction::Create => self.http.post(url),
                SyncAction::Update => self.http.put(url),
            };
            self.send(
                request.bearer_auth(token).json(tx),
                reqwest::StatusCode::OK,
                TRANSACTION_CONTEXT,
            )
        })
        .await
    }
}
