//! Joining a signing session and producing signatures for its messages.

use super::pump::{MessagePump, PumpTarget};
use super::{message_id, EngineSignRequest, Messenger, RelayClient, SigningEngineFactory};
use crate::config::AutomationConfig;
use crate::error::{SigningError, TaskError};
use crate::queue::server::{Task, TaskHandler};
use crate::types::{KeysignRequest, KeysignResponse, Signatures};
use anyhow::{Context, Result};
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

const DEFAULT_SESSION_START_TIMEOUT: Duration = Duration::from_secs(183);
const DEFAULT_ATTEMPTS: u32 = 3;

/// Runs this party's side of a keysign session.
pub struct KeysignService {
    relay: RelayClient,
    engines: Arc<dyn SigningEngineFactory>,
    local_party_id: String,
    session_start_timeout: Duration,
    poll_interval: Duration,
    attempts: u32,
}

impl KeysignService {
    pub fn new(relay: RelayClient, engines: Arc<dyn SigningEngineFactory>, local_party_id: &str) -> Self {
        Self {
            relay,
            engines,
            local_party_id: local_party_id.to_string(),
            session_start_timeout: DEFAULT_SESSION_START_TIMEOUT,
            poll_interval: Duration::from_secs(1),
            attempts: DEFAULT_ATTEMPTS,
        }
    }

    pub fn from_config(config: &AutomationConfig, engines: Arc<dyn SigningEngineFactory>) -> Self {
        let relay = RelayClient::new(&config.relay_url).with_poll_interval(config.relay_poll_interval());
        Self {
            session_start_timeout: config.session_start_timeout(),
            poll_interval: config.relay_poll_interval(),
            attempts: config.keysign_attempts.max(1),
            ..Self::new(relay, engines, &config.local_party_id)
        }
    }

    pub fn with_timeouts(mut self, session_start_timeout: Duration, poll_interval: Duration) -> Self {
        self.session_start_timeout = session_start_timeout;
        self.poll_interval = poll_interval;
        self
    }

    /// Join the session in `request` and sign every message in it.
    ///
    /// The party with `start_session` opens the session for `parties`; the
    /// other registers itself. Any message that exhausts its attempts fails
    /// the whole request.
    pub async fn join_keysign(&self, request: &KeysignRequest) -> Result<Signatures> {
        let session = request.session_id.as_str();
        debug!(
            session,
            public_key = %request.public_key,
            messages = request.messages.len(),
            is_ecdsa = request.is_ecdsa,
            "Join keysign"
        );

        if request.start_session {
            self.relay
                .start_session(session, &request.parties)
                .await
                .context("Failed to start session")?;
        } else {
            self.relay
                .register_session_with_retry(session, &self.local_party_id)
                .await
                .context("Failed to register session")?;
        }

        let parties = self
            .relay
            .wait_for_session_start(session, self.session_start_timeout)
            .await
            .context("Failed to wait for session start")?;
        info!(session, parties = ?parties, "Session started");

        let mut signatures = Signatures::new();
        for message in &request.messages {
            let mut last_err = None;
            for attempt in 0..self.attempts {
                match self.sign_message(request, &parties, message).await {
                    Ok(signature) => {
                        signatures.insert(message.clone(), signature);
                        last_err = None;
                        break;
                    }
                    Err(e) => {
                        warn!(session, attempt, message = %message, "Keysign attempt failed: {e:#}");
                        last_err = Some(e);
                    }
                }
            }
            if let Some(e) = last_err {
                return Err(e.context(format!("Failed to sign message {message}")));
            }
        }

        if let Err(e) = self.relay.complete_session(session, &self.local_party_id).await {
            error!(session, "Failed to complete session: {e:#}");
        }

        Ok(signatures)
    }

    /// One signing attempt for one message, with its own engine and pump.
    async fn sign_message(
        &self,
        request: &KeysignRequest,
        parties: &[String],
        message: &str,
    ) -> Result<KeysignResponse> {
        let session = request.session_id.as_str();
        let message_id = message_id(message);
        info!(session, message_id = %message_id, "Start keysign for message");

        let raw = hex::decode(message.trim_start_matches("0x")).context("Failed to decode message")?;
        let messenger = Messenger::new(
            self.relay.clone(),
            session,
            &request.hex_encryption_key,
            &message_id,
        );
        let engine = self.engines.create(messenger).context("Failed to create signing engine")?;

        let pump = MessagePump::start(
            self.relay.clone(),
            PumpTarget {
                session_id: session.to_string(),
                party_id: self.local_party_id.clone(),
                message_id: message_id.clone(),
                hex_encryption_key: request.hex_encryption_key.clone(),
            },
            engine.clone(),
            self.poll_interval,
        );

        let sign_request = EngineSignRequest {
            public_key: request.public_key.clone(),
            message: STANDARD.encode(raw),
            local_party_id: self.local_party_id.clone(),
            committee: parties.to_vec(),
            derive_path: request.derive_path.clone(),
            is_ecdsa: request.is_ecdsa,
        };

        let result = match engine.sign(&sign_request).await {
            Ok(signature) => {
                if let Err(e) = self
                    .relay
                    .mark_keysign_complete(session, &message_id, &signature)
                    .await
                {
                    error!(session, "Failed to mark keysign complete: {e:#}");
                }
                Ok(signature)
            }
            Err(e) => {
                error!(session, "Failed to key sign: {e:#}");
                match self.relay.check_keysign_complete(session, &message_id).await {
                    Ok(Some(signature)) => {
                        info!(session, message_id = %message_id, "Recovered signature published by peer");
                        Ok(signature)
                    }
                    _ => Err(SigningError::Engine(format!("{e:#}")).into()),
                }
            }
        };

        pump.stop().await;
        result
    }
}

/// Queue handler for `key:sign` tasks. The task result is the signature map as JSON.
pub struct KeysignHandler {
    service: Arc<KeysignService>,
}

impl KeysignHandler {
    pub fn new(service: Arc<KeysignService>) -> Self {
        Self { service }
    }
}

#[async_trait]
impl TaskHandler for KeysignHandler {
    async fn handle(&self, task: &Task) -> Result<String, TaskError> {
        let request: KeysignRequest = task.decode()?;
        if request.messages.is_empty() {
            return Err(TaskError::skip_retry("keysign request has no messages"));
        }
        let signatures = self.service.join_keysign(&request).await?;
        serde_json::to_string(&signatures)
            .context("Failed to encode signatures")
            .map_err(TaskError::from)
    }
}
