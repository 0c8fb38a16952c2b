//! Background relay poller feeding inbound messages into the signing engine.

use super::{crypto, RelayClient, RelayMessage, SigningEngine};
use anyhow::{Context, Result};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Where a pump reads from and how it decrypts.
#[derive(Debug, Clone)]
pub struct PumpTarget {
    pub session_id: String,
    pub party_id: String,
    pub message_id: String,
    pub hex_encryption_key: String,
}

/// A running message pump. [`MessagePump::stop`] waits for the poller to
/// exit; dropping the pump cancels it without waiting.
pub struct MessagePump {
    cancel: CancellationToken,
    handle: JoinHandle<usize>,
}

impl MessagePump {
    pub fn start(
        relay: RelayClient,
        target: PumpTarget,
        engine: Arc<dyn SigningEngine>,
        poll_interval: Duration,
    ) -> Self {
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let handle = tokio::spawn(async move {
            pump_loop(relay, target, engine, poll_interval, token).await
        });
        Self { cancel, handle }
    }

    /// Signal the poller and wait for it. Returns how many messages were applied.
    pub async fn stop(mut self) -> usize {
        self.cancel.cancel();
        match (&mut self.handle).await {
            Ok(applied) => applied,
            Err(e) => {
                error!("Message pump task failed: {e}");
                0
            }
        }
    }
}

impl Drop for MessagePump {
    fn drop(&mut self) {
        self.cancel.cancel();
        self.handle.abort();
    }
}

async fn pump_loop(
    relay: RelayClient,
    target: PumpTarget,
    engine: Arc<dyn SigningEngine>,
    poll_interval: Duration,
    cancel: CancellationToken,
) -> usize {
    info!(session = %target.session_id, party = %target.party_id, "Start downloading messages");
    let mut applied_cache = HashSet::new();

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(poll_interval) => {}
        }

        let messages = match relay
            .download_messages(&target.session_id, &target.party_id, &target.message_id)
            .await
        {
            Ok(messages) => messages,
            Err(e) => {
                warn!(session = %target.session_id, "Failed to get messages: {e:#}");
                continue;
            }
        };

        for message in messages {
            let cache_key = format!(
                "{}-{}-{}-{}",
                target.session_id, target.party_id, target.message_id, message.hash
            );
            if applied_cache.contains(&cache_key) {
                debug!(hash = %message.hash, "Message already applied, skipping");
                continue;
            }

            if let Err(e) = apply(&target, engine.as_ref(), &message).await {
                warn!(session = %target.session_id, hash = %message.hash, "{e:#}");
                continue;
            }
            applied_cache.insert(cache_key);

            if let Err(e) = relay
                .delete_message(&target.session_id, &target.party_id, &message.hash, &target.message_id)
                .await
            {
                warn!(hash = %message.hash, "Failed to delete message: {e:#}");
            }
        }
    }

    info!(session = %target.session_id, applied = applied_cache.len(), "Stop downloading messages");
    applied_cache.len()
}

async fn apply(target: &PumpTarget, engine: &dyn SigningEngine, message: &RelayMessage) -> Result<()> {
    let decoded = STANDARD
        .decode(&message.body)
        .context("Failed to decode message body")?;
    let plaintext = crypto::decrypt(&decoded, &target.hex_encryption_key)
        .context("Failed to decrypt message body")?;
    engine
        .apply_data(&plaintext)
        .await
        .context("Failed to apply message")
}
