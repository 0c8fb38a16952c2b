//! Two-party signing session handshake.
//!
//! The threshold-signature math lives in an external engine behind
//! [`SigningEngine`]. This module runs the session around it: joining the
//! relay session, pumping inbound protocol messages into the engine,
//! retrying failed attempts, and publishing/recovering finished signatures.

pub mod crypto;
pub mod keysign;
pub mod pump;
pub mod relay;

pub use keysign::{KeysignHandler, KeysignService};
pub use pump::MessagePump;
pub use relay::{RelayClient, RelayMessage};

use anyhow::{Context, Result};
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use sha2::{Digest, Sha256};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use crate::types::KeysignResponse;

/// Relay scoping id for one signed message; both parties derive the same value.
pub fn message_id(message: &str) -> String {
    hex::encode(Sha256::digest(message.as_bytes()))
}

/// Input to one engine signing run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineSignRequest {
    pub public_key: String,
    /// Base64 of the raw message bytes.
    pub message: String,
    pub local_party_id: String,
    pub committee: Vec<String>,
    pub derive_path: String,
    pub is_ecdsa: bool,
}

/// The external threshold-signature engine for one signing attempt.
#[async_trait]
pub trait SigningEngine: Send + Sync {
    /// Feed one decrypted inbound protocol message.
    async fn apply_data(&self, data: &[u8]) -> Result<()>;

    /// Run the local side of the protocol to completion.
    async fn sign(&self, request: &EngineSignRequest) -> Result<KeysignResponse>;
}

/// Builds an engine bound to the messenger it uses for outbound messages.
pub trait SigningEngineFactory: Send + Sync {
    fn create(&self, messenger: Messenger) -> Result<Arc<dyn SigningEngine>>;
}

impl<F> SigningEngineFactory for F
where
    F: Fn(Messenger) -> Result<Arc<dyn SigningEngine>> + Send + Sync,
{
    fn create(&self, messenger: Messenger) -> Result<Arc<dyn SigningEngine>> {
        self(messenger)
    }
}

/// Outbound side of the relay for one signing attempt: encrypts and uploads.
#[derive(Debug, Clone)]
pub struct Messenger {
    relay: RelayClient,
    session_id: String,
    hex_encryption_key: String,
    message_id: String,
    sequence: Arc<AtomicI64>,
}

impl Messenger {
    pub fn new(relay: RelayClient, session_id: &str, hex_encryption_key: &str, message_id: &str) -> Self {
        Self {
            relay,
            session_id: session_id.to_string(),
            hex_encryption_key: hex_encryption_key.to_string(),
            message_id: message_id.to_string(),
            sequence: Arc::new(AtomicI64::new(0)),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub async fn send(&self, from: &str, to: &str, body: &[u8]) -> Result<()> {
        let encrypted = crypto::encrypt(body, &self.hex_encryption_key)
            .context("Failed to encrypt outbound message")?;
        let body = STANDARD.encode(encrypted);
        let message = RelayMessage {
            session_id: self.session_id.clone(),
            from: from.to_string(),
            to: vec![to.to_string()],
            hash: hex::encode(Sha256::digest(body.as_bytes())),
            body,
            sequence_no: self.sequence.fetch_add(1, Ordering::SeqCst),
        };
        self.relay.upload_message(&message, &self.message_id).await
    }
}
