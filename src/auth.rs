//! Per-cycle authorization tokens for counterpart sync calls.
//!
//! A token is `base64url(claims).base64url(hmac_sha256(secret, claims))`.
//! Both servers share the secret; the receiving side verifies the MAC and
//! the expiry before accepting a `/sync/transaction` call.

use crate::error::TokenError;
use anyhow::{anyhow, Result};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::Utc;
use hmac::{Hmac, Mac};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::time::Duration;
use tracing::warn;

type HmacSha256 = Hmac<Sha256>;

/// Claims carried by a cycle token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenClaims {
    /// Policy the cycle runs for.
    pub sub: String,
    /// Expiry, unix seconds.
    pub exp: i64,
    /// Unique token id.
    pub jti: String,
}

/// Mints and verifies bounded-lifetime tokens.
#[derive(Clone)]
pub struct TokenIssuer {
    secret: Vec<u8>,
    ttl: Duration,
}

impl TokenIssuer {
    pub fn new(secret: &[u8], ttl: Duration) -> Self {
        Self {
            secret: secret.to_vec(),
            ttl,
        }
    }

    /// Build from the configured secret (hex if it decodes, raw text otherwise).
    /// An empty secret gets a random one, which only this process can verify.
    pub fn from_config(secret: &str, ttl: Duration) -> Self {
        if secret.is_empty() {
            warn!("No token secret configured; using a random per-process secret");
            let mut bytes = [0u8; 32];
            rand::rngs::OsRng.fill_bytes(&mut bytes);
            return Self::new(&bytes, ttl);
        }
        let bytes = hex::decode(secret).unwrap_or_else(|_| secret.as_bytes().to_vec());
        Self::new(&bytes, ttl)
    }

    /// Mint a token for one automation cycle of `subject`.
    pub fn issue(&self, subject: &str) -> Result<String> {
        let ttl = chrono::Duration::from_std(self.ttl)?;
        let claims = TokenClaims {
            sub: subject.to_string(),
            exp: (Utc::now() + ttl).timestamp(),
            jti: ulid::Ulid::new().to_string(),
        };
        let payload = URL_SAFE_NO_PAD.encode(serde_json::to_vec(&claims)?);
        let mac = self
            .mac(payload.as_bytes())
            .ok_or_else(|| anyhow!("Invalid token secret"))?
            .finalize()
            .into_bytes();
        Ok(format!("{payload}.{}", URL_SAFE_NO_PAD.encode(mac)))
    }

    /// Check the MAC and expiry of a token.
    pub fn verify(&self, token: &str) -> Result<TokenClaims, TokenError> {
        let (payload, signature) = token.split_once('.').ok_or(TokenError::Malformed)?;
        let signature = URL_SAFE_NO_PAD
            .decode(signature)
            .map_err(|_| TokenError::Malformed)?;
        self.mac(payload.as_bytes())
            .ok_or(TokenError::BadSignature)?
            .verify_slice(&signature)
            .map_err(|_| TokenError::BadSignature)?;

        let claims: TokenClaims = URL_SAFE_NO_PAD
            .decode(payload)
            .ok()
            .and_then(|raw| serde_json::from_slice(&raw).ok())
            .ok_or(TokenError::Malformed)?;
        if claims.exp <= Utc::now().timestamp() {
            return Err(TokenError::Expired);
        }
        Ok(claims)
    }

    fn mac(&self, data: &[u8]) -> Option<HmacSha256> {
        let mut mac = <HmacSha256 as Mac>::new_from_slice(&self.secret).ok()?;
        mac.update(data);
        Some(mac)
    }
}
