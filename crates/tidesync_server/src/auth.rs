//! Authentication support for the sync server.
//!
//! This module provides token-based authentication using HMAC-SHA256.
//! Tokens carry the caller's identity and an issue timestamp for expiration
//! checking.
//!
//! ## Token Format
//!
//! Tokens are composed of:
//! - 8 bytes: timestamp (Unix millis, big-endian)
//! - N bytes: CBOR-encoded `Caller` claims
//! - 32 bytes: HMAC-SHA256 signature over everything before it

use crate::error::{ServerError, ServerResult};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tidesync_protocol::{from_cbor, to_cbor, Caller};

type HmacSha256 = Hmac<Sha256>;

const TIMESTAMP_LEN: usize = 8;
const SIGNATURE_LEN: usize = 32;

/// Authentication configuration.
#[derive(Debug, Clone)]
pub struct AuthConfig {
    /// Secret key for HMAC.
    pub secret: Vec<u8>,
    /// Token expiration duration.
    pub token_expiry: Duration,
}

impl AuthConfig {
    /// Creates a new auth configuration.
    pub fn new(secret: Vec<u8>) -> Self {
        Self {
            secret,
            token_expiry: Duration::from_secs(24 * 60 * 60), // 24 hours
        }
    }

    /// Sets the token expiration duration.
    pub fn with_expiry(mut self, expiry: Duration) -> Self {
        self.token_expiry = expiry;
        self
    }
}

/// Issues and validates caller tokens.
#[derive(Clone)]
pub struct TokenValidator {
    config: AuthConfig,
}

impl TokenValidator {
    /// Creates a new token validator.
    pub fn new(config: AuthConfig) -> Self {
        Self { config }
    }

    /// Creates a token asserting `caller`'s identity.
    pub fn create_token(&self, caller: &Caller) -> ServerResult<Vec<u8>> {
        let timestamp = now_millis();
        let claims = to_cbor(caller).map_err(|e| ServerError::Internal(e.to_string()))?;

        let mut data = Vec::with_capacity(TIMESTAMP_LEN + claims.len() + SIGNATURE_LEN);
        data.extend_from_slice(&timestamp.to_be_bytes());
        data.extend_from_slice(&claims);
        let signature = self.sign(&data)?;

        data.extend_from_slice(&signature);
        Ok(data)
    }

    /// Validates a token and returns the caller it identifies.
    pub fn validate_token(&self, token: &[u8]) -> ServerResult<Caller> {
        if token.len() <= TIMESTAMP_LEN + SIGNATURE_LEN {
            return Err(ServerError::AuthenticationFailed(
                "Invalid token length".into(),
            ));
        }

        let (data, signature) = token.split_at(token.len() - SIGNATURE_LEN);
        self.verify(data, signature)?;

        let mut timestamp_bytes = [0u8; TIMESTAMP_LEN];
        timestamp_bytes.copy_from_slice(&data[..TIMESTAMP_LEN]);
        let timestamp = u64::from_be_bytes(timestamp_bytes);

        let expiry_millis = self.config.token_expiry.as_millis() as u64;
        if now_millis() > timestamp.saturating_add(expiry_millis) {
            return Err(ServerError::AuthenticationFailed("Token expired".into()));
        }

        from_cbor(&data[TIMESTAMP_LEN..])
            .map_err(|_| ServerError::AuthenticationFailed("Malformed claims".into()))
    }

    fn mac(&self) -> ServerResult<HmacSha256> {
        HmacSha256::new_from_slice(&self.config.secret)
            .map_err(|e| ServerError::Internal(format!("invalid HMAC key: {e}")))
    }

    /// Signs data with HMAC-SHA256.
    fn sign(&self, data: &[u8]) -> ServerResult<[u8; SIGNATURE_LEN]> {
        let mut mac = self.mac()?;
        mac.update(data);
        Ok(mac.finalize().into_bytes().into())
    }

    /// Constant-time signature check.
    fn verify(&self, data: &[u8], signature: &[u8]) -> ServerResult<()> {
        let mut mac = self.mac()?;
        mac.update(data);
        mac.verify_slice(signature)
            .map_err(|_| ServerError::AuthenticationFailed("Invalid signature".into()))
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
