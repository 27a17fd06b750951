//! Out-of-band pairing token.
//!
//! A token is a single URL-safe line, `rp1:<base64url(payload)>`, where the
//! payload is a versioned JSON structure. It is shown by the Satellite
//! (typically as a QR code), consumed once by the Host, and expires after a
//! fixed TTL. Replay tracking lives with the Host pairing state, not here.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Scheme prefix of the rendered token line.
pub const TOKEN_SCHEME: &str = "rp1:";

/// Current payload version.
pub const TOKEN_VERSION: u32 = 1;

/// Length of the anti-replay nonce in bytes.
pub const NONCE_LEN: usize = 16;

/// Errors produced while parsing or inspecting a token.
#[derive(Debug, Error)]
pub enum TokenError {
    #[error("token does not start with `{TOKEN_SCHEME}`")]
    BadScheme,

    #[error("token payload is not valid base64url")]
    BadEncoding,

    #[error("token payload is not valid JSON: {0}")]
    BadPayload(String),

    #[error("unsupported token version {0}")]
    UnsupportedVersion(u32),

    #[error("token carries invalid key material")]
    BadKey,
}

/// Decoded OOB pairing token payload.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PairingToken {
    /// Payload version, always [`TOKEN_VERSION`] for tokens we mint.
    pub v: u32,
    /// Satellite's long-lived public identity key, base64url.
    pub sat_pub: String,
    /// Free-form hint naming the host the satellite expects to pair with.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host_hint: Option<String>,
    /// Network endpoint to dial, `host:port`. Absent when the connection
    /// roles flip and the satellite dials the host instead.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub addr: Option<String>,
    /// Single-use anti-replay nonce, base64url.
    pub nonce: String,
    /// Unix timestamp after which the host must reject the token.
    pub expires_at: u64,
}

impl PairingToken {
    /// Mint a fresh token for the given satellite identity key.
    pub fn mint(
        sat_pub: &[u8; 32],
        host_hint: Option<String>,
        addr: Option<String>,
        ttl_secs: u64,
        now_unix: u64,
    ) -> Result<Self, TokenError> {
        let mut nonce = [0u8; NONCE_LEN];
        getrandom::getrandom(&mut nonce).map_err(|_| TokenError::BadKey)?;
        Ok(Self {
            v: TOKEN_VERSION,
            sat_pub: URL_SAFE_NO_PAD.encode(sat_pub),
            host_hint,
            addr,
            nonce: URL_SAFE_NO_PAD.encode(nonce),
            expires_at: now_unix + ttl_secs,
        })
    }

    /// Render the single-line text form.
    pub fn render(&self) -> String {
        let payload = serde_json::to_vec(self).expect("token payload serializes");
        format!("{}{}", TOKEN_SCHEME, URL_SAFE_NO_PAD.encode(payload))
    }

    /// Parse the text form back into a token, checking scheme and version.
    pub fn parse(text: &str) -> Result<Self, TokenError> {
        let encoded = text.strip_prefix(TOKEN_SCHEME).ok_or(TokenError::BadScheme)?;
        let payload = URL_SAFE_NO_PAD
            .decode(encoded.trim())
            .map_err(|_| TokenError::BadEncoding)?;
        let token: PairingToken =
            serde_json::from_slice(&payload).map_err(|e| TokenError::BadPayload(e.to_string()))?;
        if token.v != TOKEN_VERSION {
            return Err(TokenError::UnsupportedVersion(token.v));
        }
        Ok(token)
    }

    /// Satellite identity key bytes.
    pub fn sat_public_key(&self) -> Result<[u8; 32], TokenError> {
        let bytes = URL_SAFE_NO_PAD
            .decode(&self.sat_pub)
            .map_err(|_| TokenError::BadKey)?;
        bytes.as_slice().try_into().map_err(|_| TokenError::BadKey)
    }

    /// Raw nonce bytes, used as the replay ledger key.
    pub fn nonce_bytes(&self) -> Result<Vec<u8>, TokenError> {
        URL_SAFE_NO_PAD.decode(&self.nonce).map_err(|_| TokenError::BadKey)
    }

    pub fn is_expired(&self, now_unix: u64) -> bool {
        now_unix >= self.expires_at
    }
}
