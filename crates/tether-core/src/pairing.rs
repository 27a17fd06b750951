//! Pairing flows on both roles.
//!
//! The satellite mints an OOB token and waits for the host's decision; the
//! host consumes scanned tokens behind a replay ledger and a small rate
//! limiter. Registry writes and UI events stay with the controller; these
//! types only decide whether an answer is acceptable and track where each
//! side stands.

use std::collections::HashMap;
use std::time::Duration;

use thiserror::Error;
use tracing::warn;

use tether_crypto::IdentityKey;
use tether_proto::{PairingToken, TokenError};

use crate::errors::SatelliteError;

/// How long a minted token stays valid.
pub const PAIRING_TTL: Duration = Duration::from_secs(600);

/// How long consumed nonces are remembered. Longer than the token TTL so a
/// captured token keeps failing as a replay, not merely as expired.
pub const REPLAY_RETENTION: Duration = Duration::from_secs(24 * 3600);

/// Handshake answers tolerated per source within the limiter window.
pub const MAX_ANSWERS_PER_WINDOW: u32 = 5;

#[derive(Debug, Error)]
pub enum PairingError {
    #[error("pairing token expired")]
    Expired,

    #[error("pairing token replayed")]
    Replay,

    #[error("too many pairing attempts, retry in {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    #[error("unusable pairing token: {0}")]
    BadToken(#[from] TokenError),

    #[error("invalid pairing state: {0}")]
    InvalidState(&'static str),
}

impl From<PairingError> for SatelliteError {
    fn from(e: PairingError) -> Self {
        match e {
            PairingError::Expired => SatelliteError::PairingExpired,
            PairingError::Replay => SatelliteError::PairingReplay,
            other => SatelliteError::HandshakeReject(other.to_string()),
        }
    }
}

/// How the two peers find each other for the pairing connection.
///
/// The first mode that works wins; all three stay available as options.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum DiscoveryMode {
    /// Satellite opens a local-network listener and embeds its address in
    /// the token; the host dials it.
    #[default]
    SatelliteListens,
    /// Roles flip: the token carries no address, an announcement line
    /// names the host's listener, and the satellite dials.
    HostListens,
    /// The token's address names a rendezvous endpoint both peers dial
    /// out to.
    Bouncer,
}

impl DiscoveryMode {
    /// Infer the mode a token was minted for. A rendezvous token is
    /// indistinguishable from a satellite listener on the wire, so this
    /// never returns [`DiscoveryMode::Bouncer`]; that mode is chosen
    /// explicitly by configuration.
    pub fn infer(token: &PairingToken) -> DiscoveryMode {
        if token.addr.is_some() {
            DiscoveryMode::SatelliteListens
        } else {
            DiscoveryMode::HostListens
        }
    }
}

/// Prefix of the host announcement line used in [`DiscoveryMode::HostListens`].
pub const ANNOUNCE_SCHEME: &str = "rpa1:";

/// Render the one-line datagram announcing the host's listener address.
pub fn render_announcement(addr: &str) -> String {
    format!("{ANNOUNCE_SCHEME}{addr}")
}

/// Parse a host announcement line back into the address to dial.
pub fn parse_announcement(line: &str) -> Option<&str> {
    let addr = line.strip_prefix(ANNOUNCE_SCHEME)?.trim();
    if addr.is_empty() {
        None
    } else {
        Some(addr)
    }
}

/// Runtime status of a satellite identity, mirroring the pairing wire
/// messages.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IdentityStatus {
    Requested,
    Recorded,
    Confirmed,
    Rejected,
    TookOver,
    Disposed,
}

/// Runtime record of one satellite identity on the host.
#[derive(Clone, Debug)]
pub struct SatelliteIdentity {
    pub sat_identity_id: u64,
    /// The OOB token text the satellite presented.
    pub identity: String,
    pub status: IdentityStatus,
}

/// Remembers consumed token nonces within a sliding window.
pub struct NonceLedger {
    retention: Duration,
    seen: HashMap<Vec<u8>, u64>,
}

impl NonceLedger {
    pub fn new(retention: Duration) -> Self {
        Self { retention, seen: HashMap::new() }
    }

    /// Record a nonce, failing if it was already seen inside the window.
    pub fn check_and_record(&mut self, nonce: &[u8], now_unix: u64) -> Result<(), PairingError> {
        match self.seen.get(nonce) {
            Some(seen_at) if now_unix.saturating_sub(*seen_at) < self.retention.as_secs() => {
                warn!("pairing nonce replayed");
                Err(PairingError::Replay)
            }
            _ => {
                self.seen.insert(nonce.to_vec(), now_unix);
                Ok(())
            }
        }
    }

    /// Drop entries older than the window. Returns how many went.
    pub fn cleanup_expired(&mut self, now_unix: u64) -> usize {
        let retention = self.retention.as_secs();
        let before = self.seen.len();
        self.seen.retain(|_, seen_at| now_unix.saturating_sub(*seen_at) < retention);
        before - self.seen.len()
    }
}

impl Default for NonceLedger {
    fn default() -> Self {
        Self::new(REPLAY_RETENTION)
    }
}

/// Per-source throttle on handshake answers.
pub struct AttemptLimiter {
    max_attempts: u32,
    window: Duration,
    entries: HashMap<String, (u64, u32)>,
}

impl AttemptLimiter {
    pub fn new(max_attempts: u32, window: Duration) -> Self {
        Self { max_attempts, window, entries: HashMap::new() }
    }

    pub fn check(&mut self, source: &str, now_unix: u64) -> Result<(), PairingError> {
        let window = self.window.as_secs();
        let entry = self.entries.entry(source.to_string()).or_insert((now_unix, 0));
        if now_unix.saturating_sub(entry.0) >= window {
            *entry = (now_unix, 0);
        }
        if entry.1 >= self.max_attempts {
            let retry_after_secs = window.saturating_sub(now_unix.saturating_sub(entry.0));
            warn!(source, "pairing attempts throttled");
            return Err(PairingError::RateLimited { retry_after_secs });
        }
        entry.1 += 1;
        Ok(())
    }
}

impl Default for AttemptLimiter {
    fn default() -> Self {
        Self::new(MAX_ANSWERS_PER_WINDOW, PAIRING_TTL)
    }
}

/// A scanned token the host has vetted and recorded.
pub struct AcceptedAnswer {
    pub token: PairingToken,
    pub sat_public_key: [u8; 32],
}

/// Host-side token intake: replay ledger plus attempt throttle.
///
/// Replay is checked ahead of expiry so a captured token always reads as a
/// replay once used, even after its TTL lapses.
#[derive(Default)]
pub struct HostPairing {
    nonces: NonceLedger,
    limiter: AttemptLimiter,
}

impl HostPairing {
    pub fn new(nonces: NonceLedger, limiter: AttemptLimiter) -> Self {
        Self { nonces, limiter }
    }

    pub fn accept_answer(&mut self, answer: &str, now_unix: u64) -> Result<AcceptedAnswer, PairingError> {
        let token = PairingToken::parse(answer)?;
        let sat_public_key = token.sat_public_key()?;
        let nonce = token.nonce_bytes()?;

        self.limiter.check(&token.sat_pub, now_unix)?;
        self.nonces.check_and_record(&nonce, now_unix)?;
        if token.is_expired(now_unix) {
            return Err(PairingError::Expired);
        }
        Ok(AcceptedAnswer { token, sat_public_key })
    }

    pub fn cleanup_expired(&mut self, now_unix: u64) -> usize {
        self.nonces.cleanup_expired(now_unix)
    }
}

/// Where the satellite stands in its own pairing flow.
#[derive(Clone, Debug)]
pub enum SatPairingState {
    Idle,
    /// Token shown to the user, host answer outstanding.
    Advertised { token: PairingToken },
    /// Host recorded the identity, user approval outstanding.
    AwaitingDecision { sat_identity_id: u64 },
    Confirmed { sat_identity_id: u64 },
    Rejected,
}

/// Satellite-side pairing state machine.
pub struct SatellitePairing {
    identity: IdentityKey,
    state: SatPairingState,
}

impl SatellitePairing {
    pub fn new(identity: IdentityKey) -> Self {
        Self { identity, state: SatPairingState::Idle }
    }

    pub fn identity(&self) -> &IdentityKey {
        &self.identity
    }

    pub fn state(&self) -> &SatPairingState {
        &self.state
    }

    /// Mint and remember a fresh token.
    pub fn advertise(
        &mut self,
        host_hint: Option<String>,
        addr: Option<String>,
        now_unix: u64,
    ) -> Result<PairingToken, PairingError> {
        match self.state {
            SatPairingState::Idle | SatPairingState::Rejected => {}
            _ => return Err(PairingError::InvalidState("token already outstanding")),
        }
        let token = PairingToken::mint(
            self.identity.public().as_bytes(),
            host_hint,
            addr,
            PAIRING_TTL.as_secs(),
            now_unix,
        )?;
        self.state = SatPairingState::Advertised { token: token.clone() };
        Ok(token)
    }

    pub fn on_identity_record(&mut self, sat_identity_id: u64) -> Result<(), PairingError> {
        match self.state {
            SatPairingState::Advertised { .. } => {
                self.state = SatPairingState::AwaitingDecision { sat_identity_id };
                Ok(())
            }
            _ => Err(PairingError::InvalidState("no token outstanding")),
        }
    }

    pub fn on_confirmed(&mut self, sat_identity_id: u64) -> Result<(), PairingError> {
        match self.state {
            SatPairingState::AwaitingDecision { sat_identity_id: expected }
                if expected == sat_identity_id =>
            {
                self.state = SatPairingState::Confirmed { sat_identity_id };
                Ok(())
            }
            _ => Err(PairingError::InvalidState("no decision outstanding")),
        }
    }

    pub fn on_rejected(&mut self) {
        self.state = SatPairingState::Rejected;
    }
}
