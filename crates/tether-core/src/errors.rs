//! The satellite error family.
//!
//! `SatelliteError` is the single umbrella surfaced to chat-engine clients
//! for this subsystem, distinct from the store/agent/database families the
//! engine already has. Lower layers keep their own error enums; conversions
//! here flatten them to the boundary kinds.

use thiserror::Error;

use tether_crypto::{HandshakeError, RecordError};
use tether_proto::{FrameError, TokenError};
use tether_transport::ChannelError;

use crate::store::StoreError;

#[derive(Debug, Error)]
pub enum SatelliteError {
    #[error("pairing token expired")]
    PairingExpired,

    #[error("pairing token replayed")]
    PairingReplay,

    #[error("handshake rejected: {0}")]
    HandshakeReject(String),

    #[error("peer authentication failed")]
    AuthFail,

    #[error("record replay detected (seq {0})")]
    ReplayDetected(u64),

    #[error("frame of {len} bytes exceeds the {max} byte limit")]
    FrameTooLarge { len: usize, max: usize },

    #[error("malformed payload: {0}")]
    Decode(String),

    #[error("command denied: {0}")]
    DeniedCommand(String),

    #[error("operation timed out")]
    Timeout,

    #[error("session is suspended")]
    SessionSuspended,

    #[error("session is disposed")]
    SessionDisposed,

    #[error("remote device unknown")]
    DeviceUnknown,

    #[error("remote device revoked")]
    DeviceRevoked,

    #[error("channel broken")]
    ChannelBroken,

    #[error("illegal session transition: {0}")]
    InvalidTransition(String),

    #[error("store failure: {0}")]
    Store(#[from] StoreError),
}

impl From<ChannelError> for SatelliteError {
    fn from(e: ChannelError) -> Self {
        match e {
            ChannelError::Framing(f) => {
                let tether_transport::FramingError::TooLarge { len, max } = f;
                SatelliteError::FrameTooLarge { len, max }
            }
            ChannelError::Record(RecordError::Replay { seq }) => SatelliteError::ReplayDetected(seq),
            ChannelError::Record(_) => SatelliteError::AuthFail,
            ChannelError::Handshake(h) => h.into(),
            ChannelError::Frame(f) => f.into(),
            ChannelError::Rejected(reason) => SatelliteError::HandshakeReject(reason),
            ChannelError::Io(_) | ChannelError::Closed => SatelliteError::ChannelBroken,
        }
    }
}

impl From<HandshakeError> for SatelliteError {
    fn from(e: HandshakeError) -> Self {
        match e {
            HandshakeError::AuthFail => SatelliteError::AuthFail,
            other => SatelliteError::HandshakeReject(other.to_string()),
        }
    }
}

impl From<FrameError> for SatelliteError {
    fn from(e: FrameError) -> Self {
        SatelliteError::Decode(e.to_string())
    }
}

impl From<TokenError> for SatelliteError {
    fn from(e: TokenError) -> Self {
        SatelliteError::HandshakeReject(e.to_string())
    }
}
