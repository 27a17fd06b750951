//! Channel frames.
//!
//! Every record on the secure channel is one UTF-8 JSON object tagged by
//! its `k` field. `cmd` and `reply` carry a correlation id; `event` and the
//! control frames do not.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Errors produced while encoding or decoding frames.
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("malformed frame: {0}")]
    Decode(String),

    #[error("frame failed to serialize: {0}")]
    Encode(String),
}

/// A single record on the secure channel.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "k", rename_all = "lowercase")]
pub enum Frame {
    /// Satellite-issued chat command awaiting exactly one reply.
    Cmd { id: u64, cmd: Value },
    /// Host reply to a `cmd`, echoing its correlation id.
    Reply { id: u64, resp: Value },
    /// Spontaneous chat-engine response with no correlation id.
    Event { resp: Value },
    /// Keepalive probe.
    Ping,
    /// Keepalive answer.
    Pong,
    /// Orderly channel shutdown.
    Bye { reason: String },
}

impl Frame {
    /// Correlation id, present only on `cmd` and `reply` frames.
    pub fn corr_id(&self) -> Option<u64> {
        match self {
            Frame::Cmd { id, .. } | Frame::Reply { id, .. } => Some(*id),
            _ => None,
        }
    }

    /// Short tag for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Frame::Cmd { .. } => "cmd",
            Frame::Reply { .. } => "reply",
            Frame::Event { .. } => "event",
            Frame::Ping => "ping",
            Frame::Pong => "pong",
            Frame::Bye { .. } => "bye",
        }
    }

    /// True for `ping`/`pong`/`bye`.
    pub fn is_control(&self) -> bool {
        matches!(self, Frame::Ping | Frame::Pong | Frame::Bye { .. })
    }

    /// Serialize to the UTF-8 JSON record carried inside a sealed record.
    pub fn to_bytes(&self) -> Result<Vec<u8>, FrameError> {
        serde_json::to_vec(self).map_err(|e| FrameError::Encode(e.to_string()))
    }

    /// Parse a decrypted record payload.
    pub fn from_bytes(bytes: &[u8]) -> Result<Frame, FrameError> {
        serde_json::from_slice(bytes).map_err(|e| FrameError::Decode(e.to_string()))
    }
}
