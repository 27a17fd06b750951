//! Chat command and response surface.
//!
//! The chat engine speaks JSON objects tagged by a `type` field. This
//! subsystem never interprets command bodies; it classifies on the tag and
//! passes the value through opaque. Pairing control messages and the
//! controller-surfaced satellite events are concrete enums because this
//! subsystem owns their schema.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// A chat-engine command, opaque except for its `type` tag.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChatCommand(pub Value);

impl ChatCommand {
    /// Build a command carrying only its tag. Bodies are the engine's
    /// concern; tests and pairing control paths only need the tag.
    pub fn tagged(tag: &str) -> Self {
        ChatCommand(json!({ "type": tag }))
    }

    /// The `type` tag the router classifies on, if present.
    pub fn tag(&self) -> Option<&str> {
        self.0.get("type")?.as_str()
    }
}

/// A chat-engine response or event, opaque except for its `type` tag.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChatResponse(pub Value);

impl ChatResponse {
    pub fn tagged(tag: &str) -> Self {
        ChatResponse(json!({ "type": tag }))
    }

    pub fn tag(&self) -> Option<&str> {
        self.0.get("type")?.as_str()
    }

    /// Error reply sent for a command the allowlist refuses to forward.
    pub fn command_denied(tag: &str, category: &str) -> Self {
        ChatResponse(json!({
            "type": "chatCmdError",
            "error": { "type": "deniedCommand", "command": tag, "category": category },
        }))
    }

    /// Error reply for a command that arrived while the session could not
    /// accept it.
    pub fn session_unavailable(reason: &str) -> Self {
        ChatResponse(json!({
            "type": "chatCmdError",
            "error": { "type": "sessionUnavailable", "reason": reason },
        }))
    }

    pub fn is_error(&self) -> bool {
        self.tag() == Some("chatCmdError")
    }
}

/// Pairing and lifecycle control messages exchanged on the channel itself.
///
/// Satellite-originated variants travel as `cmd` payloads, host-originated
/// ones as `event` payloads, so the frame grammar stays closed.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum PairingMsg {
    /// Satellite asks the host to record its identity (OOB material inside).
    SatRequestIdentity { identity: String },
    /// Host recorded the identity and awaits user approval.
    SatIdentityRecord { sat_identity_id: u64, identity: String },
    /// Host user approved the pairing.
    SatIdentityConfirm { sat_identity_id: u64 },
    /// Host user rejected the pairing.
    SatIdentityReject { sat_identity_id: u64 },
    /// Host UI takes the foreground; satellite must stop issuing commands.
    SatTakeover,
    /// Host hands the foreground back; satellite may flush queued commands.
    SatResume,
    /// Satellite walks away from the binding.
    SatTerminateIdentity { sat_identity_id: u64 },
    /// Host revokes the binding.
    SatIdentityDeregister { sat_identity_id: u64 },
}

impl PairingMsg {
    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).expect("pairing message serializes")
    }

    /// Try to interpret a frame payload as a pairing control message.
    pub fn from_value(value: &Value) -> Option<Self> {
        serde_json::from_value(value.clone()).ok()
    }
}

/// Responses this subsystem emits on the chat output queue for the local UI.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum SatelliteEvent {
    SatRequestIdentity { identity: String },
    SatIdentityRecord { sat_identity_id: u64, identity: String },
    SatIdentityConfirmed { sat_identity_id: u64 },
    SatIdentityRejected { sat_identity_id: u64 },
    SatTookOver { sat_identity_id: u64 },
    SatIdentityDisposed { sat_identity_id: u64 },
}

impl SatelliteEvent {
    /// Convert into the opaque response shape the chat output queue carries.
    pub fn into_response(self) -> ChatResponse {
        ChatResponse(serde_json::to_value(self).expect("satellite event serializes"))
    }
}
