//! Cryptography for tether remote profile sessions.
//!
//! Three layers, used strictly in order:
//! - [`keys`]: long-lived Ed25519 identity keys, one pair per device
//!   binding, persisted opaque in the device registry.
//! - [`handshake`]: signed-ephemeral X25519 agreement producing one AEAD
//!   key per direction plus a short verification code.
//! - [`record`]: ChaCha20-Poly1305 record layer with strictly monotonic
//!   64-bit nonce counters; counter regression is treated as replay.

#![forbid(unsafe_code)]

pub mod handshake;
pub mod keys;
pub mod record;

pub use handshake::{HandshakeError, SessionSecrets};
pub use keys::{IdentityKey, KeyError, PublicIdentity};
pub use record::{RecordChannel, RecordError};
