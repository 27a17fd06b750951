//! Wire-level types for tether remote profile sessions.
//!
//! This crate defines everything that crosses a process boundary:
//! - the `k`-tagged JSON frames exchanged on the secure channel,
//! - the single-line out-of-band pairing token,
//! - the chat command/response surface and the controller-facing
//!   satellite events mirrored onto the chat output queue.

#![forbid(unsafe_code)]

pub mod commands;
pub mod frame;
pub mod token;

pub use commands::{ChatCommand, ChatResponse, PairingMsg, SatelliteEvent};
pub use frame::{Frame, FrameError};
pub use token::{PairingToken, TokenError};
