//! Remote profile sessions for the tether chat client.
//!
//! The host (primary device) stays the single writer of the chat store
//! while a satellite (secondary UI) drives it over a secure duplex channel.
//! This crate holds everything above the transport:
//!
//! - [`store`] / [`registry`]: persistent bindings between remote devices
//!   and local users, with per-binding host key pairs.
//! - [`pairing`]: out-of-band token consumption, replay ledger and the
//!   identity approval flow on both roles.
//! - [`session`]: the Idle/Pairing/Active/Suspended/Disposed phase machine
//!   and the drop-oldest event buffer that rides out short outages.
//! - [`router`]: command classification, engine forwarding and response
//!   mirroring on the host side.
//! - [`satellite`]: reply correlation and the bounded command queue on the
//!   satellite side.
//! - [`controller`]: the process-wide coordinator owning the single
//!   satellite slot, plus [`link`] tasks that wire a live channel to it.

#![forbid(unsafe_code)]

pub mod controller;
pub mod engine;
pub mod errors;
pub mod link;
pub mod pairing;
pub mod registry;
pub mod router;
pub mod satellite;
pub mod session;
pub mod store;

#[cfg(feature = "sqlite")]
pub mod sqlite;

pub use controller::{ControllerConfig, SatelliteController};
pub use errors::SatelliteError;
pub use registry::DeviceRegistry;
pub use session::SessionPhase;
