//! Secure duplex transport for tether remote sessions.
//!
//! Stacks three small pieces: a length-prefixed frame codec, the
//! handshake/record layer from `tether-crypto`, and keepalive/reconnect
//! bookkeeping. The channel is generic over any async byte stream so the
//! same code runs over TCP in production and `tokio::io::duplex` in tests.

#![forbid(unsafe_code)]

pub mod channel;
pub mod framing;
pub mod reconnect;
pub mod tcp;

pub use channel::{ChannelConfig, ChannelError, ChannelStats, Incoming, Keepalive, SecureChannel};
pub use framing::{FrameCodec, FramingError, DEFAULT_MAX_FRAME, MIN_MAX_FRAME};
pub use reconnect::{ReconnectPolicy, ReconnectSchedule};
pub use tcp::{dial, ChannelListener};
