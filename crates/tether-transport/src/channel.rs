//! Authenticated encrypted channel over an async byte stream.
//!
//! Construction runs the signed-ephemeral handshake in the clear (the
//! messages are self-authenticating); everything after travels through the
//! record layer. The acceptor side is staged so the host can inspect the
//! claimed identity and OOB nonce before committing to the handshake.

use std::time::{Duration, Instant};

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, trace};

use tether_crypto::handshake::{self, Accept, Hello};
use tether_crypto::{HandshakeError, IdentityKey, PublicIdentity, RecordChannel, RecordError};
use tether_proto::{Frame, FrameError};

use crate::framing::{FrameCodec, FramingError, DEFAULT_MAX_FRAME};

/// Tuning knobs for a channel. Defaults match the protocol constants.
#[derive(Clone, Debug)]
pub struct ChannelConfig {
    /// Record cap handed to the frame codec.
    pub max_frame: usize,
    /// Idle interval after which a `ping` goes out.
    pub ping_interval: Duration,
    /// Consecutive silent intervals before the channel counts as broken.
    pub missed_intervals: u32,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            max_frame: DEFAULT_MAX_FRAME,
            ping_interval: Duration::from_secs(20),
            missed_intervals: 3,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Framing(#[from] FramingError),

    #[error(transparent)]
    Record(#[from] RecordError),

    #[error(transparent)]
    Handshake(#[from] HandshakeError),

    #[error(transparent)]
    Frame(#[from] FrameError),

    #[error("peer closed the connection")]
    Closed,

    #[error("handshake rejected: {0}")]
    Rejected(String),
}

impl ChannelError {
    /// Fatal errors poison the record state; the channel must be torn down
    /// and re-authenticated from long-lived keys. `Io`/`Closed` are the
    /// ordinary broken-connection cases the reconnect loop absorbs.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ChannelError::Framing(_)
                | ChannelError::Record(_)
                | ChannelError::Handshake(_)
                | ChannelError::Frame(_)
                | ChannelError::Rejected(_)
        )
    }
}

/// Byte and frame counters for one channel.
#[derive(Clone, Copy, Debug, Default)]
pub struct ChannelStats {
    pub frames_sent: u64,
    pub frames_received: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
}

/// Keepalive bookkeeping, driven by the session task's timer.
#[derive(Clone, Copy, Debug)]
pub struct Keepalive {
    interval: Duration,
    missed_limit: u32,
    last_rx: Instant,
    last_tx: Instant,
}

impl Keepalive {
    pub fn new(interval: Duration, missed_limit: u32, now: Instant) -> Self {
        Self { interval, missed_limit, last_rx: now, last_tx: now }
    }

    pub fn on_rx(&mut self, now: Instant) {
        self.last_rx = now;
    }

    pub fn on_tx(&mut self, now: Instant) {
        self.last_tx = now;
    }

    /// A `ping` is due after a full idle interval without any send.
    pub fn ping_due(&self, now: Instant) -> bool {
        now.duration_since(self.last_tx) >= self.interval
    }

    /// The peer is gone after `missed_limit` silent intervals.
    pub fn broken(&self, now: Instant) -> bool {
        now.duration_since(self.last_rx) >= self.interval * self.missed_limit
    }
}

async fn write_framed<S: AsyncWrite + Unpin>(
    io: &mut S,
    codec: &FrameCodec,
    record: &[u8],
) -> Result<(), ChannelError> {
    let framed = codec.encode(record)?;
    io.write_all(&framed).await?;
    io.flush().await?;
    Ok(())
}

async fn read_framed<S: AsyncRead + Unpin>(
    io: &mut S,
    codec: &FrameCodec,
    buf: &mut BytesMut,
) -> Result<Vec<u8>, ChannelError> {
    loop {
        if let Some(record) = codec.decode(buf)? {
            return Ok(record);
        }
        if io.read_buf(buf).await? == 0 {
            return Err(ChannelError::Closed);
        }
    }
}

/// An established secure channel carrying [`Frame`]s.
#[derive(Debug)]
pub struct SecureChannel<S> {
    io: S,
    codec: FrameCodec,
    record: RecordChannel,
    buf: BytesMut,
    peer: PublicIdentity,
    verify_code: String,
    stats: ChannelStats,
}

impl<S: AsyncRead + AsyncWrite + Unpin> SecureChannel<S> {
    /// Connect as the initiating peer.
    ///
    /// `pairing_nonce` is the OOB token nonce on the first handshake and
    /// `None` on reconnect; `expected_peer` pins the acceptor's identity
    /// whenever the registry already knows it.
    pub async fn connect(
        mut io: S,
        identity: &IdentityKey,
        pairing_nonce: Option<&[u8]>,
        expected_peer: Option<&PublicIdentity>,
        config: &ChannelConfig,
    ) -> Result<Self, ChannelError> {
        let codec = FrameCodec::new(config.max_frame);
        let init = handshake::initiate(identity, pairing_nonce);
        let hello_bytes =
            serde_json::to_vec(&init.hello).map_err(|e| FrameError::Encode(e.to_string()))?;
        write_framed(&mut io, &codec, &hello_bytes).await?;

        let mut buf = BytesMut::new();
        let accept_bytes = read_framed(&mut io, &codec, &mut buf).await?;
        let accept: Accept = serde_json::from_slice(&accept_bytes)
            .map_err(|_| ChannelError::Handshake(HandshakeError::BadEncoding))?;
        let secrets = handshake::complete(init, &accept, expected_peer)?;

        debug!(peer = %secrets.peer.fingerprint(), "channel established (initiator)");
        Ok(Self {
            io,
            codec,
            record: RecordChannel::new(&secrets),
            buf,
            peer: secrets.peer,
            verify_code: secrets.verify_code,
            stats: ChannelStats::default(),
        })
    }

    /// Read the peer's hello without committing to the handshake.
    pub async fn read_hello(mut io: S, config: &ChannelConfig) -> Result<Incoming<S>, ChannelError> {
        let codec = FrameCodec::new(config.max_frame);
        let mut buf = BytesMut::new();
        let hello_bytes = read_framed(&mut io, &codec, &mut buf).await?;
        let hello: Hello = serde_json::from_slice(&hello_bytes)
            .map_err(|_| ChannelError::Handshake(HandshakeError::BadEncoding))?;
        Ok(Incoming { io, codec, buf, hello })
    }

    /// Send one frame through the record layer.
    pub async fn send(&mut self, frame: &Frame) -> Result<(), ChannelError> {
        let payload = frame.to_bytes()?;
        let record = self.record.seal(&payload)?;
        if record.len() > self.codec.max_frame() {
            return Err(ChannelError::Framing(FramingError::TooLarge {
                len: record.len(),
                max: self.codec.max_frame(),
            }));
        }
        write_framed(&mut self.io, &self.codec, &record).await?;
        self.stats.frames_sent += 1;
        self.stats.bytes_sent += record.len() as u64;
        trace!(kind = frame.kind(), "frame sent");
        Ok(())
    }

    /// Receive the next frame, blocking until one arrives.
    pub async fn recv(&mut self) -> Result<Frame, ChannelError> {
        let record = read_framed(&mut self.io, &self.codec, &mut self.buf).await?;
        let payload = self.record.open(&record)?;
        let frame = Frame::from_bytes(&payload)?;
        self.stats.frames_received += 1;
        self.stats.bytes_received += record.len() as u64;
        trace!(kind = frame.kind(), "frame received");
        Ok(frame)
    }

    /// Announce shutdown and close the stream. Best effort on both counts.
    pub async fn close(&mut self, reason: &str) {
        let _ = self.send(&Frame::Bye { reason: reason.to_string() }).await;
        let _ = self.io.shutdown().await;
    }

    pub fn peer(&self) -> &PublicIdentity {
        &self.peer
    }

    /// Code for out-of-band comparison between the two users.
    pub fn verify_code(&self) -> &str {
        &self.verify_code
    }

    pub fn stats(&self) -> ChannelStats {
        self.stats
    }
}

/// A hello that has been read but not yet answered.
///
/// The host checks the claimed identity against the registry and the nonce
/// against the replay ledger before calling [`Incoming::accept`].
pub struct Incoming<S> {
    io: S,
    codec: FrameCodec,
    buf: BytesMut,
    hello: Hello,
}

impl<S: AsyncRead + AsyncWrite + Unpin> Incoming<S> {
    /// The initiator's claimed long-lived identity.
    pub fn claimed_peer(&self) -> Result<PublicIdentity, ChannelError> {
        use base64::Engine as _;
        let bytes = base64::engine::general_purpose::URL_SAFE_NO_PAD
            .decode(&self.hello.identity)
            .map_err(|_| ChannelError::Handshake(HandshakeError::BadEncoding))?;
        PublicIdentity::from_bytes(&bytes)
            .map_err(|_| ChannelError::Handshake(HandshakeError::BadEncoding))
    }

    /// OOB token nonce, present only on first-pairing handshakes.
    pub fn pairing_nonce(&self) -> Result<Option<Vec<u8>>, ChannelError> {
        use base64::Engine as _;
        match &self.hello.nonce {
            None => Ok(None),
            Some(n) => base64::engine::general_purpose::URL_SAFE_NO_PAD
                .decode(n)
                .map(Some)
                .map_err(|_| ChannelError::Handshake(HandshakeError::BadEncoding)),
        }
    }

    /// Complete the handshake and promote to a [`SecureChannel`].
    pub async fn accept(
        mut self,
        identity: &IdentityKey,
        expected_peer: Option<&PublicIdentity>,
    ) -> Result<SecureChannel<S>, ChannelError> {
        let (accept, secrets) = handshake::accept(identity, &self.hello, expected_peer)?;
        let accept_bytes =
            serde_json::to_vec(&accept).map_err(|e| FrameError::Encode(e.to_string()))?;
        write_framed(&mut self.io, &self.codec, &accept_bytes).await?;

        debug!(peer = %secrets.peer.fingerprint(), "channel established (acceptor)");
        Ok(SecureChannel {
            io: self.io,
            codec: self.codec,
            record: RecordChannel::new(&secrets),
            buf: self.buf,
            peer: secrets.peer,
            verify_code: secrets.verify_code,
            stats: ChannelStats::default(),
        })
    }

    /// Drop the connection without answering.
    pub async fn reject(mut self) {
        let _ = self.io.shutdown().await;
    }
}
