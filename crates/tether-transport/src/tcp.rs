//! TCP entry points.
//!
//! The channel itself is stream-agnostic; these helpers bind it to plain
//! TCP, the outer transport this client ships with. Identity pinning
//! happens inside the handshake, so no TLS machinery sits in front.

use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};

use tether_crypto::{IdentityKey, PublicIdentity};

use crate::channel::{ChannelConfig, ChannelError, Incoming, SecureChannel};

/// Dial a peer and complete the handshake as initiator.
pub async fn dial<A: ToSocketAddrs>(
    addr: A,
    identity: &IdentityKey,
    pairing_nonce: Option<&[u8]>,
    expected_peer: Option<&PublicIdentity>,
    config: &ChannelConfig,
) -> Result<SecureChannel<TcpStream>, ChannelError> {
    let stream = TcpStream::connect(addr).await?;
    stream.set_nodelay(true)?;
    SecureChannel::connect(stream, identity, pairing_nonce, expected_peer, config).await
}

/// Listening side of a pairing or reconnect endpoint.
pub struct ChannelListener {
    listener: TcpListener,
    config: ChannelConfig,
}

impl ChannelListener {
    pub async fn bind<A: ToSocketAddrs>(
        addr: A,
        config: ChannelConfig,
    ) -> Result<Self, ChannelError> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self { listener, config })
    }

    /// The bound address, for embedding into a token or announcement line.
    pub fn local_addr(&self) -> Result<std::net::SocketAddr, ChannelError> {
        Ok(self.listener.local_addr()?)
    }

    /// Wait for a connection and read its hello. The caller inspects the
    /// claimed identity and nonce before accepting.
    pub async fn next(&self) -> Result<Incoming<TcpStream>, ChannelError> {
        let (stream, _) = self.listener.accept().await?;
        stream.set_nodelay(true)?;
        SecureChannel::read_hello(stream, &self.config).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tether_proto::Frame;

    #[tokio::test]
    async fn loopback_dial_and_accept() {
        let config = ChannelConfig::default();
        let listener = ChannelListener::bind("127.0.0.1:0", config.clone()).await.unwrap();
        let addr = listener.local_addr().unwrap();

        let sat_key = IdentityKey::generate();
        let host_key = IdentityKey::generate();

        let dial_config = config.clone();
        let dialer = tokio::spawn(async move {
            dial(addr, &sat_key, None, None, &dial_config).await
        });

        let incoming = listener.next().await.unwrap();
        let mut host_chan = incoming.accept(&host_key, None).await.unwrap();
        let mut sat_chan = dialer.await.unwrap().unwrap();

        sat_chan.send(&Frame::Ping).await.unwrap();
        assert_eq!(host_chan.recv().await.unwrap(), Frame::Ping);
    }
}
