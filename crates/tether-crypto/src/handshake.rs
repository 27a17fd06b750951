//! Signed-ephemeral handshake.
//!
//! Both peers exchange a fresh X25519 ephemeral key signed with their
//! long-lived identity key over a labelled transcript. The Diffie-Hellman
//! result seeds HKDF-SHA256, which expands one record key per direction
//! plus a short verification code both users can compare out of band.
//!
//! On first pairing the hello additionally binds the OOB token nonce into
//! the signed transcript, so a handshake cannot be grafted onto a replayed
//! token. On reconnect the long-lived keys alone authenticate and a fresh
//! DH yields a new session root.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use hkdf::Hkdf;
use rand_core::OsRng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use x25519_dalek::{EphemeralSecret, PublicKey as X25519Public};

use crate::keys::{IdentityKey, PublicIdentity};

/// Handshake message version.
pub const HANDSHAKE_VERSION: u32 = 1;

const HELLO_CONTEXT: &[u8] = b"tether hello v1";
const ACCEPT_CONTEXT: &[u8] = b"tether accept v1";
const SESSION_CONTEXT: &[u8] = b"tether session v1";

#[derive(Debug, thiserror::Error)]
pub enum HandshakeError {
    #[error("unsupported handshake version {0}")]
    UnsupportedVersion(u32),

    #[error("handshake message carries malformed key material")]
    BadEncoding,

    #[error("peer signature verification failed")]
    AuthFail,

    #[error("peer identity does not match the registered binding")]
    PeerMismatch,
}

/// First handshake message, initiator to acceptor.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Hello {
    pub v: u32,
    /// Initiator's long-lived public identity, base64url.
    pub identity: String,
    /// Fresh X25519 ephemeral public key, base64url.
    pub eph: String,
    /// OOB token nonce on the first pairing handshake, absent on reconnect.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nonce: Option<String>,
    /// Signature over the hello transcript, base64url.
    pub sig: String,
}

/// Second handshake message, acceptor to initiator.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Accept {
    pub v: u32,
    pub identity: String,
    pub eph: String,
    /// Signature over the accept transcript (which includes the hello
    /// ephemeral, binding the two halves together).
    pub sig: String,
}

/// Keys and metadata of an established channel.
pub struct SessionSecrets {
    /// AEAD key for records we send.
    pub send_key: [u8; 32],
    /// AEAD key for records we receive.
    pub recv_key: [u8; 32],
    /// Six-digit code both users can compare; advisory, never enforced.
    pub verify_code: String,
    /// The peer's authenticated long-lived identity.
    pub peer: PublicIdentity,
}

/// Initiator state held between sending the hello and reading the accept.
pub struct Initiation {
    eph: EphemeralSecret,
    eph_pub: X25519Public,
    identity_pub: PublicIdentity,
    pub hello: Hello,
}

fn transcript(context: &[u8], parts: &[&[u8]]) -> [u8; 32] {
    let mut h = Sha256::new();
    h.update((context.len() as u64).to_be_bytes());
    h.update(context);
    for part in parts {
        h.update((part.len() as u64).to_be_bytes());
        h.update(part);
    }
    h.finalize().into()
}

fn decode32(field: &str) -> Result<[u8; 32], HandshakeError> {
    let bytes = URL_SAFE_NO_PAD.decode(field).map_err(|_| HandshakeError::BadEncoding)?;
    bytes.as_slice().try_into().map_err(|_| HandshakeError::BadEncoding)
}

fn decode_sig(field: &str) -> Result<Vec<u8>, HandshakeError> {
    URL_SAFE_NO_PAD.decode(field).map_err(|_| HandshakeError::BadEncoding)
}

/// Begin a handshake as the connecting peer.
///
/// `pairing_nonce` is the OOB token nonce on a first pairing and `None` on
/// reconnect.
pub fn initiate(identity: &IdentityKey, pairing_nonce: Option<&[u8]>) -> Initiation {
    let eph = EphemeralSecret::random_from_rng(OsRng);
    let eph_pub = X25519Public::from(&eph);
    let identity_pub = identity.public();

    let digest = transcript(
        HELLO_CONTEXT,
        &[
            identity_pub.as_bytes(),
            eph_pub.as_bytes(),
            pairing_nonce.unwrap_or(&[]),
        ],
    );
    let hello = Hello {
        v: HANDSHAKE_VERSION,
        identity: URL_SAFE_NO_PAD.encode(identity_pub.as_bytes()),
        eph: URL_SAFE_NO_PAD.encode(eph_pub.as_bytes()),
        nonce: pairing_nonce.map(|n| URL_SAFE_NO_PAD.encode(n)),
        sig: URL_SAFE_NO_PAD.encode(identity.sign(&digest)),
    };

    Initiation { eph, eph_pub, identity_pub, hello }
}

/// Answer a hello as the listening peer.
///
/// `expected_peer` pins the initiator to a registered identity; `None` is
/// only legal during first pairing, where the OOB token vouches instead.
pub fn accept(
    identity: &IdentityKey,
    hello: &Hello,
    expected_peer: Option<&PublicIdentity>,
) -> Result<(Accept, SessionSecrets), HandshakeError> {
    if hello.v != HANDSHAKE_VERSION {
        return Err(HandshakeError::UnsupportedVersion(hello.v));
    }
    let peer = PublicIdentity(decode32(&hello.identity)?);
    if let Some(expected) = expected_peer {
        if peer != *expected {
            return Err(HandshakeError::PeerMismatch);
        }
    }

    let peer_eph = X25519Public::from(decode32(&hello.eph)?);
    let nonce_bytes = match &hello.nonce {
        Some(n) => URL_SAFE_NO_PAD.decode(n).map_err(|_| HandshakeError::BadEncoding)?,
        None => Vec::new(),
    };
    let digest = transcript(
        HELLO_CONTEXT,
        &[peer.as_bytes(), peer_eph.as_bytes(), &nonce_bytes],
    );
    peer.verify(&digest, &decode_sig(&hello.sig)?)
        .map_err(|_| HandshakeError::AuthFail)?;

    let eph = EphemeralSecret::random_from_rng(OsRng);
    let eph_pub = X25519Public::from(&eph);
    let our_pub = identity.public();

    let accept_digest = transcript(
        ACCEPT_CONTEXT,
        &[our_pub.as_bytes(), eph_pub.as_bytes(), peer_eph.as_bytes()],
    );
    let accept = Accept {
        v: HANDSHAKE_VERSION,
        identity: URL_SAFE_NO_PAD.encode(our_pub.as_bytes()),
        eph: URL_SAFE_NO_PAD.encode(eph_pub.as_bytes()),
        sig: URL_SAFE_NO_PAD.encode(identity.sign(&accept_digest)),
    };

    let shared = eph.diffie_hellman(&peer_eph);
    let secrets = derive_secrets(
        shared.as_bytes(),
        &peer,
        &peer_eph,
        &our_pub,
        &eph_pub,
        peer,
        false,
    );
    Ok((accept, secrets))
}

/// Complete the handshake as the initiator after reading the accept.
pub fn complete(
    init: Initiation,
    accept: &Accept,
    expected_peer: Option<&PublicIdentity>,
) -> Result<SessionSecrets, HandshakeError> {
    if accept.v != HANDSHAKE_VERSION {
        return Err(HandshakeError::UnsupportedVersion(accept.v));
    }
    let peer = PublicIdentity(decode32(&accept.identity)?);
    if let Some(expected) = expected_peer {
        if peer != *expected {
            return Err(HandshakeError::PeerMismatch);
        }
    }

    let peer_eph = X25519Public::from(decode32(&accept.eph)?);
    let digest = transcript(
        ACCEPT_CONTEXT,
        &[peer.as_bytes(), peer_eph.as_bytes(), init.eph_pub.as_bytes()],
    );
    peer.verify(&digest, &decode_sig(&accept.sig)?)
        .map_err(|_| HandshakeError::AuthFail)?;

    let shared = init.eph.diffie_hellman(&peer_eph);
    Ok(derive_secrets(
        shared.as_bytes(),
        &init.identity_pub,
        &init.eph_pub,
        &peer,
        &peer_eph,
        peer,
        true,
    ))
}

/// Expand the DH result into direction-separated keys.
///
/// The salt transcript is ordered initiator-first on both sides so the two
/// peers derive identical material and then pick opposite directions.
fn derive_secrets(
    shared: &[u8; 32],
    initiator_id: &PublicIdentity,
    initiator_eph: &X25519Public,
    acceptor_id: &PublicIdentity,
    acceptor_eph: &X25519Public,
    peer: PublicIdentity,
    we_initiated: bool,
) -> SessionSecrets {
    let salt = transcript(
        SESSION_CONTEXT,
        &[
            initiator_id.as_bytes(),
            initiator_eph.as_bytes(),
            acceptor_id.as_bytes(),
            acceptor_eph.as_bytes(),
        ],
    );
    let hk = Hkdf::<Sha256>::new(Some(&salt), shared);

    let mut i2a = [0u8; 32];
    let mut a2i = [0u8; 32];
    let mut code = [0u8; 4];
    hk.expand(b"initiator-to-acceptor", &mut i2a)
        .expect("32-byte HKDF output");
    hk.expand(b"acceptor-to-initiator", &mut a2i)
        .expect("32-byte HKDF output");
    hk.expand(b"verification-code", &mut code)
        .expect("4-byte HKDF output");
    let verify_code = format!("{:06}", u32::from_be_bytes(code) % 1_000_000);

    let (send_key, recv_key) = if we_initiated { (i2a, a2i) } else { (a2i, i2a) };
    SessionSecrets { send_key, recv_key, verify_code, peer }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(nonce: Option<&[u8]>) -> (SessionSecrets, SessionSecrets) {
        let sat = IdentityKey::generate();
        let host = IdentityKey::generate();

        let init = initiate(&host, nonce);
        let (accept_msg, sat_secrets) = accept(&sat, &init.hello, None).unwrap();
        let host_secrets = complete(init, &accept_msg, Some(&sat.public())).unwrap();
        (host_secrets, sat_secrets)
    }

    #[test]
    fn peers_derive_mirrored_keys() {
        let (a, b) = run(Some(b"nonce-1".as_slice()));
        assert_eq!(a.send_key, b.recv_key);
        assert_eq!(a.recv_key, b.send_key);
        assert_ne!(a.send_key, a.recv_key);
    }

    #[test]
    fn verification_codes_match_and_are_six_digits() {
        let (a, b) = run(None);
        assert_eq!(a.verify_code, b.verify_code);
        assert_eq!(a.verify_code.len(), 6);
        assert!(a.verify_code.chars().all(|c| c.is_ascii_digit()));
    }

    #[test]
    fn sessions_do_not_share_keys() {
        let (a, _) = run(None);
        let (c, _) = run(None);
        assert_ne!(a.send_key, c.send_key);
    }

    #[test]
    fn tampered_hello_signature_fails() {
        let host = IdentityKey::generate();
        let sat = IdentityKey::generate();
        let mut init = initiate(&host, None);
        init.hello.sig = URL_SAFE_NO_PAD.encode([0u8; 64]);
        assert!(matches!(
            accept(&sat, &init.hello, None),
            Err(HandshakeError::AuthFail)
        ));
    }

    #[test]
    fn stripping_the_nonce_breaks_the_signature() {
        let host = IdentityKey::generate();
        let sat = IdentityKey::generate();
        let mut init = initiate(&host, Some(b"token-nonce".as_slice()));
        init.hello.nonce = None;
        assert!(matches!(
            accept(&sat, &init.hello, None),
            Err(HandshakeError::AuthFail)
        ));
    }

    #[test]
    fn unexpected_peer_is_rejected_before_signature_check() {
        let host = IdentityKey::generate();
        let sat = IdentityKey::generate();
        let stranger = IdentityKey::generate().public();

        let init = initiate(&host, None);
        assert!(matches!(
            accept(&sat, &init.hello, Some(&stranger)),
            Err(HandshakeError::PeerMismatch)
        ));
    }

    #[test]
    fn accept_identity_is_pinned_on_complete() {
        let host = IdentityKey::generate();
        let sat = IdentityKey::generate();
        let stranger = IdentityKey::generate().public();

        let init = initiate(&host, None);
        let (accept_msg, _) = accept(&sat, &init.hello, None).unwrap();
        assert!(matches!(
            complete(init, &accept_msg, Some(&stranger)),
            Err(HandshakeError::PeerMismatch)
        ));
    }

    #[test]
    fn version_gate() {
        let host = IdentityKey::generate();
        let sat = IdentityKey::generate();
        let mut init = initiate(&host, None);
        init.hello.v = 2;
        assert!(matches!(
            accept(&sat, &init.hello, None),
            Err(HandshakeError::UnsupportedVersion(2))
        ));
    }
}
