//! Long-lived identity keys.
//!
//! Each remote binding gets its own Ed25519 pair on both peers: the host
//! mints a fresh pair per registered device, the satellite mints one when
//! it first advertises a pairing token. The raw 32-byte forms are what the
//! device registry persists.

use std::fmt;

use ed25519_dalek::{Signature, SigningKey, VerifyingKey};
use rand_core::OsRng;
use sha2::{Digest, Sha256};
use zeroize::Zeroizing;

/// Length of serialized public and private identity keys.
pub const IDENTITY_KEY_LEN: usize = 32;

#[derive(Debug, thiserror::Error)]
pub enum KeyError {
    #[error("key material has wrong length")]
    BadLength,

    #[error("key bytes do not form a valid public key")]
    BadKey,

    #[error("signature verification failed")]
    BadSignature,
}

/// SHA-256 helper shared by fingerprints and handshake transcripts.
pub fn sha256(data: &[u8]) -> [u8; 32] {
    Sha256::digest(data).into()
}

/// A long-lived Ed25519 signing identity.
#[derive(Clone)]
pub struct IdentityKey {
    sign: SigningKey,
}

impl IdentityKey {
    pub fn generate() -> Self {
        Self { sign: SigningKey::generate(&mut OsRng) }
    }

    /// Restore an identity from its persisted private half.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, KeyError> {
        let arr: [u8; IDENTITY_KEY_LEN] = bytes.try_into().map_err(|_| KeyError::BadLength)?;
        Ok(Self { sign: SigningKey::from_bytes(&arr) })
    }

    /// Serialized private half, zeroized when the buffer drops.
    pub fn to_bytes(&self) -> Zeroizing<[u8; IDENTITY_KEY_LEN]> {
        Zeroizing::new(self.sign.to_bytes())
    }

    pub fn public(&self) -> PublicIdentity {
        PublicIdentity(self.sign.verifying_key().to_bytes())
    }

    pub fn sign(&self, message: &[u8]) -> [u8; 64] {
        use ed25519_dalek::Signer;
        self.sign.sign(message).to_bytes()
    }
}

impl fmt::Debug for IdentityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "IdentityKey({})", self.public().fingerprint())
    }
}

/// The public half of an identity, the unit the registry pins.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct PublicIdentity(pub [u8; IDENTITY_KEY_LEN]);

impl PublicIdentity {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, KeyError> {
        let arr: [u8; IDENTITY_KEY_LEN] = bytes.try_into().map_err(|_| KeyError::BadLength)?;
        Ok(Self(arr))
    }

    pub fn as_bytes(&self) -> &[u8; IDENTITY_KEY_LEN] {
        &self.0
    }

    /// Verify a detached signature made by the matching private half.
    pub fn verify(&self, message: &[u8], signature: &[u8]) -> Result<(), KeyError> {
        let vk = VerifyingKey::from_bytes(&self.0).map_err(|_| KeyError::BadKey)?;
        let sig_bytes: [u8; 64] = signature.try_into().map_err(|_| KeyError::BadLength)?;
        let sig = Signature::from_bytes(&sig_bytes);
        vk.verify_strict(message, &sig).map_err(|_| KeyError::BadSignature)
    }

    /// Short hex handle for logs and UI listings.
    pub fn fingerprint(&self) -> String {
        hex::encode(&sha256(&self.0)[..8])
    }
}

impl fmt::Debug for PublicIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicIdentity({})", self.fingerprint())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_verify_round_trip() {
        let key = IdentityKey::generate();
        let sig = key.sign(b"attach");
        key.public().verify(b"attach", &sig).unwrap();
    }

    #[test]
    fn wrong_message_fails() {
        let key = IdentityKey::generate();
        let sig = key.sign(b"attach");
        assert!(matches!(
            key.public().verify(b"detach", &sig),
            Err(KeyError::BadSignature)
        ));
    }

    #[test]
    fn wrong_signer_fails() {
        let key = IdentityKey::generate();
        let other = IdentityKey::generate();
        let sig = other.sign(b"attach");
        assert!(key.public().verify(b"attach", &sig).is_err());
    }

    #[test]
    fn persisted_form_restores_identity() {
        let key = IdentityKey::generate();
        let restored = IdentityKey::from_bytes(key.to_bytes().as_ref()).unwrap();
        assert_eq!(restored.public(), key.public());
    }

    #[test]
    fn bad_lengths_rejected() {
        assert!(matches!(IdentityKey::from_bytes(&[0u8; 31]), Err(KeyError::BadLength)));
        assert!(matches!(PublicIdentity::from_bytes(&[0u8; 33]), Err(KeyError::BadLength)));
    }

    #[test]
    fn fingerprint_is_stable_and_short() {
        let key = IdentityKey::generate();
        let fp = key.public().fingerprint();
        assert_eq!(fp.len(), 16);
        assert_eq!(fp, key.public().fingerprint());
    }
}
