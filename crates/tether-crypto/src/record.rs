//! AEAD record layer.
//!
//! Each direction has its own ChaCha20-Poly1305 key and a 64-bit sequence
//! counter. The sequence travels in clear ahead of the ciphertext and is
//! folded into the nonce, so accepting a record authenticates its position
//! in the stream. Receive-side counters only ever move forward; a record
//! whose sequence does not exceed the last accepted one is a replay.

use std::fmt;

use chacha20poly1305::{
    aead::{Aead, KeyInit},
    ChaCha20Poly1305, Key, Nonce,
};

use crate::handshake::SessionSecrets;

/// Clear sequence prefix plus AEAD tag.
pub const RECORD_OVERHEAD: usize = 8 + 16;

#[derive(Debug, thiserror::Error)]
pub enum RecordError {
    #[error("record replayed or reordered (seq {seq})")]
    Replay { seq: u64 },

    #[error("record failed authentication")]
    Tamper,

    #[error("record shorter than the minimum envelope")]
    Truncated,

    #[error("send counter exhausted")]
    Exhausted,
}

/// Both directions of an established channel's record protection.
pub struct RecordChannel {
    seal_cipher: ChaCha20Poly1305,
    open_cipher: ChaCha20Poly1305,
    next_send: u64,
    last_recv: u64,
}

impl fmt::Debug for RecordChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecordChannel")
            .field("next_send", &self.next_send)
            .field("last_recv", &self.last_recv)
            .finish_non_exhaustive()
    }
}

fn seq_nonce(seq: u64) -> Nonce {
    let mut bytes = [0u8; 12];
    bytes[4..].copy_from_slice(&seq.to_be_bytes());
    *Nonce::from_slice(&bytes)
}

impl RecordChannel {
    pub fn new(secrets: &SessionSecrets) -> Self {
        Self::from_keys(&secrets.send_key, &secrets.recv_key)
    }

    pub fn from_keys(send_key: &[u8; 32], recv_key: &[u8; 32]) -> Self {
        Self {
            seal_cipher: ChaCha20Poly1305::new(Key::from_slice(send_key)),
            open_cipher: ChaCha20Poly1305::new(Key::from_slice(recv_key)),
            next_send: 1,
            last_recv: 0,
        }
    }

    /// Seal a plaintext into `seq || ciphertext`.
    pub fn seal(&mut self, plaintext: &[u8]) -> Result<Vec<u8>, RecordError> {
        let seq = self.next_send;
        if seq == u64::MAX {
            return Err(RecordError::Exhausted);
        }
        let ciphertext = self
            .seal_cipher
            .encrypt(&seq_nonce(seq), plaintext)
            .map_err(|_| RecordError::Tamper)?;
        self.next_send += 1;

        let mut record = Vec::with_capacity(8 + ciphertext.len());
        record.extend_from_slice(&seq.to_be_bytes());
        record.extend_from_slice(&ciphertext);
        Ok(record)
    }

    /// Open a received record, enforcing counter progression.
    ///
    /// The counter advances only after the ciphertext authenticates, so a
    /// forged prefix cannot push the window forward.
    pub fn open(&mut self, record: &[u8]) -> Result<Vec<u8>, RecordError> {
        if record.len() < RECORD_OVERHEAD {
            return Err(RecordError::Truncated);
        }
        let seq = u64::from_be_bytes(record[..8].try_into().expect("8-byte prefix"));
        if seq <= self.last_recv {
            return Err(RecordError::Replay { seq });
        }
        let plaintext = self
            .open_cipher
            .decrypt(&seq_nonce(seq), &record[8..])
            .map_err(|_| RecordError::Tamper)?;
        self.last_recv = seq;
        Ok(plaintext)
    }
}
