//! Length-prefixed record delimiting.
//!
//! Every record on the wire is a 4-byte big-endian length followed by that
//! many bytes. The cap is configurable but never below 256 KiB, the floor
//! needed for file-descriptor payloads.

use bytes::{Buf, BytesMut};
use thiserror::Error;

/// Default record cap, 1 MiB.
pub const DEFAULT_MAX_FRAME: usize = 1024 * 1024;

/// Lowest configurable record cap, 256 KiB.
pub const MIN_MAX_FRAME: usize = 256 * 1024;

const LEN_PREFIX: usize = 4;

#[derive(Debug, Error)]
pub enum FramingError {
    #[error("record of {len} bytes exceeds the {max} byte limit")]
    TooLarge { len: usize, max: usize },
}

/// Codec for one direction of a framed byte stream.
#[derive(Clone, Copy, Debug)]
pub struct FrameCodec {
    max_frame: usize,
}

impl FrameCodec {
    /// Create a codec; caps below [`MIN_MAX_FRAME`] are raised to it.
    pub fn new(max_frame: usize) -> Self {
        Self { max_frame: max_frame.max(MIN_MAX_FRAME) }
    }

    pub fn max_frame(&self) -> usize {
        self.max_frame
    }

    /// Prefix a record with its length.
    pub fn encode(&self, record: &[u8]) -> Result<Vec<u8>, FramingError> {
        if record.len() > self.max_frame {
            return Err(FramingError::TooLarge { len: record.len(), max: self.max_frame });
        }
        let mut out = Vec::with_capacity(LEN_PREFIX + record.len());
        out.extend_from_slice(&(record.len() as u32).to_be_bytes());
        out.extend_from_slice(record);
        Ok(out)
    }

    /// Pull the next complete record out of a receive buffer.
    ///
    /// Returns `Ok(None)` while the buffer holds only a partial record. An
    /// oversized announced length fails before any payload is buffered.
    pub fn decode(&self, buf: &mut BytesMut) -> Result<Option<Vec<u8>>, FramingError> {
        if buf.len() < LEN_PREFIX {
            return Ok(None);
        }
        let len = u32::from_be_bytes(buf[..LEN_PREFIX].try_into().expect("4-byte prefix")) as usize;
        if len > self.max_frame {
            return Err(FramingError::TooLarge { len, max: self.max_frame });
        }
        if buf.len() < LEN_PREFIX + len {
            return Ok(None);
        }
        buf.advance(LEN_PREFIX);
        Ok(Some(buf.split_to(len).to_vec()))
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME)
    }
}
