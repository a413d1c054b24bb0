//! Data connection framing: 4-byte LE length prefix, then a bincode [`Envelope`].
//!
//! Hosts with message-oriented channels can hand whole frames to [`decode_frame`]; hosts
//! whose transport may split or coalesce writes feed bytes into a [`FrameBuffer`].

use bincode::Options;
use bytes::{Buf, BytesMut};

use crate::envelope::Envelope;

const LEN_SIZE: usize = 4;
/// Largest payload accepted either way. A 64 KiB chunk plus metadata is far below this.
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

fn codec() -> impl Options {
    bincode::DefaultOptions::new().with_limit(MAX_FRAME_LEN as u64)
}

#[derive(Debug, thiserror::Error)]
pub enum FrameEncodeError {
    #[error("encode envelope: {0}")]
    Encode(#[from] bincode::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum FrameDecodeError {
    #[error("incomplete frame")]
    NeedMore,
    #[error("frame of {0} bytes exceeds limit")]
    TooLarge(usize),
    #[error("decode envelope: {0}")]
    Decode(#[from] bincode::Error),
}

pub fn encode_frame(envelope: &Envelope) -> Result<Vec<u8>, FrameEncodeError> {
    let payload = codec().serialize(envelope)?;
    let mut out = Vec::with_capacity(LEN_SIZE + payload.len());
    out.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    out.extend_from_slice(&payload);
    Ok(out)
}

/// Payload length announced by the prefix at the front of `bytes`, if complete.
fn frame_len(bytes: &[u8]) -> Result<Option<usize>, FrameDecodeError> {
    let Some(prefix) = bytes.get(..LEN_SIZE) else {
        return Ok(None);
    };
    let len = u32::from_le_bytes([prefix[0], prefix[1], prefix[2], prefix[3]]) as usize;
    if len > MAX_FRAME_LEN {
        return Err(FrameDecodeError::TooLarge(len));
    }
    Ok(Some(len))
}

/// Decode the frame at the front of `bytes`. Returns the envelope and bytes consumed.
pub fn decode_frame(bytes: &[u8]) -> Result<(Envelope, usize), FrameDecodeError> {
    let len = frame_len(bytes)?.ok_or(FrameDecodeError::NeedMore)?;
    let end = LEN_SIZE + len;
    let payload = bytes.get(LEN_SIZE..end).ok_or(FrameDecodeError::NeedMore)?;
    Ok((codec().deserialize(payload)?, end))
}

/// Reassembles frames from arbitrarily split reads.
#[derive(Debug, Default)]
pub struct FrameBuffer {
    buf: BytesMut,
}

impl FrameBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Buffered bytes not yet consumed.
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn clear(&mut self) {
        self.buf.clear();
    }

    /// Next complete envelope, or `Ok(None)` until more bytes arrive.
    ///
    /// A frame that fails to decode is consumed so the following frames still parse. An
    /// oversized prefix leaves no way to resynchronize; the buffer is cleared.
    pub fn next_envelope(&mut self) -> Result<Option<Envelope>, FrameDecodeError> {
        let len = match frame_len(&self.buf) {
            Ok(Some(len)) => len,
            Ok(None) => return Ok(None),
            Err(e) => {
                self.buf.clear();
                return Err(e);
            }
        };
        if self.buf.len() < LEN_SIZE + len {
            return Ok(None);
        }
        self.buf.advance(LEN_SIZE);
        let payload = self.buf.split_to(len);
        Ok(Some(codec().deserialize(&payload)?))
    }
}
