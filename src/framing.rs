//! Length-prefixed framing for the tunnel data channel.
//!
//! Wire format, one frame per tunnelled packet:
//!
//! ```text
//! [payload_len:u32 big-endian] [payload:bytes]
//! ```
//!
//! Payload lengths outside `1..=MAX_FRAME_LEN` are per-frame protocol
//! violations: the decoder discards the bad prefix and keeps going, so
//! one garbled frame does not cost the connection.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{Error, Result};

/// Maximum frame payload size in bytes.
pub const MAX_FRAME_LEN: usize = 65535;

/// Length prefix size in bytes.
pub const PREFIX_LEN: usize = 4;

/// Encode one payload as a single contiguous frame.
///
/// Prefix and payload land in one buffer so the caller can hand the
/// whole frame to a single `write_all`.
pub fn encode_frame(payload: &[u8]) -> Result<Bytes> {
    if payload.is_empty() || payload.len() > MAX_FRAME_LEN {
        return Err(Error::InvalidFrameLength(payload.len() as u32));
    }

    let mut buf = BytesMut::with_capacity(PREFIX_LEN + payload.len());
    buf.put_u32(payload.len() as u32);
    buf.put_slice(payload);
    Ok(buf.freeze())
}

/// Streaming frame decoder.
///
/// Socket reads of any fragmentation are fed in as they arrive and
/// complete payloads come out; a frame split across reads stays
/// buffered until the missing bytes show up.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buffer: BytesMut,
}

impl FrameDecoder {
    /// Create a decoder with room for a maximum-size frame.
    pub fn new() -> Self {
        Self {
            buffer: BytesMut::with_capacity(PREFIX_LEN + MAX_FRAME_LEN),
        }
    }

    /// Append bytes received from the transport.
    pub fn feed(&mut self, chunk: &[u8]) {
        self.buffer.extend_from_slice(chunk);
    }

    /// Number of buffered bytes not yet surfaced as frames.
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }

    /// Pull the next complete frame out of the buffer.
    ///
    /// `Ok(None)` means more bytes are needed. An out-of-range length
    /// prefix is consumed and reported as [`Error::InvalidFrameLength`];
    /// decoding resumes right after it.
    pub fn next_frame(&mut self) -> Result<Option<Bytes>> {
        if self.buffer.remaining() < PREFIX_LEN {
            return Ok(None);
        }

        let declared = (&self.buffer[..PREFIX_LEN]).get_u32();
        if declared == 0 || declared as usize > MAX_FRAME_LEN {
            self.buffer.advance(PREFIX_LEN);
            return Err(Error::InvalidFrameLength(declared));
        }

        let len = declared as usize;
        if self.buffer.remaining() < PREFIX_LEN + len {
            return Ok(None);
        }

        self.buffer.advance(PREFIX_LEN);
        Ok(Some(self.buffer.split_to(len).freeze()))
    }
}
