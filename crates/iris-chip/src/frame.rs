//! Transaction frame codec for the streaming channel.
//!
//! Every transaction travels through the ring buffer as a 4-byte length
//! prefix followed by the request bytes. The request bytes repeat the size
//! in their first 4 bytes and carry the correlation id in the next 4, so a
//! reassembled frame identifies itself without a separate lookup table:
//!
//! ```text
//! ┌────────┬────────┬────────┬─────┬─────┬──────┬──────┬────────┬────────┬──────┬─────────┐
//! │ len    │ size   │ id     │ sec │ cmd │ kind │ rsvd │ value  │ status │ rsvd │ payload │
//! │ 4      │ 4      │ 4      │ 1   │ 1   │ 1    │ 1    │ 4      │ 2      │ 2    │ …       │
//! └────────┴────────┴────────┴─────┴─────┴──────┴──────┴────────┴────────┴──────┴─────────┘
//! ```
//!
//! All integers are little endian. `len == size == 20 + payload length`.
//! The in-payload duplication of the size is a firmware compatibility
//! requirement and must not be collapsed into the prefix.

use bytes::{Buf, BufMut, BytesMut};
use thiserror::Error;

/// Size of the length prefix preceding every frame.
pub const LEN_PREFIX_SIZE: usize = 4;

/// Size of the frame header that follows the length prefix.
pub const FRAME_HEADER_SIZE: usize = 20;

/// Upper bound accepted for a single frame (header + payload).
///
/// Anything larger than this in a length prefix is treated as channel
/// corruption rather than a real transfer.
pub const MAX_FRAME_SIZE: usize = 1 << 20;

/// Size of an encoded [`ApiCommand`] block.
pub const API_COMMAND_SIZE: usize = 12;

/// Frame kind byte values.
pub mod kind {
    /// Single-word firmware read.
    pub const API_READ: u8 = 0;
    /// Single-word firmware write.
    pub const API_WRITE: u8 = 1;
    /// Buffer transfer, device to host.
    pub const BUFFER_READ: u8 = 2;
    /// Buffer transfer, host to device.
    pub const BUFFER_WRITE: u8 = 3;
}

/// Errors produced while decoding a frame.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    /// Fewer bytes than a bare frame header.
    #[error("frame too short: {len} bytes")]
    TooShort {
        /// Number of bytes available.
        len: usize,
    },

    /// The duplicated size disagrees with the actual byte count.
    #[error("frame size mismatch: header says {size}, got {len} bytes")]
    SizeMismatch {
        /// Size field from the frame header.
        size: u32,
        /// Number of bytes actually present.
        len: usize,
    },

    /// Length prefix beyond [`MAX_FRAME_SIZE`].
    #[error("frame length {len} exceeds maximum {max}")]
    Oversized {
        /// Claimed frame length.
        len: usize,
        /// Maximum accepted length.
        max: usize,
    },
}

/// One decoded (or to-be-encoded) transaction frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Correlation id matching the frame to its originating request.
    pub id: u32,
    /// Command-type / section selector.
    pub section: u8,
    /// Command selector within the section.
    pub command: u8,
    /// Frame kind byte (see [`kind`]).
    pub kind: u8,
    /// Scalar value (input for writes, result for reads).
    pub value: u32,
    /// 16-bit firmware status code.
    pub status: u16,
    /// Variable-length payload (buffer kinds only).
    pub payload: Vec<u8>,
}

impl Frame {
    /// Total on-wire size of this frame including the length prefix.
    pub fn wire_len(&self) -> usize {
        LEN_PREFIX_SIZE + FRAME_HEADER_SIZE + self.payload.len()
    }

    /// Encode the frame including its length prefix.
    #[allow(clippy::cast_possible_truncation)] // payload bounded by MAX_FRAME_SIZE
    pub fn encode(&self) -> Vec<u8> {
        let size = (FRAME_HEADER_SIZE + self.payload.len()) as u32;
        let mut buf = BytesMut::with_capacity(self.wire_len());
        buf.put_u32_le(size); // length prefix
        buf.put_u32_le(size); // duplicated size, firmware convention
        buf.put_u32_le(self.id);
        buf.put_u8(self.section);
        buf.put_u8(self.command);
        buf.put_u8(self.kind);
        buf.put_u8(0);
        buf.put_u32_le(self.value);
        buf.put_u16_le(self.status);
        buf.put_u16_le(0);
        buf.put_slice(&self.payload);
        buf.to_vec()
    }

    /// Decode a frame body (everything after the length prefix).
    ///
    /// # Errors
    ///
    /// Returns [`FrameError`] if the body is shorter than a frame header or
    /// its duplicated size disagrees with `body.len()`.
    pub fn decode(body: &[u8]) -> Result<Self, FrameError> {
        if body.len() < FRAME_HEADER_SIZE {
            return Err(FrameError::TooShort { len: body.len() });
        }
        let mut buf = body;
        let size = buf.get_u32_le();
        if size as usize != body.len() {
            return Err(FrameError::SizeMismatch {
                size,
                len: body.len(),
            });
        }
        let id = buf.get_u32_le();
        let section = buf.get_u8();
        let command = buf.get_u8();
        let kind = buf.get_u8();
        let _rsvd = buf.get_u8();
        let value = buf.get_u32_le();
        let status = buf.get_u16_le();
        let _rsvd2 = buf.get_u16_le();
        Ok(Self {
            id,
            section,
            command,
            kind,
            value,
            status,
            payload: buf.to_vec(),
        })
    }
}

/// Validate a length prefix read off the channel.
///
/// # Errors
///
/// Returns [`FrameError`] when the claimed length cannot be a real frame.
pub fn validate_len_prefix(len: u32) -> Result<usize, FrameError> {
    let len = len as usize;
    if len < FRAME_HEADER_SIZE {
        return Err(FrameError::TooShort { len });
    }
    if len > MAX_FRAME_SIZE {
        return Err(FrameError::Oversized {
            len,
            max: MAX_FRAME_SIZE,
        });
    }
    Ok(len)
}

/// Fixed-size command block for the API sub-channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ApiCommand {
    /// Correlation id.
    pub id: u32,
    /// Input value (writes) or zero (reads).
    pub value: u32,
    /// Command-type / section selector.
    pub section: u8,
    /// Command selector within the section.
    pub command: u8,
    /// True for a firmware write, false for a read.
    pub write: bool,
}

impl ApiCommand {
    /// Encode into the fixed 12-byte slot layout.
    pub fn encode(&self) -> [u8; API_COMMAND_SIZE] {
        let mut buf = [0u8; API_COMMAND_SIZE];
        buf[0..4].copy_from_slice(&self.id.to_le_bytes());
        buf[4..8].copy_from_slice(&self.value.to_le_bytes());
        buf[8] = self.section;
        buf[9] = self.command;
        buf[10] = u8::from(self.write);
        buf
    }

    /// Decode from the fixed 12-byte slot layout.
    ///
    /// Returns `None` if the slot is shorter than [`API_COMMAND_SIZE`].
    pub fn decode(buf: &[u8]) -> Option<Self> {
        if buf.len() < API_COMMAND_SIZE {
            return None;
        }
        Some(Self {
            id: u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]),
            value: u32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]),
            section: buf[8],
            command: buf[9],
            write: buf[10] != 0,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(payload: Vec<u8>) -> Frame {
        Frame {
            id: 7,
            section: 2,
            command: 0x31,
            kind: kind::BUFFER_WRITE,
            value: 0xDEAD_BEEF,
            status: 0,
            payload,
        }
    }

    #[test]
    fn encode_decode_roundtrip() {
        let frame = sample(vec![1, 2, 3, 4, 5]);
        let wire = frame.encode();
        assert_eq!(wire.len(), frame.wire_len());

        let body = &wire[LEN_PREFIX_SIZE..];
        let decoded = Frame::decode(body).unwrap();
        assert_eq!(decoded, frame);
    }

    #[test]
    fn prefix_duplicates_size() {
        let wire = sample(vec![0; 10]).encode();
        // Length prefix and in-payload size are byte-identical.
        assert_eq!(wire[0..4], wire[4..8]);
        let len = u32::from_le_bytes(wire[0..4].try_into().unwrap());
        assert_eq!(len as usize, FRAME_HEADER_SIZE + 10);
    }

    #[test]
    fn decode_rejects_short_body() {
        let err = Frame::decode(&[0u8; 10]).unwrap_err();
        assert_eq!(err, FrameError::TooShort { len: 10 });
    }

    #[test]
    fn decode_rejects_size_mismatch() {
        let mut wire = sample(vec![1, 2, 3]).encode();
        wire.push(0xFF); // extra trailing byte
        let body = &wire[LEN_PREFIX_SIZE..];
        assert!(matches!(
            Frame::decode(body),
            Err(FrameError::SizeMismatch { .. })
        ));
    }

    #[test]
    fn len_prefix_validation() {
        assert!(validate_len_prefix(FRAME_HEADER_SIZE as u32).is_ok());
        assert!(matches!(
            validate_len_prefix(3),
            Err(FrameError::TooShort { .. })
        ));
        assert!(matches!(
            validate_len_prefix(u32::MAX),
            Err(FrameError::Oversized { .. })
        ));
    }

    #[test]
    fn api_command_roundtrip() {
        let cmd = ApiCommand {
            id: 42,
            value: 0x1234_5678,
            section: 1,
            command: 0x20,
            write: true,
        };
        let slot = cmd.encode();
        assert_eq!(ApiCommand::decode(&slot), Some(cmd));
    }

    #[test]
    fn empty_payload_frame_is_header_only() {
        let frame = sample(Vec::new());
        let wire = frame.encode();
        assert_eq!(wire.len(), LEN_PREFIX_SIZE + FRAME_HEADER_SIZE);
    }
}
