//! Message codec seam and the bundled frame codec.
//!
//! Both transports encode and decode through the same [`MessageCodec`], so
//! what goes on the wire does not depend on the transport chosen.

use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Result of trying to decode one message from the front of a buffer.
#[derive(Debug, PartialEq)]
pub enum Decoded<M> {
    Message { message: M, consumed: usize },
    NeedMoreData,
}

/// Decoding failure. `skip` is how many bytes the caller must drop from the
/// front of its buffer before trying again.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error("unrecognized framing marker ({skip} bytes skipped)")]
    UnrecognizedFraming { skip: usize },

    #[error("malformed message: {reason}")]
    Malformed { skip: usize, reason: String },
}

impl DecodeError {
    pub fn skip(&self) -> usize {
        match self {
            DecodeError::UnrecognizedFraming { skip } | DecodeError::Malformed { skip, .. } => {
                *skip
            }
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("payload of {size} bytes exceeds the codec limit of {max}")]
    PayloadTooLarge { size: usize, max: usize },
}

/// Wire codec used by the transports. Opaque to them beyond this interface.
pub trait MessageCodec: Send + Sync + 'static {
    type Message: Send + Sync + 'static;

    fn encode(&self, message: &Self::Message) -> Result<Bytes, CodecError>;

    /// Decode at most one message from the front of `buf`.
    fn decode_one(&self, buf: &[u8]) -> Result<Decoded<Self::Message>, DecodeError>;
}

/// Sync marker opening every frame.
pub const SYNC_WORD: u16 = 0x7E1D;

/// sync(2) + msg_type(2) + timestamp_ms(8) + payload_len(4)
pub const HEADER_LEN: usize = 16;

pub const TRAILER_LEN: usize = 2;

pub const DEFAULT_MAX_PAYLOAD: usize = 1024 * 1024;

/// A framed message: type tag and logical timestamp around opaque bytes.
///
/// The transports never interpret `msg_type` or `timestamp_ms`; they exist
/// for routing and logging above.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub msg_type: u16,
    pub timestamp_ms: u64,
    pub payload: Bytes,
}

impl Frame {
    /// New frame stamped with the current wall-clock time.
    pub fn new(msg_type: u16, payload: impl Into<Bytes>) -> Self {
        Self {
            msg_type,
            timestamp_ms: crate::now_ms(),
            payload: payload.into(),
        }
    }

    pub fn encoded_len(&self) -> usize {
        HEADER_LEN + self.payload.len() + TRAILER_LEN
    }
}

/// Length-prefixed frame codec with a sync marker and CRC-16 trailer.
///
/// Layout (big-endian):
/// `sync u16 | msg_type u16 | timestamp_ms u64 | payload_len u32 | payload | crc16 u16`
#[derive(Debug, Clone)]
pub struct FrameCodec {
    max_payload: usize,
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameCodec {
    pub fn new() -> Self {
        Self {
            max_payload: DEFAULT_MAX_PAYLOAD,
        }
    }

    pub fn with_max_payload(max_payload: usize) -> Self {
        Self { max_payload }
    }

    pub fn max_payload(&self) -> usize {
        self.max_payload
    }
}

impl MessageCodec for FrameCodec {
    type Message = Frame;

    fn encode(&self, frame: &Frame) -> Result<Bytes, CodecError> {
        if frame.payload.len() > self.max_payload {
            return Err(CodecError::PayloadTooLarge {
                size: frame.payload.len(),
                max: self.max_payload,
            });
        }
        let mut buf = BytesMut::with_capacity(frame.encoded_len());
        buf.put_u16(SYNC_WORD);
        buf.put_u16(frame.msg_type);
        buf.put_u64(frame.timestamp_ms);
        buf.put_u32(frame.payload.len() as u32);
        buf.put_slice(&frame.payload);
        let crc = crc16(&buf);
        buf.put_u16(crc);
        Ok(buf.freeze())
    }

    fn decode_one(&self, buf: &[u8]) -> Result<Decoded<Frame>, DecodeError> {
        if buf.len() < 2 {
            return Ok(Decoded::NeedMoreData);
        }
        if u16::from_be_bytes([buf[0], buf[1]]) != SYNC_WORD {
            return Err(DecodeError::UnrecognizedFraming {
                skip: resync_distance(buf),
            });
        }
        if buf.len() < HEADER_LEN {
            return Ok(Decoded::NeedMoreData);
        }

        let mut header = &buf[2..HEADER_LEN];
        let msg_type = header.get_u16();
        let timestamp_ms = header.get_u64();
        let payload_len = header.get_u32() as usize;

        if payload_len > self.max_payload {
            // A length this large means the marker was a coincidence.
            return Err(DecodeError::UnrecognizedFraming { skip: 1 });
        }

        let total = HEADER_LEN + payload_len + TRAILER_LEN;
        if buf.len() < total {
            return Ok(Decoded::NeedMoreData);
        }

        let body_end = HEADER_LEN + payload_len;
        let expected = u16::from_be_bytes([buf[body_end], buf[body_end + 1]]);
        let actual = crc16(&buf[..body_end]);
        if expected != actual {
            return Err(DecodeError::Malformed {
                skip: 1,
                reason: format!("crc mismatch (expected {expected:#06x}, got {actual:#06x})"),
            });
        }

        Ok(Decoded::Message {
            message: Frame {
                msg_type,
                timestamp_ms,
                payload: Bytes::copy_from_slice(&buf[HEADER_LEN..body_end]),
            },
            consumed: total,
        })
    }
}

/// Bytes to drop so the buffer starts at the next possible sync marker.
/// Keeps a trailing half-marker so it can complete with the next chunk.
fn resync_distance(buf: &[u8]) -> usize {
    let [hi, lo] = SYNC_WORD.to_be_bytes();
    buf.windows(2)
        .skip(1)
        .position(|w| w[0] == hi && w[1] == lo)
        .map(|p| p + 1)
        .unwrap_or_else(|| {
            if buf.last() == Some(&hi) {
                buf.len() - 1
            } else {
                buf.len()
            }
        })
}

/// CRC-16/CCITT-FALSE (poly 0x1021, init 0xFFFF).
pub fn crc16(data: &[u8]) -> u16 {
    let mut crc: u16 = 0xFFFF;
    for &byte in data {
        crc ^= (byte as u16) << 8;
        for _ in 0..8 {
            crc = if crc & 0x8000 != 0 {
                (crc << 1) ^ 0x1021
            } else {
                crc << 1
            };
        }
    }
    crc
}
