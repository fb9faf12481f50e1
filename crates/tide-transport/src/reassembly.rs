//! Stream reassembly: turns an ordered byte stream back into messages.
//!
//! Pure logic, no I/O. The stream transport owns one per peer, pushes each
//! received chunk in, then drains complete messages greedily.

use bytes::{Bytes, BytesMut};

use crate::codec::{DecodeError, Decoded, MessageCodec};

#[derive(Debug, Default)]
pub struct Reassembler {
    buffer: BytesMut,
    discarded: u64,
    framing_errors: u64,
}

impl Reassembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a chunk at the back of the buffer.
    pub fn push(&mut self, chunk: &[u8]) {
        self.buffer.extend_from_slice(chunk);
    }

    /// Decode the next complete message from the front of the buffer.
    ///
    /// Returns the raw frame bytes with the decoded message, or `None` when
    /// more data is needed. Malformed prefixes are dropped and decoding
    /// resumes past them, so corruption never stalls the stream.
    pub fn next_message<C: MessageCodec>(&mut self, codec: &C) -> Option<(Bytes, C::Message)> {
        loop {
            if self.buffer.is_empty() {
                return None;
            }
            match codec.decode_one(&self.buffer) {
                Ok(Decoded::Message { message, consumed }) => {
                    let consumed = consumed.clamp(1, self.buffer.len());
                    let frame = self.buffer.split_to(consumed).freeze();
                    return Some((frame, message));
                }
                Ok(Decoded::NeedMoreData) => return None,
                Err(err) => {
                    let skip = err.skip().clamp(1, self.buffer.len());
                    match &err {
                        DecodeError::UnrecognizedFraming { .. } => {
                            tracing::trace!(skip, "dropping bytes without framing marker");
                        }
                        DecodeError::Malformed { reason, .. } => {
                            tracing::debug!(skip, %reason, "dropping malformed message prefix");
                        }
                    }
                    let _ = self.buffer.split_to(skip);
                    self.discarded += skip as u64;
                    self.framing_errors += 1;
                }
            }
        }
    }

    /// Bytes waiting for the rest of their message.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Total bytes dropped while resynchronising.
    pub fn discarded(&self) -> u64 {
        self.discarded
    }

    pub fn framing_errors(&self) -> u64 {
        self.framing_errors
    }

    /// Drop any partial message.
    pub fn clear(&mut self) {
        self.buffer.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{CodecError, Frame, FrameCodec};

    /// Minimal codec: `0xAA | len u8 | payload`.
    struct TinyCodec;

    impl MessageCodec for TinyCodec {
        type Message = Vec<u8>;

        fn encode(&self, message: &Vec<u8>) -> Result<Bytes, CodecError> {
            let mut out = vec![0xAA, message.len() as u8];
            out.extend_from_slice(message);
            Ok(out.into())
        }

        fn decode_one(&self, buf: &[u8]) -> Result<Decoded<Vec<u8>>, DecodeError> {
            if buf[0] != 0xAA {
                return Err(DecodeError::UnrecognizedFraming { skip: 1 });
            }
            if buf.len() < 2 {
                return Ok(Decoded::NeedMoreData);
            }
            let total = 2 + buf[1] as usize;
            if buf.len() < total {
                return Ok(Decoded::NeedMoreData);
            }
            Ok(Decoded::Message {
                message: buf[2..total].to_vec(),
                consumed: total,
            })
        }
    }

    fn drain<C: MessageCodec>(r: &mut Reassembler, codec: &C) -> Vec<C::Message> {
        std::iter::from_fn(|| r.next_message(codec).map(|(_, m)| m)).collect()
    }

    #[test]
    fn one_byte_chunks_yield_messages_in_order() {
        let codec = TinyCodec;
        let a = vec![b'A'; 8];
        let b = vec![b'B'; 5];
        let c = vec![b'C'; 13];
        let mut stream = Vec::new();
        for m in [&a, &b, &c] {
            stream.extend_from_slice(&codec.encode(m).unwrap());
        }
        assert_eq!(stream.len(), 32);

        let mut r = Reassembler::new();
        let mut seen = Vec::new();
        for byte in &stream {
            r.push(std::slice::from_ref(byte));
            seen.extend(drain(&mut r, &codec));
        }
        assert_eq!(seen, vec![a, b, c]);
        assert_eq!(r.buffered(), 0);
        assert_eq!(r.discarded(), 0);
    }

    #[test]
    fn partial_message_stays_buffered() {
        let codec = FrameCodec::new();
        let bytes = codec.encode(&Frame::new(1, &b"hello"[..])).unwrap();
        let mut r = Reassembler::new();
        r.push(&bytes[..10]);
        assert!(r.next_message(&codec).is_none());
        assert_eq!(r.buffered(), 10);
        r.push(&bytes[10..]);
        let (raw, frame) = r.next_message(&codec).unwrap();
        assert_eq!(raw, bytes);
        assert_eq!(&frame.payload[..], b"hello");
        assert_eq!(r.buffered(), 0);
    }

    #[test]
    fn corrupted_prefix_is_skipped() {
        let codec = FrameCodec::new();
        let good: Vec<Frame> = (0..3u8).map(|i| Frame::new(i as u16, vec![i; 4])).collect();

        let mut corrupted = codec.encode(&Frame::new(99, &b"lost"[..])).unwrap().to_vec();
        corrupted[0] = 0x00;
        let mut r = Reassembler::new();
        r.push(&corrupted);
        for f in &good {
            r.push(&codec.encode(f).unwrap());
        }

        let decoded = drain(&mut r, &codec);
        assert_eq!(decoded, good);
        assert_eq!(r.discarded(), corrupted.len() as u64);
        assert_eq!(r.buffered(), 0);
    }

    #[test]
    fn bad_checksum_resyncs_on_following_frame() {
        let codec = FrameCodec::new();
        let mut bad = codec.encode(&Frame::new(5, &b"damaged"[..])).unwrap().to_vec();
        let last = bad.len() - 1;
        bad[last] ^= 0x55;
        let next = Frame::new(6, &b"intact"[..]);

        let mut r = Reassembler::new();
        r.push(&bad);
        r.push(&codec.encode(&next).unwrap());
        assert_eq!(drain(&mut r, &codec), vec![next]);
        assert!(r.framing_errors() >= 1);
    }

    #[test]
    fn clear_drops_partial_message() {
        let codec = FrameCodec::new();
        let bytes = codec.encode(&Frame::new(1, &b"partial"[..])).unwrap();
        let mut r = Reassembler::new();
        r.push(&bytes[..5]);
        r.clear();
        assert_eq!(r.buffered(), 0);
        r.push(&bytes);
        assert!(r.next_message(&codec).is_some());
    }
}
