//! Frame encoding and decoding.
//!
//! The decoder tolerates arbitrary TCP segmentation: a frame split across
//! reads stays buffered until complete, and several frames arriving in one
//! read are all extracted in order. Tags outside the known set still parse
//! (the length field is tag-independent) so the caller can skip them; a
//! declared length above the cap is unrecoverable and fatal.

use super::{Message, MessageType, HEADER_LEN, MAX_PAYLOAD};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

/// Framing violation that prevents further decoding of the stream
#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("payload length {len} exceeds maximum {max}")]
    Oversize { len: u64, max: usize },
}

/// Outcome of a single decode attempt
#[derive(Debug)]
pub enum Decoded {
    /// One complete message and the number of buffer bytes it consumed
    Frame(Message, usize),
    /// More bytes required; the value is the minimum total buffer length
    /// needed before the next attempt can make progress
    NeedMore(usize),
}

/// Encode one message: header followed by the payload verbatim
pub fn encode(kind: MessageType, payload: &[u8]) -> Result<Bytes, FrameError> {
    if payload.len() > MAX_PAYLOAD {
        return Err(FrameError::Oversize {
            len: payload.len() as u64,
            max: MAX_PAYLOAD,
        });
    }

    let mut buf = BytesMut::with_capacity(HEADER_LEN + payload.len());
    buf.put_u8(kind as u8);
    buf.put_u32(payload.len() as u32);
    buf.extend_from_slice(payload);
    Ok(buf.freeze())
}

/// Decode one message from the front of `buf`.
///
/// Returns the message and its consumed byte count, or the minimum buffer
/// length needed for the next attempt. Does not modify the buffer.
pub fn decode_one(buf: &[u8], max_payload: usize) -> Result<Decoded, FrameError> {
    if buf.len() < HEADER_LEN {
        return Ok(Decoded::NeedMore(HEADER_LEN));
    }

    let declared = u32::from_be_bytes([buf[1], buf[2], buf[3], buf[4]]);
    if declared as usize > max_payload {
        return Err(FrameError::Oversize {
            len: u64::from(declared),
            max: max_payload,
        });
    }

    let total = HEADER_LEN + declared as usize;
    if buf.len() < total {
        return Ok(Decoded::NeedMore(total));
    }

    let msg = Message {
        tag: buf[0],
        payload: Bytes::copy_from_slice(&buf[HEADER_LEN..total]),
    };
    Ok(Decoded::Frame(msg, total))
}

/// Repeatedly decode complete messages from `buf`, consuming them.
///
/// Residual bytes of a trailing partial frame are left in place.
pub fn decode_all(buf: &mut BytesMut, max_payload: usize) -> Result<Vec<Message>, FrameError> {
    let mut out = Vec::new();
    loop {
        match decode_one(buf, max_payload)? {
            Decoded::Frame(msg, consumed) => {
                buf.advance(consumed);
                out.push(msg);
            }
            Decoded::NeedMore(_) => return Ok(out),
        }
    }
}

/// Per-session streaming buffer feeding the decoder.
///
/// Bytes read off the transport are appended as they arrive; `drain`
/// extracts every complete message and retains the residual.
#[derive(Debug)]
pub struct FrameBuffer {
    buf: BytesMut,
    max_payload: usize,
}

impl FrameBuffer {
    pub fn new(max_payload: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(8 * 1024),
            max_payload,
        }
    }

    /// Append raw transport bytes
    pub fn extend(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Extract every complete buffered message, in arrival order
    pub fn drain(&mut self) -> Result<Vec<Message>, FrameError> {
        decode_all(&mut self.buf, self.max_payload)
    }

    /// Bytes currently buffered without forming a complete message
    pub fn residual_len(&self) -> usize {
        self.buf.len()
    }
}

impl Default for FrameBuffer {
    fn default() -> Self {
        Self::new(MAX_PAYLOAD)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_then_decode_is_identity() {
        let wire = encode(MessageType::AuthRequest, b"{\"username\":\"u\"}").unwrap();
        match decode_one(&wire, MAX_PAYLOAD).unwrap() {
            Decoded::Frame(msg, consumed) => {
                assert_eq!(consumed, wire.len());
                assert_eq!(msg.kind(), Some(MessageType::AuthRequest));
                assert_eq!(&msg.payload[..], b"{\"username\":\"u\"}");
                assert_eq!(msg.wire_len(), wire.len());
            }
            other => panic!("expected frame, got {:?}", other),
        }
    }

    #[test]
    fn empty_payload_frames() {
        let wire = encode(MessageType::Keepalive, &[]).unwrap();
        assert_eq!(wire.len(), HEADER_LEN);
        let Decoded::Frame(msg, consumed) = decode_one(&wire, MAX_PAYLOAD).unwrap() else {
            panic!("expected frame");
        };
        assert_eq!(consumed, HEADER_LEN);
        assert!(msg.payload.is_empty());
    }

    #[test]
    fn partial_header_requests_more() {
        let wire = encode(MessageType::Disconnect, &[]).unwrap();
        match decode_one(&wire[..3], MAX_PAYLOAD).unwrap() {
            Decoded::NeedMore(n) => assert_eq!(n, HEADER_LEN),
            other => panic!("expected NeedMore, got {:?}", other),
        }
    }

    #[test]
    fn partial_payload_requests_full_frame() {
        let wire = encode(MessageType::DataPacket, &[0u8; 100]).unwrap();
        match decode_one(&wire[..HEADER_LEN + 10], MAX_PAYLOAD).unwrap() {
            Decoded::NeedMore(n) => assert_eq!(n, HEADER_LEN + 100),
            other => panic!("expected NeedMore, got {:?}", other),
        }
    }

    #[test]
    fn max_length_field_is_rejected() {
        let mut wire = vec![0x10u8];
        wire.extend_from_slice(&0xFFFF_FFFFu32.to_be_bytes());
        let err = decode_one(&wire, MAX_PAYLOAD).unwrap_err();
        assert_eq!(
            err,
            FrameError::Oversize {
                len: 0xFFFF_FFFF,
                max: MAX_PAYLOAD
            }
        );
    }

    #[test]
    fn oversize_encode_is_rejected() {
        let payload = vec![0u8; MAX_PAYLOAD + 1];
        assert!(encode(MessageType::DataPacket, &payload).is_err());
    }

    #[test]
    fn unknown_tag_still_parses() {
        let mut wire = vec![0x7Fu8];
        wire.extend_from_slice(&2u32.to_be_bytes());
        wire.extend_from_slice(b"xy");
        let Decoded::Frame(msg, consumed) = decode_one(&wire, MAX_PAYLOAD).unwrap() else {
            panic!("expected frame");
        };
        assert_eq!(consumed, 7);
        assert_eq!(msg.tag, 0x7F);
        assert_eq!(msg.kind(), None);
    }

    #[test]
    fn concatenated_frames_decode_in_order() {
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&encode(MessageType::Keepalive, &[]).unwrap());
        buf.extend_from_slice(&encode(MessageType::DataPacket, b"pkt").unwrap());
        buf.extend_from_slice(&encode(MessageType::Disconnect, &[]).unwrap());
        // trailing partial frame
        buf.extend_from_slice(&[0x04, 0x00]);

        let msgs = decode_all(&mut buf, MAX_PAYLOAD).unwrap();
        assert_eq!(msgs.len(), 3);
        assert_eq!(msgs[0].kind(), Some(MessageType::Keepalive));
        assert_eq!(msgs[1].kind(), Some(MessageType::DataPacket));
        assert_eq!(&msgs[1].payload[..], b"pkt");
        assert_eq!(msgs[2].kind(), Some(MessageType::Disconnect));
        assert_eq!(buf.len(), 2);
    }

    #[test]
    fn frame_buffer_reassembles_split_frames() {
        let wire = encode(MessageType::DataPacket, &[7u8; 64]).unwrap();
        let mut fb = FrameBuffer::default();

        fb.extend(&wire[..2]);
        assert!(fb.drain().unwrap().is_empty());
        fb.extend(&wire[2..30]);
        assert!(fb.drain().unwrap().is_empty());
        fb.extend(&wire[30..]);

        let msgs = fb.drain().unwrap();
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0].payload.len(), 64);
        assert_eq!(fb.residual_len(), 0);
    }
}
