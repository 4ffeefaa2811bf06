//! Codec for the plugin byte stream.
//!
//! Frames are length-prefixed JSON: a 4-byte big-endian length followed by
//! the serialized frame. JSON keeps the plugin wire debuggable with a pipe
//! and a pretty-printer; the documents are the same ones the rest of the
//! system speaks.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

/// Maximum frame size (16 MiB).
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Length prefix size in bytes.
pub const LENGTH_PREFIX_SIZE: usize = 4;

/// Protocol errors that can occur during encoding/decoding.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Frame exceeds maximum size.
    #[error("Frame size {0} exceeds maximum {MAX_FRAME_SIZE}")]
    FrameTooLarge(usize),

    /// JSON encoding/decoding error.
    #[error("Codec error: {0}")]
    Json(#[from] serde_json::Error),

    /// Invalid frame data.
    #[error("Invalid frame: {0}")]
    Invalid(String),
}

/// Encode a frame to bytes.
///
/// # Errors
///
/// Returns an error if the frame is too large or serialization fails.
pub fn encode<T: Serialize>(frame: &T) -> Result<Bytes, ProtocolError> {
    let payload = serde_json::to_vec(frame)?;

    if payload.len() > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge(payload.len()));
    }

    let mut buf = BytesMut::with_capacity(LENGTH_PREFIX_SIZE + payload.len());
    buf.put_u32(payload.len() as u32);
    buf.extend_from_slice(&payload);

    Ok(buf.freeze())
}

/// Decode one frame from the front of a streaming buffer.
///
/// Returns `Ok(None)` when the buffer does not yet hold a complete frame;
/// consumed bytes are removed from the buffer on success.
///
/// # Errors
///
/// Returns an error if the frame is oversized or the payload is not valid
/// JSON for `T`.
pub fn decode_from<T: DeserializeOwned>(buf: &mut BytesMut) -> Result<Option<T>, ProtocolError> {
    if buf.len() < LENGTH_PREFIX_SIZE {
        return Ok(None);
    }

    let length = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
    if length > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge(length));
    }

    let total = LENGTH_PREFIX_SIZE + length;
    if buf.len() < total {
        return Ok(None);
    }

    buf.advance(LENGTH_PREFIX_SIZE);
    let payload = buf.split_to(length);
    let frame = serde_json::from_slice(&payload)?;
    Ok(Some(frame))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handshake::Hello;
    use crate::rpc::{Call, RpcFrame};

    #[test]
    fn encode_decode_round_trip() {
        let frame = RpcFrame::Hello(Hello::current());
        let encoded = encode(&frame).unwrap();

        let mut buf = BytesMut::from(&encoded[..]);
        let decoded: RpcFrame = decode_from(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, frame);
        assert!(buf.is_empty());
    }

    #[test]
    fn partial_frames_wait_for_more_bytes() {
        let frame = RpcFrame::Request {
            id: 1,
            call: Call::GetSpec,
        };
        let encoded = encode(&frame).unwrap();

        let mut buf = BytesMut::from(&encoded[..encoded.len() - 1]);
        assert!(decode_from::<RpcFrame>(&mut buf).unwrap().is_none());

        buf.extend_from_slice(&encoded[encoded.len() - 1..]);
        assert!(decode_from::<RpcFrame>(&mut buf).unwrap().is_some());
    }

    #[test]
    fn two_frames_in_one_buffer() {
        let first = RpcFrame::Request {
            id: 1,
            call: Call::GetSpec,
        };
        let second = RpcFrame::Request {
            id: 2,
            call: Call::GetSpec,
        };
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&encode(&first).unwrap());
        buf.extend_from_slice(&encode(&second).unwrap());

        let a: RpcFrame = decode_from(&mut buf).unwrap().unwrap();
        let b: RpcFrame = decode_from(&mut buf).unwrap().unwrap();
        assert_eq!(a, first);
        assert_eq!(b, second);
        assert!(buf.is_empty());
    }

    #[test]
    fn oversized_length_is_rejected() {
        let mut buf = BytesMut::new();
        buf.put_u32((MAX_FRAME_SIZE + 1) as u32);
        buf.extend_from_slice(b"xxxx");
        assert!(matches!(
            decode_from::<RpcFrame>(&mut buf),
            Err(ProtocolError::FrameTooLarge(_))
        ));
    }
}
