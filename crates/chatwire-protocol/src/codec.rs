//! Codec for encoding and decoding Chatwire frames.
//!
//! Binary frames use MessagePack with length-prefixed framing. Text frames
//! are a single JSON document without a prefix.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

use crate::frames::Frame;

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

    /// Not enough data to decode frame.
    #[error("Incomplete frame: need {0} more bytes")]
    Incomplete(usize),

    /// MessagePack encoding error.
    #[error("Encoding error: {0}")]
    Encode(#[from] rmp_serde::encode::Error),

    /// MessagePack decoding error.
    #[error("Decoding error: {0}")]
    Decode(#[from] rmp_serde::decode::Error),

    /// JSON encoding or decoding error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Encode a frame to bytes.
///
/// The encoded format is:
/// - 4 bytes: Big-endian length prefix
/// - N bytes: MessagePack-encoded frame
///
/// # Errors
///
/// Returns an error if the frame is too large or encoding fails.
pub fn encode(frame: &Frame) -> Result<Bytes, ProtocolError> {
    let mut buf = BytesMut::new();
    encode_into(frame, &mut buf)?;
    Ok(buf.freeze())
}

/// Encode a frame into an existing buffer.
///
/// # Errors
///
/// Returns an error if the frame is too large or encoding fails.
pub fn encode_into(frame: &Frame, buf: &mut BytesMut) -> Result<(), ProtocolError> {
    let payload = rmp_serde::to_vec_named(frame)?;

    if payload.len() > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge(payload.len()));
    }

    buf.reserve(LENGTH_PREFIX_SIZE + payload.len());
    buf.put_u32(payload.len() as u32);
    buf.extend_from_slice(&payload);

    Ok(())
}

/// Decode a frame from bytes.
///
/// # Errors
///
/// Returns an error if the data is incomplete, too large, or invalid.
pub fn decode(data: &[u8]) -> Result<Frame, ProtocolError> {
    if data.len() < LENGTH_PREFIX_SIZE {
        return Err(ProtocolError::Incomplete(LENGTH_PREFIX_SIZE - data.len()));
    }

    let length = u32::from_be_bytes([data[0], data[1], data[2], data[3]]) as usize;

    if length > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge(length));
    }

    let total_size = LENGTH_PREFIX_SIZE + length;
    if data.len() < total_size {
        return Err(ProtocolError::Incomplete(total_size - data.len()));
    }

    let frame = rmp_serde::from_slice(&data[LENGTH_PREFIX_SIZE..total_size])?;
    Ok(frame)
}

/// Try to decode a frame from a buffer, advancing it if successful.
///
/// Returns `Ok(Some(frame))` if a complete frame was decoded,
/// `Ok(None)` if more data is needed, or `Err` on protocol error.
///
/// # Errors
///
/// Returns an error if the frame is too large or invalid.
pub fn decode_from(buf: &mut BytesMut) -> Result<Option<Frame>, ProtocolError> {
    if buf.len() < LENGTH_PREFIX_SIZE {
        return Ok(None);
    }

    let length = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;

    if length > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge(length));
    }

    let total_size = LENGTH_PREFIX_SIZE + length;
    if buf.len() < total_size {
        return Ok(None);
    }

    buf.advance(LENGTH_PREFIX_SIZE);
    let payload = buf.split_to(length);
    let frame = rmp_serde::from_slice(&payload)?;

    Ok(Some(frame))
}

/// Encode a frame as a JSON text document.
///
/// # Errors
///
/// Returns an error if serialization fails.
pub fn encode_json(frame: &Frame) -> Result<String, ProtocolError> {
    Ok(serde_json::to_string(frame)?)
}

/// Decode a frame from a JSON text document.
///
/// # Errors
///
/// Returns an error if the text is too large or not a valid frame.
pub fn decode_json(text: &str) -> Result<Frame, ProtocolError> {
    if text.len() > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge(text.len()));
    }
    Ok(serde_json::from_str(text)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{CallType, EventKind, SignalKind};
    use serde_json::json;

    #[test]
    fn test_encode_decode_mixed_frames() {
        let frames = vec![
            Frame::connect(1, Some("alice".to_string())),
            Frame::join_room(1, "chat-1"),
            Frame::publish_room(
                "chat-1",
                EventKind::ReceiveMessage,
                json!({"message_id": "m1", "text": "hello", "seq": 42}),
            ),
            Frame::InitiateCall {
                id: 2,
                recipient: "bob".to_string(),
                call_type: CallType::Video,
            },
            Frame::Signal {
                call_id: "call-1".to_string(),
                kind: SignalKind::Offer,
                payload: json!({"sdp": "v=0\r\n", "type": "offer"}),
            },
            Frame::error(1, 1005, "Call already in progress"),
            Frame::connected("conn-123", 1, 30000),
        ];

        for frame in frames {
            let encoded = encode(&frame).unwrap();
            let decoded = decode(&encoded).unwrap();
            assert_eq!(frame, decoded);
        }
    }

    #[test]
    fn test_decode_incomplete() {
        let frame = Frame::join_room(1, "test");
        let encoded = encode(&frame).unwrap();

        let partial = &encoded[..5];
        match decode(partial) {
            Err(ProtocolError::Incomplete(_)) => {}
            other => panic!("Expected Incomplete error, got {:?}", other),
        }
    }

    #[test]
    fn test_decode_oversized_prefix() {
        let mut data = BytesMut::new();
        data.put_u32((MAX_FRAME_SIZE + 1) as u32);
        data.extend_from_slice(&[0u8; 8]);

        match decode_from(&mut data) {
            Err(ProtocolError::FrameTooLarge(_)) => {}
            other => panic!("Expected FrameTooLarge error, got {:?}", other),
        }
    }

    #[test]
    fn test_streaming_decode() {
        let frame1 = Frame::join_room(1, "room-a");
        let frame2 = Frame::leave_room(2, "room-a");

        let mut buf = BytesMut::new();
        encode_into(&frame1, &mut buf).unwrap();
        encode_into(&frame2, &mut buf).unwrap();

        // Feed a partial third frame; it must wait for more data.
        let frame3 = encode(&Frame::ping()).unwrap();
        buf.extend_from_slice(&frame3[..2]);

        assert_eq!(decode_from(&mut buf).unwrap().unwrap(), frame1);
        assert_eq!(decode_from(&mut buf).unwrap().unwrap(), frame2);
        assert!(decode_from(&mut buf).unwrap().is_none());

        buf.extend_from_slice(&frame3[2..]);
        assert_eq!(decode_from(&mut buf).unwrap().unwrap(), Frame::ping());
        assert!(buf.is_empty());
    }

    #[test]
    fn test_json_text_frames() {
        let text = r#"{"type":"end_call","id":9,"call_id":"c-9","duration":61}"#;
        let frame = decode_json(text).unwrap();
        assert_eq!(
            frame,
            Frame::EndCall {
                id: 9,
                call_id: "c-9".to_string(),
                duration: 61,
            }
        );

        let out = encode_json(&Frame::ack(9)).unwrap();
        assert_eq!(out, r#"{"type":"ack","id":9}"#);

        assert!(matches!(
            decode_json(r#"{"type":"teleport"}"#),
            Err(ProtocolError::Json(_))
        ));
    }
}
