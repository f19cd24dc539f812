//! Codec for encoding and decoding media frames.

use crate::frame::{FrameFlags, FrameKind, MediaFrame};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use uuid::Uuid;

/// Error type for codec operations
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum CodecError {
    /// Insufficient data to decode
    #[error("Insufficient data")]
    InsufficientData,

    /// Invalid frame format
    #[error("Invalid frame format: {0}")]
    InvalidFormat(String),

    /// Unsupported version
    #[error("Unsupported version: {0}")]
    UnsupportedVersion(u8),

    /// Invalid frame kind
    #[error("Invalid frame kind: {0}")]
    InvalidFrameKind(u8),
}

/// Encode a media frame to bytes
///
/// # Errors
///
/// Returns `InvalidFormat` if the payload exceeds [`MediaFrame::MAX_PAYLOAD_SIZE`].
pub fn encode_frame(frame: &MediaFrame) -> Result<Bytes, CodecError> {
    let payload_len = frame.payload.len();
    if payload_len > MediaFrame::MAX_PAYLOAD_SIZE {
        return Err(CodecError::InvalidFormat(format!(
            "payload of {payload_len} bytes exceeds {}",
            MediaFrame::MAX_PAYLOAD_SIZE
        )));
    }

    let mut buf = BytesMut::with_capacity(MediaFrame::HEADER_SIZE + payload_len);

    buf.put_u8(frame.version);
    buf.put_u8(frame.kind as u8);
    buf.put_slice(frame.publisher.as_bytes());
    buf.put_u64(frame.timestamp);
    buf.put_u32(frame.sequence);
    // Bounded by MAX_PAYLOAD_SIZE above
    #[allow(clippy::cast_possible_truncation)]
    buf.put_u32(payload_len as u32);
    buf.put_u16(frame.flags.to_u16());
    // Reserved
    buf.put_bytes(0, 2);
    buf.extend_from_slice(&frame.payload);

    Ok(buf.freeze())
}

/// Decode a media frame from bytes
///
/// # Errors
///
/// Returns an error if the header is truncated, the version or kind is
/// unknown, or the declared payload is larger than the limit or than the
/// remaining buffer.
pub fn decode_frame(data: &mut impl Buf) -> Result<MediaFrame, CodecError> {
    if data.remaining() < MediaFrame::HEADER_SIZE {
        return Err(CodecError::InsufficientData);
    }

    let version = data.get_u8();
    if version != MediaFrame::VERSION {
        return Err(CodecError::UnsupportedVersion(version));
    }

    let raw_kind = data.get_u8();
    let kind = FrameKind::from_u8(raw_kind).ok_or(CodecError::InvalidFrameKind(raw_kind))?;

    let mut publisher = [0u8; 16];
    data.copy_to_slice(&mut publisher);
    let publisher = Uuid::from_bytes(publisher);

    let timestamp = data.get_u64();
    let sequence = data.get_u32();
    let payload_len = data.get_u32() as usize;
    let flags = FrameFlags::from_u16(data.get_u16());
    data.advance(2);

    if payload_len > MediaFrame::MAX_PAYLOAD_SIZE {
        return Err(CodecError::InvalidFormat(format!(
            "declared payload of {payload_len} bytes exceeds {}",
            MediaFrame::MAX_PAYLOAD_SIZE
        )));
    }

    if data.remaining() < payload_len {
        return Err(CodecError::InsufficientData);
    }

    let payload = data.copy_to_bytes(payload_len);

    Ok(MediaFrame {
        version,
        kind,
        publisher,
        timestamp,
        sequence,
        flags,
        payload,
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::indexing_slicing)]
mod tests {
    use super::*;

    fn sample(kind: FrameKind) -> MediaFrame {
        let mut frame = MediaFrame::new(kind, Uuid::new_v4(), 42, Bytes::from_static(b"payload"));
        frame.timestamp = 1_700_000_000_000_000;
        frame.flags = FrameFlags {
            end_of_frame: true,
            discardable: kind == FrameKind::ScreenDelta,
        };
        frame
    }

    #[test]
    fn test_encode_decode() {
        let frame = sample(FrameKind::ScreenDelta);
        let mut encoded = encode_frame(&frame).unwrap();
        assert_eq!(encoded.len(), MediaFrame::HEADER_SIZE + 7);

        let decoded = decode_frame(&mut encoded).unwrap();
        assert_eq!(decoded, frame);
    }

    #[test]
    fn test_truncated_header() {
        let mut buf = Bytes::from_static(&[1, 0, 0]);
        assert_eq!(decode_frame(&mut buf), Err(CodecError::InsufficientData));
    }

    #[test]
    fn test_unknown_version_rejected() {
        let mut encoded = BytesMut::from(&encode_frame(&sample(FrameKind::Audio)).unwrap()[..]);
        encoded[0] = 9;
        assert_eq!(
            decode_frame(&mut encoded.freeze()),
            Err(CodecError::UnsupportedVersion(9))
        );
    }

    #[test]
    fn test_unknown_kind_rejected() {
        let mut encoded = BytesMut::from(&encode_frame(&sample(FrameKind::Audio)).unwrap()[..]);
        encoded[1] = 0x7f;
        assert_eq!(
            decode_frame(&mut encoded.freeze()),
            Err(CodecError::InvalidFrameKind(0x7f))
        );
    }

    #[test]
    fn test_payload_shorter_than_declared() {
        let encoded = encode_frame(&sample(FrameKind::Audio)).unwrap();
        let mut cut = encoded.slice(..encoded.len() - 3);
        assert_eq!(decode_frame(&mut cut), Err(CodecError::InsufficientData));
    }

    #[test]
    fn test_oversized_declared_payload_rejected() {
        let mut encoded = BytesMut::from(&encode_frame(&sample(FrameKind::Audio)).unwrap()[..]);
        // Payload length lives at offset 30..34
        encoded[30..34].copy_from_slice(&u32::MAX.to_be_bytes());
        assert!(matches!(
            decode_frame(&mut encoded.freeze()),
            Err(CodecError::InvalidFormat(_))
        ));
    }

    #[test]
    fn test_oversized_payload_not_encoded() {
        let frame = MediaFrame::new(
            FrameKind::ScreenKey,
            Uuid::new_v4(),
            0,
            Bytes::from(vec![0u8; MediaFrame::MAX_PAYLOAD_SIZE + 1]),
        );
        assert!(matches!(
            encode_frame(&frame),
            Err(CodecError::InvalidFormat(_))
        ));
    }
}
