//! Deserialize multipart messages from the wire framing.
use bytes::Bytes;
use nom::{
    IResult,
    bytes::complete::take,
    multi::many_m_n,
    number::complete::be_u32,
};
use nombytes::NomBytes;

use crate::constants::{MAX_FRAMES_PER_MESSAGE, MAX_MESSAGE_SIZE};
use crate::error::{Error, Result};

/// Parse one length-prefixed frame.
pub fn parse_frame(s: NomBytes) -> IResult<NomBytes, Bytes> {
    let (s, length) = be_u32(s)?;

    // Validate frame size bounds
    if length as usize > MAX_MESSAGE_SIZE {
        return Err(nom::Err::Failure(nom::error::Error::new(
            s,
            nom::error::ErrorKind::TooLarge,
        )));
    }

    let (s, frame) = take(length)(s)?;
    Ok((s, frame.into_bytes()))
}

/// Parse a framed payload: frame count followed by that many frames.
pub fn parse_frames(s: NomBytes) -> IResult<NomBytes, Vec<Bytes>> {
    let (s, count) = be_u32(s)?;

    // Validate frame count bounds
    if count > MAX_FRAMES_PER_MESSAGE {
        return Err(nom::Err::Failure(nom::error::Error::new(
            s,
            nom::error::ErrorKind::TooLarge,
        )));
    }

    many_m_n(count as usize, count as usize, parse_frame)(s)
}

/// Decode a complete payload (outer length prefix already stripped) into its
/// frames, rejecting trailing garbage.
pub fn decode_payload(payload: Bytes) -> Result<Vec<Bytes>> {
    match parse_frames(NomBytes::new(payload.clone())) {
        Ok((rest, frames)) if rest.clone().into_bytes().is_empty() => Ok(frames),
        _ => Err(Error::Parsing(payload)),
    }
}

/// Convert frame bytes to a validated UTF-8 string.
pub fn frame_to_string(frame: &Bytes) -> Result<String> {
    std::str::from_utf8(frame)
        .map(|s| s.to_string())
        .map_err(|_| Error::Parsing(frame.clone()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encode::encode_frames;
    use bytes::{BufMut, BytesMut};

    fn payload_of(frames: &[Bytes]) -> Bytes {
        let mut buffer = BytesMut::new();
        encode_frames(frames, &mut buffer);
        buffer.freeze()
    }

    #[test]
    fn test_decode_payload() {
        let frames = vec![Bytes::from_static(b"heartbeats"), Bytes::from_static(b"a1")];
        let decoded = decode_payload(payload_of(&frames)).expect("decode");
        assert_eq!(decoded, frames);
    }

    #[test]
    fn test_decode_rejects_trailing_garbage() {
        let mut buffer = BytesMut::new();
        encode_frames(&[Bytes::from_static(b"x")], &mut buffer);
        buffer.put_slice(b"junk");
        assert!(matches!(
            decode_payload(buffer.freeze()),
            Err(Error::Parsing(_))
        ));
    }

    #[test]
    fn test_decode_rejects_truncated_frame() {
        let mut buffer = BytesMut::new();
        buffer.put_u32(1);
        buffer.put_u32(10);
        buffer.put_slice(b"short");
        assert!(decode_payload(buffer.freeze()).is_err());
    }

    #[test]
    fn test_decode_rejects_excessive_frame_count() {
        let mut buffer = BytesMut::new();
        buffer.put_u32(MAX_FRAMES_PER_MESSAGE + 1);
        assert!(decode_payload(buffer.freeze()).is_err());
    }

    #[test]
    fn test_decode_rejects_oversized_frame() {
        let mut buffer = BytesMut::new();
        buffer.put_u32(1);
        buffer.put_u32((MAX_MESSAGE_SIZE + 1) as u32);
        assert!(decode_payload(buffer.freeze()).is_err());
    }

    #[test]
    fn test_frame_to_string_rejects_invalid_utf8() {
        assert!(frame_to_string(&Bytes::from_static(b"ok")).is_ok());
        assert!(frame_to_string(&Bytes::from_static(&[0xff, 0xfe])).is_err());
    }
}
