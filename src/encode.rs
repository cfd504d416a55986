//! Serialize multipart messages into the wire framing.
//!
//! A wire message is a `u32` big-endian payload length followed by the
//! payload: a `u32` frame count, then for each frame a `u32` length prefix
//! and the frame bytes. The counterpart parsers live in [`crate::parser`].

use bytes::{BufMut, Bytes, BytesMut};

/// Render the framed payload (count + length-prefixed frames) into `buffer`.
pub fn encode_frames<T: BufMut>(frames: &[Bytes], buffer: &mut T) {
    buffer.put_u32(frames.len() as u32);
    for frame in frames {
        buffer.put_u32(frame.len() as u32);
        buffer.put_slice(frame);
    }
}

/// Wire size of the framed payload, excluding the outer length prefix.
pub fn payload_len(frames: &[Bytes]) -> usize {
    4 + frames.iter().map(|f| 4 + f.len()).sum::<usize>()
}

/// Encode a complete wire message: outer length prefix plus framed payload.
pub fn encode_message(frames: &[Bytes]) -> Bytes {
    let payload = payload_len(frames);
    let mut buffer = BytesMut::with_capacity(4 + payload);
    buffer.put_u32(payload as u32);
    encode_frames(frames, &mut buffer);
    buffer.freeze()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::parse_frames;
    use nombytes::NomBytes;

    #[test]
    fn test_payload_len_accounts_for_prefixes() {
        let frames = vec![Bytes::from_static(b"ab"), Bytes::from_static(b"c")];
        // count prefix + two length prefixes + 3 data bytes
        assert_eq!(payload_len(&frames), 4 + 4 + 2 + 4 + 1);
    }

    #[test]
    fn test_message_carries_outer_prefix() {
        let frames = vec![Bytes::from_static(b"hello")];
        let message = encode_message(&frames);
        let declared = u32::from_be_bytes(message[..4].try_into().unwrap()) as usize;
        assert_eq!(declared, message.len() - 4);
    }

    #[test]
    fn test_encoded_payload_parses_back() {
        let frames = vec![
            Bytes::from_static(b"updates"),
            Bytes::from_static(b"node-a_42"),
            Bytes::from_static(b"payload"),
        ];
        let message = encode_message(&frames);
        let payload = message.slice(4..);
        let (rest, parsed) = parse_frames(NomBytes::new(payload)).expect("parse");
        assert!(rest.into_bytes().is_empty());
        assert_eq!(parsed, frames);
    }

    #[test]
    fn test_empty_frame_list() {
        let message = encode_message(&[]);
        assert_eq!(message.as_ref(), &[0, 0, 0, 4, 0, 0, 0, 0]);
    }
}
