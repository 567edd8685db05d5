//! Framing: length-prefix (4 bytes LE) + bincode payload.

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::protocol::PeerMessage;

pub const LEN_SIZE: usize = 4;
pub const MAX_FRAME_LEN: u32 = 16 * 1024 * 1024; // 16 MiB

/// Encode a peer message into a single frame: 4 bytes LE length + bincode payload.
pub fn encode_frame(msg: &PeerMessage) -> Result<Vec<u8>, FrameEncodeError> {
    encode_value(msg)
}

/// Decode one peer message from the front of `bytes`. Returns the message and the number of bytes consumed.
/// Call with partial buffer; returns error if not enough bytes (caller should try again after more data).
pub fn decode_frame(bytes: &[u8]) -> Result<(PeerMessage, usize), FrameDecodeError> {
    decode_value(bytes)
}

/// Frame any serializable value (the C ABI frames `Action`s the same way).
pub fn encode_value<T: Serialize>(value: &T) -> Result<Vec<u8>, FrameEncodeError> {
    let payload = bincode::serialize(value).map_err(FrameEncodeError::Encode)?;
    let len = payload.len() as u32;
    if payload.len() > MAX_FRAME_LEN as usize {
        return Err(FrameEncodeError::TooLarge);
    }
    let mut out = Vec::with_capacity(LEN_SIZE + payload.len());
    out.extend_from_slice(&len.to_le_bytes());
    out.extend_from_slice(&payload);
    Ok(out)
}

pub fn decode_value<T: DeserializeOwned>(bytes: &[u8]) -> Result<(T, usize), FrameDecodeError> {
    if bytes.len() < LEN_SIZE {
        return Err(FrameDecodeError::NeedMore);
    }
    let len = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize;
    if len > MAX_FRAME_LEN as usize {
        return Err(FrameDecodeError::TooLarge);
    }
    if bytes.len() < LEN_SIZE + len {
        return Err(FrameDecodeError::NeedMore);
    }
    let value: T =
        bincode::deserialize(&bytes[LEN_SIZE..LEN_SIZE + len]).map_err(FrameDecodeError::Decode)?;
    Ok((value, LEN_SIZE + len))
}

/// Error encoding a message into a frame (bincode or size limit).
#[derive(Debug, thiserror::Error)]
pub enum FrameEncodeError {
    #[error("encode error: {0}")]
    Encode(#[from] bincode::Error),
    #[error("frame too large")]
    TooLarge,
}

/// Error decoding a frame (need more bytes, too large, or bincode failure).
#[derive(Debug, thiserror::Error)]
pub enum FrameDecodeError {
    #[error("need more bytes")]
    NeedMore,
    #[error("frame too large")]
    TooLarge,
    #[error("decode error: {0}")]
    Decode(#[from] bincode::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tile_reply() -> PeerMessage {
        PeerMessage::new("response 3 5 37.422000 -122.084000 15", vec![0xff, 0xd8, 0xff, 0xe0])
    }

    #[test]
    fn frame_carries_path_and_payload() {
        let msg = tile_reply();
        let frame = encode_frame(&msg).unwrap();
        let (decoded, n) = decode_frame(&frame).unwrap();
        assert_eq!(n, frame.len());
        assert_eq!(decoded, msg);
    }

    #[test]
    fn partial_read_need_more() {
        let frame = encode_frame(&tile_reply()).unwrap();
        assert!(matches!(
            decode_frame(&frame[..2]),
            Err(FrameDecodeError::NeedMore)
        ));
        assert!(matches!(
            decode_frame(&frame[..frame.len() - 1]),
            Err(FrameDecodeError::NeedMore)
        ));
    }

    #[test]
    fn oversized_length_prefix_rejected() {
        let mut bytes = (MAX_FRAME_LEN + 1).to_le_bytes().to_vec();
        bytes.extend_from_slice(&[0u8; 8]);
        assert!(matches!(
            decode_frame(&bytes),
            Err(FrameDecodeError::TooLarge)
        ));
    }

    #[test]
    fn back_to_back_frames() {
        let a = PeerMessage::new("locate", Vec::new());
        let b = tile_reply();
        let mut buf = encode_frame(&a).unwrap();
        let first_len = buf.len();
        buf.extend_from_slice(&encode_frame(&b).unwrap());
        let (m1, n1) = decode_frame(&buf).unwrap();
        assert_eq!(n1, first_len);
        let (m2, _) = decode_frame(&buf[n1..]).unwrap();
        assert_eq!(m1.path, "locate");
        assert_eq!(m2, b);
    }
}
