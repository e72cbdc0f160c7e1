//! Framing: length-prefix (4 bytes LE) + bincode payload.

use crate::protocol::Message;

pub const LEN_SIZE: usize = 4;
pub const MAX_FRAME_LEN: u32 = 16 * 1024 * 1024; // 16 MiB

/// Serialize a message body without the length prefix.
pub fn encode_message(msg: &Message) -> Result<Vec<u8>, FrameEncodeError> {
    let payload = bincode::serialize(msg).map_err(FrameEncodeError::Encode)?;
    if payload.len() > MAX_FRAME_LEN as usize {
        return Err(FrameEncodeError::TooLarge);
    }
    Ok(payload)
}

/// Deserialize a message body (no length prefix).
pub fn decode_message(bytes: &[u8]) -> Result<Message, FrameDecodeError> {
    bincode::deserialize(bytes).map_err(FrameDecodeError::Decode)
}

/// Encode a message into a single frame: 4 bytes LE length + bincode payload.
pub fn encode_frame(msg: &Message) -> Result<Vec<u8>, FrameEncodeError> {
    let payload = encode_message(msg)?;
    let mut out = Vec::with_capacity(LEN_SIZE + payload.len());
    out.extend_from_slice(&len_prefix(payload.len())?);
    out.extend_from_slice(&payload);
    Ok(out)
}

/// Length prefix for a frame body of `len` bytes; fails when the peer would refuse it.
pub fn len_prefix(len: usize) -> Result<[u8; LEN_SIZE], FrameEncodeError> {
    match u32::try_from(len) {
        Ok(len) if len <= MAX_FRAME_LEN => Ok(len.to_le_bytes()),
        _ => Err(FrameEncodeError::TooLarge),
    }
}

/// Error encoding a message into a frame (bincode or size limit).
#[derive(Debug, thiserror::Error)]
pub enum FrameEncodeError {
    #[error("encode error: {0}")]
    Encode(#[from] bincode::Error),
    #[error("frame too large")]
    TooLarge,
}

/// Decode one frame from the front of `bytes`. Returns the message and the number of bytes consumed.
/// Call with partial buffer; returns error if not enough bytes (caller should try again after more data).
pub fn decode_frame(bytes: &[u8]) -> Result<(Message, usize), FrameDecodeError> {
    let Some(len_bytes) = bytes.get(..LEN_SIZE) else {
        return Err(FrameDecodeError::NeedMore);
    };
    let len = frame_len(len_bytes)?;
    let Some(body) = bytes.get(LEN_SIZE..LEN_SIZE + len) else {
        return Err(FrameDecodeError::NeedMore);
    };
    Ok((decode_message(body)?, LEN_SIZE + len))
}

/// Parse and bound-check a 4-byte length prefix.
pub fn frame_len(prefix: &[u8]) -> Result<usize, FrameDecodeError> {
    let arr: [u8; LEN_SIZE] = prefix
        .try_into()
        .map_err(|_| FrameDecodeError::NeedMore)?;
    let len = u32::from_le_bytes(arr);
    if len > MAX_FRAME_LEN {
        return Err(FrameDecodeError::TooLarge);
    }
    Ok(len as usize)
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
    use crate::endpoint::EndpointId;
    use crate::protocol::PROTOCOL_VERSION;

    fn sample_advertisement() -> Message {
        Message::Advertisement {
            protocol_version: PROTOCOL_VERSION,
            service_id: "com.kanawish.nearby".to_owned(),
            endpoint_id: EndpointId::new("a1b2c3d4"),
            endpoint_name: "robot".to_owned(),
            listen_port: 45681,
        }
    }

    #[test]
    fn roundtrip_advertisement() {
        let msg = sample_advertisement();
        let frame = encode_frame(&msg).unwrap();
        let (decoded, n) = decode_frame(&frame).unwrap();
        assert_eq!(n, frame.len());
        assert_eq!(decoded, msg);
    }

    #[test]
    fn partial_read_need_more() {
        let frame = encode_frame(&sample_advertisement()).unwrap();
        assert!(matches!(
            decode_frame(&frame[..2]),
            Err(FrameDecodeError::NeedMore)
        ));
        assert!(matches!(
            decode_frame(&frame[..LEN_SIZE]),
            Err(FrameDecodeError::NeedMore)
        ));
        assert!(matches!(
            decode_frame(&frame[..frame.len() - 1]),
            Err(FrameDecodeError::NeedMore)
        ));
    }

    #[test]
    fn oversized_prefix_rejected() {
        let prefix = (MAX_FRAME_LEN + 1).to_le_bytes();
        assert!(matches!(
            decode_frame(&prefix),
            Err(FrameDecodeError::TooLarge)
        ));
    }

    #[test]
    fn prefix_matches_receiver_limit() {
        let max = MAX_FRAME_LEN as usize;
        assert_eq!(frame_len(&len_prefix(max).unwrap()).unwrap(), max);
        // A body at the cap plus an AEAD tag must be refused before it is written.
        assert!(matches!(len_prefix(max + 16), Err(FrameEncodeError::TooLarge)));
    }

    #[test]
    fn multiple_messages() {
        let a = sample_advertisement();
        let b = Message::PayloadChunk {
            payload_id: 9,
            body: vec![1, 2, 3],
        };
        let fa = encode_frame(&a).unwrap();
        let fb = encode_frame(&b).unwrap();
        let mut buf = Vec::new();
        buf.extend_from_slice(&fa);
        buf.extend_from_slice(&fb);
        let (m1, n1) = decode_frame(&buf).unwrap();
        assert_eq!(n1, fa.len());
        let (m2, n2) = decode_frame(&buf[n1..]).unwrap();
        assert_eq!(n2, fb.len());
        assert_eq!(m1, a);
        assert_eq!(m2, b);
    }
}
