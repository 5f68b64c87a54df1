//! Frame codec: length-delimited bincode messages

use bytes::{Bytes, BytesMut};
use thiserror::Error;
use tokio_util::codec::LengthDelimitedCodec;

use crate::messages::ControlMessage;

/// Protocol codec errors
#[derive(Debug, Error)]
pub enum ProtoError {
    #[error("Frame too large: {0} bytes")]
    FrameTooLarge(usize),

    #[error("Encode error: {0}")]
    Encode(#[source] bincode::Error),

    #[error("Decode error: {0}")]
    Decode(#[source] bincode::Error),
}

/// Build the length-delimited codec both sides of the channel use.
///
/// 4-byte big-endian length prefix, payload capped at [`crate::MAX_FRAME_SIZE`].
pub fn codec() -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .length_field_length(4)
        .max_frame_length(crate::MAX_FRAME_SIZE as usize)
        .new_codec()
}

/// Serialize one message into a frame payload.
pub fn encode_message(msg: &ControlMessage) -> Result<Bytes, ProtoError> {
    let payload = bincode::serialize(msg).map_err(ProtoError::Encode)?;
    if payload.len() > crate::MAX_FRAME_SIZE as usize {
        return Err(ProtoError::FrameTooLarge(payload.len()));
    }
    Ok(Bytes::from(payload))
}

/// Deserialize one frame payload into a message.
pub fn decode_message(payload: &BytesMut) -> Result<ControlMessage, ProtoError> {
    bincode::deserialize(payload).map_err(ProtoError::Decode)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_decode() {
        let msg = ControlMessage::Heartbeat { timestamp: 42 };
        let encoded = encode_message(&msg).unwrap();
        let decoded = decode_message(&BytesMut::from(&encoded[..])).unwrap();
        assert_eq!(msg, decoded);
    }

    #[test]
    fn test_oversized_frame_rejected() {
        let msg = ControlMessage::TcpData {
            stream_id: 1,
            data: vec![0u8; crate::MAX_FRAME_SIZE as usize + 1],
        };
        let result = encode_message(&msg);
        assert!(matches!(result, Err(ProtoError::FrameTooLarge(_))));
    }

    #[test]
    fn test_garbage_rejected() {
        let garbage = BytesMut::from(&[0xff, 0xfe, 0xfd][..]);
        assert!(decode_message(&garbage).is_err());
    }
}
