//! Routed frames between nodes: 2 bytes LE header length + bincode header +
//! payload. The payload is never copied on decode.

use serde::{Deserialize, Serialize};

use crate::identity::{NodeId, StreamId};
use crate::slice::Slice;
use crate::status::Status;

const LEN_SIZE: usize = 2;
/// Upper bound on an encoded frame (64 KiB minus the length prefix).
pub const MAX_FRAME_LEN: usize = 64 * 1024 - LEN_SIZE;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FrameKind {
    /// Stream payload with the stream's send sequence number.
    Data { seq: u64 },
    /// Acknowledges `Data { seq }` on the same stream.
    Ack { seq: u64 },
    /// `Data { seq }` arrived and is queued but has not been read yet.
    Held { seq: u64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameHeader {
    pub src: NodeId,
    pub dst: NodeId,
    pub stream_id: StreamId,
    pub kind: FrameKind,
}

#[derive(Debug, Clone)]
pub struct Frame {
    pub header: FrameHeader,
    pub payload: Slice,
}

pub fn encode_frame(header: &FrameHeader, payload: &[u8]) -> Result<Slice, WireError> {
    let head = bincode::serialize(header)?;
    let total = LEN_SIZE + head.len() + payload.len();
    if total > MAX_FRAME_LEN {
        return Err(WireError::TooLarge { size: total });
    }
    let mut out = Vec::with_capacity(total);
    out.extend_from_slice(&(head.len() as u16).to_le_bytes());
    out.extend_from_slice(&head);
    out.extend_from_slice(payload);
    Ok(Slice::from(out))
}

pub fn decode_frame(bytes: &Slice) -> Result<Frame, WireError> {
    if bytes.len() > MAX_FRAME_LEN {
        return Err(WireError::TooLarge { size: bytes.len() });
    }
    if bytes.len() < LEN_SIZE {
        return Err(WireError::Truncated);
    }
    let head_len = u16::from_le_bytes([bytes[0], bytes[1]]) as usize;
    if bytes.len() < LEN_SIZE + head_len {
        return Err(WireError::Truncated);
    }
    let header: FrameHeader = bincode::deserialize(&bytes[LEN_SIZE..LEN_SIZE + head_len])?;
    Ok(Frame {
        header,
        payload: bytes.cut(LEN_SIZE + head_len..bytes.len()),
    })
}

#[derive(Debug, thiserror::Error)]
pub enum WireError {
    #[error("frame too large: {size} bytes")]
    TooLarge { size: usize },
    #[error("truncated frame")]
    Truncated,
    #[error("header error: {0}")]
    Header(#[from] bincode::Error),
}

impl From<WireError> for Status {
    fn from(e: WireError) -> Self {
        match e {
            WireError::TooLarge { .. } => Status::resource_exhausted(e.to_string()),
            _ => Status::failed_precondition(e.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header(kind: FrameKind) -> FrameHeader {
        FrameHeader {
            src: NodeId(1),
            dst: NodeId(2),
            stream_id: StreamId(5),
            kind,
        }
    }

    #[test]
    fn roundtrip_keeps_payload_view() {
        let encoded = encode_frame(&header(FrameKind::Data { seq: 9 }), b"payload").unwrap();
        let frame = decode_frame(&encoded).unwrap();
        assert_eq!(frame.header, header(FrameKind::Data { seq: 9 }));
        assert_eq!(frame.payload.as_bytes(), b"payload");
        assert!(frame.payload.is_view_of(&encoded));
    }

    #[test]
    fn empty_payload_ack() {
        let encoded = encode_frame(&header(FrameKind::Ack { seq: 3 }), &[]).unwrap();
        let frame = decode_frame(&encoded).unwrap();
        assert!(frame.payload.is_empty());
        assert!(matches!(frame.header.kind, FrameKind::Ack { seq: 3 }));
    }

    #[test]
    fn truncated_and_oversized() {
        let encoded = encode_frame(&header(FrameKind::Data { seq: 1 }), b"x").unwrap();
        assert!(matches!(
            decode_frame(&encoded.cut(0..1)),
            Err(WireError::Truncated)
        ));
        assert!(matches!(
            decode_frame(&encoded.cut(0..4)),
            Err(WireError::Truncated) | Err(WireError::Header(_))
        ));
        let big = vec![0u8; MAX_FRAME_LEN];
        assert!(matches!(
            encode_frame(&header(FrameKind::Data { seq: 1 }), &big),
            Err(WireError::TooLarge { .. })
        ));
    }
}
