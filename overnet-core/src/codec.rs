//! Application message framing.
//!
//! A message is a run of fragments `(tag: u8, length: varint, payload)`:
//!
//! | tag   | fragment         | payload                         |
//! |-------|------------------|---------------------------------|
//! | 1     | transaction id   | varint, at most 31 bits         |
//! | 2     | ordinal          | varint, `1..=u32::MAX`          |
//! | 127   | body             | opaque bytes                    |
//! | 128   | channel fork     | serialized fork frame           |
//!
//! Tags below 64 must be understood by the receiver; tags from 64 up may be
//! skipped; tags from 128 up name handles, are exempt from the ascending-tag
//! rule and may repeat.

use crate::identity::NodeId;
use crate::slice::Slice;
use crate::status::Status;
use crate::varint;

pub const TAG_TRANSACTION_ID: u8 = 1;
pub const TAG_ORDINAL: u8 = 2;
pub const TAG_BODY: u8 = 127;
pub const TAG_CHANNEL_FORK: u8 = 128;

pub const FIRST_SKIPPABLE_TAG: u8 = 64;
pub const FIRST_HANDLE_TAG: u8 = 128;

pub const MAX_TRANSACTION_ID: u32 = 0x7fff_ffff;

/// Transport-specific bounds applied while encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CodecLimits {
    pub max_message_size: usize,
    pub max_forks: usize,
}

impl Default for CodecLimits {
    fn default() -> Self {
        Self {
            max_message_size: 60 * 1024,
            max_forks: 64,
        }
    }
}

fn fragment_size(payload_len: usize) -> usize {
    1 + varint::wire_size_for(payload_len as u64) + payload_len
}

fn put_fragment(out: &mut Vec<u8>, tag: u8, payload: &[u8]) {
    out.push(tag);
    varint::write(payload.len() as u64, out);
    out.extend_from_slice(payload);
}

fn varint_payload(value: u64) -> ([u8; varint::MAX_LEN], usize) {
    let mut tmp = Vec::with_capacity(varint::MAX_LEN);
    varint::write(value, &mut tmp);
    let mut out = [0u8; varint::MAX_LEN];
    out[..tmp.len()].copy_from_slice(&tmp);
    (out, tmp.len())
}

/// Encode one message. `txid == 0` omits the transaction id fragment. `forks`
/// are serialized fork frames, already reserved by the caller; on error the
/// caller still owns them and must fail them.
pub fn encode(
    txid: u32,
    ordinal: u32,
    body: &[u8],
    forks: &[Slice],
    limits: &CodecLimits,
) -> Result<Slice, Status> {
    if ordinal == 0 {
        return Err(Status::failed_precondition("ordinal must be nonzero"));
    }
    if txid > MAX_TRANSACTION_ID {
        return Err(Status::invalid_argument(format!(
            "transaction id {} exceeds 31 bits",
            txid
        )));
    }
    if forks.len() > limits.max_forks {
        return Err(Status::failed_precondition(format!(
            "too many handles: {} (max {})",
            forks.len(),
            limits.max_forks
        )));
    }

    let (txid_buf, txid_len) = varint_payload(u64::from(txid));
    let (ord_buf, ord_len) = varint_payload(u64::from(ordinal));
    let mut total = fragment_size(ord_len) + fragment_size(body.len());
    if txid != 0 {
        total += fragment_size(txid_len);
    }
    total += forks.iter().map(|f| fragment_size(f.len())).sum::<usize>();
    if total > limits.max_message_size {
        return Err(Status::resource_exhausted(format!(
            "message of {} bytes exceeds limit of {}",
            total, limits.max_message_size
        )));
    }

    let mut out = Vec::with_capacity(total);
    if txid != 0 {
        put_fragment(&mut out, TAG_TRANSACTION_ID, &txid_buf[..txid_len]);
    }
    put_fragment(&mut out, TAG_ORDINAL, &ord_buf[..ord_len]);
    put_fragment(&mut out, TAG_BODY, body);
    for fork in forks {
        put_fragment(&mut out, TAG_CHANNEL_FORK, fork);
    }
    debug_assert_eq!(out.len(), total);
    Ok(Slice::from(out))
}

/// Turns an embedded fork frame into something the receiver can keep.
pub trait ForkUnwrapper {
    type Fork;

    fn unwrap_fork_frame(&self, peer: NodeId, frame: Slice) -> Result<Self::Fork, Status>;
}

/// Sink for decoded fragments, called in wire order.
pub trait MessageReceiver<F> {
    fn set_transaction_id(&mut self, txid: u32) -> Result<(), Status>;
    fn set_ordinal(&mut self, ordinal: u32) -> Result<(), Status>;
    fn set_body(&mut self, body: Slice) -> Result<(), Status>;
    fn append_fork(&mut self, fork: F) -> Result<(), Status>;
    /// A handle-class fragment this decoder does not understand was skipped.
    fn unknown_handle(&mut self) -> Result<(), Status>;
}

fn malformed(what: impl std::fmt::Display) -> Status {
    Status::failed_precondition(format!("malformed message: {}", what))
}

fn read_exact_varint(payload: &[u8]) -> Result<u64, Status> {
    let mut cursor = payload;
    let value = varint::read(&mut cursor).ok_or_else(|| malformed("bad varint"))?;
    if !cursor.is_empty() {
        return Err(malformed("trailing bytes after varint"));
    }
    Ok(value)
}

/// Decode `message` from `peer`, reporting fragments to `receiver`. Stops at
/// the first error.
pub fn decode<U, R>(
    message: &Slice,
    peer: NodeId,
    unwrapper: &U,
    receiver: &mut R,
) -> Result<(), Status>
where
    U: ForkUnwrapper + ?Sized,
    R: MessageReceiver<U::Fork> + ?Sized,
{
    let bytes = message.as_bytes();
    let mut offset = 0usize;
    let mut last_ordered_tag: Option<u8> = None;
    let mut saw_ordinal = false;

    while offset < bytes.len() {
        let tag = bytes[offset];
        offset += 1;
        let mut cursor = &bytes[offset..];
        let length = varint::read(&mut cursor).ok_or_else(|| malformed("bad fragment length"))?;
        offset = bytes.len() - cursor.len();
        let remaining = (bytes.len() - offset) as u64;
        if length > remaining {
            return Err(malformed(format!(
                "fragment {} claims {} bytes, {} remain",
                tag, length, remaining
            )));
        }
        let end = offset + length as usize;
        let payload = message.cut(offset..end);
        offset = end;

        if tag < FIRST_HANDLE_TAG {
            if let Some(prev) = last_ordered_tag {
                if tag <= prev {
                    return Err(malformed(format!("fragment {} after {}", tag, prev)));
                }
            }
            last_ordered_tag = Some(tag);
        }

        match tag {
            TAG_TRANSACTION_ID => {
                let txid = read_exact_varint(&payload)?;
                if txid > u64::from(MAX_TRANSACTION_ID) {
                    return Err(malformed("transaction id out of range"));
                }
                receiver.set_transaction_id(txid as u32)?;
            }
            TAG_ORDINAL => {
                let ordinal = read_exact_varint(&payload)?;
                if ordinal == 0 || ordinal > u64::from(u32::MAX) {
                    return Err(malformed("ordinal out of range"));
                }
                saw_ordinal = true;
                receiver.set_ordinal(ordinal as u32)?;
            }
            TAG_BODY => receiver.set_body(payload)?,
            TAG_CHANNEL_FORK => {
                let fork = unwrapper.unwrap_fork_frame(peer, payload)?;
                receiver.append_fork(fork)?;
            }
            t if t < FIRST_SKIPPABLE_TAG => {
                return Err(malformed(format!("unknown required fragment {}", t)));
            }
            t if t >= FIRST_HANDLE_TAG => receiver.unknown_handle()?,
            _ => {}
        }
    }

    if !saw_ordinal {
        return Err(malformed("missing ordinal"));
    }
    Ok(())
}

/// Release a decoded fork that will never be used.
pub trait Discard {
    fn discard(self, status: &Status);
}

/// A fully decoded message.
#[derive(Debug)]
pub struct DecodedMessage<F> {
    /// Zero when the message carried no transaction id.
    pub txid: u32,
    pub ordinal: u32,
    pub body: Slice,
    pub forks: Vec<F>,
    pub unknown_handles: usize,
}

impl<F: Discard> DecodedMessage<F> {
    /// Decode into an owned message. If decoding fails, forks surfaced so far
    /// are discarded with the failure status before it is returned.
    pub fn decode<U>(message: &Slice, peer: NodeId, unwrapper: &U) -> Result<Self, Status>
    where
        U: ForkUnwrapper<Fork = F> + ?Sized,
    {
        let mut decoded = DecodedMessage {
            txid: 0,
            ordinal: 0,
            body: Slice::new(),
            forks: Vec::new(),
            unknown_handles: 0,
        };
        match decode(message, peer, unwrapper, &mut decoded) {
            Ok(()) => Ok(decoded),
            Err(status) => {
                for fork in decoded.forks.drain(..) {
                    fork.discard(&status);
                }
                Err(status)
            }
        }
    }
}

impl<F> MessageReceiver<F> for DecodedMessage<F> {
    fn set_transaction_id(&mut self, txid: u32) -> Result<(), Status> {
        self.txid = txid;
        Ok(())
    }

    fn set_ordinal(&mut self, ordinal: u32) -> Result<(), Status> {
        self.ordinal = ordinal;
        Ok(())
    }

    fn set_body(&mut self, body: Slice) -> Result<(), Status> {
        self.body = body;
        Ok(())
    }

    fn append_fork(&mut self, fork: F) -> Result<(), Status> {
        self.forks.push(fork);
        Ok(())
    }

    fn unknown_handle(&mut self) -> Result<(), Status> {
        self.unknown_handles += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::StreamId;
    use crate::protocol::{ForkFrame, Introduction, ReliabilityAndOrdering};
    use crate::status::StatusCode;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use std::cell::RefCell;

    const PEER: NodeId = NodeId(42);

    /// Unwraps frames into `ForkFrame`s and remembers discards.
    #[derive(Default)]
    struct FrameUnwrapper {
        discarded: RefCell<Vec<StreamId>>,
    }

    #[derive(Debug)]
    struct Unwrapped<'a> {
        frame: ForkFrame,
        log: &'a RefCell<Vec<StreamId>>,
    }

    impl<'a> Discard for Unwrapped<'a> {
        fn discard(self, _status: &Status) {
            self.log.borrow_mut().push(self.frame.stream_id);
        }
    }

    impl ForkUnwrapper for FrameUnwrapper {
        type Fork = ForkFrame;

        fn unwrap_fork_frame(&self, peer: NodeId, frame: Slice) -> Result<ForkFrame, Status> {
            assert_eq!(peer, PEER);
            ForkFrame::decode(&frame)
        }
    }

    impl Discard for ForkFrame {
        fn discard(self, _status: &Status) {}
    }

    struct LoggingUnwrapper<'a>(&'a RefCell<Vec<StreamId>>);

    impl<'a> ForkUnwrapper for LoggingUnwrapper<'a> {
        type Fork = Unwrapped<'a>;

        fn unwrap_fork_frame(&self, _peer: NodeId, frame: Slice) -> Result<Unwrapped<'a>, Status> {
            Ok(Unwrapped {
                frame: ForkFrame::decode(&frame)?,
                log: self.0,
            })
        }
    }

    /// Records every callback; used to check nothing is committed on failure.
    #[derive(Default)]
    struct Recorder {
        ordinals: Vec<u32>,
        txids: Vec<u32>,
        bodies: usize,
    }

    impl MessageReceiver<ForkFrame> for Recorder {
        fn set_transaction_id(&mut self, txid: u32) -> Result<(), Status> {
            self.txids.push(txid);
            Ok(())
        }
        fn set_ordinal(&mut self, ordinal: u32) -> Result<(), Status> {
            self.ordinals.push(ordinal);
            Ok(())
        }
        fn set_body(&mut self, _body: Slice) -> Result<(), Status> {
            self.bodies += 1;
            Ok(())
        }
        fn append_fork(&mut self, _fork: ForkFrame) -> Result<(), Status> {
            Ok(())
        }
        fn unknown_handle(&mut self) -> Result<(), Status> {
            Ok(())
        }
    }

    fn fork_frame(id: u64) -> Slice {
        ForkFrame {
            stream_id: StreamId(id),
            reliability: ReliabilityAndOrdering::ReliableOrdered,
            introduction: Introduction::new("svc"),
        }
        .encode()
        .unwrap()
    }

    fn decode_all(message: &Slice) -> Result<DecodedMessage<ForkFrame>, Status> {
        DecodedMessage::decode(message, PEER, &FrameUnwrapper::default())
    }

    #[test]
    fn roundtrip_sampled_values() {
        let mut rng = StdRng::seed_from_u64(0x0ae7);
        let limits = CodecLimits::default();
        let mut cases = vec![(1u32, 0u32, 0usize), (u32::MAX, MAX_TRANSACTION_ID, 10)];
        for _ in 0..200 {
            cases.push((
                rng.gen_range(1..=u32::MAX),
                rng.gen_range(0..=MAX_TRANSACTION_ID),
                rng.gen_range(0..4096),
            ));
        }
        for (ordinal, txid, body_len) in cases {
            let body: Vec<u8> = (0..body_len).map(|_| rng.gen()).collect();
            let encoded = encode(txid, ordinal, &body, &[], &limits).unwrap();
            let decoded = decode_all(&encoded).unwrap();
            assert_eq!(decoded.ordinal, ordinal);
            assert_eq!(decoded.txid, txid);
            assert_eq!(decoded.body.as_bytes(), body.as_slice());
            if body_len > 0 {
                assert!(decoded.body.is_view_of(&encoded));
            }
        }
    }

    #[test]
    fn zero_txid_is_omitted() {
        let encoded = encode(0, 5, b"hi", &[], &CodecLimits::default()).unwrap();
        assert_eq!(encoded.as_bytes(), &[TAG_ORDINAL, 1, 5, TAG_BODY, 2, b'h', b'i']);
    }

    #[test]
    fn forks_roundtrip_in_order() {
        let forks = vec![fork_frame(3), fork_frame(5)];
        let encoded = encode(9, 1, b"body", &forks, &CodecLimits::default()).unwrap();
        let decoded = decode_all(&encoded).unwrap();
        let ids: Vec<StreamId> = decoded.forks.iter().map(|f| f.stream_id).collect();
        assert_eq!(ids, vec![StreamId(3), StreamId(5)]);
    }

    #[test]
    fn encode_rejects_zero_ordinal_and_limits() {
        let limits = CodecLimits {
            max_message_size: 32,
            max_forks: 1,
        };
        let err = encode(0, 0, b"", &[], &limits).unwrap_err();
        assert_eq!(err.code(), StatusCode::FailedPrecondition);
        let err = encode(0, 1, &[0u8; 64], &[], &limits).unwrap_err();
        assert_eq!(err.code(), StatusCode::ResourceExhausted);
        let err = encode(0, 1, b"", &[fork_frame(1), fork_frame(3)], &limits).unwrap_err();
        assert_eq!(err.code(), StatusCode::FailedPrecondition);
        let err = encode(MAX_TRANSACTION_ID + 1, 1, b"", &[], &limits).unwrap_err();
        assert_eq!(err.code(), StatusCode::InvalidArgument);
    }

    #[test]
    fn zero_ordinal_datagram_commits_nothing() {
        let message = Slice::from(vec![2u8, 1, 0]);
        let mut recorder = Recorder::default();
        let err = decode(&message, PEER, &FrameUnwrapper::default(), &mut recorder).unwrap_err();
        assert_eq!(err.code(), StatusCode::FailedPrecondition);
        assert!(recorder.ordinals.is_empty());
    }

    #[test]
    fn out_of_order_tag_rejected() {
        // ordinal then transaction id
        let message = Slice::from(vec![2u8, 1, 1, 1, 1, 4]);
        let err = decode_all(&message).unwrap_err();
        assert_eq!(err.code(), StatusCode::FailedPrecondition);
        // repeated ordinal
        let message = Slice::from(vec![2u8, 1, 1, 2, 1, 1]);
        assert!(decode_all(&message).is_err());
    }

    #[test]
    fn overlong_fragment_rejected() {
        let message = Slice::from(vec![2u8, 1, 1, 127, 9, 1, 2]);
        let err = decode_all(&message).unwrap_err();
        assert_eq!(err.code(), StatusCode::FailedPrecondition);
    }

    #[test]
    fn oversized_values_rejected() {
        let mut bytes = vec![TAG_TRANSACTION_ID, 5];
        varint::write(u64::from(MAX_TRANSACTION_ID) + 1, &mut bytes);
        bytes.extend_from_slice(&[TAG_ORDINAL, 1, 1]);
        assert!(decode_all(&Slice::from(bytes)).is_err());

        let mut bytes = vec![TAG_ORDINAL, 5];
        varint::write(u64::from(u32::MAX) + 1, &mut bytes);
        assert!(decode_all(&Slice::from(bytes)).is_err());
    }

    #[test]
    fn unknown_tags() {
        // required range fails
        let message = Slice::from(vec![2u8, 1, 1, 10, 0]);
        assert!(decode_all(&message).is_err());
        // skippable range is skipped
        let message = Slice::from(vec![2u8, 1, 1, 70, 2, 0xaa, 0xbb, 127, 1, 7]);
        let decoded = decode_all(&message).unwrap();
        assert_eq!(decoded.body.as_bytes(), &[7]);
        assert_eq!(decoded.unknown_handles, 0);
        // handle range is reported, may repeat, and is exempt from ordering
        let message = Slice::from(vec![2u8, 1, 1, 200, 0, 127, 0, 200, 1, 0]);
        let decoded = decode_all(&message).unwrap();
        assert_eq!(decoded.unknown_handles, 2);
    }

    #[test]
    fn missing_ordinal_rejected() {
        let message = Slice::from(vec![127u8, 1, 1]);
        assert!(decode_all(&message).is_err());
    }

    #[test]
    fn failure_discards_surfaced_forks() {
        let mut bytes = encode(0, 1, b"", &[fork_frame(3)], &CodecLimits::default())
            .unwrap()
            .to_vec();
        // a required fragment after the fork makes the whole message fail
        bytes.extend_from_slice(&[10, 0]);
        let log = RefCell::new(Vec::new());
        let err = DecodedMessage::decode(&Slice::from(bytes), PEER, &LoggingUnwrapper(&log))
            .unwrap_err();
        assert_eq!(err.code(), StatusCode::FailedPrecondition);
        assert_eq!(*log.borrow(), vec![StreamId(3)]);
    }
}
