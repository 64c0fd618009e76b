//! Multi-vnode write envelope
//!
//! An envelope is a plain concatenation of records with no leading count:
//!
//! ```text
//! | vnode_id: u32 BE | len: u32 BE | payload: len bytes | vnode_id | len | ... |
//! ```
//!
//! Parsing stops when the buffer is exhausted. Any record whose header or
//! payload runs past the end rejects the whole envelope.

use crate::core::error::EnvelopeError;
use crate::core::types::VnodeId;
use bytes::{BufMut, Bytes, BytesMut};

/// Size of a record header in bytes
pub const RECORD_HEADER_SIZE: usize = 8;

/// One vnode's slice of an envelope
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SubPayload {
    /// Target vnode
    pub vnode: VnodeId,
    /// Zero-copy slice of the envelope body
    pub payload: Bytes,
}

/// Split an envelope into its per-vnode records.
///
/// The returned payloads share `body`'s allocation.
pub fn split_envelope(body: &Bytes) -> Result<Vec<SubPayload>, EnvelopeError> {
    let mut records = Vec::new();
    let mut offset = 0;

    while offset < body.len() {
        let remaining = body.len() - offset;
        if remaining < RECORD_HEADER_SIZE {
            return Err(EnvelopeError::TruncatedHeader { offset, remaining });
        }
        let header = &body[offset..offset + RECORD_HEADER_SIZE];
        let vnode = u32::from_be_bytes([header[0], header[1], header[2], header[3]]);
        let declared = u32::from_be_bytes([header[4], header[5], header[6], header[7]]) as usize;

        let start = offset + RECORD_HEADER_SIZE;
        let available = body.len() - start;
        if declared > available {
            return Err(EnvelopeError::LengthOverrun {
                offset,
                declared,
                remaining: available,
            });
        }

        records.push(SubPayload {
            vnode: VnodeId(vnode),
            payload: body.slice(start..start + declared),
        });
        offset = start + declared;
    }

    if records.is_empty() {
        return Err(EnvelopeError::Empty);
    }
    Ok(records)
}

/// Build an envelope from `(vnode, payload)` records
pub fn encode_envelope<'a, I>(records: I) -> Bytes
where
    I: IntoIterator<Item = (VnodeId, &'a [u8])>,
{
    let mut buf = BytesMut::new();
    for (vnode, payload) in records {
        buf.reserve(RECORD_HEADER_SIZE + payload.len());
        buf.put_u32(vnode.0);
        buf.put_u32(payload.len() as u32);
        buf.put_slice(payload);
    }
    buf.freeze()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn splits_two_vnode_envelope() {
        let body = encode_envelope([(VnodeId(1), &b"a"[..]), (VnodeId(2), &b"bc"[..])]);
        let records = split_envelope(&body).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].vnode, VnodeId(1));
        assert_eq!(&records[0].payload[..], b"a");
        assert_eq!(records[1].vnode, VnodeId(2));
        assert_eq!(&records[1].payload[..], b"bc");
    }

    #[test]
    fn empty_payload_record_is_valid() {
        let body = encode_envelope([(VnodeId(5), &b""[..])]);
        let records = split_envelope(&body).unwrap();
        assert_eq!(records, vec![SubPayload { vnode: VnodeId(5), payload: Bytes::new() }]);
    }

    #[test]
    fn empty_envelope_is_rejected() {
        assert_eq!(split_envelope(&Bytes::new()), Err(EnvelopeError::Empty));
    }

    #[test]
    fn overrun_rejects_whole_envelope() {
        let mut raw = encode_envelope([(VnodeId(1), &b"ok"[..])]).to_vec();
        raw.extend_from_slice(&2u32.to_be_bytes());
        raw.extend_from_slice(&10u32.to_be_bytes());
        raw.extend_from_slice(b"short");

        let err = split_envelope(&Bytes::from(raw)).unwrap_err();
        assert_eq!(
            err,
            EnvelopeError::LengthOverrun { offset: 10, declared: 10, remaining: 5 }
        );
    }

    #[test]
    fn trailing_partial_header_is_rejected() {
        let mut raw = encode_envelope([(VnodeId(1), &b"x"[..])]).to_vec();
        raw.extend_from_slice(&[0, 0, 0]);
        let err = split_envelope(&Bytes::from(raw)).unwrap_err();
        assert_eq!(err, EnvelopeError::TruncatedHeader { offset: 9, remaining: 3 });
    }

    #[test]
    fn payloads_share_the_request_buffer() {
        let body = encode_envelope([(VnodeId(1), &b"shared"[..])]);
        let records = split_envelope(&body).unwrap();
        let base = body.as_ptr() as usize;
        let slice = records[0].payload.as_ptr() as usize;
        assert_eq!(slice - base, RECORD_HEADER_SIZE);
    }

    proptest! {
        #[test]
        fn arbitrary_records_split_back(
            records in proptest::collection::vec(
                (any::<u32>(), proptest::collection::vec(any::<u8>(), 0..64)),
                1..16,
            )
        ) {
            let body = encode_envelope(records.iter().map(|(v, p)| (VnodeId(*v), p.as_slice())));
            let split = split_envelope(&body).unwrap();
            prop_assert_eq!(split.len(), records.len());
            for (got, (vnode, payload)) in split.iter().zip(&records) {
                prop_assert_eq!(got.vnode, VnodeId(*vnode));
                prop_assert_eq!(&got.payload[..], payload.as_slice());
            }
        }

        #[test]
        fn truncated_envelopes_never_parse(
            payload in proptest::collection::vec(any::<u8>(), 1..64),
            cut in 1usize..64,
        ) {
            let body = encode_envelope([(VnodeId(3), payload.as_slice())]);
            let cut = cut.min(body.len() - 1);
            let truncated = body.slice(..body.len() - cut);
            prop_assert!(split_envelope(&truncated).is_err());
        }
    }
}
