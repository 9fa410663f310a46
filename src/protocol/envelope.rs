//! Envelope codec
//!
//! Wraps a payload with its tag on the way out and splits tag from payload
//! on the way in. The first occurrence of the dialect's separator marks the
//! tag/payload boundary; tags never contain the separator.

use bytes::{BufMut, Bytes, BytesMut};
use std::fmt;
use thiserror::Error;

use super::{ControlMarker, Dialect, COUNTER_PREFIX, MAX_DATAGRAM_SIZE};

/// Codec errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("Malformed envelope: {0}")]
    MalformedEnvelope(String),

    #[error("Empty payload")]
    EmptyPayload,

    #[error("Envelope too large: {0} bytes (max: {1})")]
    TooLarge(usize, usize),
}

impl CodecError {
    fn malformed(reason: impl Into<String>) -> Self {
        CodecError::MalformedEnvelope(reason.into())
    }
}

/// Per-message metadata prefixed to a payload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Tag {
    /// Send time in milliseconds since the Unix epoch
    Timestamp(u64),
    /// Wrapping sequence number
    Counter(u16),
}

impl Tag {
    /// The dialect this tag belongs to
    pub fn dialect(&self) -> Dialect {
        match self {
            Tag::Timestamp(_) => Dialect::Timestamp,
            Tag::Counter(_) => Dialect::Counter,
        }
    }

    /// Timestamp value, if this is a timestamp tag
    pub fn timestamp_ms(&self) -> Option<u64> {
        match self {
            Tag::Timestamp(ms) => Some(*ms),
            Tag::Counter(_) => None,
        }
    }

    fn write_to(&self, buf: &mut BytesMut) {
        match self {
            Tag::Timestamp(ms) => buf.put_slice(ms.to_string().as_bytes()),
            Tag::Counter(seq) => {
                buf.put_u8(COUNTER_PREFIX);
                buf.put_slice(seq.to_string().as_bytes());
            }
        }
        buf.put_u8(self.dialect().separator());
    }

    fn parse(raw: &[u8], dialect: Dialect) -> Result<Self, CodecError> {
        match dialect {
            Dialect::Timestamp => parse_decimal::<u64>(raw).map(Tag::Timestamp),
            Dialect::Counter => match raw.split_first() {
                Some((&COUNTER_PREFIX, digits)) => parse_decimal::<u16>(digits).map(Tag::Counter),
                _ => Err(CodecError::malformed("counter tag must start with 'C'")),
            },
        }
    }
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Tag::Timestamp(ms) => write!(f, "{}", ms),
            Tag::Counter(seq) => write!(f, "C{}", seq),
        }
    }
}

// `str::parse` accepts a leading '+', so check the digits first.
fn parse_decimal<T: std::str::FromStr>(raw: &[u8]) -> Result<T, CodecError> {
    if raw.is_empty() || !raw.iter().all(u8::is_ascii_digit) {
        return Err(CodecError::malformed(format!(
            "tag is not a decimal number: {:?}",
            String::from_utf8_lossy(raw)
        )));
    }
    std::str::from_utf8(raw)
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| CodecError::malformed("tag out of range"))
}

/// A decoded envelope
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub tag: Tag,
    pub payload: Bytes,
}

impl Envelope {
    pub fn new(tag: Tag, payload: impl Into<Bytes>) -> Self {
        Self {
            tag,
            payload: payload.into(),
        }
    }

    /// A single-byte control envelope
    pub fn control(tag: Tag, marker: ControlMarker) -> Self {
        Self::new(tag, Bytes::copy_from_slice(&[marker.byte()]))
    }

    /// The control marker carried by this envelope, if it is a bare control byte
    pub fn control_marker(&self) -> Option<ControlMarker> {
        ControlMarker::classify(&self.payload)
    }

    /// Encode this envelope
    pub fn encode(&self) -> Result<Bytes, CodecError> {
        encode(&self.payload, self.tag)
    }
}

/// Encode a payload with its tag into a buffer
pub fn encode_into(payload: &[u8], tag: Tag, buf: &mut BytesMut) -> Result<(), CodecError> {
    if payload.is_empty() {
        return Err(CodecError::EmptyPayload);
    }

    let start = buf.len();
    tag.write_to(buf);
    let total = buf.len() - start + payload.len();
    if total > MAX_DATAGRAM_SIZE {
        buf.truncate(start);
        return Err(CodecError::TooLarge(total, MAX_DATAGRAM_SIZE));
    }

    buf.put_slice(payload);
    Ok(())
}

/// Encode a payload with its tag: `tag | separator | payload`
pub fn encode(payload: &[u8], tag: Tag) -> Result<Bytes, CodecError> {
    let mut buf = BytesMut::with_capacity(payload.len() + 24);
    encode_into(payload, tag, &mut buf)?;
    Ok(buf.freeze())
}

/// Decode a raw envelope using the given dialect
pub fn decode(frame: &[u8], dialect: Dialect) -> Result<Envelope, CodecError> {
    let separator = dialect.separator();
    let boundary = frame
        .iter()
        .position(|&b| b == separator)
        .ok_or_else(|| CodecError::malformed("separator not found"))?;

    let tag = Tag::parse(&frame[..boundary], dialect)?;

    let payload = &frame[boundary + 1..];
    if payload.is_empty() {
        return Err(CodecError::malformed("empty payload"));
    }

    Ok(Envelope::new(tag, Bytes::copy_from_slice(payload)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{ACK, ENQ};

    #[test]
    fn test_timestamp_wire_format() {
        let bytes = encode(b"G 0", Tag::Timestamp(1715400000123)).unwrap();
        assert_eq!(&bytes[..], b"1715400000123 G 0");
    }

    #[test]
    fn test_counter_wire_format() {
        let bytes = encode(&[ENQ], Tag::Counter(42)).unwrap();
        assert_eq!(&bytes[..], b"C42|\x05");
    }

    #[test]
    fn test_decode_splits_on_first_separator() {
        let env = decode(b"17 S 1 103 204", Dialect::Timestamp).unwrap();
        assert_eq!(env.tag, Tag::Timestamp(17));
        assert_eq!(&env.payload[..], b"S 1 103 204");

        let env = decode(b"C7|a|b", Dialect::Counter).unwrap();
        assert_eq!(env.tag, Tag::Counter(7));
        assert_eq!(&env.payload[..], b"a|b");
    }

    #[test]
    fn test_roundtrip_both_dialects() {
        let sizes = [1usize, 2, 100, 1400, 65_000];
        for &size in &sizes {
            let payload: Vec<u8> = (0..size).map(|i| (i % 251) as u8).collect();
            for tag in [Tag::Timestamp(1_700_000_000_000), Tag::Counter(65_535)] {
                let bytes = encode(&payload, tag).unwrap();
                let env = decode(&bytes, tag.dialect()).unwrap();
                assert_eq!(env.tag, tag);
                assert_eq!(&env.payload[..], &payload[..]);
            }
        }
    }

    #[test]
    fn test_missing_separator() {
        let err = decode(b"1234567", Dialect::Timestamp).unwrap_err();
        assert!(matches!(err, CodecError::MalformedEnvelope(_)));

        let err = decode(b"C12 no pipe", Dialect::Counter).unwrap_err();
        assert!(matches!(err, CodecError::MalformedEnvelope(_)));
    }

    #[test]
    fn test_empty_payload_rejected() {
        assert!(matches!(
            decode(b"C1|", Dialect::Counter),
            Err(CodecError::MalformedEnvelope(_))
        ));
        assert_eq!(encode(b"", Tag::Counter(1)), Err(CodecError::EmptyPayload));
    }

    #[test]
    fn test_unparsable_tags() {
        for raw in [&b"12a4 x"[..], b" x", b"+12 x", b"99999999999999999999999 x"] {
            assert!(decode(raw, Dialect::Timestamp).is_err(), "{:?}", raw);
        }
        for raw in [&b"12|x"[..], b"C|x", b"C65536|x", b"c1|x"] {
            assert!(decode(raw, Dialect::Counter).is_err(), "{:?}", raw);
        }
    }

    #[test]
    fn test_oversized_envelope() {
        let payload = vec![b'x'; MAX_DATAGRAM_SIZE];
        let err = encode(&payload, Tag::Counter(0)).unwrap_err();
        assert!(matches!(err, CodecError::TooLarge(_, MAX_DATAGRAM_SIZE)));

        // Exactly at the limit is fine
        let payload = vec![b'x'; MAX_DATAGRAM_SIZE - 3];
        assert_eq!(encode(&payload, Tag::Counter(0)).unwrap().len(), MAX_DATAGRAM_SIZE);
    }

    #[test]
    fn test_control_envelope() {
        let env = Envelope::control(Tag::Counter(3), ControlMarker::Ack);
        assert_eq!(&env.encode().unwrap()[..], b"C3|\x06");
        assert_eq!(env.control_marker(), Some(ControlMarker::Ack));

        let data = Envelope::new(Tag::Counter(3), vec![ACK, b'!']);
        assert_eq!(data.control_marker(), None);
    }
}
