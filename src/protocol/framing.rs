//! Stream framing for envelopes
//!
//! Datagrams carry one bare envelope each. Streams have no message
//! boundaries, so every envelope is preceded by its length as a 2-byte
//! big-endian integer. An envelope never exceeds [`MAX_DATAGRAM_SIZE`],
//! which is exactly what two bytes can express.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

use super::MAX_DATAGRAM_SIZE;

/// Header size: length(2)
const HEADER_SIZE: usize = 2;

/// Framing errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    #[error("Frame too large: {0} bytes (max: {1})")]
    TooLarge(usize, usize),

    #[error("Zero-length frame")]
    Empty,
}

/// Writes length-prefixed frames
#[derive(Debug, Default)]
pub struct FrameEncoder;

impl FrameEncoder {
    pub fn new() -> Self {
        Self
    }

    /// Append one length-prefixed envelope to `buf`
    pub fn encode(&self, envelope: &[u8], buf: &mut BytesMut) -> Result<(), FrameError> {
        if envelope.is_empty() {
            return Err(FrameError::Empty);
        }
        if envelope.len() > MAX_DATAGRAM_SIZE {
            return Err(FrameError::TooLarge(envelope.len(), MAX_DATAGRAM_SIZE));
        }

        buf.reserve(HEADER_SIZE + envelope.len());
        buf.put_u16(envelope.len() as u16);
        buf.put_slice(envelope);
        Ok(())
    }
}

/// Reads length-prefixed frames incrementally
#[derive(Debug, Default)]
pub struct FrameDecoder {
    state: DecodeState,
}

#[derive(Debug, Default)]
enum DecodeState {
    #[default]
    Header,
    Payload {
        length: usize,
    },
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attempt to decode a frame from the buffer
    /// Returns Ok(None) if more data is needed
    pub fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Bytes>, FrameError> {
        loop {
            match self.state {
                DecodeState::Header => {
                    if buf.len() < HEADER_SIZE {
                        return Ok(None);
                    }

                    let length = buf.get_u16() as usize;
                    if length == 0 {
                        return Err(FrameError::Empty);
                    }

                    self.state = DecodeState::Payload { length };
                }
                DecodeState::Payload { length } => {
                    if buf.len() < length {
                        buf.reserve(length - buf.len());
                        return Ok(None);
                    }

                    self.state = DecodeState::Header;
                    return Ok(Some(buf.split_to(length).freeze()));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_multiple_frames_in_one_buffer() {
        let encoder = FrameEncoder::new();
        let mut decoder = FrameDecoder::new();
        let mut buf = BytesMut::new();

        let frames: [&[u8]; 3] = [b"C0|G 0", b"C1|A 0", b"C2|\x05"];
        for frame in &frames {
            encoder.encode(frame, &mut buf).unwrap();
        }

        for frame in &frames {
            let decoded = decoder.decode(&mut buf).unwrap().unwrap();
            assert_eq!(&decoded[..], *frame);
        }
        assert!(decoder.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn test_partial_reads() {
        let encoder = FrameEncoder::new();
        let mut decoder = FrameDecoder::new();
        let mut wire = BytesMut::new();
        encoder.encode(b"1715400000000 sample text", &mut wire).unwrap();

        let mut buf = BytesMut::new();
        let mut out = None;
        for byte in wire.iter() {
            assert!(out.is_none());
            buf.put_u8(*byte);
            out = decoder.decode(&mut buf).unwrap();
        }
        assert_eq!(&out.unwrap()[..], b"1715400000000 sample text");
    }

    #[test]
    fn test_frame_limits() {
        let encoder = FrameEncoder::new();
        let mut buf = BytesMut::new();
        assert_eq!(encoder.encode(b"", &mut buf), Err(FrameError::Empty));

        let big = vec![0u8; MAX_DATAGRAM_SIZE + 1];
        assert!(matches!(
            encoder.encode(&big, &mut buf),
            Err(FrameError::TooLarge(_, _))
        ));

        let mut decoder = FrameDecoder::new();
        let mut zero = BytesMut::from(&[0u8, 0u8][..]);
        assert_eq!(decoder.decode(&mut zero), Err(FrameError::Empty));
    }
}
