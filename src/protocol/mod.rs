//! Protocol module - Defines the wire envelope shared by clients and servers
//!
//! Every message on the wire is a tagged envelope:
//! - tag bytes (ASCII timestamp, or `C` + ASCII sequence number)
//! - 1 separator byte (space for timestamps, `|` for counters)
//! - payload bytes
//!
//! Stream transports additionally prefix each envelope with a 2-byte
//! big-endian length (see [`framing`]).

mod envelope;
mod framing;

pub use envelope::*;
pub use framing::*;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Default port used by the demo server and client
pub const DEFAULT_PORT: u16 = 46188;

/// Maximum datagram size, inclusive of tag and separator
pub const MAX_DATAGRAM_SIZE: usize = 65_535;

/// Separator used by the timestamp dialect
pub const TIMESTAMP_SEPARATOR: u8 = b' ';

/// Separator used by the counter dialect
pub const COUNTER_SEPARATOR: u8 = b'|';

/// Prefix of a counter tag
pub const COUNTER_PREFIX: u8 = b'C';

/// "Are you alive" probe byte
pub const ENQ: u8 = 0x05;

/// Probe acknowledgement byte
pub const ACK: u8 = 0x06;

/// Control markers carried as single-byte payloads
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ControlMarker {
    Enq = ENQ,
    Ack = ACK,
}

impl ControlMarker {
    /// The wire byte for this marker
    pub fn byte(self) -> u8 {
        self as u8
    }

    /// Classify a payload as a control marker.
    ///
    /// Only a payload that is exactly one marker byte counts; anything
    /// longer is application data even if it starts with a marker byte.
    pub fn classify(payload: &[u8]) -> Option<Self> {
        match payload {
            [ENQ] => Some(Self::Enq),
            [ACK] => Some(Self::Ack),
            _ => None,
        }
    }
}

/// Tag encoding convention used by a session for its whole lifetime
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Dialect {
    /// Send time in epoch milliseconds, used for latency measurement
    #[default]
    Timestamp,
    /// Wrapping 16-bit sequence number
    Counter,
}

impl Dialect {
    /// Separator byte between tag and payload
    pub fn separator(self) -> u8 {
        match self {
            Dialect::Timestamp => TIMESTAMP_SEPARATOR,
            Dialect::Counter => COUNTER_SEPARATOR,
        }
    }
}

impl fmt::Display for Dialect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Dialect::Timestamp => f.write_str("timestamp"),
            Dialect::Counter => f.write_str("counter"),
        }
    }
}

impl FromStr for Dialect {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "timestamp" | "ts" => Ok(Dialect::Timestamp),
            "counter" | "seq" => Ok(Dialect::Counter),
            other => Err(format!("unknown dialect: {}", other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_control_classification() {
        assert_eq!(ControlMarker::classify(&[ENQ]), Some(ControlMarker::Enq));
        assert_eq!(ControlMarker::classify(&[ACK]), Some(ControlMarker::Ack));
        assert_eq!(ControlMarker::classify(&[ENQ, b'x']), None);
        assert_eq!(ControlMarker::classify(b"G 0"), None);
        assert_eq!(ControlMarker::classify(&[]), None);
    }

    #[test]
    fn test_dialect_parsing() {
        assert_eq!("counter".parse::<Dialect>().unwrap(), Dialect::Counter);
        assert_eq!("Timestamp".parse::<Dialect>().unwrap(), Dialect::Timestamp);
        assert!("bogus".parse::<Dialect>().is_err());
        assert_eq!(Dialect::Counter.separator(), b'|');
        assert_eq!(Dialect::Timestamp.separator(), b' ');
    }
}
