//! Transport module - Socket adapters the session layer sends frames through
//!
//! Provides:
//! - [`UdpTransport`] for datagram sessions (connected client or bound server)
//! - [`TcpTransport`] for stream sessions, with length-prefixed framing
//! - [`Transport`], the seam the session layer is written against

mod tcp;
mod udp;

pub use tcp::*;
pub use udp::*;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::str::FromStr;

/// Which socket type a session runs over
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    #[default]
    Udp,
    Tcp,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportKind::Udp => f.write_str("udp"),
            TransportKind::Tcp => f.write_str("tcp"),
        }
    }
}

impl FromStr for TransportKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "udp" => Ok(TransportKind::Udp),
            "tcp" => Ok(TransportKind::Tcp),
            other => Err(format!("unknown transport: {}", other)),
        }
    }
}

/// A socket endpoint that moves whole envelopes.
///
/// `recv_frame` must be cancel safe: dropping it before completion loses no
/// data, so callers can race it against timers and queues.
#[async_trait]
pub trait Transport: Send {
    /// Socket type behind this transport
    fn kind(&self) -> TransportKind;

    /// Local bound address
    fn local_addr(&self) -> io::Result<SocketAddr>;

    /// Configured peer, if the transport is connected to one
    fn peer_addr(&self) -> Option<SocketAddr>;

    /// Send one envelope. `dest` overrides the connected peer for
    /// unconnected datagram sockets and is ignored by streams.
    async fn send_frame(&mut self, frame: &[u8], dest: Option<SocketAddr>) -> io::Result<()>;

    /// Wait for the next envelope and its source address
    async fn recv_frame(&mut self) -> io::Result<(Bytes, SocketAddr)>;

    /// Release the socket. Calling it again is a no-op.
    async fn close(&mut self) -> io::Result<()>;

    /// Whether `close` has been called
    fn is_closed(&self) -> bool;
}

/// Resolve a hostname to a socket address
pub async fn resolve_host(host: &str, port: u16) -> io::Result<SocketAddr> {
    use tokio::net::lookup_host;

    let addr_string = format!("{}:{}", host, port);
    let mut addrs = lookup_host(&addr_string).await?;

    addrs.next().ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::NotFound,
            format!("Could not resolve host: {}", host),
        )
    })
}

pub(crate) fn closed_error() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "transport closed")
}
