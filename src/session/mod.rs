//! Session module - One logical connection between a local endpoint and a peer
//!
//! A [`Session`] owns:
//! - one transport (datagram or stream)
//! - the dialect its envelopes are tagged with
//! - the wrapping sequence counter
//! - the latency tracker for inbound envelopes
//!
//! Server-side sessions answer bare `ENQ` probes inside [`Session::receive`],
//! so probes never reach the application.

mod latency;
mod prober;

pub use latency::*;
pub use prober::*;

use bytes::Bytes;
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::time::Instant;
use uuid::Uuid;

use crate::protocol::{self, CodecError, ControlMarker, Dialect, Envelope, Tag};
use crate::transport::{TcpTransport, Transport, TransportKind, UdpTransport};

/// Session errors
#[derive(Error, Debug)]
pub enum SessionError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Transport error: {0}")]
    Transport(#[from] io::Error),

    #[error("{0}")]
    Malformed(#[from] CodecError),

    #[error("Timed out waiting for data")]
    Timeout,

    #[error("No peer address known yet")]
    NoPeer,

    #[error("Session closed")]
    Closed,

    #[error("Cancelled")]
    Cancelled,
}

impl SessionError {
    /// Expected, recoverable absence of data
    pub fn is_timeout(&self) -> bool {
        matches!(self, SessionError::Timeout)
    }
}

pub type SessionResult<T> = Result<T, SessionError>;

/// Which end of the conversation a session is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Initiates the session and probes the peer
    Client,
    /// Answers probes; learns its peer from inbound traffic
    Server,
}

/// Wrapping 16-bit sequence counter
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SequenceCounter(u16);

impl SequenceCounter {
    pub fn new() -> Self {
        Self(0)
    }

    /// Value the next data envelope will carry
    pub fn current(&self) -> u16 {
        self.0
    }

    /// Take the current value and advance, wrapping 65535 -> 0
    pub fn next(&mut self) -> u16 {
        let value = self.0;
        self.0 = self.0.wrapping_add(1);
        value
    }
}

/// Options shared by every session constructor
#[derive(Clone)]
pub struct SessionOptions {
    pub dialect: Dialect,
    /// Bound on establishing a stream connection
    pub connect_timeout: Duration,
    pub clock: Arc<dyn Clock>,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            dialect: Dialect::default(),
            connect_timeout: Duration::from_millis(5000),
            clock: Arc::new(SystemClock),
        }
    }
}

impl SessionOptions {
    pub fn new(dialect: Dialect) -> Self {
        Self {
            dialect,
            ..Default::default()
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }
}

/// An envelope handed to the application
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Received {
    pub tag: Tag,
    pub payload: Bytes,
    pub source: SocketAddr,
}

/// Session statistics
#[derive(Debug, Default, Clone)]
pub struct SessionStats {
    /// Envelopes sent, control envelopes included
    pub frames_sent: u64,
    /// Frames received, malformed ones included
    pub frames_received: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    /// Frames dropped because they failed to decode
    pub malformed_dropped: u64,
    /// Probes answered with ACK (server side)
    pub probes_answered: u64,
}

/// One transport endpoint plus its tagging state
pub struct Session {
    id: Uuid,
    transport: Box<dyn Transport>,
    role: Role,
    dialect: Dialect,
    sequence: SequenceCounter,
    latency: LatencyTracker,
    clock: Arc<dyn Clock>,
    /// Configured peer (client) or last source seen (server)
    peer: Option<SocketAddr>,
    connected: bool,
    last_inbound: Instant,
    stats: SessionStats,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("role", &self.role)
            .field("dialect", &self.dialect)
            .field("kind", &self.transport.kind())
            .field("peer", &self.peer)
            .field("connected", &self.connected)
            .finish()
    }
}

impl Session {
    /// Wrap an already-open transport
    pub fn new(transport: Box<dyn Transport>, role: Role, options: &SessionOptions) -> Self {
        let peer = transport.peer_addr();
        Self {
            id: Uuid::new_v4(),
            transport,
            role,
            dialect: options.dialect,
            sequence: SequenceCounter::new(),
            latency: LatencyTracker::new(),
            clock: options.clock.clone(),
            peer,
            connected: false,
            last_inbound: Instant::now(),
            stats: SessionStats::default(),
        }
    }

    /// Open a client-side session to `host:port`
    pub async fn connect(
        kind: TransportKind,
        host: &str,
        port: u16,
        options: &SessionOptions,
    ) -> SessionResult<Self> {
        if host.trim().is_empty() {
            return Err(SessionError::Configuration("No host specified".to_string()));
        }
        if port == 0 {
            return Err(SessionError::Configuration("No port specified".to_string()));
        }

        let transport: Box<dyn Transport> = match kind {
            TransportKind::Udp => Box::new(UdpTransport::connect(host, port).await?),
            TransportKind::Tcp => {
                Box::new(TcpTransport::connect(host, port, options.connect_timeout).await?)
            }
        };

        let session = Self::new(transport, Role::Client, options);
        tracing::info!(
            session = %session.id,
            "Sending to {}://{}:{} ({} dialect)",
            kind,
            host,
            port,
            options.dialect
        );
        Ok(session)
    }

    /// Bind a server-side datagram session
    pub async fn bind_udp(addr: SocketAddr, options: &SessionOptions) -> SessionResult<Self> {
        let transport = UdpTransport::bind(addr).await?;
        let mut session = Self::new(Box::new(transport), Role::Server, options);
        session.connected = true;
        Ok(session)
    }

    /// Wrap an accepted stream as a server-side session
    pub fn from_tcp_stream(stream: TcpStream, options: &SessionOptions) -> SessionResult<Self> {
        let transport = TcpTransport::from_stream(stream)?;
        let mut session = Self::new(Box::new(transport), Role::Server, options);
        session.connected = true;
        Ok(session)
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn dialect(&self) -> Dialect {
        self.dialect
    }

    pub fn kind(&self) -> TransportKind {
        self.transport.kind()
    }

    /// Current peer: configured for clients, learned for servers
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer
    }

    pub fn local_addr(&self) -> SessionResult<SocketAddr> {
        Ok(self.transport.local_addr()?)
    }

    /// Whether the session is usable: probed alive (client) or bound (server)
    pub fn is_connected(&self) -> bool {
        self.connected && !self.transport.is_closed()
    }

    pub(crate) fn set_connected(&mut self, connected: bool) {
        self.connected = connected;
    }

    pub fn stats(&self) -> &SessionStats {
        &self.stats
    }

    pub fn latency(&self) -> &LatencyTracker {
        &self.latency
    }

    /// Latency of the last timestamp-tagged envelope received
    pub fn last_latency_ms(&self) -> i64 {
        self.latency.last_latency_ms()
    }

    /// When the last frame of any kind arrived
    pub fn last_inbound(&self) -> Instant {
        self.last_inbound
    }

    /// Time since the last frame of any kind arrived
    pub fn idle_time(&self) -> Duration {
        self.last_inbound.elapsed()
    }

    /// Tag the next envelope will carry. The counter only moves once a
    /// data envelope has been sent, so probes reuse the current value.
    pub(crate) fn current_tag(&self) -> Tag {
        match self.dialect {
            Dialect::Timestamp => Tag::Timestamp(self.clock.now_ms()),
            Dialect::Counter => Tag::Counter(self.sequence.current()),
        }
    }

    /// Send a payload to the current peer
    pub async fn send(&mut self, payload: &[u8]) -> SessionResult<()> {
        self.send_tagged(payload, None).await
    }

    /// Send a payload to a specific address (datagram servers)
    pub async fn send_to(&mut self, payload: &[u8], dest: SocketAddr) -> SessionResult<()> {
        self.send_tagged(payload, Some(dest)).await
    }

    async fn send_tagged(&mut self, payload: &[u8], dest: Option<SocketAddr>) -> SessionResult<()> {
        if self.transport.is_closed() {
            return Err(SessionError::Closed);
        }

        let dest = self.resolve_dest(dest)?;
        let tag = self.current_tag();
        let frame = protocol::encode(payload, tag)?;

        // The counter moves once the envelope has been handed to the socket
        let result = self.write_frame(&frame, dest).await;
        if self.dialect == Dialect::Counter {
            self.sequence.next();
        }
        result
    }

    /// Send a pre-built envelope without touching the counter
    pub(crate) async fn send_envelope(
        &mut self,
        envelope: &Envelope,
        dest: Option<SocketAddr>,
    ) -> SessionResult<()> {
        if self.transport.is_closed() {
            return Err(SessionError::Closed);
        }
        let dest = self.resolve_dest(dest)?;
        let frame = envelope.encode()?;
        self.write_frame(&frame, dest).await
    }

    /// Unconnected datagram servers reply to the last peer they heard from
    fn resolve_dest(&self, dest: Option<SocketAddr>) -> SessionResult<Option<SocketAddr>> {
        match (self.role, self.transport.kind(), dest) {
            (_, _, Some(dest)) => Ok(Some(dest)),
            (Role::Server, TransportKind::Udp, None) => self.peer.map(Some).ok_or(SessionError::NoPeer),
            (_, _, None) => Ok(None),
        }
    }

    async fn write_frame(&mut self, frame: &[u8], dest: Option<SocketAddr>) -> SessionResult<()> {
        if let Err(e) = self.transport.send_frame(frame, dest).await {
            tracing::error!(session = %self.id, "General error during tx: {}", e);
            return Err(e.into());
        }

        self.stats.frames_sent += 1;
        self.stats.bytes_sent += frame.len() as u64;
        Ok(())
    }

    /// Wait for the next application payload.
    ///
    /// `None` or a zero timeout waits indefinitely.
    pub async fn receive(&mut self, timeout: Option<Duration>) -> SessionResult<Bytes> {
        self.receive_from(timeout).await.map(|r| r.payload)
    }

    /// Wait for the next application envelope along with its tag and source.
    ///
    /// Malformed frames are logged and dropped. On the server side a bare
    /// `ENQ` is answered with an `ACK` carrying the probe's tag, and the wait
    /// continues.
    pub async fn receive_from(&mut self, timeout: Option<Duration>) -> SessionResult<Received> {
        let deadline = timeout
            .filter(|t| !t.is_zero())
            .map(|t| Instant::now() + t);

        loop {
            let (frame, source) = match deadline {
                Some(deadline) => match tokio::time::timeout_at(deadline, self.next_frame()).await {
                    Ok(result) => result?,
                    Err(_) => return Err(SessionError::Timeout),
                },
                None => self.next_frame().await?,
            };

            if let Some(received) = self.process_frame(frame, source).await? {
                return Ok(received);
            }
        }
    }

    /// Wait for the next raw frame.
    ///
    /// Cancel safe, so it can be raced in `select!`. Hand the result to
    /// [`Session::process_frame`] outside the race.
    pub async fn next_frame(&mut self) -> SessionResult<(Bytes, SocketAddr)> {
        if self.transport.is_closed() {
            return Err(SessionError::Closed);
        }
        Ok(self.transport.recv_frame().await?)
    }

    /// Decode and dispatch one raw frame.
    ///
    /// Returns `None` when the frame was consumed by the protocol: malformed
    /// frames, probes answered on the server side, late ACKs on the client
    /// side. May write an ACK, so it must not be cancelled midway.
    pub async fn process_frame(
        &mut self,
        frame: Bytes,
        source: SocketAddr,
    ) -> SessionResult<Option<Received>> {
        self.note_inbound(frame.len());

        let envelope = match self.decode(&frame, source) {
            Some(envelope) => envelope,
            None => return Ok(None),
        };

        if self.role == Role::Server {
            self.peer = Some(source);
        }

        match (self.role, envelope.control_marker()) {
            (Role::Server, Some(ControlMarker::Enq)) => {
                tracing::debug!(session = %self.id, "ENQ {} from {}, answering ACK", envelope.tag, source);
                let ack = Envelope::control(envelope.tag, ControlMarker::Ack);
                self.send_envelope(&ack, Some(source)).await?;
                self.stats.probes_answered += 1;
                Ok(None)
            }
            (Role::Client, Some(marker)) => {
                tracing::debug!(session = %self.id, "Control byte {:?} {} ignored", marker, envelope.tag);
                Ok(None)
            }
            _ => Ok(Some(Received {
                tag: envelope.tag,
                payload: envelope.payload,
                source,
            })),
        }
    }

    fn note_inbound(&mut self, len: usize) {
        self.last_inbound = Instant::now();
        self.stats.frames_received += 1;
        self.stats.bytes_received += len as u64;
    }

    /// Decode a frame and feed the latency tracker; malformed frames are
    /// counted, logged and dropped
    fn decode(&mut self, frame: &[u8], source: SocketAddr) -> Option<Envelope> {
        match protocol::decode(frame, self.dialect) {
            Ok(envelope) => {
                self.latency.observe(envelope.tag, self.clock.now_ms());
                Some(envelope)
            }
            Err(e) => {
                self.stats.malformed_dropped += 1;
                tracing::warn!(session = %self.id, "Dropping frame from {}: {}", source, e);
                None
            }
        }
    }

    /// Release the socket. Safe to call more than once.
    pub async fn close(&mut self) {
        self.connected = false;
        if self.transport.is_closed() {
            return;
        }
        if let Err(e) = self.transport.close().await {
            tracing::debug!(session = %self.id, "Error while closing: {}", e);
        }
        tracing::info!(session = %self.id, "Session closed");
    }
}
