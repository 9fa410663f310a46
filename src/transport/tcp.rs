//! Stream transport
//!
//! Envelopes travel length-prefixed (see [`crate::protocol::FrameEncoder`]).
//! Writes go through `write_all`, so a short write is retried rather than
//! surfaced; a write that cannot complete is a transport error.

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use std::io;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use super::{closed_error, resolve_host, Transport, TransportKind};
use crate::protocol::{FrameDecoder, FrameEncoder};

/// A TCP stream carrying length-prefixed envelopes
pub struct TcpTransport {
    stream: Option<TcpStream>,
    local_addr: SocketAddr,
    peer_addr: SocketAddr,
    encoder: FrameEncoder,
    decoder: FrameDecoder,
    read_buf: BytesMut,
    write_buf: BytesMut,
}

impl TcpTransport {
    /// Connect to `host:port`, giving up after `connect_timeout`
    pub async fn connect(host: &str, port: u16, connect_timeout: Duration) -> io::Result<Self> {
        let addr = resolve_host(host, port).await?;

        let stream = match tokio::time::timeout(connect_timeout, TcpStream::connect(addr)).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(io::Error::new(
                    io::ErrorKind::TimedOut,
                    format!("connect to {} timed out", addr),
                ))
            }
        };

        tracing::debug!("TCP stream connected to {}", addr);
        Self::from_stream(stream)
    }

    /// Wrap an accepted stream
    pub fn from_stream(stream: TcpStream) -> io::Result<Self> {
        stream.set_nodelay(true)?;
        let local_addr = stream.local_addr()?;
        let peer_addr = stream.peer_addr()?;

        Ok(Self {
            stream: Some(stream),
            local_addr,
            peer_addr,
            encoder: FrameEncoder::new(),
            decoder: FrameDecoder::new(),
            read_buf: BytesMut::with_capacity(4096),
            write_buf: BytesMut::with_capacity(4096),
        })
    }
}

#[async_trait]
impl Transport for TcpTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Tcp
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        Ok(self.local_addr)
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        Some(self.peer_addr)
    }

    async fn send_frame(&mut self, frame: &[u8], _dest: Option<SocketAddr>) -> io::Result<()> {
        let stream = self.stream.as_mut().ok_or_else(closed_error)?;

        self.write_buf.clear();
        self.encoder
            .encode(frame, &mut self.write_buf)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;

        stream.write_all(&self.write_buf).await?;
        stream.flush().await
    }

    async fn recv_frame(&mut self) -> io::Result<(Bytes, SocketAddr)> {
        loop {
            // A bad length prefix desynchronises the stream for good
            if let Some(frame) = self
                .decoder
                .decode(&mut self.read_buf)
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?
            {
                return Ok((frame, self.peer_addr));
            }

            let stream = self.stream.as_mut().ok_or_else(closed_error)?;
            self.read_buf.reserve(4096);
            let n = stream.read_buf(&mut self.read_buf).await?;

            if n == 0 {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "connection closed by peer",
                ));
            }
        }
    }

    async fn close(&mut self) -> io::Result<()> {
        match self.stream.take() {
            Some(mut stream) => stream.shutdown().await,
            None => Ok(()),
        }
    }

    fn is_closed(&self) -> bool {
        self.stream.is_none()
    }
}
