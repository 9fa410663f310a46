//! Datagram transport

use async_trait::async_trait;
use bytes::Bytes;
use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use tokio::net::UdpSocket;

use super::{closed_error, resolve_host, Transport, TransportKind};
use crate::protocol::MAX_DATAGRAM_SIZE;

/// A UDP socket carrying one envelope per datagram
pub struct UdpTransport {
    socket: Option<UdpSocket>,
    /// Peer the socket is connected to (client side)
    peer: Option<SocketAddr>,
    recv_buf: Vec<u8>,
}

impl UdpTransport {
    /// Open an ephemeral socket connected to `host:port`.
    ///
    /// Connecting filters out datagrams from other sources and lets ICMP
    /// "port unreachable" surface as receive errors.
    pub async fn connect(host: &str, port: u16) -> io::Result<Self> {
        let peer = resolve_host(host, port).await?;
        let local: SocketAddr = if peer.is_ipv4() {
            (Ipv4Addr::UNSPECIFIED, 0).into()
        } else {
            (Ipv6Addr::UNSPECIFIED, 0).into()
        };

        let socket = UdpSocket::bind(local).await?;
        socket.connect(peer).await?;
        tracing::debug!("UDP socket {} connected to {}", socket.local_addr()?, peer);

        Ok(Self::with_socket(socket, Some(peer)))
    }

    /// Bind a listening socket; peers are learned from inbound datagrams
    pub async fn bind(addr: SocketAddr) -> io::Result<Self> {
        let socket = UdpSocket::bind(addr).await?;
        tracing::info!("Listening on udp://{}", socket.local_addr()?);
        Ok(Self::with_socket(socket, None))
    }

    fn with_socket(socket: UdpSocket, peer: Option<SocketAddr>) -> Self {
        Self {
            socket: Some(socket),
            peer,
            recv_buf: vec![0u8; MAX_DATAGRAM_SIZE],
        }
    }

    fn socket(&self) -> io::Result<&UdpSocket> {
        self.socket.as_ref().ok_or_else(closed_error)
    }
}

#[async_trait]
impl Transport for UdpTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Udp
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket()?.local_addr()
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer
    }

    async fn send_frame(&mut self, frame: &[u8], dest: Option<SocketAddr>) -> io::Result<()> {
        let socket = self.socket()?;
        match (self.peer, dest) {
            (Some(_), None) => {
                socket.send(frame).await?;
            }
            (Some(peer), Some(dest)) if peer == dest => {
                socket.send(frame).await?;
            }
            (_, Some(dest)) => {
                socket.send_to(frame, dest).await?;
            }
            (None, None) => {
                return Err(io::Error::new(
                    io::ErrorKind::NotConnected,
                    "no destination for datagram",
                ));
            }
        }
        Ok(())
    }

    async fn recv_frame(&mut self) -> io::Result<(Bytes, SocketAddr)> {
        let socket = self.socket.as_ref().ok_or_else(closed_error)?;
        let (n, src) = socket.recv_from(&mut self.recv_buf).await?;
        Ok((Bytes::copy_from_slice(&self.recv_buf[..n]), src))
    }

    async fn close(&mut self) -> io::Result<()> {
        if self.socket.take().is_some() {
            tracing::debug!("UDP socket closed");
        }
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.socket.is_none()
    }
}
