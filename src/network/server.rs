//! Telelink Server
//!
//! Answers probes and hands application payloads to the embedding program
//! as events. Over UDP one bound session serves every peer; over TCP each
//! accepted stream gets its own session and task.

use bytes::Bytes;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, RwLock};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use super::handle::{HandleError, Outbound, SessionHandle};
use super::ServerConfig;
use crate::session::{Session, SessionError, SessionOptions};
use crate::transport::TransportKind;

/// Pause after a socket error so a failing socket does not spin the loop
const ERROR_PAUSE: Duration = Duration::from_millis(10);

/// Server errors
#[derive(Error, Debug)]
pub enum ServerError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    #[error("Send failed: {0}")]
    Handle(#[from] HandleError),

    #[error("Server already running")]
    AlreadyRunning,

    #[error("Server not running")]
    NotRunning,

    #[error("Bind failed: {0}")]
    BindFailed(String),

    #[error("Unknown peer: {0}")]
    UnknownPeer(SocketAddr),
}

pub type ServerResult<T> = Result<T, ServerError>;

/// Events emitted by the server
#[derive(Debug, Clone)]
pub enum ServerEvent {
    /// Server started
    Started { bind_addr: SocketAddr },
    /// First frame from a new peer
    PeerSeen { addr: SocketAddr },
    /// Application payload from a peer
    MessageReceived { addr: SocketAddr, payload: Bytes },
    /// Peer silent for longer than the peer timeout
    PeerLost { addr: SocketAddr, idle: Duration },
    /// Stream peer closed or failed
    PeerDisconnected { addr: SocketAddr, reason: String },
    /// Per-message or socket error; the server keeps running
    Error { message: String },
    /// Server stopped
    Stopped,
}

/// Information about a peer the server has heard from
#[derive(Debug, Clone)]
pub struct PeerInfo {
    pub addr: SocketAddr,
    pub first_seen: Instant,
    pub last_seen: Instant,
    /// Application payloads received, probes excluded
    pub messages: u64,
    /// Handle for sending payloads to this peer
    pub handle: SessionHandle,
}

type PeerMap = Arc<RwLock<HashMap<SocketAddr, PeerInfo>>>;

/// State shared between the server and its tasks
#[derive(Clone)]
struct Shared {
    peers: PeerMap,
    event_tx: mpsc::Sender<ServerEvent>,
}

impl Shared {
    fn emit(&self, event: ServerEvent) {
        if let Err(e) = self.event_tx.try_send(event) {
            tracing::debug!("Server event dropped: {}", e);
        }
    }

    /// Record inbound traffic from `addr`, registering it if new
    async fn touch(&self, addr: SocketAddr, handle: &SessionHandle) {
        let now = Instant::now();
        let mut peers = self.peers.write().await;
        match peers.get_mut(&addr) {
            Some(peer) => peer.last_seen = now,
            None => {
                tracing::info!("New peer {}", addr);
                peers.insert(
                    addr,
                    PeerInfo {
                        addr,
                        first_seen: now,
                        last_seen: now,
                        messages: 0,
                        handle: handle.clone(),
                    },
                );
                self.emit(ServerEvent::PeerSeen { addr });
            }
        }
    }

    async fn count_message(&self, addr: SocketAddr) {
        if let Some(peer) = self.peers.write().await.get_mut(&addr) {
            peer.messages += 1;
        }
    }

    async fn remove(&self, addr: SocketAddr) {
        self.peers.write().await.remove(&addr);
    }
}

/// Telelink Server
pub struct Server {
    config: ServerConfig,
    shared: Shared,
    event_rx: Option<mpsc::Receiver<ServerEvent>>,
    cancel: Option<CancellationToken>,
    task: Option<JoinHandle<()>>,
    local_addr: Option<SocketAddr>,
    running: Arc<RwLock<bool>>,
}

impl Server {
    /// Create a new server
    pub fn new(config: ServerConfig) -> Self {
        let (event_tx, event_rx) = mpsc::channel(256);

        Self {
            config,
            shared: Shared {
                peers: Arc::new(RwLock::new(HashMap::new())),
                event_tx,
            },
            event_rx: Some(event_rx),
            cancel: None,
            task: None,
            local_addr: None,
            running: Arc::new(RwLock::new(false)),
        }
    }

    /// Take the event receiver (can only be called once)
    pub fn take_event_receiver(&mut self) -> Option<mpsc::Receiver<ServerEvent>> {
        self.event_rx.take()
    }

    /// Bind and start serving. Returns the bound address.
    pub async fn start(&mut self) -> ServerResult<SocketAddr> {
        {
            let running = self.running.read().await;
            if *running {
                return Err(ServerError::AlreadyRunning);
            }
        }

        let bind_addr = SocketAddr::new(self.config.bind_address, self.config.port);
        let cancel = CancellationToken::new();
        let shared = self.shared.clone();
        let options = self.config.session_options();

        let (local_addr, serve): (SocketAddr, JoinHandle<()>) = match self.config.transport {
            TransportKind::Udp => {
                let session = Session::bind_udp(bind_addr, &options).await.map_err(|e| {
                    ServerError::BindFailed(format!("Failed to bind to {}: {}", bind_addr, e))
                })?;
                let local_addr = session.local_addr()?;

                let (outbound_tx, outbound_rx) = mpsc::channel(self.config.queue_capacity.max(1));
                let handle = SessionHandle::new(outbound_tx);
                handle.mark_connected();

                let task = tokio::spawn(serve_udp(
                    session,
                    handle,
                    outbound_rx,
                    shared,
                    self.config.peer_timeout,
                    cancel.clone(),
                ));
                (local_addr, task)
            }
            TransportKind::Tcp => {
                let listener = TcpListener::bind(bind_addr).await.map_err(|e| {
                    ServerError::BindFailed(format!("Failed to bind to {}: {}", bind_addr, e))
                })?;
                let local_addr = listener.local_addr()?;

                let task = tokio::spawn(serve_tcp(
                    listener,
                    options,
                    self.config.clone(),
                    shared,
                    cancel.clone(),
                ));
                (local_addr, task)
            }
        };

        tracing::info!(
            "Server listening on {}://{} ({} dialect)",
            self.config.transport,
            local_addr,
            self.config.dialect
        );

        *self.running.write().await = true;
        self.shared.emit(ServerEvent::Started {
            bind_addr: local_addr,
        });

        let running = self.running.clone();
        let shared = self.shared.clone();
        self.task = Some(tokio::spawn(async move {
            if let Err(e) = serve.await {
                tracing::error!("Server task failed: {}", e);
            }
            shared.peers.write().await.clear();
            *running.write().await = false;
            shared.emit(ServerEvent::Stopped);
        }));
        self.cancel = Some(cancel);
        self.local_addr = Some(local_addr);

        Ok(local_addr)
    }

    /// Stop the server and wait for its tasks to finish
    pub async fn stop(&mut self) -> ServerResult<()> {
        {
            let running = self.running.read().await;
            if !*running {
                return Err(ServerError::NotRunning);
            }
        }

        tracing::info!("Server shutdown requested");
        if let Some(cancel) = self.cancel.take() {
            cancel.cancel();
        }
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                tracing::error!("Server task failed: {}", e);
            }
        }
        self.local_addr = None;

        Ok(())
    }

    /// Check if the server is running
    pub async fn is_running(&self) -> bool {
        *self.running.read().await
    }

    /// Bound address while running
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Get a list of known peers
    pub async fn peers(&self) -> Vec<PeerInfo> {
        let peers = self.shared.peers.read().await;
        peers.values().cloned().collect()
    }

    /// Send a payload to a specific peer
    pub async fn send_to(&self, addr: SocketAddr, payload: impl Into<Bytes>) -> ServerResult<()> {
        let handle = {
            let peers = self.shared.peers.read().await;
            peers.get(&addr).map(|peer| peer.handle.clone())
        };
        let handle = handle.ok_or(ServerError::UnknownPeer(addr))?;
        handle.send_to(addr, payload).await?;
        Ok(())
    }

    /// Send a payload to every known peer. Returns how many were queued.
    pub async fn broadcast(&self, payload: impl Into<Bytes>) -> usize {
        let payload = payload.into();
        let targets: Vec<(SocketAddr, SessionHandle)> = {
            let peers = self.shared.peers.read().await;
            peers
                .values()
                .map(|peer| (peer.addr, peer.handle.clone()))
                .collect()
        };

        let mut queued = 0;
        for (addr, handle) in targets {
            match handle.send_to(addr, payload.clone()).await {
                Ok(()) => queued += 1,
                Err(e) => tracing::debug!("Broadcast to {} skipped: {}", addr, e),
            }
        }
        queued
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        if let Some(cancel) = &self.cancel {
            cancel.cancel();
        }
    }
}

/// Serve every datagram peer from one bound session
async fn serve_udp(
    mut session: Session,
    handle: SessionHandle,
    mut outbound_rx: mpsc::Receiver<Outbound>,
    shared: Shared,
    peer_timeout: Duration,
    cancel: CancellationToken,
) {
    let mut sweep = tokio::time::interval((peer_timeout / 2).max(Duration::from_millis(10)));
    sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,

            Some(outbound) = outbound_rx.recv() => {
                let result = match outbound.dest {
                    Some(dest) => session.send_to(&outbound.payload, dest).await,
                    None => session.send(&outbound.payload).await,
                };
                if let Err(e) = result {
                    shared.emit(ServerEvent::Error {
                        message: format!("Send failed: {}", e),
                    });
                }
            }

            result = session.next_frame() => {
                let (frame, source) = match result {
                    Ok(received) => received,
                    Err(SessionError::Closed) => break,
                    Err(e) => {
                        tracing::warn!("Receive error: {}", e);
                        shared.emit(ServerEvent::Error { message: e.to_string() });
                        tokio::time::sleep(ERROR_PAUSE).await;
                        continue;
                    }
                };

                shared.touch(source, &handle).await;
                match session.process_frame(frame, source).await {
                    Ok(Some(received)) => {
                        shared.count_message(source).await;
                        shared.emit(ServerEvent::MessageReceived {
                            addr: source,
                            payload: received.payload,
                        });
                    }
                    Ok(None) => {}
                    Err(e) => {
                        tracing::error!("Failed to answer {}: {}", source, e);
                        shared.emit(ServerEvent::Error {
                            message: format!("Failed to answer {}: {}", source, e),
                        });
                    }
                }
            }

            _ = sweep.tick() => expire_peers(&shared, peer_timeout).await,
        }
    }

    session.close().await;
}

/// Drop datagram peers that went quiet
async fn expire_peers(shared: &Shared, peer_timeout: Duration) {
    let lost: Vec<(SocketAddr, Duration)> = {
        let mut peers = shared.peers.write().await;
        let lost: Vec<(SocketAddr, Duration)> = peers
            .values()
            .map(|peer| (peer.addr, peer.last_seen.elapsed()))
            .filter(|(_, idle)| *idle > peer_timeout)
            .collect();
        for (addr, _) in &lost {
            peers.remove(addr);
        }
        lost
    };

    for (addr, idle) in lost {
        tracing::warn!("Peer {} is gone, silent for {:?}", addr, idle);
        shared.emit(ServerEvent::PeerLost { addr, idle });
    }
}

/// Accept stream peers until cancelled
async fn serve_tcp(
    listener: TcpListener,
    options: SessionOptions,
    config: ServerConfig,
    shared: Shared,
    cancel: CancellationToken,
) {
    let mut peers = JoinSet::new();

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,

            result = listener.accept() => {
                match result {
                    Ok((stream, addr)) => {
                        tracing::info!("New connection from {}", addr);
                        match Session::from_tcp_stream(stream, &options) {
                            Ok(session) => {
                                peers.spawn(handle_peer(
                                    session,
                                    addr,
                                    config.clone(),
                                    shared.clone(),
                                    cancel.child_token(),
                                ));
                            }
                            Err(e) => {
                                tracing::error!("Failed to set up session for {}: {}", addr, e);
                                shared.emit(ServerEvent::Error { message: e.to_string() });
                            }
                        }
                    }
                    Err(e) => {
                        tracing::error!("Accept error: {}", e);
                        shared.emit(ServerEvent::Error { message: e.to_string() });
                        tokio::time::sleep(ERROR_PAUSE).await;
                    }
                }
            }

            Some(_) = peers.join_next(), if !peers.is_empty() => {}
        }
    }

    while peers.join_next().await.is_some() {}
}

/// Why a stream peer's loop ended
enum PeerExit {
    Cancelled,
    Lost(Duration),
    Disconnected(String),
}

/// Drive one stream peer's session
async fn handle_peer(
    mut session: Session,
    addr: SocketAddr,
    config: ServerConfig,
    shared: Shared,
    cancel: CancellationToken,
) {
    let (outbound_tx, mut outbound_rx) = mpsc::channel::<Outbound>(config.queue_capacity.max(1));
    let handle = SessionHandle::new(outbound_tx);
    handle.mark_connected();
    shared.touch(addr, &handle).await;

    let exit = loop {
        let stale_at = session.last_inbound() + config.peer_timeout;

        tokio::select! {
            _ = cancel.cancelled() => break PeerExit::Cancelled,

            Some(outbound) = outbound_rx.recv() => {
                if let Err(e) = session.send(&outbound.payload).await {
                    break PeerExit::Disconnected(format!("Send error: {}", e));
                }
            }

            result = session.next_frame() => {
                let (frame, source) = match result {
                    Ok(received) => received,
                    Err(SessionError::Transport(e))
                        if e.kind() == std::io::ErrorKind::UnexpectedEof =>
                    {
                        break PeerExit::Disconnected("Connection closed".to_string());
                    }
                    Err(e) => break PeerExit::Disconnected(format!("Error: {}", e)),
                };

                shared.touch(addr, &handle).await;
                match session.process_frame(frame, source).await {
                    Ok(Some(received)) => {
                        shared.count_message(addr).await;
                        shared.emit(ServerEvent::MessageReceived {
                            addr,
                            payload: received.payload,
                        });
                    }
                    Ok(None) => {}
                    Err(e) => break PeerExit::Disconnected(format!("Send error: {}", e)),
                }
            }

            _ = tokio::time::sleep_until(stale_at) => {
                let idle = session.idle_time();
                if idle >= config.peer_timeout {
                    break PeerExit::Lost(idle);
                }
            }
        }
    };

    handle.mark_disconnected();
    shared.remove(addr).await;
    session.close().await;

    match exit {
        PeerExit::Cancelled => {}
        PeerExit::Lost(idle) => {
            tracing::warn!("Peer {} is gone, silent for {:?}", addr, idle);
            shared.emit(ServerEvent::PeerLost { addr, idle });
        }
        PeerExit::Disconnected(reason) => {
            tracing::info!("Peer {} disconnected: {}", addr, reason);
            shared.emit(ServerEvent::PeerDisconnected { addr, reason });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{Dialect, ACK};
    use std::net::{IpAddr, Ipv4Addr};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpStream, UdpSocket};

    fn config(transport: TransportKind) -> ServerConfig {
        ServerConfig::new(transport, Dialect::Counter, 0)
            .with_bind_address(IpAddr::V4(Ipv4Addr::LOCALHOST))
    }

    async fn next_event(events: &mut mpsc::Receiver<ServerEvent>) -> ServerEvent {
        tokio::time::timeout(Duration::from_secs(2), events.recv())
            .await
            .unwrap()
            .unwrap()
    }

    #[tokio::test]
    async fn test_server_creation() {
        let server = Server::new(ServerConfig::default());
        assert!(!server.is_running().await);
        assert!(server.local_addr().is_none());
        assert!(server.peers().await.is_empty());
    }

    #[tokio::test]
    async fn test_start_and_stop() {
        let mut server = Server::new(config(TransportKind::Udp));
        let mut events = server.take_event_receiver().unwrap();
        assert!(server.take_event_receiver().is_none());

        let addr = server.start().await.unwrap();
        assert_ne!(addr.port(), 0);
        assert!(server.is_running().await);
        assert!(matches!(server.start().await, Err(ServerError::AlreadyRunning)));
        assert!(matches!(next_event(&mut events).await, ServerEvent::Started { bind_addr } if bind_addr == addr));

        server.stop().await.unwrap();
        assert!(!server.is_running().await);
        assert!(matches!(next_event(&mut events).await, ServerEvent::Stopped));
        assert!(matches!(server.stop().await, Err(ServerError::NotRunning)));
    }

    #[tokio::test]
    async fn test_bind_failure() {
        let taken = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let port = taken.local_addr().unwrap().port();

        let mut server = Server::new(ServerConfig {
            port,
            ..config(TransportKind::Udp)
        });
        assert!(matches!(server.start().await, Err(ServerError::BindFailed(_))));
        assert!(!server.is_running().await);
    }

    #[tokio::test]
    async fn test_udp_probe_and_payload() {
        let mut server = Server::new(config(TransportKind::Udp));
        let mut events = server.take_event_receiver().unwrap();
        let addr = server.start().await.unwrap();
        next_event(&mut events).await;

        let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let peer_addr = peer.local_addr().unwrap();

        // Probe is answered and never surfaces as a message
        peer.send_to(b"C3|\x05", addr).await.unwrap();
        let mut buf = [0u8; 64];
        let (n, from) = peer.recv_from(&mut buf).await.unwrap();
        assert_eq!(from, addr);
        assert_eq!(&buf[..n], &[b'C', b'3', b'|', ACK]);
        assert!(matches!(next_event(&mut events).await, ServerEvent::PeerSeen { addr } if addr == peer_addr));

        peer.send_to(b"C4|G 0", addr).await.unwrap();
        match next_event(&mut events).await {
            ServerEvent::MessageReceived { addr, payload } => {
                assert_eq!(addr, peer_addr);
                assert_eq!(&payload[..], b"G 0");
            }
            other => panic!("unexpected event {:?}", other),
        }

        let peers = server.peers().await;
        assert_eq!(peers.len(), 1);
        assert_eq!(peers[0].messages, 1);

        // Malformed frames are reported nowhere but the log; the server keeps going
        peer.send_to(b"no separator", addr).await.unwrap();
        server.send_to(peer_addr, "sample text").await.unwrap();
        let (n, _) = peer.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"C0|sample text");

        assert_eq!(server.broadcast("sample text").await, 1);
        let (n, _) = peer.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"C1|sample text");

        server.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_unknown_peer() {
        let mut server = Server::new(config(TransportKind::Udp));
        server.start().await.unwrap();

        let stranger: SocketAddr = "127.0.0.1:9".parse().unwrap();
        assert!(matches!(
            server.send_to(stranger, "A 0").await,
            Err(ServerError::UnknownPeer(addr)) if addr == stranger
        ));
        assert_eq!(server.broadcast("A 0").await, 0);

        server.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_silent_udp_peer_is_lost() {
        let mut server = Server::new(config(TransportKind::Udp).with_peer_timeout(Duration::from_millis(100)));
        let mut events = server.take_event_receiver().unwrap();
        let addr = server.start().await.unwrap();

        let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        peer.send_to(b"C0|A 0", addr).await.unwrap();

        let lost = loop {
            match next_event(&mut events).await {
                ServerEvent::PeerLost { addr, idle } => break (addr, idle),
                _ => continue,
            }
        };
        assert_eq!(lost.0, peer.local_addr().unwrap());
        assert!(lost.1 > Duration::from_millis(100));
        assert!(server.peers().await.is_empty());

        server.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_tcp_peer_lifecycle() {
        let mut server = Server::new(config(TransportKind::Tcp));
        let mut events = server.take_event_receiver().unwrap();
        let addr = server.start().await.unwrap();
        next_event(&mut events).await;

        let mut stream = TcpStream::connect(addr).await.unwrap();
        let peer_addr = stream.local_addr().unwrap();
        assert!(matches!(next_event(&mut events).await, ServerEvent::PeerSeen { addr } if addr == peer_addr));

        // Length-prefixed probe
        stream.write_all(&[0, 4, b'C', b'0', b'|', 0x05]).await.unwrap();
        let mut ack = [0u8; 6];
        stream.read_exact(&mut ack).await.unwrap();
        assert_eq!(ack, [0, 4, b'C', b'0', b'|', ACK]);

        stream.write_all(&[0, 6, b'C', b'1', b'|', b'S', b' ', b'0']).await.unwrap();
        match next_event(&mut events).await {
            ServerEvent::MessageReceived { payload, .. } => assert_eq!(&payload[..], b"S 0"),
            other => panic!("unexpected event {:?}", other),
        }

        drop(stream);
        assert!(matches!(
            next_event(&mut events).await,
            ServerEvent::PeerDisconnected { addr, .. } if addr == peer_addr
        ));
        assert!(server.peers().await.is_empty());

        server.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_stop_closes_tcp_peers() {
        let mut server = Server::new(config(TransportKind::Tcp));
        let addr = server.start().await.unwrap();

        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream.write_all(&[0, 6, b'C', b'0', b'|', b'A', b' ', b'0']).await.unwrap();

        server.stop().await.unwrap();

        let mut buf = [0u8; 8];
        let n = tokio::time::timeout(Duration::from_secs(2), stream.read(&mut buf))
            .await
            .unwrap()
            .unwrap_or(0);
        assert_eq!(n, 0);
    }
}
