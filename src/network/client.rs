//! Telelink Client
//!
//! Establishes a probed session with a server and keeps it alive. A single
//! driver task owns the session; the application talks to it through the
//! transmit and receive queues only, so a reconnect never races a send.

use bytes::Bytes;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::handle::{Outbound, SessionHandle};
use super::ClientConfig;
use crate::session::{LivenessProber, ProbeState, Session, SessionError, SessionResult};

/// Client errors
#[derive(Error, Debug)]
pub enum ClientError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Already connected")]
    AlreadyConnected,

    #[error("Timed out waiting for data")]
    Timeout,

    #[error("Client shut down")]
    Shutdown,
}

pub type ClientResult<T> = Result<T, ClientError>;

/// Events emitted by the client
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    /// First session established
    Connected { server: String, attempts: u32 },
    /// One connection attempt failed; another follows
    AttemptFailed { attempt: u32, reason: String },
    /// The established session was lost
    Disconnected { reason: String },
    /// A fresh session replaced a lost one
    Reconnected { server: String, attempts: u32 },
}

/// Client state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Disconnected,
    Connecting,
    Connected,
}

/// Telelink Client
pub struct Client {
    config: ClientConfig,
    state: Arc<RwLock<ClientState>>,
    /// Transmit side of the hand-off, shared connection and latency flags
    handle: SessionHandle,
    /// Moved into the driver on setup
    outbound_rx: Mutex<Option<mpsc::Receiver<Outbound>>>,
    inbound_tx: mpsc::Sender<Bytes>,
    inbound_rx: tokio::sync::Mutex<mpsc::Receiver<Bytes>>,
    event_tx: mpsc::Sender<ClientEvent>,
    event_rx: Option<mpsc::Receiver<ClientEvent>>,
    cancel: CancellationToken,
    driver: Mutex<Option<JoinHandle<()>>>,
}

impl Client {
    /// Create a new client
    pub fn new(config: ClientConfig) -> Self {
        let capacity = config.queue_capacity.max(1);
        let (outbound_tx, outbound_rx) = mpsc::channel(capacity);
        let (inbound_tx, inbound_rx) = mpsc::channel(capacity);
        let (event_tx, event_rx) = mpsc::channel(256);

        Self {
            config,
            state: Arc::new(RwLock::new(ClientState::Disconnected)),
            handle: SessionHandle::new(outbound_tx),
            outbound_rx: Mutex::new(Some(outbound_rx)),
            inbound_tx,
            inbound_rx: tokio::sync::Mutex::new(inbound_rx),
            event_tx,
            event_rx: Some(event_rx),
            cancel: CancellationToken::new(),
            driver: Mutex::new(None),
        }
    }

    /// Take the event receiver (can only be called once)
    pub fn take_event_receiver(&mut self) -> Option<mpsc::Receiver<ClientEvent>> {
        self.event_rx.take()
    }

    /// Token that stops setup, the driver and any pending receive
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Connect to `host:port` and probe the server until it answers.
    ///
    /// Does not return until the server is alive, retrying forever with
    /// the configured backoff. Only bad arguments or cancellation end it
    /// early.
    pub async fn setup(&self, host: &str, port: &str) -> ClientResult<()> {
        let host = host.trim();
        if host.is_empty() {
            return Err(ClientError::Configuration("No host specified".to_string()));
        }
        let port = port.trim();
        if port.is_empty() {
            return Err(ClientError::Configuration("No port specified".to_string()));
        }
        let port = match port.parse::<u16>() {
            Ok(port) if port != 0 => port,
            _ => return Err(ClientError::Configuration(format!("Invalid port: {}", port))),
        };

        {
            let mut state = self.state.write().await;
            if *state != ClientState::Disconnected {
                return Err(ClientError::AlreadyConnected);
            }
            *state = ClientState::Connecting;
        }

        let taken = lock(&self.outbound_rx).take();
        let outbound_rx = match taken {
            Some(rx) => rx,
            None => {
                *self.state.write().await = ClientState::Disconnected;
                return Err(ClientError::Shutdown);
            }
        };

        let established = establish(&self.config, host, port, &self.cancel, &self.event_tx).await;
        let (session, attempts) = match established {
            Ok(established) => established,
            Err(e) => {
                *lock(&self.outbound_rx) = Some(outbound_rx);
                *self.state.write().await = ClientState::Disconnected;
                return Err(e);
            }
        };

        let server = format!("{}:{}", host, port);
        tracing::info!("Connected to {} after {} attempt(s)", server, attempts);

        self.handle.mark_connected();
        *self.state.write().await = ClientState::Connected;
        emit(&self.event_tx, ClientEvent::Connected { server, attempts });

        let driver = Driver {
            config: self.config.clone(),
            host: host.to_string(),
            port,
            session,
            handle: self.handle.clone(),
            state: self.state.clone(),
            outbound_rx,
            inbound_tx: self.inbound_tx.clone(),
            event_tx: self.event_tx.clone(),
            cancel: self.cancel.clone(),
        };
        *lock(&self.driver) = Some(tokio::spawn(driver.run()));

        Ok(())
    }

    /// Queue a payload for the server.
    ///
    /// Returns false while disconnected or when the queue is full; the
    /// payload is not kept for later.
    pub fn send(&self, payload: impl Into<Bytes>) -> bool {
        match self.handle.try_send(payload) {
            Ok(()) => true,
            Err(e) => {
                tracing::debug!("Payload rejected: {}", e);
                false
            }
        }
    }

    /// Wait for the next payload from the server.
    ///
    /// `None` or a zero timeout waits indefinitely.
    pub async fn receive(&self, timeout: Option<Duration>) -> ClientResult<Bytes> {
        let mut inbound = self.inbound_rx.lock().await;
        let timeout = timeout.filter(|t| !t.is_zero());

        tokio::select! {
            _ = self.cancel.cancelled() => Err(ClientError::Shutdown),
            received = recv_within(&mut inbound, timeout) => received,
        }
    }

    /// Latency of the last timestamp-tagged envelope from the server
    pub fn last_latency_ms(&self) -> i64 {
        self.handle.last_latency_ms()
    }

    /// Check if a probed session is currently up
    pub fn is_connected(&self) -> bool {
        self.handle.is_connected()
    }

    /// Get the current state
    pub async fn state(&self) -> ClientState {
        *self.state.read().await
    }

    /// Stop the driver and release the session
    pub async fn shutdown(&self) {
        self.cancel.cancel();

        let driver = lock(&self.driver).take();
        if let Some(driver) = driver {
            if let Err(e) = driver.await {
                tracing::error!("Client driver task failed: {}", e);
            }
        }

        self.handle.mark_disconnected();
        *self.state.write().await = ClientState::Disconnected;
        tracing::info!("Client shut down");
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn recv_within(
    inbound: &mut mpsc::Receiver<Bytes>,
    timeout: Option<Duration>,
) -> ClientResult<Bytes> {
    let received = match timeout {
        Some(timeout) => tokio::time::timeout(timeout, inbound.recv())
            .await
            .map_err(|_| ClientError::Timeout)?,
        None => inbound.recv().await,
    };
    received.ok_or(ClientError::Shutdown)
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn emit(event_tx: &mpsc::Sender<ClientEvent>, event: ClientEvent) {
    if let Err(e) = event_tx.try_send(event) {
        tracing::debug!("Client event dropped: {}", e);
    }
}

/// Open and probe sessions until one comes up alive
async fn establish(
    config: &ClientConfig,
    host: &str,
    port: u16,
    cancel: &CancellationToken,
    event_tx: &mpsc::Sender<ClientEvent>,
) -> ClientResult<(Session, u32)> {
    let mut prober = LivenessProber::new(config.probe_timeout);
    let mut attempt: u32 = 0;

    loop {
        attempt = attempt.saturating_add(1);

        let outcome = tokio::select! {
            _ = cancel.cancelled() => return Err(ClientError::Shutdown),
            outcome = open_session(config, host, port, &mut prober) => outcome,
        };

        let reason = match outcome {
            Ok(session) => return Ok((session, attempt)),
            Err(SessionError::Configuration(message)) => {
                return Err(ClientError::Configuration(message))
            }
            Err(SessionError::Timeout) => {
                format!("No ACK within {:?}", config.probe_timeout)
            }
            Err(e) => e.to_string(),
        };

        tracing::warn!(
            "Connection attempt {} to {}:{} failed: {}",
            attempt,
            host,
            port,
            reason
        );
        emit(event_tx, ClientEvent::AttemptFailed { attempt, reason });

        let delay = config.reconnect.delay(attempt);
        tokio::select! {
            _ = cancel.cancelled() => return Err(ClientError::Shutdown),
            _ = tokio::time::sleep(delay), if !delay.is_zero() => {}
            _ = tokio::task::yield_now(), if delay.is_zero() => {}
        }
    }
}

/// One connection attempt: a new transport, then a probe if configured
async fn open_session(
    config: &ClientConfig,
    host: &str,
    port: u16,
    prober: &mut LivenessProber,
) -> SessionResult<Session> {
    let mut session = Session::connect(config.transport, host, port, &config.session_options()).await?;

    if !config.probe_on_connect {
        session.set_connected(true);
        return Ok(session);
    }

    match prober.probe(&mut session).await {
        Ok(ProbeState::Alive) => Ok(session),
        Ok(_) => {
            session.close().await;
            Err(SessionError::Timeout)
        }
        Err(e) => {
            session.close().await;
            Err(e)
        }
    }
}

/// Owns the live session for the rest of the client's life
struct Driver {
    config: ClientConfig,
    host: String,
    port: u16,
    session: Session,
    handle: SessionHandle,
    state: Arc<RwLock<ClientState>>,
    outbound_rx: mpsc::Receiver<Outbound>,
    inbound_tx: mpsc::Sender<Bytes>,
    event_tx: mpsc::Sender<ClientEvent>,
    cancel: CancellationToken,
}

impl Driver {
    async fn run(mut self) {
        while let Some(reason) = self.serve().await {
            tracing::warn!(session = %self.session.id(), "Connection lost: {}", reason);

            // Stop accepting payloads before the transport goes away
            self.handle.mark_disconnected();
            *self.state.write().await = ClientState::Connecting;
            emit(&self.event_tx, ClientEvent::Disconnected { reason });
            self.session.close().await;

            let established = establish(
                &self.config,
                &self.host,
                self.port,
                &self.cancel,
                &self.event_tx,
            )
            .await;
            let (session, attempts) = match established {
                Ok(established) => established,
                Err(_) => break,
            };

            let discarded = self.discard_queued();
            if discarded > 0 {
                tracing::info!("Discarded {} payload(s) queued before reconnect", discarded);
            }

            self.session = session;
            self.handle.mark_connected();
            *self.state.write().await = ClientState::Connected;
            emit(
                &self.event_tx,
                ClientEvent::Reconnected {
                    server: format!("{}:{}", self.host, self.port),
                    attempts,
                },
            );
        }

        self.handle.mark_disconnected();
        self.session.close().await;
        *self.state.write().await = ClientState::Disconnected;
    }

    /// Pump the queues until the session is lost. Returns the reason, or
    /// `None` once cancelled.
    async fn serve(&mut self) -> Option<String> {
        let window = self.config.liveness_window;

        loop {
            let stale_at = self.session.last_inbound() + window;

            tokio::select! {
                _ = self.cancel.cancelled() => return None,

                Some(outbound) = self.outbound_rx.recv() => {
                    match self.session.send(&outbound.payload).await {
                        Ok(()) => {}
                        Err(SessionError::Malformed(e)) => {
                            tracing::warn!("Payload not sent: {}", e);
                        }
                        Err(e) => return Some(format!("Send error: {}", e)),
                    }
                }

                result = self.session.next_frame() => {
                    let (frame, source) = match result {
                        Ok(received) => received,
                        Err(e) => return Some(format!("Receive error: {}", e)),
                    };
                    match self.session.process_frame(frame, source).await {
                        Ok(Some(received)) => {
                            self.handle.update_latency(self.session.last_latency_ms());
                            if self.inbound_tx.try_send(received.payload).is_err() {
                                tracing::warn!("Receive queue full, dropping payload");
                            }
                        }
                        Ok(None) => {}
                        Err(e) => return Some(format!("Receive error: {}", e)),
                    }
                }

                _ = tokio::time::sleep_until(stale_at) => {
                    if self.session.idle_time() >= window {
                        return Some(format!("No data from server for {:?}", window));
                    }
                }
            }
        }
    }

    fn discard_queued(&mut self) -> usize {
        let mut discarded = 0;
        while self.outbound_rx.try_recv().is_ok() {
            discarded += 1;
        }
        discarded
    }
}
