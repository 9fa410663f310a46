//! Hand-off handle for a session owned by another task

use bytes::Bytes;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

/// Handle errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HandleError {
    #[error("Not connected")]
    NotConnected,

    #[error("Send queue full")]
    QueueFull,

    #[error("Send channel closed")]
    ChannelClosed,
}

/// A payload waiting in the transmit queue
#[derive(Debug, Clone)]
pub struct Outbound {
    pub payload: Bytes,
    /// Explicit destination; `None` means the session's current peer
    pub dest: Option<SocketAddr>,
}

/// A handle for queueing payloads to a session's owning task
#[derive(Clone, Debug)]
pub struct SessionHandle {
    sender: mpsc::Sender<Outbound>,
    connected: Arc<AtomicBool>,
    latency_ms: Arc<AtomicI64>,
}

impl SessionHandle {
    pub fn new(sender: mpsc::Sender<Outbound>) -> Self {
        Self {
            sender,
            connected: Arc::new(AtomicBool::new(false)),
            latency_ms: Arc::new(AtomicI64::new(0)),
        }
    }

    /// Queue a payload for the current peer, waiting for queue space
    pub async fn send(&self, payload: impl Into<Bytes>) -> Result<(), HandleError> {
        self.enqueue(Outbound {
            payload: payload.into(),
            dest: None,
        })
        .await
    }

    /// Queue a payload for a specific address, waiting for queue space
    pub async fn send_to(&self, dest: SocketAddr, payload: impl Into<Bytes>) -> Result<(), HandleError> {
        self.enqueue(Outbound {
            payload: payload.into(),
            dest: Some(dest),
        })
        .await
    }

    /// Queue a payload without waiting
    pub fn try_send(&self, payload: impl Into<Bytes>) -> Result<(), HandleError> {
        if !self.is_connected() {
            return Err(HandleError::NotConnected);
        }

        self.sender
            .try_send(Outbound {
                payload: payload.into(),
                dest: None,
            })
            .map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => HandleError::QueueFull,
                mpsc::error::TrySendError::Closed(_) => HandleError::ChannelClosed,
            })
    }

    async fn enqueue(&self, outbound: Outbound) -> Result<(), HandleError> {
        if !self.is_connected() {
            return Err(HandleError::NotConnected);
        }

        self.sender
            .send(outbound)
            .await
            .map_err(|_| HandleError::ChannelClosed)
    }

    /// Check if the session is currently usable
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Latency of the last timestamp-tagged envelope received
    pub fn last_latency_ms(&self) -> i64 {
        self.latency_ms.load(Ordering::SeqCst)
    }

    pub fn mark_connected(&self) {
        self.connected.store(true, Ordering::SeqCst);
    }

    pub fn mark_disconnected(&self) {
        self.connected.store(false, Ordering::SeqCst);
    }

    pub fn update_latency(&self, latency_ms: i64) {
        self.latency_ms.store(latency_ms, Ordering::SeqCst);
    }
}
