//! Network module - Long-running client and server loops over sessions
//!
//! Provides:
//! - Client that probes its peer and reconnects whenever it goes quiet
//! - Server that answers probes and tracks the peers it hears from
//! - Hand-off handles so application code never touches a socket directly

mod client;
mod handle;
mod server;

pub use client::*;
pub use handle::*;
pub use server::*;

use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

use crate::protocol::{Dialect, DEFAULT_PORT};
use crate::session::SessionOptions;
use crate::transport::TransportKind;

/// Default capacity of the transmit and receive hand-off queues
pub const DEFAULT_QUEUE_CAPACITY: usize = 256;

/// Delay schedule between connection attempts.
///
/// Retries never stop; the policy only decides how long to wait.
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectPolicy {
    /// Wait after the first failed attempt. Zero retries immediately.
    pub initial_delay: Duration,
    /// Upper bound on any single wait
    pub max_delay: Duration,
    /// Growth factor per consecutive failure
    pub multiplier: f64,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(50),
            max_delay: Duration::from_millis(2000),
            multiplier: 2.0,
        }
    }
}

impl ReconnectPolicy {
    /// Retry back-to-back with no wait
    pub fn immediate() -> Self {
        Self {
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            multiplier: 1.0,
        }
    }

    /// Wait before the next try, after `attempt` (1-based) failed
    pub fn delay(&self, attempt: u32) -> Duration {
        if self.initial_delay.is_zero() {
            return Duration::ZERO;
        }

        let exponent = attempt.saturating_sub(1).min(32) as i32;
        let factor = self.multiplier.max(1.0).powi(exponent);
        let millis = self.initial_delay.as_millis() as f64 * factor;
        let capped = millis.min(self.max_delay.as_millis() as f64);
        Duration::from_millis(capped as u64).max(self.initial_delay.min(self.max_delay))
    }
}

/// Configuration for the reconnecting client
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub transport: TransportKind,
    pub dialect: Dialect,
    /// Bound on waiting for an ACK to a probe
    pub probe_timeout: Duration,
    /// Silence after which the server is considered gone
    pub liveness_window: Duration,
    /// Probe the peer before declaring a session established
    pub probe_on_connect: bool,
    /// Bound on establishing a stream connection
    pub connect_timeout: Duration,
    pub reconnect: ReconnectPolicy,
    pub queue_capacity: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            transport: TransportKind::Udp,
            dialect: Dialect::default(),
            probe_timeout: Duration::from_millis(1000),
            liveness_window: Duration::from_millis(1000),
            probe_on_connect: true,
            connect_timeout: Duration::from_millis(5000),
            reconnect: ReconnectPolicy::default(),
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
        }
    }
}

impl ClientConfig {
    pub fn new(transport: TransportKind, dialect: Dialect) -> Self {
        Self {
            transport,
            dialect,
            ..Default::default()
        }
    }

    pub fn with_probe_timeout(mut self, timeout: Duration) -> Self {
        self.probe_timeout = timeout;
        self
    }

    pub fn with_liveness_window(mut self, window: Duration) -> Self {
        self.liveness_window = window;
        self
    }

    pub fn with_reconnect(mut self, policy: ReconnectPolicy) -> Self {
        self.reconnect = policy;
        self
    }

    pub fn without_probe(mut self) -> Self {
        self.probe_on_connect = false;
        self
    }

    pub(crate) fn session_options(&self) -> SessionOptions {
        SessionOptions::new(self.dialect).with_connect_timeout(self.connect_timeout)
    }
}

/// Configuration for the server
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub transport: TransportKind,
    pub dialect: Dialect,
    pub bind_address: IpAddr,
    /// Port to listen on; 0 lets the OS pick
    pub port: u16,
    /// Silence after which a peer is dropped
    pub peer_timeout: Duration,
    pub queue_capacity: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            transport: TransportKind::Udp,
            dialect: Dialect::default(),
            bind_address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: DEFAULT_PORT,
            peer_timeout: Duration::from_millis(1000),
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
        }
    }
}

impl ServerConfig {
    pub fn new(transport: TransportKind, dialect: Dialect, port: u16) -> Self {
        Self {
            transport,
            dialect,
            port,
            ..Default::default()
        }
    }

    pub fn with_bind_address(mut self, addr: IpAddr) -> Self {
        self.bind_address = addr;
        self
    }

    pub fn with_peer_timeout(mut self, timeout: Duration) -> Self {
        self.peer_timeout = timeout;
        self
    }

    pub(crate) fn session_options(&self) -> SessionOptions {
        SessionOptions::new(self.dialect)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_grows_and_caps() {
        let policy = ReconnectPolicy {
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(1000),
            multiplier: 2.0,
        };
        assert_eq!(policy.delay(1), Duration::from_millis(100));
        assert_eq!(policy.delay(2), Duration::from_millis(200));
        assert_eq!(policy.delay(4), Duration::from_millis(800));
        assert_eq!(policy.delay(5), Duration::from_millis(1000));
        assert_eq!(policy.delay(u32::MAX), Duration::from_millis(1000));
    }

    #[test]
    fn test_immediate_policy() {
        let policy = ReconnectPolicy::immediate();
        for attempt in 1..10 {
            assert_eq!(policy.delay(attempt), Duration::ZERO);
        }
    }

    #[test]
    fn test_config_builders() {
        let config = ClientConfig::new(TransportKind::Tcp, Dialect::Timestamp)
            .with_probe_timeout(Duration::from_millis(250))
            .without_probe();
        assert_eq!(config.transport, TransportKind::Tcp);
        assert_eq!(config.probe_timeout, Duration::from_millis(250));
        assert!(!config.probe_on_connect);
        assert_eq!(config.session_options().dialect, Dialect::Timestamp);

        let server = ServerConfig::new(TransportKind::Udp, Dialect::Counter, 0);
        assert_eq!(server.port, 0);
        assert_eq!(server.peer_timeout, Duration::from_millis(1000));
    }
}
