//! Liveness probing
//!
//! `IDLE -> PROBING -> ALIVE`, or `PROBING -> DEAD` once the probe timer
//! runs out. `DEAD` is terminal for an attempt; probing again restarts the
//! machine at `IDLE`.

use std::io;
use std::time::Duration;
use tokio::time::Instant;

use super::{Session, SessionResult};
use crate::protocol::{ControlMarker, Envelope, ACK};

/// Pause after a receive error while probing, so a socket that keeps
/// failing does not spin until the deadline
const ERROR_PAUSE: Duration = Duration::from_millis(10);

/// Prober state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeState {
    Idle,
    Probing,
    Alive,
    Dead,
}

/// Runs the ENQ/ACK exchange on a session
#[derive(Debug)]
pub struct LivenessProber {
    timeout: Duration,
    state: ProbeState,
}

impl LivenessProber {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            state: ProbeState::Idle,
        }
    }

    pub fn state(&self) -> ProbeState {
        self.state
    }

    /// Probe timer bound
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Send one `ENQ` and wait up to the probe timeout for an `ACK`.
    ///
    /// Returns `Alive` or `Dead`. Anything other than an ACK that arrives in
    /// the meantime is discarded; it may be leftover data from an earlier
    /// session. Failing to send the probe is an error.
    pub async fn probe(&mut self, session: &mut Session) -> SessionResult<ProbeState> {
        self.state = ProbeState::Idle;

        let probe = Envelope::control(session.current_tag(), ControlMarker::Enq);
        tracing::info!(session = %session.id, "Sending ENQ...");
        self.state = ProbeState::Probing;
        if let Err(e) = session.send_envelope(&probe, None).await {
            self.state = ProbeState::Dead;
            return Err(e);
        }

        let started = Instant::now();
        let deadline = started + self.timeout;

        loop {
            let (frame, source) =
                match tokio::time::timeout_at(deadline, session.transport.recv_frame()).await {
                    Err(_) => {
                        tracing::warn!(session = %session.id, "No response to ping.");
                        self.state = ProbeState::Dead;
                        return Ok(self.state);
                    }
                    Ok(Err(e)) if is_transient(&e) => {
                        tracing::debug!(session = %session.id, "Receive error while probing: {}", e);
                        tokio::time::sleep(ERROR_PAUSE).await;
                        continue;
                    }
                    Ok(Err(e)) => {
                        self.state = ProbeState::Dead;
                        return Err(e.into());
                    }
                    Ok(Ok(received)) => received,
                };

            session.note_inbound(frame.len());

            let Some(envelope) = session.decode(&frame, source) else {
                continue;
            };

            if envelope.payload.first() == Some(&ACK) {
                let rtt = started.elapsed();
                session.latency.observe_probe(rtt);
                session.set_connected(true);
                tracing::info!(session = %session.id, "ACK received in {:?}", rtt);
                self.state = ProbeState::Alive;
                return Ok(self.state);
            }

            tracing::debug!(
                session = %session.id,
                "Discarding {} byte payload while probing",
                envelope.payload.len()
            );
        }
    }
}

/// Errors a probe should wait out rather than abort on. A connected
/// datagram socket reports an ICMP "port unreachable" this way.
fn is_transient(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionRefused | io::ErrorKind::ConnectionReset | io::ErrorKind::Interrupted
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Dialect;
    use crate::session::SessionOptions;
    use crate::transport::TransportKind;
    use std::net::SocketAddr;
    use tokio::net::UdpSocket;

    async fn connect(dialect: Dialect, addr: SocketAddr) -> Session {
        Session::connect(
            TransportKind::Udp,
            "127.0.0.1",
            addr.port(),
            &SessionOptions::new(dialect),
        )
        .await
        .unwrap()
    }

    /// A server session that keeps receiving, and so keeps answering probes
    async fn spawn_responder(dialect: Dialect) -> SocketAddr {
        let options = SessionOptions::new(dialect);
        let mut server = Session::bind_udp("127.0.0.1:0".parse().unwrap(), &options)
            .await
            .unwrap();
        let addr = server.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let _ = server.receive(None).await;
            }
        });
        addr
    }

    #[tokio::test]
    async fn test_responder_reaches_alive() {
        for dialect in [Dialect::Counter, Dialect::Timestamp] {
            let addr = spawn_responder(dialect).await;
            let mut session = connect(dialect, addr).await;
            let mut prober = LivenessProber::new(Duration::from_millis(1000));
            assert_eq!(prober.state(), ProbeState::Idle);

            let started = Instant::now();
            let state = prober.probe(&mut session).await.unwrap();
            assert_eq!(state, ProbeState::Alive);
            assert!(started.elapsed() < prober.timeout());
            assert!(session.is_connected());
            assert!(session.latency().last_probe_rtt().is_some());
        }
    }

    #[tokio::test]
    async fn test_silent_peer_reaches_dead_after_timeout() {
        // Bound but never answers
        let silent = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let mut session = connect(Dialect::Counter, silent.local_addr().unwrap()).await;
        let mut prober = LivenessProber::new(Duration::from_millis(250));

        let started = Instant::now();
        let state = prober.probe(&mut session).await.unwrap();
        let elapsed = started.elapsed();

        assert_eq!(state, ProbeState::Dead);
        assert_eq!(prober.state(), ProbeState::Dead);
        assert!(elapsed >= Duration::from_millis(250));
        assert!(elapsed < Duration::from_millis(750), "took {:?}", elapsed);
        assert!(!session.is_connected());
    }

    #[tokio::test]
    async fn test_no_listener_waits_out_the_timer() {
        let gone = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = gone.local_addr().unwrap();
        drop(gone);

        let mut session = connect(Dialect::Counter, addr).await;
        let mut prober = LivenessProber::new(Duration::from_millis(200));

        let started = Instant::now();
        assert_eq!(prober.probe(&mut session).await.unwrap(), ProbeState::Dead);
        assert!(started.elapsed() >= Duration::from_millis(200));
    }

    #[tokio::test]
    async fn test_stale_data_is_discarded() {
        let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let mut session = connect(Dialect::Counter, peer.local_addr().unwrap()).await;

        let responder = tokio::spawn(async move {
            let mut buf = [0u8; 64];
            let (n, src) = peer.recv_from(&mut buf).await.unwrap();
            assert_eq!(&buf[..n], b"C0|\x05");
            peer.send_to(b"C9|sample text", src).await.unwrap();
            peer.send_to(b"garbage", src).await.unwrap();
            peer.send_to(b"C0|\x06", src).await.unwrap();
        });

        let mut prober = LivenessProber::new(Duration::from_secs(1));
        assert_eq!(prober.probe(&mut session).await.unwrap(), ProbeState::Alive);
        assert_eq!(session.stats().frames_received, 3);
        assert_eq!(session.stats().malformed_dropped, 1);
        responder.await.unwrap();
    }

    #[tokio::test]
    async fn test_probe_restarts_after_dead() {
        let silent = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let mut session = connect(Dialect::Timestamp, silent.local_addr().unwrap()).await;
        let mut prober = LivenessProber::new(Duration::from_millis(100));

        assert_eq!(prober.probe(&mut session).await.unwrap(), ProbeState::Dead);

        // Peer comes back and answers the next probe
        let answer = tokio::spawn(async move {
            let mut buf = [0u8; 64];
            loop {
                let (n, src) = silent.recv_from(&mut buf).await.unwrap();
                let boundary = buf[..n].iter().position(|&b| b == b' ').unwrap();
                let mut ack = buf[..=boundary].to_vec();
                ack.push(ACK);
                silent.send_to(&ack, src).await.unwrap();
            }
        });

        assert_eq!(prober.probe(&mut session).await.unwrap(), ProbeState::Alive);
        answer.abort();
    }

    #[tokio::test]
    async fn test_probe_on_closed_session_fails() {
        let silent = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let mut session = connect(Dialect::Counter, silent.local_addr().unwrap()).await;
        session.close().await;

        let mut prober = LivenessProber::new(Duration::from_millis(100));
        assert!(prober.probe(&mut session).await.is_err());
        assert_eq!(prober.state(), ProbeState::Dead);
    }
}
