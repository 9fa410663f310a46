//! Telelink - Tagged datagram envelopes with liveness probing
//!
//! Layers, bottom up:
//! - [`protocol`]: envelope codec and stream framing
//! - [`transport`]: UDP and TCP socket adapters
//! - [`session`]: one tagged conversation, probes and latency
//! - [`network`]: reconnecting client and multi-peer server
//! - [`config`]: TOML configuration

pub mod config;
pub mod network;
pub mod protocol;
pub mod session;
pub mod transport;
