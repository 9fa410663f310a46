//! Telelink - Tagged datagram envelopes with liveness probing
//!
//! Demo server and client exercising the library end to end.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use bytes::Bytes;
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use telelink::config::{self, Config};
use telelink::network::{Client, ClientEvent, Server, ServerEvent};
use telelink::protocol::Dialect;
use telelink::transport::TransportKind;

/// Telelink - tagged datagram envelopes with liveness probing
#[derive(Parser)]
#[command(name = "telelink")]
#[command(author = "Telelink Contributors")]
#[command(version = "0.1.0")]
#[command(about = "Probe, stream and measure latency over UDP or TCP", long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Socket type (udp or tcp)
    #[arg(short, long, global = true)]
    transport: Option<TransportKind>,

    /// Envelope tagging (timestamp or counter)
    #[arg(short, long, global = true)]
    dialect: Option<Dialect>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the demo server
    Server {
        /// Port to listen on
        #[arg(short, long)]
        port: Option<u16>,

        /// Interface to bind to
        #[arg(short, long)]
        bind: Option<String>,

        /// Delay between streamed samples (ms)
        #[arg(long, default_value_t = 10)]
        interval_ms: u64,
    },

    /// Run the demo client
    Client {
        /// Server host
        host: Option<String>,

        /// Server port
        port: Option<String>,

        /// Delay between keep-alive rounds (ms)
        #[arg(long, default_value_t = 10)]
        interval_ms: u64,
    },

    /// Show current configuration
    Config {
        /// Generate sample configuration
        #[arg(long)]
        generate: bool,

        /// Output path for generated config
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Load configuration
    let mut config = if let Some(config_path) = &cli.config {
        Config::load(config_path)?
    } else {
        Config::load_default().unwrap_or_default()
    };

    // Initialize logging
    let filter = if cli.verbose || config.general.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .init();

    if let Some(transport) = cli.transport {
        config.network.transport = transport;
    }
    if let Some(dialect) = cli.dialect {
        config.network.dialect = dialect;
    }

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                println!("\nShutting down...");
                cancel.cancel();
            }
        });
    }

    match cli.command {
        Commands::Server {
            port,
            bind,
            interval_ms,
        } => {
            if let Some(port) = port {
                config.network.port = port;
            }
            if let Some(bind) = bind {
                config.network.bind_address = bind;
            }
            config.validate()?;
            run_server(config, Duration::from_millis(interval_ms.max(1)), cancel).await?;
        }
        Commands::Client {
            host,
            port,
            interval_ms,
        } => {
            if let Some(host) = host {
                config.network.host = host;
            }
            let port = port.unwrap_or_else(|| config.network.port.to_string());
            config.validate()?;
            run_client(config, port, Duration::from_millis(interval_ms.max(1)), cancel).await?;
        }
        Commands::Config { generate, output } => {
            if generate {
                let sample = config::generate_sample_config()?;
                if let Some(path) = output {
                    std::fs::write(&path, &sample)?;
                    println!("Configuration written to: {}", path.display());
                } else {
                    println!("{}", sample);
                }
            } else {
                println!("{}", toml::to_string_pretty(&config)?);
            }
        }
    }

    Ok(())
}

/// What the demo server does with one inbound command
#[derive(Debug, PartialEq, Eq)]
enum Command {
    StartStream,
    StopStream,
    KeepAlive,
    Sample(String),
    Unknown(String),
}

impl Command {
    fn parse(payload: &[u8]) -> Self {
        let text = String::from_utf8_lossy(payload).trim().to_string();
        match text.as_str() {
            "G 0" => Command::StartStream,
            "S 0" => Command::StopStream,
            "A 0" => Command::KeepAlive,
            _ if text.starts_with("S 1") => Command::Sample(text),
            _ => Command::Unknown(text),
        }
    }
}

/// Run the demo server
async fn run_server(config: Config, interval: Duration, cancel: CancellationToken) -> anyhow::Result<()> {
    let mut server = Server::new(config.server_config()?);
    let mut event_rx = server
        .take_event_receiver()
        .ok_or_else(|| anyhow::anyhow!("server event receiver already taken"))?;

    let local_addr = server.start().await?;

    println!("\n========================================");
    println!("  Telelink Server Running");
    println!("========================================");
    println!("  Host: {}", config.general.name);
    println!("  Address: {}://{}", config.network.transport, local_addr);
    println!("  Dialect: {}", config.network.dialect);
    println!("========================================");
    println!("\nWaiting for clients...");
    println!("Press Ctrl+C to stop.\n");

    let mut streaming: HashSet<SocketAddr> = HashSet::new();
    let mut ticker = tokio::time::interval(interval);
    let sample = Bytes::from_static(b"sample text");

    // Main event loop
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,

            Some(event) = event_rx.recv() => {
                match event {
                    ServerEvent::PeerSeen { addr } => {
                        println!("+ Client seen: {}", addr);
                    }
                    ServerEvent::MessageReceived { addr, payload } => {
                        match Command::parse(&payload) {
                            Command::StartStream => {
                                tracing::info!("{} asked for data", addr);
                                streaming.insert(addr);
                            }
                            Command::StopStream => {
                                tracing::info!("{} stopped the stream", addr);
                                streaming.remove(&addr);
                            }
                            Command::KeepAlive => tracing::debug!("Keep-alive from {}", addr),
                            Command::Sample(text) => tracing::info!("{}: {}", addr, text),
                            Command::Unknown(text) => tracing::warn!("Unknown command from {}: {:?}", addr, text),
                        }
                    }
                    ServerEvent::PeerLost { addr, idle } => {
                        tracing::warn!("Client is gone: {} (silent {:?})", addr, idle);
                        streaming.remove(&addr);
                        println!("- Client lost: {}", addr);
                    }
                    ServerEvent::PeerDisconnected { addr, reason } => {
                        streaming.remove(&addr);
                        println!("- Client disconnected: {} ({})", addr, reason);
                    }
                    ServerEvent::Error { message } => {
                        tracing::error!("Server error: {}", message);
                    }
                    ServerEvent::Started { .. } | ServerEvent::Stopped => {}
                }
            }

            _ = ticker.tick(), if !streaming.is_empty() => {
                for addr in &streaming {
                    if let Err(e) = server.send_to(*addr, sample.clone()).await {
                        tracing::debug!("Sample to {} not sent: {}", addr, e);
                    }
                }
            }
        }
    }

    server.stop().await?;
    tracing::info!("Server stopped");

    Ok(())
}

/// Run the demo client
async fn run_client(
    config: Config,
    port: String,
    interval: Duration,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    let host = config.network.host.clone();
    let mut client = Client::new(config.client_config());
    let mut event_rx = client
        .take_event_receiver()
        .ok_or_else(|| anyhow::anyhow!("client event receiver already taken"))?;

    // Ctrl-C during setup stops the retry loop too
    let client_cancel = client.cancellation_token();
    let setup_cancel = cancel.clone();
    let forward = tokio::spawn(async move {
        setup_cancel.cancelled().await;
        client_cancel.cancel();
    });

    println!("Connecting to {}://{}:{}...", config.network.transport, host, port);
    if let Err(e) = client.setup(&host, &port).await {
        forward.abort();
        if cancel.is_cancelled() {
            return Ok(());
        }
        return Err(e.into());
    }

    println!("\n========================================");
    println!("  Telelink Client Connected");
    println!("========================================");
    println!("  Local: {}", config.general.name);
    println!("  Server: {}:{}", host, port);
    println!("  Dialect: {}", config.network.dialect);
    println!("========================================");
    println!("\nPress Ctrl+C to disconnect.\n");

    // Tell the server to start streaming
    client.send("G 0");

    let mut ticker = tokio::time::interval(interval);
    let mut keep_alive = true;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,

            Some(event) = event_rx.recv() => {
                match event {
                    ClientEvent::Disconnected { reason } => {
                        tracing::warn!("Server is gone... {}", reason);
                    }
                    ClientEvent::Reconnected { server, attempts } => {
                        tracing::info!("Reconnected to {} after {} attempt(s)", server, attempts);
                        // Nothing is replayed; ask for the stream again
                        client.send("G 0");
                    }
                    ClientEvent::AttemptFailed { attempt, reason } => {
                        tracing::debug!("Attempt {} failed: {}", attempt, reason);
                    }
                    ClientEvent::Connected { .. } => {}
                }
            }

            received = client.receive(None) => {
                match received {
                    Ok(payload) => tracing::info!(
                        "New in RX queue: {} (latency {} ms)",
                        String::from_utf8_lossy(&payload),
                        client.last_latency_ms()
                    ),
                    Err(_) => break,
                }
            }

            _ = ticker.tick() => {
                if keep_alive {
                    client.send("A 0");
                } else {
                    client.send("S 1 103 204 4444 24 8");
                }
                keep_alive = !keep_alive;
            }
        }
    }

    tracing::info!("Stopping nicely");
    client.send("S 0");
    // Let the driver flush the stop request
    tokio::time::sleep(Duration::from_millis(100)).await;

    client.shutdown().await;
    forward.abort();
    tracing::info!("Goodbye");

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parsing() {
        let cli = Cli::try_parse_from(["telelink", "--transport", "tcp", "client", "localhost", "46188"]).unwrap();
        assert_eq!(cli.transport, Some(TransportKind::Tcp));
        assert!(matches!(cli.command, Commands::Client { ref host, .. } if host.as_deref() == Some("localhost")));

        let cli = Cli::try_parse_from(["telelink", "server", "-d", "counter", "--port", "5000"]).unwrap();
        assert_eq!(cli.dialect, Some(Dialect::Counter));

        assert!(Cli::try_parse_from(["telelink", "--transport", "sctp", "server"]).is_err());
    }

    #[test]
    fn test_command_parsing() {
        assert_eq!(Command::parse(b"G 0"), Command::StartStream);
        assert_eq!(Command::parse(b"S 0"), Command::StopStream);
        assert_eq!(Command::parse(b"A 0\n"), Command::KeepAlive);
        assert_eq!(
            Command::parse(b"S 1 103 204 4444 24 8"),
            Command::Sample("S 1 103 204 4444 24 8".to_string())
        );
        assert_eq!(Command::parse(b"X"), Command::Unknown("X".to_string()));
    }
}
