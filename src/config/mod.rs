//! Configuration module
//!
//! Handles loading and saving Telelink configuration.

use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::network::{ClientConfig, ReconnectPolicy, ServerConfig, DEFAULT_QUEUE_CAPACITY};
use crate::protocol::{Dialect, DEFAULT_PORT};
use crate::transport::TransportKind;

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Serialize error: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("Config file not found: {0}")]
    NotFound(PathBuf),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

pub type ConfigResult<T> = Result<T, ConfigError>;

/// Main application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// General settings
    #[serde(default)]
    pub general: GeneralConfig,

    /// Network settings
    #[serde(default)]
    pub network: NetworkConfig,

    /// Probe and peer timeouts
    #[serde(default)]
    pub liveness: LivenessConfig,

    /// Retry schedule for the client
    #[serde(default)]
    pub reconnect: ReconnectConfig,
}

/// General configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    /// Human-readable name for this host
    pub name: String,
    /// Enable verbose logging
    #[serde(default)]
    pub verbose: bool,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            name: hostname::get()
                .map(|h| h.to_string_lossy().to_string())
                .unwrap_or_else(|_| "unknown".to_string()),
            verbose: false,
        }
    }
}

/// Network configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// Server host the client connects to
    #[serde(default = "default_host")]
    pub host: String,
    /// Port to connect to or listen on
    #[serde(default = "default_port")]
    pub port: u16,
    /// Interface the server binds to
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    #[serde(default)]
    pub transport: TransportKind,
    #[serde(default)]
    pub dialect: Dialect,
    /// Stream connection timeout in ms
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_connect_timeout() -> u64 {
    5000
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            bind_address: default_bind_address(),
            transport: TransportKind::default(),
            dialect: Dialect::default(),
            connect_timeout_ms: default_connect_timeout(),
        }
    }
}

/// Liveness configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LivenessConfig {
    /// How long a probe waits for its ACK
    #[serde(default = "default_one_second")]
    pub probe_timeout_ms: u64,
    /// Client: silence after which the server is considered gone
    #[serde(default = "default_one_second")]
    pub liveness_window_ms: u64,
    /// Client: probe before declaring a session established
    #[serde(default = "default_true")]
    pub probe_on_connect: bool,
    /// Server: silence after which a peer is dropped
    #[serde(default = "default_one_second")]
    pub peer_timeout_ms: u64,
}

fn default_one_second() -> u64 {
    1000
}

fn default_true() -> bool {
    true
}

impl Default for LivenessConfig {
    fn default() -> Self {
        Self {
            probe_timeout_ms: default_one_second(),
            liveness_window_ms: default_one_second(),
            probe_on_connect: default_true(),
            peer_timeout_ms: default_one_second(),
        }
    }
}

/// Reconnect configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconnectConfig {
    /// Wait after the first failure; 0 retries immediately
    #[serde(default = "default_initial_delay")]
    pub initial_delay_ms: u64,
    #[serde(default = "default_max_delay")]
    pub max_delay_ms: u64,
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
}

fn default_initial_delay() -> u64 {
    50
}

fn default_max_delay() -> u64 {
    2000
}

fn default_multiplier() -> f64 {
    2.0
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: default_initial_delay(),
            max_delay_ms: default_max_delay(),
            multiplier: default_multiplier(),
        }
    }
}

impl Config {
    /// Load configuration from a file
    pub fn load(path: &Path) -> ConfigResult<Self> {
        if !path.exists() {
            return Err(ConfigError::NotFound(path.to_path_buf()));
        }

        let contents = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from the default location
    pub fn load_default() -> ConfigResult<Self> {
        let config_paths = [
            dirs::config_dir().map(|p| p.join("telelink/config.toml")),
            Some(PathBuf::from("./telelink.toml")),
            Some(PathBuf::from("./config.toml")),
        ];

        for path in config_paths.iter().flatten() {
            if path.exists() {
                tracing::debug!("Loading configuration from {}", path.display());
                return Self::load(path);
            }
        }

        // Return default config if no file found
        Ok(Self::default())
    }

    /// Save configuration to a file
    pub fn save(&self, path: &Path) -> ConfigResult<()> {
        let contents = toml::to_string_pretty(self)?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        std::fs::write(path, contents)?;
        Ok(())
    }

    /// Check values serde cannot
    pub fn validate(&self) -> ConfigResult<()> {
        self.bind_address()?;

        if self.network.host.trim().is_empty() {
            return Err(ConfigError::Invalid("network.host is empty".to_string()));
        }
        if self.liveness.probe_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "liveness.probe_timeout_ms must be positive".to_string(),
            ));
        }
        if self.liveness.liveness_window_ms == 0 || self.liveness.peer_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "liveness windows must be positive".to_string(),
            ));
        }
        if !self.reconnect.multiplier.is_finite() || self.reconnect.multiplier < 1.0 {
            return Err(ConfigError::Invalid(format!(
                "reconnect.multiplier must be at least 1.0, got {}",
                self.reconnect.multiplier
            )));
        }
        if self.reconnect.max_delay_ms < self.reconnect.initial_delay_ms {
            return Err(ConfigError::Invalid(
                "reconnect.max_delay_ms is below reconnect.initial_delay_ms".to_string(),
            ));
        }
        Ok(())
    }

    /// Parsed server bind address
    pub fn bind_address(&self) -> ConfigResult<IpAddr> {
        self.network.bind_address.parse().map_err(|_| {
            ConfigError::Invalid(format!(
                "network.bind_address is not an IP address: {}",
                self.network.bind_address
            ))
        })
    }

    /// Runtime settings for [`crate::network::Client`]
    pub fn client_config(&self) -> ClientConfig {
        ClientConfig {
            transport: self.network.transport,
            dialect: self.network.dialect,
            probe_timeout: Duration::from_millis(self.liveness.probe_timeout_ms),
            liveness_window: Duration::from_millis(self.liveness.liveness_window_ms),
            probe_on_connect: self.liveness.probe_on_connect,
            connect_timeout: Duration::from_millis(self.network.connect_timeout_ms),
            reconnect: ReconnectPolicy {
                initial_delay: Duration::from_millis(self.reconnect.initial_delay_ms),
                max_delay: Duration::from_millis(self.reconnect.max_delay_ms),
                multiplier: self.reconnect.multiplier,
            },
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
        }
    }

    /// Runtime settings for [`crate::network::Server`]
    pub fn server_config(&self) -> ConfigResult<ServerConfig> {
        Ok(ServerConfig {
            transport: self.network.transport,
            dialect: self.network.dialect,
            bind_address: self.bind_address()?,
            port: self.network.port,
            peer_timeout: Duration::from_millis(self.liveness.peer_timeout_ms),
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
        })
    }
}

/// Generate a sample configuration file
pub fn generate_sample_config() -> ConfigResult<String> {
    let config = Config {
        general: GeneralConfig {
            name: "telemetry-rig".to_string(),
            verbose: false,
        },
        network: NetworkConfig {
            host: "192.168.1.20".to_string(),
            transport: TransportKind::Udp,
            dialect: Dialect::Counter,
            ..Default::default()
        },
        ..Default::default()
    };

    Ok(toml::to_string_pretty(&config)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.network.port, DEFAULT_PORT);
        assert_eq!(config.network.transport, TransportKind::Udp);
        assert_eq!(config.network.dialect, Dialect::Timestamp);
        assert_eq!(config.liveness.probe_timeout_ms, 1000);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_save_and_load() {
        let mut config = Config::default();
        config.network.transport = TransportKind::Tcp;
        config.reconnect.initial_delay_ms = 0;
        let file = NamedTempFile::new().unwrap();

        config.save(file.path()).unwrap();

        let loaded = Config::load(file.path()).unwrap();
        assert_eq!(loaded.network.port, config.network.port);
        assert_eq!(loaded.network.transport, TransportKind::Tcp);
        assert_eq!(loaded.reconnect.initial_delay_ms, 0);
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "[network]\nport = 5000\ndialect = \"counter\"\n\n[liveness]\nprobe_timeout_ms = 250").unwrap();

        let config = Config::load(file.path()).unwrap();
        assert_eq!(config.network.port, 5000);
        assert_eq!(config.network.dialect, Dialect::Counter);
        assert_eq!(config.network.host, "127.0.0.1");
        assert_eq!(config.liveness.probe_timeout_ms, 250);
        assert_eq!(config.liveness.liveness_window_ms, 1000);
        assert_eq!(config.reconnect.max_delay_ms, 2000);
    }

    #[test]
    fn test_missing_file() {
        let result = Config::load(Path::new("/nonexistent/telelink.toml"));
        assert!(matches!(result, Err(ConfigError::NotFound(_))));
    }

    #[test]
    fn test_invalid_values() {
        let mut config = Config::default();
        config.network.bind_address = "everywhere".to_string();
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
        assert!(config.server_config().is_err());

        let mut config = Config::default();
        config.reconnect.multiplier = 0.5;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        let mut config = Config::default();
        config.liveness.probe_timeout_ms = 0;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "[network]\ntransport = \"carrier-pigeon\"").unwrap();
        assert!(matches!(Config::load(file.path()), Err(ConfigError::Parse(_))));
    }

    #[test]
    fn test_runtime_conversions() {
        let mut config = Config::default();
        config.reconnect.initial_delay_ms = 100;
        config.reconnect.max_delay_ms = 400;

        let client = config.client_config();
        assert_eq!(client.probe_timeout, Duration::from_millis(1000));
        assert_eq!(client.reconnect.delay(3), Duration::from_millis(400));

        let server = config.server_config().unwrap();
        assert_eq!(server.port, DEFAULT_PORT);
        assert!(server.bind_address.is_unspecified());
    }

    #[test]
    fn test_sample_config() {
        let sample = generate_sample_config().unwrap();
        let parsed: Config = toml::from_str(&sample).unwrap();
        assert_eq!(parsed.general.name, "telemetry-rig");
        assert_eq!(parsed.network.dialect, Dialect::Counter);
        assert!(parsed.validate().is_ok());
    }
}
