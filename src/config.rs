//! Configuration module for the kafka-lite server.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.

use clap::Parser;
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Command-line arguments for the broker
#[derive(Parser, Debug, Default)]
#[command(name = "kafka-lite")]
#[command(author = "kafka-lite authors")]
#[command(version = "0.1.0")]
#[command(about = "A Kafka wire-protocol compatible broker front end", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Host or address to bind to (e.g., 0.0.0.0)
    #[arg(short = 'H', long)]
    pub host: Option<String>,

    /// Port to listen on
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Size in bytes of the per-connection read buffer
    #[arg(long)]
    pub read_buffer_size: Option<usize>,

    /// Maximum number of concurrent connections
    #[arg(long)]
    pub max_connections: Option<usize>,

    /// Number of worker threads (defaults to number of CPU cores)
    #[arg(short = 'w', long)]
    pub workers: Option<usize>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    pub log_level: Option<String>,
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server-related configuration
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_read_buffer_size")]
    pub read_buffer_size: usize,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    /// Listen backlog passed to listen(2)
    #[serde(default = "default_backlog")]
    pub backlog: i32,
    /// Number of worker threads
    pub workers: Option<usize>,
    /// Seconds to wait for open connections after shutdown is requested
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            read_buffer_size: default_read_buffer_size(),
            max_connections: default_max_connections(),
            backlog: default_backlog(),
            workers: None,
            shutdown_timeout: default_shutdown_timeout(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    9092
}

fn default_read_buffer_size() -> usize {
    1024
}

fn default_max_connections() -> usize {
    10_000
}

fn default_backlog() -> i32 {
    1024
}

fn default_shutdown_timeout() -> u64 {
    5
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Final resolved configuration. Immutable once built.
#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub read_buffer_size: usize,
    pub max_connections: usize,
    pub backlog: i32,
    pub workers: Option<usize>,
    pub shutdown_timeout: Duration,
    pub log_level: String,
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_cli(CliArgs::parse())
    }

    /// Merge parsed CLI args over the TOML file they point at (if any).
    pub fn from_cli(cli: CliArgs) -> Result<Self, ConfigError> {
        let toml_config = if let Some(ref config_path) = cli.config {
            let contents = std::fs::read_to_string(config_path)
                .map_err(|e| ConfigError::FileRead(config_path.clone(), e))?;
            toml::from_str(&contents)
                .map_err(|e| ConfigError::TomlParse(config_path.clone(), e))?
        } else {
            TomlConfig::default()
        };

        Self::merge(cli, toml_config)
    }

    fn merge(cli: CliArgs, toml_config: TomlConfig) -> Result<Self, ConfigError> {
        let server = toml_config.server;

        let config = Config {
            host: cli.host.unwrap_or(server.host),
            port: cli.port.unwrap_or(server.port),
            read_buffer_size: cli.read_buffer_size.unwrap_or(server.read_buffer_size),
            max_connections: cli.max_connections.unwrap_or(server.max_connections),
            backlog: server.backlog,
            workers: cli.workers.or(server.workers),
            shutdown_timeout: Duration::from_secs(server.shutdown_timeout),
            log_level: cli.log_level.unwrap_or(toml_config.logging.level),
        };

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        // A request header alone is 12 bytes.
        if self.read_buffer_size < 12 {
            return Err(ConfigError::Invalid {
                field: "read_buffer_size",
                reason: format!("must be at least 12 bytes, got {}", self.read_buffer_size),
            });
        }
        if self.max_connections == 0 {
            return Err(ConfigError::Invalid {
                field: "max_connections",
                reason: "must be greater than zero".to_string(),
            });
        }
        if self.workers == Some(0) {
            return Err(ConfigError::Invalid {
                field: "workers",
                reason: "must be greater than zero".to_string(),
            });
        }
        Ok(())
    }

    /// The `host:port` string the listener binds to.
    pub fn listen_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl Default for Config {
    fn default() -> Self {
        let server = ServerConfig::default();
        Config {
            host: server.host,
            port: server.port,
            read_buffer_size: server.read_buffer_size,
            max_connections: server.max_connections,
            backlog: server.backlog,
            workers: server.workers,
            shutdown_timeout: Duration::from_secs(server.shutdown_timeout),
            log_level: default_log_level(),
        }
    }
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file '{}': {}", .0.display(), .1)]
    FileRead(PathBuf, #[source] std::io::Error),

    #[error("Failed to parse config file '{}': {}", .0.display(), .1)]
    TomlParse(PathBuf, #[source] toml::de::Error),

    #[error("Invalid configuration: {field} - {reason}")]
    Invalid { field: &'static str, reason: String },
}
