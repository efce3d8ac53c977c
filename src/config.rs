//! Configuration module for resp-server.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.

use clap::{Parser, ValueEnum};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Connection handler to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum ProtocolType {
    /// Redis RESP protocol
    Resp,
    /// Line echo
    Echo,
}

/// Command-line arguments for the server
#[derive(Parser, Debug)]
#[command(name = "resp-server")]
#[command(version)]
#[command(about = "A RESP protocol server", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Address to bind to (e.g., 127.0.0.1:6379)
    #[arg(short = 'l', long)]
    pub listen: Option<String>,

    /// Maximum number of concurrent connections
    #[arg(short = 'n', long)]
    pub max_connections: Option<usize>,

    /// Idle connection timeout in seconds (0 = never)
    #[arg(short = 't', long)]
    pub timeout: Option<u64>,

    /// Seconds each connection gets to finish in-flight work on shutdown
    #[arg(short = 'g', long)]
    pub shutdown_grace: Option<u64>,

    /// Connection handler to run
    #[arg(short = 'p', long, value_enum)]
    pub protocol: Option<ProtocolType>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    pub log_level: String,
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
    /// Address to bind to
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Maximum number of concurrent connections
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    /// Idle connection timeout in seconds
    #[serde(default)]
    pub timeout: u64,
    /// Shutdown grace period in seconds
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace: u64,
    /// Connection handler
    #[serde(default = "default_protocol")]
    pub protocol: ProtocolType,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            max_connections: default_max_connections(),
            timeout: 0,
            shutdown_grace: default_shutdown_grace(),
            protocol: default_protocol(),
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

fn default_listen() -> String {
    "127.0.0.1:6379".to_string()
}

fn default_max_connections() -> usize {
    10000
}

fn default_shutdown_grace() -> u64 {
    10
}

fn default_protocol() -> ProtocolType {
    ProtocolType::Resp
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub listen: String,
    pub max_connections: usize,
    /// Idle connection timeout; `None` disables it.
    pub timeout: Option<Duration>,
    pub shutdown_grace: Duration,
    pub protocol: ProtocolType,
    pub log_level: String,
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_args(CliArgs::parse())
    }

    /// Merge parsed CLI args with the TOML file they point at, if any.
    /// CLI arguments take precedence over TOML file values.
    pub fn from_args(cli: CliArgs) -> Result<Self, ConfigError> {
        let toml_config = match cli.config {
            Some(ref path) => read_toml(path)?,
            None => TomlConfig::default(),
        };
        let server = toml_config.server;

        let timeout = cli.timeout.unwrap_or(server.timeout);
        let max_connections = cli.max_connections.unwrap_or(server.max_connections);
        if max_connections == 0 {
            return Err(ConfigError::Invalid(
                "max_connections must be at least 1".to_string(),
            ));
        }

        Ok(Config {
            listen: cli.listen.unwrap_or(server.listen),
            max_connections,
            timeout: (timeout > 0).then(|| Duration::from_secs(timeout)),
            shutdown_grace: Duration::from_secs(
                cli.shutdown_grace.unwrap_or(server.shutdown_grace),
            ),
            protocol: cli.protocol.unwrap_or(server.protocol),
            log_level: if cli.log_level != "info" {
                cli.log_level
            } else {
                toml_config.logging.level
            },
        })
    }
}

fn read_toml(path: &Path) -> Result<TomlConfig, ConfigError> {
    let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::FileRead {
        path: path.to_path_buf(),
        source,
    })?;
    toml::from_str(&contents).map_err(|source| ConfigError::TomlParse {
        path: path.to_path_buf(),
        source,
    })
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file '{}': {source}", .path.display())]
    FileRead {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Failed to parse config file '{}': {source}", .path.display())]
    TomlParse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}
