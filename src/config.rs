//! Configuration for the echo server and client.
//!
//! Both binaries accept command-line arguments and an optional TOML
//! configuration file. CLI arguments take precedence over config file values.

use crate::codec::DEFAULT_MAX_LINE_LENGTH;
use crate::connection::HandlerSettings;
use clap::Parser;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default server port.
pub const DEFAULT_PORT: u16 = 9002;

/// Command-line arguments for the echo server
#[derive(Parser, Debug)]
#[command(name = "line-echo")]
#[command(author = "line-echo authors")]
#[command(version = "0.1.0")]
#[command(about = "A line-oriented TCP echo server", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Address to bind to (e.g., 0.0.0.0:9002)
    #[arg(short = 'l', long)]
    pub listen: Option<String>,

    /// Number of runtime worker threads (0 = number of CPU cores)
    #[arg(short = 'w', long)]
    pub workers: Option<usize>,

    /// Maximum concurrent connections (0 = unbounded)
    #[arg(long)]
    pub max_connections: Option<usize>,

    /// Maximum line length in bytes, newline excluded
    #[arg(long)]
    pub max_line_length: Option<usize>,

    /// Close connections idle for this many seconds (0 = never)
    #[arg(long)]
    pub idle_timeout: Option<u64>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    pub log_level: Option<String>,
}

/// Command-line arguments for the echo client
#[derive(Parser, Debug)]
#[command(name = "echo-client")]
#[command(author = "line-echo authors")]
#[command(version = "0.1.0")]
#[command(about = "Relay standard input to a line echo server", long_about = None)]
pub struct ClientArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Server address to connect to (e.g., 127.0.0.1:9002)
    #[arg(short = 's', long)]
    pub server: Option<String>,

    /// Maximum length in bytes of a line received from the server
    #[arg(long)]
    pub max_line_length: Option<usize>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    pub log_level: Option<String>,
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub client: ClientSection,
    #[serde(default)]
    pub logging: LoggingSection,
}

/// Server-related configuration
#[derive(Debug, Deserialize)]
pub struct ServerSection {
    /// Address to bind to
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Number of runtime worker threads
    pub workers: Option<usize>,
    /// Listen backlog
    #[serde(default = "default_backlog")]
    pub backlog: i32,
    /// Maximum concurrent connections, 0 for no limit
    #[serde(default)]
    pub max_connections: usize,
    /// Maximum line length in bytes
    #[serde(default = "default_max_line_length")]
    pub max_line_length: usize,
    /// Idle timeout in seconds, 0 disables it
    #[serde(default)]
    pub idle_timeout: u64,
    /// Seconds to wait for connections to close on shutdown
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout: u64,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            workers: None,
            backlog: default_backlog(),
            max_connections: 0,
            max_line_length: default_max_line_length(),
            idle_timeout: 0,
            shutdown_timeout: default_shutdown_timeout(),
        }
    }
}

/// Client-related configuration
#[derive(Debug, Deserialize)]
pub struct ClientSection {
    /// Server address
    #[serde(default = "default_server")]
    pub server: String,
    /// Seconds to wait for the connection to be established
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout: u64,
    /// Seconds to wait for outstanding echoes after input ends
    #[serde(default = "default_drain_timeout")]
    pub drain_timeout: u64,
    /// Maximum length in bytes of a line received from the server
    #[serde(default = "default_max_line_length")]
    pub max_line_length: usize,
}

impl Default for ClientSection {
    fn default() -> Self {
        Self {
            server: default_server(),
            connect_timeout: default_connect_timeout(),
            drain_timeout: default_drain_timeout(),
            max_line_length: default_max_line_length(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Deserialize, Default)]
pub struct LoggingSection {
    /// Log level
    pub level: Option<String>,
}

fn default_listen() -> String {
    format!("0.0.0.0:{DEFAULT_PORT}")
}

fn default_server() -> String {
    format!("127.0.0.1:{DEFAULT_PORT}")
}

fn default_backlog() -> i32 {
    1024
}

fn default_max_line_length() -> usize {
    DEFAULT_MAX_LINE_LENGTH
}

fn default_shutdown_timeout() -> u64 {
    5
}

fn default_connect_timeout() -> u64 {
    5
}

fn default_drain_timeout() -> u64 {
    2
}

impl TomlConfig {
    /// Read the file at `path`, or fall back to defaults when no path is given.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let Some(path) = path else {
            return Ok(TomlConfig::default());
        };

        let contents = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::FileRead(path.to_path_buf(), e))?;
        toml::from_str(&contents).map_err(|e| ConfigError::TomlParse(path.to_path_buf(), e))
    }
}

/// Final resolved server configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub listen: String,
    /// 0 means one worker per CPU core
    pub workers: usize,
    pub backlog: i32,
    /// 0 means unbounded
    pub max_connections: usize,
    pub max_line_length: usize,
    /// Seconds, 0 disables
    pub idle_timeout: u64,
    pub shutdown_timeout: u64,
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self::merge(
            CliArgs {
                config: None,
                listen: None,
                workers: None,
                max_connections: None,
                max_line_length: None,
                idle_timeout: None,
                log_level: None,
            },
            TomlConfig::default(),
        )
    }
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_args(CliArgs::parse())
    }

    pub fn from_args(cli: CliArgs) -> Result<Self, ConfigError> {
        let toml_config = TomlConfig::load(cli.config.as_deref())?;
        let config = Self::merge(cli, toml_config);
        config.validate()?;
        Ok(config)
    }

    // CLI takes precedence
    fn merge(cli: CliArgs, toml_config: TomlConfig) -> Self {
        let server = toml_config.server;
        Config {
            listen: cli.listen.unwrap_or(server.listen),
            workers: cli.workers.or(server.workers).unwrap_or(0),
            backlog: server.backlog,
            max_connections: cli.max_connections.unwrap_or(server.max_connections),
            max_line_length: cli.max_line_length.unwrap_or(server.max_line_length),
            idle_timeout: cli.idle_timeout.unwrap_or(server.idle_timeout),
            shutdown_timeout: server.shutdown_timeout,
            log_level: cli
                .log_level
                .or(toml_config.logging.level)
                .unwrap_or_else(|| "info".to_string()),
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.max_line_length == 0 {
            return Err(ConfigError::Invalid(
                "max_line_length must be greater than 0".to_string(),
            ));
        }
        if self.backlog <= 0 {
            return Err(ConfigError::Invalid(
                "backlog must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }

    /// Limits applied to every accepted connection.
    pub fn handler_settings(&self) -> HandlerSettings {
        HandlerSettings {
            max_line_length: self.max_line_length,
            idle_timeout: (self.idle_timeout > 0).then(|| Duration::from_secs(self.idle_timeout)),
        }
    }
}

/// Final resolved client configuration
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub server: String,
    pub connect_timeout: Duration,
    pub drain_timeout: Duration,
    /// Should be at least the server's limit, or long echoes are rejected
    pub max_line_length: usize,
    pub log_level: String,
}

impl ClientConfig {
    /// Load configuration from CLI args and optional TOML file.
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_args(ClientArgs::parse())
    }

    pub fn from_args(cli: ClientArgs) -> Result<Self, ConfigError> {
        let toml_config = TomlConfig::load(cli.config.as_deref())?;
        let client = toml_config.client;

        let config = ClientConfig {
            server: cli.server.unwrap_or(client.server),
            connect_timeout: Duration::from_secs(client.connect_timeout),
            drain_timeout: Duration::from_secs(client.drain_timeout),
            max_line_length: cli.max_line_length.unwrap_or(client.max_line_length),
            // The terminal is the transcript; keep logs quiet by default.
            log_level: cli
                .log_level
                .or(toml_config.logging.level)
                .unwrap_or_else(|| "warn".to_string()),
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.max_line_length == 0 {
            return Err(ConfigError::Invalid(
                "max_line_length must be greater than 0".to_string(),
            ));
        }
        if self.connect_timeout.is_zero() {
            return Err(ConfigError::Invalid(
                "connect_timeout must be greater than 0".to_string(),
            ));
        }
        // A zero drain would drop echoes still in flight when input ends.
        if self.drain_timeout.is_zero() {
            return Err(ConfigError::Invalid(
                "drain_timeout must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}

/// Configuration loading errors
#[derive(Debug)]
pub enum ConfigError {
    FileRead(PathBuf, std::io::Error),
    TomlParse(PathBuf, toml::de::Error),
    Invalid(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::FileRead(path, e) => {
                write!(f, "Failed to read config file '{}': {}", path.display(), e)
            }
            ConfigError::TomlParse(path, e) => {
                write!(f, "Failed to parse config file '{}': {}", path.display(), e)
            }
            ConfigError::Invalid(msg) => write!(f, "Invalid configuration: {msg}"),
        }
    }
}

impl std::error::Error for ConfigError {}
