//! Configuration module for the reactord server.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.

use crate::protocol::DEFAULT_MAX_FRAME_SIZE;
use crate::runtime::BackendType;
use clap::Parser;
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Command-line arguments for the server
#[derive(Parser, Debug, Default)]
#[command(name = "reactord")]
#[command(version = "0.1.0")]
#[command(about = "Single-threaded reactor server for a framed binary protocol", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Address to bind to (e.g., 127.0.0.1:12200)
    #[arg(short = 'l', long)]
    pub listen: Option<SocketAddr>,

    /// Readiness backend
    #[arg(short = 'b', long, value_enum)]
    pub backend: Option<BackendType>,

    /// Maximum number of concurrent client connections
    #[arg(short = 'm', long)]
    pub max_connections: Option<usize>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    pub log_level: Option<String>,
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct TomlConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server-related configuration
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServerConfig {
    /// Address to bind to
    #[serde(default = "default_listen")]
    pub listen: SocketAddr,
    /// Listen backlog
    #[serde(default = "default_backlog")]
    pub backlog: i32,
    /// Concurrent client limit; further accepts are closed immediately
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    /// Extra event table slots for descriptors the process opens itself
    #[serde(default = "default_reserved_fds")]
    pub reserved_fds: usize,
    #[serde(default)]
    pub backend: BackendType,
    /// Housekeeping tick in milliseconds
    #[serde(default = "default_tick_ms")]
    pub tick_ms: u64,
    /// Bytes requested by each socket read
    #[serde(default = "default_read_chunk")]
    pub read_chunk: usize,
    /// Largest accepted request body
    #[serde(default = "default_max_frame_size")]
    pub max_frame_size: u32,
    /// Close clients silent for this many seconds (0 = never)
    #[serde(default)]
    pub idle_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            backlog: default_backlog(),
            max_connections: default_max_connections(),
            reserved_fds: default_reserved_fds(),
            backend: BackendType::default(),
            tick_ms: default_tick_ms(),
            read_chunk: default_read_chunk(),
            max_frame_size: default_max_frame_size(),
            idle_timeout_secs: 0,
        }
    }
}

/// Logging configuration
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
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

fn default_listen() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 12200))
}

fn default_backlog() -> i32 {
    256
}

fn default_max_connections() -> usize {
    1024
}

fn default_reserved_fds() -> usize {
    96
}

fn default_tick_ms() -> u64 {
    100
}

fn default_read_chunk() -> usize {
    16 * 1024
}

fn default_max_frame_size() -> u32 {
    DEFAULT_MAX_FRAME_SIZE
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub listen: SocketAddr,
    pub backlog: i32,
    pub max_connections: usize,
    pub reserved_fds: usize,
    pub backend: BackendType,
    pub tick: Duration,
    pub read_chunk: usize,
    pub max_frame_size: u32,
    pub idle_timeout: Option<Duration>,
    pub log_level: String,
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    /// CLI arguments take precedence over TOML file values.
    pub fn load() -> crate::Result<Self> {
        let cli = CliArgs::parse();

        let toml_config = if let Some(ref config_path) = cli.config {
            let contents = std::fs::read_to_string(config_path)
                .map_err(|e| ConfigError::FileRead(config_path.clone(), e))?;
            toml::from_str(&contents)
                .map_err(|e| ConfigError::TomlParse(config_path.clone(), e))?
        } else {
            TomlConfig::default()
        };

        Ok(Self::merge(cli, toml_config)?)
    }

    /// Merge CLI args over TOML values and validate the result.
    pub fn merge(cli: CliArgs, toml_config: TomlConfig) -> Result<Self, ConfigError> {
        let config = Self::resolve(cli, toml_config);
        config.validate()?;
        Ok(config)
    }

    fn resolve(cli: CliArgs, toml_config: TomlConfig) -> Self {
        let server = toml_config.server;

        Config {
            listen: cli.listen.unwrap_or(server.listen),
            backlog: server.backlog,
            max_connections: cli.max_connections.unwrap_or(server.max_connections),
            reserved_fds: server.reserved_fds,
            backend: cli.backend.unwrap_or(server.backend),
            tick: Duration::from_millis(server.tick_ms),
            read_chunk: server.read_chunk,
            max_frame_size: server.max_frame_size,
            idle_timeout: (server.idle_timeout_secs > 0)
                .then(|| Duration::from_secs(server.idle_timeout_secs)),
            log_level: cli.log_level.unwrap_or(toml_config.logging.level),
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.max_connections == 0 {
            return Err(ConfigError::Invalid("max_connections must be non-zero"));
        }
        if self.tick.is_zero() {
            return Err(ConfigError::Invalid("tick_ms must be non-zero"));
        }
        if self.read_chunk == 0 {
            return Err(ConfigError::Invalid("read_chunk must be non-zero"));
        }
        if self.backlog <= 0 {
            return Err(ConfigError::Invalid("backlog must be positive"));
        }
        Ok(())
    }

    /// Event table size: one slot per descriptor number the process may
    /// hand out.
    pub fn table_capacity(&self) -> usize {
        self.max_connections + self.reserved_fds
    }

    /// Reader limit: one maximal frame plus one read's worth of the next.
    pub fn read_limit(&self) -> usize {
        crate::protocol::HEADER_SIZE + self.max_frame_size as usize + self.read_chunk
    }

    /// Staged reply bytes above which a client stops being read until its
    /// writer drains below the limit again.
    pub fn write_limit(&self) -> usize {
        self.read_limit()
    }

    /// Shrink `max_connections` so the event table fits under the process
    /// descriptor limit `nofile`. Returns true if the value changed.
    pub fn fit_descriptor_limit(&mut self, nofile: usize) -> bool {
        let usable = nofile.saturating_sub(self.reserved_fds).max(1);
        if self.max_connections <= usable {
            return false;
        }
        self.max_connections = usable;
        true
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::resolve(CliArgs::default(), TomlConfig::default())
    }
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file '{path}': {1}", path = .0.display())]
    FileRead(PathBuf, #[source] std::io::Error),

    #[error("Failed to parse config file '{path}': {1}", path = .0.display())]
    TomlParse(PathBuf, #[source] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(&'static str),
}
