//! Configuration module for the framewire server.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values. Values are read
//! once when the server, handler and connections are constructed; there is
//! no hot reload.

use clap::Parser;
use serde::Deserialize;
use std::path::PathBuf;

/// Command-line arguments for the server
#[derive(Parser, Debug)]
#[command(name = "framewire")]
#[command(author = "framewire authors")]
#[command(version = "0.1.0")]
#[command(about = "A length-prefixed TCP application server", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Address to bind to (e.g., 0.0.0.0:8999)
    #[arg(short = 'l', long)]
    pub listen: Option<String>,

    /// Server name used in logs
    #[arg(long)]
    pub name: Option<String>,

    /// Maximum number of live connections
    #[arg(long)]
    pub max_conn: Option<usize>,

    /// Maximum body size of a single frame in bytes
    #[arg(long)]
    pub max_package_size: Option<u32>,

    /// Number of dispatch workers (0 = one task per request)
    #[arg(short = 'w', long)]
    pub workers: Option<usize>,

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
    pub protocol: ProtocolConfig,
    #[serde(default)]
    pub dispatch: DispatchConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server-related configuration
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    /// Address to bind to
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Name reported in logs
    #[serde(default = "default_name")]
    pub name: String,
    /// Maximum number of live connections
    #[serde(default = "default_max_conn")]
    pub max_conn: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            name: default_name(),
            max_conn: default_max_conn(),
        }
    }
}

/// Framing-related configuration
#[derive(Debug, Deserialize)]
pub struct ProtocolConfig {
    /// Largest body a peer may declare in a frame header
    #[serde(default = "default_max_package_size")]
    pub max_package_size: u32,
    /// Capacity of each connection's outbound frame channel
    #[serde(default = "default_max_msg_chan_len")]
    pub max_msg_chan_len: usize,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            max_package_size: default_max_package_size(),
            max_msg_chan_len: default_max_msg_chan_len(),
        }
    }
}

/// Dispatch policy configuration
#[derive(Debug, Deserialize)]
pub struct DispatchConfig {
    /// Number of persistent workers (0 = direct mode)
    #[serde(default = "default_worker_pool_size")]
    pub worker_pool_size: usize,
    /// Capacity of the shared task queue in pooled mode
    #[serde(default = "default_max_worker_task_len")]
    pub max_worker_task_len: usize,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            worker_pool_size: default_worker_pool_size(),
            max_worker_task_len: default_max_worker_task_len(),
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
    "0.0.0.0:8999".to_string()
}

fn default_name() -> String {
    "framewire".to_string()
}

fn default_max_conn() -> usize {
    1024
}

fn default_max_package_size() -> u32 {
    4096
}

fn default_max_msg_chan_len() -> usize {
    1024
}

fn default_worker_pool_size() -> usize {
    10
}

fn default_max_worker_task_len() -> usize {
    1024
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub listen: String,
    pub name: String,
    pub max_conn: usize,
    pub max_package_size: u32,
    pub max_msg_chan_len: usize,
    pub worker_pool_size: usize,
    pub max_worker_task_len: usize,
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self::merge(CliArgs::empty(), TomlConfig::default())
    }
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    /// CLI arguments take precedence over TOML file values.
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_cli(CliArgs::parse())
    }

    /// Resolve already-parsed CLI arguments against the optional TOML file.
    pub fn from_cli(cli: CliArgs) -> Result<Self, ConfigError> {
        // Load TOML config if specified
        let toml_config = if let Some(ref config_path) = cli.config {
            let contents = std::fs::read_to_string(config_path)
                .map_err(|e| ConfigError::FileRead(config_path.clone(), e))?;
            toml::from_str(&contents)
                .map_err(|e| ConfigError::TomlParse(config_path.clone(), e))?
        } else {
            TomlConfig::default()
        };

        let config = Self::merge(cli, toml_config);
        config.validate()?;
        Ok(config)
    }

    fn merge(cli: CliArgs, toml_config: TomlConfig) -> Self {
        Config {
            listen: cli.listen.unwrap_or(toml_config.server.listen),
            name: cli.name.unwrap_or(toml_config.server.name),
            max_conn: cli.max_conn.unwrap_or(toml_config.server.max_conn),
            max_package_size: cli
                .max_package_size
                .unwrap_or(toml_config.protocol.max_package_size),
            max_msg_chan_len: toml_config.protocol.max_msg_chan_len,
            worker_pool_size: cli
                .workers
                .unwrap_or(toml_config.dispatch.worker_pool_size),
            max_worker_task_len: toml_config.dispatch.max_worker_task_len,
            log_level: if cli.log_level != "info" {
                cli.log_level
            } else {
                toml_config.logging.level
            },
        }
    }

    /// Reject values the runtime cannot honour (zero-capacity channels or
    /// a frame limit that admits no payload).
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_package_size == 0 {
            return Err(ConfigError::Invalid(
                "protocol.max_package_size must be at least 1".to_string(),
            ));
        }
        if self.max_msg_chan_len == 0 {
            return Err(ConfigError::Invalid(
                "protocol.max_msg_chan_len must be at least 1".to_string(),
            ));
        }
        if self.worker_pool_size > 0 && self.max_worker_task_len == 0 {
            return Err(ConfigError::Invalid(
                "dispatch.max_worker_task_len must be at least 1 when workers are enabled"
                    .to_string(),
            ));
        }
        Ok(())
    }
}

impl CliArgs {
    fn empty() -> Self {
        Self {
            config: None,
            listen: None,
            name: None,
            max_conn: None,
            max_package_size: None,
            workers: None,
            log_level: default_log_level(),
        }
    }
}

/// Configuration loading errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file '{path}': {1}", path = .0.display())]
    FileRead(PathBuf, std::io::Error),
    #[error("Failed to parse config file '{path}': {1}", path = .0.display())]
    TomlParse(PathBuf, toml::de::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}
