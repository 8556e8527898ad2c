//! Configuration module for keepalive-echo.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.

use clap::{Parser, ValueEnum};
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// How a non-GET request body is turned into the response body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum EchoPolicy {
    /// Echo the whole body, reassembled from every chunk.
    #[default]
    Full,
    /// Echo only the first chunk; later chunks are read and dropped.
    FirstChunk,
}

/// Command-line arguments for the echo server
#[derive(Parser, Debug)]
#[command(name = "keepalive-echo")]
#[command(author = "keepalive-echo authors")]
#[command(version = "0.1.0")]
#[command(about = "An HTTP echo server with keep-alive timeouts", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Address to bind to (e.g., 0.0.0.0:8080)
    #[arg(short = 'l', long)]
    pub listen: Option<String>,

    /// Idle time in milliseconds a persistent connection is kept open (0 disables keep-alive)
    #[arg(short = 'k', long)]
    pub keep_alive_timeout_ms: Option<u64>,

    /// Time in milliseconds allowed to receive a complete request head
    #[arg(long)]
    pub headers_timeout_ms: Option<u64>,

    /// Maximum request body size in bytes
    #[arg(long)]
    pub max_body_size: Option<usize>,

    /// Which part of a non-GET body is echoed back
    #[arg(short = 'e', long, value_enum)]
    pub echo: Option<EchoPolicy>,

    /// Number of worker threads (defaults to a single-threaded event loop)
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
    pub http: HttpConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Listener-related configuration
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    /// Address to bind to
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Number of worker threads
    pub workers: Option<usize>,
    /// Maximum number of concurrently served connections
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            workers: None,
            max_connections: default_max_connections(),
        }
    }
}

/// HTTP connection handling configuration
#[derive(Debug, Deserialize)]
pub struct HttpConfig {
    #[serde(default = "default_keep_alive_timeout_ms")]
    pub keep_alive_timeout_ms: u64,
    #[serde(default = "default_headers_timeout_ms")]
    pub headers_timeout_ms: u64,
    #[serde(default = "default_max_header_size")]
    pub max_header_size: usize,
    #[serde(default = "default_max_body_size")]
    pub max_body_size: usize,
    #[serde(default)]
    pub echo: EchoPolicy,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            keep_alive_timeout_ms: default_keep_alive_timeout_ms(),
            headers_timeout_ms: default_headers_timeout_ms(),
            max_header_size: default_max_header_size(),
            max_body_size: default_max_body_size(),
            echo: EchoPolicy::default(),
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
    "0.0.0.0:8080".to_string()
}

fn default_max_connections() -> usize {
    10_000
}

fn default_keep_alive_timeout_ms() -> u64 {
    10_000 // 10 seconds
}

fn default_headers_timeout_ms() -> u64 {
    10_000 // 10 seconds
}

fn default_max_header_size() -> usize {
    16 * 1024 // 16 KB
}

fn default_max_body_size() -> usize {
    16 * 1024 * 1024 // 16 MB
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub listen: String,
    pub workers: Option<usize>,
    pub max_connections: usize,
    pub keep_alive_timeout: Duration,
    pub headers_timeout: Duration,
    pub max_header_size: usize,
    pub max_body_size: usize,
    pub echo_policy: EchoPolicy,
    pub log_level: String,
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    /// CLI arguments take precedence over TOML file values.
    pub fn load() -> Result<Self, ConfigError> {
        let cli = CliArgs::parse();

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

    /// Merge CLI args with TOML config (CLI takes precedence)
    pub fn merge(cli: CliArgs, toml_config: TomlConfig) -> Self {
        Config {
            listen: cli.listen.unwrap_or(toml_config.server.listen),
            workers: cli.workers.or(toml_config.server.workers),
            max_connections: toml_config.server.max_connections,
            keep_alive_timeout: Duration::from_millis(
                cli.keep_alive_timeout_ms
                    .unwrap_or(toml_config.http.keep_alive_timeout_ms),
            ),
            headers_timeout: Duration::from_millis(
                cli.headers_timeout_ms
                    .unwrap_or(toml_config.http.headers_timeout_ms),
            ),
            max_header_size: toml_config.http.max_header_size,
            max_body_size: cli.max_body_size.unwrap_or(toml_config.http.max_body_size),
            echo_policy: cli.echo.unwrap_or(toml_config.http.echo),
            log_level: if cli.log_level != "info" {
                cli.log_level
            } else {
                toml_config.logging.level
            },
        }
    }

    /// Reject settings the server cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.headers_timeout.is_zero() {
            return Err(ConfigError::Invalid(
                "headers timeout must be greater than zero".to_string(),
            ));
        }
        if self.max_header_size == 0 {
            return Err(ConfigError::Invalid(
                "max_header_size must be greater than zero".to_string(),
            ));
        }
        if self.max_connections == 0 {
            return Err(ConfigError::Invalid(
                "max_connections must be greater than zero".to_string(),
            ));
        }
        if self.workers == Some(0) {
            return Err(ConfigError::Invalid(
                "workers must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    /// Whether responses may leave the connection open.
    pub fn keep_alive_enabled(&self) -> bool {
        !self.keep_alive_timeout.is_zero()
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::merge(
            CliArgs {
                config: None,
                listen: None,
                keep_alive_timeout_ms: None,
                headers_timeout_ms: None,
                max_body_size: None,
                echo: None,
                workers: None,
                log_level: default_log_level(),
            },
            TomlConfig::default(),
        )
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
            ConfigError::Invalid(msg) => write!(f, "Invalid configuration: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}
