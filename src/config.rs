//! Configuration for the archbench demo server.
//!
//! Supports both command-line arguments and a TOML configuration file.
//! CLI arguments take precedence over config file values.

use crate::arch::Architecture;
use crate::endpoint::Port;
use clap::Parser;
use serde::Deserialize;
use std::path::PathBuf;

/// Command-line arguments for the demo server
#[derive(Parser, Debug)]
#[command(name = "archbench")]
#[command(version = "0.1.0")]
#[command(about = "Echo server running one of the archbench architectures", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Port to listen on (all interfaces)
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Server architecture
    #[arg(short, long, value_enum)]
    pub architecture: Option<Architecture>,

    /// Worker threads for the async runtime (0 = number of CPU cores)
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
    pub runtime: ServerOptions,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server-related configuration
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub architecture: Architecture,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            architecture: Architecture::default(),
        }
    }
}

/// Tuning knobs shared by all server architectures.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct ServerOptions {
    /// Listen backlog
    #[serde(default = "default_backlog")]
    pub backlog: i32,
    /// Async runtime worker threads (0 = number of CPU cores)
    #[serde(default)]
    pub async_workers: usize,
    /// Readiness events fetched per reactor poll
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            backlog: default_backlog(),
            async_workers: 0,
            event_capacity: default_event_capacity(),
        }
    }
}

impl ServerOptions {
    pub(crate) fn worker_threads(&self) -> usize {
        if self.async_workers == 0 {
            num_cpus()
        } else {
            self.async_workers
        }
    }
}

/// Logging configuration
#[derive(Debug, Deserialize)]
pub struct LoggingConfig {
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

fn default_port() -> u16 {
    8082
}

fn default_backlog() -> i32 {
    1024
}

fn default_event_capacity() -> usize {
    1024
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub port: Port,
    pub architecture: Architecture,
    pub options: ServerOptions,
    pub log_level: String,
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    pub fn load() -> Result<Self, ConfigError> {
        let cli = CliArgs::parse();

        let toml_config = if let Some(ref config_path) = cli.config {
            let contents = std::fs::read_to_string(config_path)
                .map_err(|e| ConfigError::FileRead(config_path.clone(), e))?;
            toml::from_str(&contents)
                .map_err(|e| ConfigError::TomlParse(config_path.clone(), e))?
        } else {
            TomlConfig::default()
        };

        Self::resolve(cli, toml_config)
    }

    /// Merge CLI args over the TOML config.
    pub fn resolve(cli: CliArgs, toml_config: TomlConfig) -> Result<Self, ConfigError> {
        let raw_port = cli.port.unwrap_or(toml_config.server.port);
        let port = Port::new(raw_port).map_err(|_| ConfigError::InvalidPort(raw_port))?;

        let mut options = toml_config.runtime;
        if let Some(workers) = cli.workers {
            options.async_workers = workers;
        }

        Ok(Config {
            port,
            architecture: cli
                .architecture
                .unwrap_or(toml_config.server.architecture),
            options,
            log_level: if cli.log_level != "info" {
                cli.log_level
            } else {
                toml_config.logging.level
            },
        })
    }
}

/// Configuration loading errors
#[derive(Debug)]
pub enum ConfigError {
    FileRead(PathBuf, std::io::Error),
    TomlParse(PathBuf, toml::de::Error),
    InvalidPort(u16),
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
            ConfigError::InvalidPort(port) => {
                write!(f, "Invalid port {port}: must be between 1 and 65535")
            }
        }
    }
}

impl std::error::Error for ConfigError {}

fn num_cpus() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}
