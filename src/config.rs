//! Configuration module for rpc-bench.
//!
//! Supports both command-line arguments and a TOML configuration file.
//! The file supplies defaults for the options of the `client` and `server`
//! commands, plus reporting and logging settings. CLI arguments take
//! precedence over config file values.

use crate::stats::{DEFAULT_CDF_SAMPLES, DEFAULT_RING_CAPACITY};
use crate::transport::Protocol;
use clap::Parser;
use serde::Deserialize;
use std::path::PathBuf;

/// Command-line arguments for the benchmark node
#[derive(Parser, Debug)]
#[command(name = "rpc-bench")]
#[command(author = "rpc-bench authors")]
#[command(version = "0.1.0")]
#[command(
    about = "RPC load generator and echo server for latency and throughput measurements",
    long_about = None
)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    pub log_level: String,

    /// Command to run at startup, e.g. `server --ports 4`. Without one,
    /// commands are read from standard input, one per line.
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    pub command: Vec<String>,
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub client: ClientConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub stats: StatsConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Defaults for the `client` command
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub protocol: Protocol,
    /// Client ports, each with its own sender thread
    pub ports: usize,
    /// Receiver threads per client port
    pub port_receivers: usize,
    /// Outstanding requests allowed from this node, split across ports
    pub client_max: u32,
    /// Hosts running server ports
    pub server_hosts: Vec<String>,
    /// Lowest server port number
    pub first_port: u16,
    /// Server ports on each server host
    pub server_ports: usize,
    /// Target message bandwidth in GB/s; 0 sends continuously
    pub net_bw: f64,
    /// Request length distribution
    pub workload: String,
    /// Truncate stream requests to the native message limit
    pub truncate: bool,
    /// Seed for request sequences; port N uses `seed + N`
    pub seed: u64,
    /// Largest frame a stream connection accepts
    pub max_frame_len: usize,
    /// Events fetched per event loop wait
    pub batch_size: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            protocol: Protocol::Native,
            ports: 1,
            port_receivers: 1,
            client_max: 1,
            server_hosts: vec!["127.0.0.1".to_string()],
            first_port: 4000,
            server_ports: 1,
            net_bw: 0.0,
            workload: "100".to_string(),
            truncate: true,
            seed: 12345,
            max_frame_len: default_max_frame_len(),
            batch_size: default_batch_size(),
        }
    }
}

/// Defaults for the `server` command
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub protocol: Protocol,
    /// Address server ports bind to
    pub bind: String,
    /// Number of server ports
    pub ports: usize,
    /// Lowest port number; 0 picks ephemeral ports
    pub first_port: u16,
    /// Worker threads per port
    pub port_threads: usize,
    /// Connections accepted per stream port
    pub max_connections: usize,
    /// Largest frame a stream connection accepts
    pub max_frame_len: usize,
    /// Events fetched per event loop wait
    pub batch_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            protocol: Protocol::Native,
            bind: "0.0.0.0".to_string(),
            ports: 1,
            first_port: 4000,
            port_threads: 1,
            max_connections: 10_000,
            max_frame_len: default_max_frame_len(),
            batch_size: default_batch_size(),
        }
    }
}

/// Statistics reporting configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StatsConfig {
    /// Milliseconds between reports
    pub interval_ms: u64,
    /// Samples retained per client port
    pub ring_capacity: usize,
    /// Samples used for percentiles, split across client ports
    pub cdf_samples: usize,
}

impl Default for StatsConfig {
    fn default() -> Self {
        Self {
            interval_ms: 1000,
            ring_capacity: DEFAULT_RING_CAPACITY,
            cdf_samples: DEFAULT_CDF_SAMPLES,
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

fn default_max_frame_len() -> usize {
    16 * 1024 * 1024 // 16 MiB
}

fn default_batch_size() -> usize {
    64
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub client: ClientConfig,
    pub server: ServerConfig,
    pub stats: StatsConfig,
    pub log_level: String,
    /// Startup command words; empty means interactive.
    pub command: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self::merge(
            CliArgs {
                config: None,
                log_level: default_log_level(),
                command: Vec::new(),
            },
            TomlConfig::default(),
        )
    }
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

        Ok(Self::merge(cli, toml_config))
    }

    fn merge(cli: CliArgs, toml_config: TomlConfig) -> Self {
        Config {
            client: toml_config.client,
            server: toml_config.server,
            stats: toml_config.stats,
            log_level: if cli.log_level != "info" {
                cli.log_level
            } else {
                toml_config.logging.level
            },
            command: cli.command,
        }
    }
}

/// Configuration loading errors
#[derive(Debug)]
pub enum ConfigError {
    FileRead(PathBuf, std::io::Error),
    TomlParse(PathBuf, toml::de::Error),
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
        }
    }
}

impl std::error::Error for ConfigError {}
