//! Configuration module for the mata relay.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.

use clap::Parser;
use serde::Deserialize;
use std::path::PathBuf;
use thiserror::Error;

/// Command-line arguments for the relay
#[derive(Parser, Debug)]
#[command(name = "mata")]
#[command(version)]
#[command(about = "A TCP relay that duplicates traffic to backend targets", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Address to listen on (e.g., :8080 or 127.0.0.1:8080)
    #[arg(short = 'l', long, visible_alias = "source")]
    pub listen: Option<String>,

    /// Comma-separated list of target addresses; the first is the primary
    #[arg(short = 't', long, value_delimiter = ',')]
    pub targets: Vec<String>,

    /// Echo mode - return received data back to the client
    #[arg(short = 'e', long)]
    pub echo: bool,

    /// Maximum number of concurrent client connections
    #[arg(long)]
    pub max_connections: Option<usize>,

    /// Number of worker threads (defaults to number of CPU cores)
    #[arg(short = 'w', long)]
    pub workers: Option<usize>,

    /// Set TCP_NODELAY on client and target sockets
    #[arg(long)]
    pub nodelay: Option<bool>,

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
    pub proxy: ProxyConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Listener-related configuration
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    /// Address to listen on
    pub listen: Option<String>,
    /// Maximum number of concurrent client connections
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    /// Number of worker threads
    pub workers: Option<usize>,
    /// Set TCP_NODELAY on client and target sockets
    #[serde(default = "default_nodelay")]
    pub nodelay: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: None,
            max_connections: default_max_connections(),
            workers: None,
            nodelay: default_nodelay(),
        }
    }
}

/// Relay-related configuration
#[derive(Debug, Deserialize, Default)]
pub struct ProxyConfig {
    /// Backend addresses, in priority order
    #[serde(default)]
    pub targets: Vec<String>,
    /// Echo mode (targets are ignored)
    #[serde(default)]
    pub echo: bool,
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

fn default_max_connections() -> usize {
    10000
}

fn default_nodelay() -> bool {
    true
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub listen: String,
    pub targets: Vec<String>,
    pub echo: bool,
    pub max_connections: usize,
    pub workers: Option<usize>,
    pub nodelay: bool,
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen: String::new(),
            targets: Vec::new(),
            echo: false,
            max_connections: default_max_connections(),
            workers: None,
            nodelay: default_nodelay(),
            log_level: default_log_level(),
        }
    }
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    /// CLI arguments take precedence over TOML file values.
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_cli(CliArgs::parse())
    }

    /// Resolve parsed CLI arguments, reading the TOML file they point at.
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

    /// Merge CLI args with TOML config (CLI takes precedence) and validate.
    pub fn merge(cli: CliArgs, toml_config: TomlConfig) -> Result<Self, ConfigError> {
        let targets: Vec<String> = if cli.targets.is_empty() {
            toml_config.proxy.targets
        } else {
            cli.targets
        }
        .into_iter()
        .map(|t| t.trim().to_string())
        .collect();

        let listen = cli
            .listen
            .or(toml_config.server.listen)
            .map(|l| normalize_listen(&l))
            .ok_or(ConfigError::MissingListen)?;

        let config = Config {
            listen,
            targets,
            echo: cli.echo || toml_config.proxy.echo,
            max_connections: cli
                .max_connections
                .unwrap_or(toml_config.server.max_connections),
            workers: cli.workers.or(toml_config.server.workers),
            nodelay: cli.nodelay.unwrap_or(toml_config.server.nodelay),
            log_level: if cli.log_level != "info" {
                cli.log_level
            } else {
                toml_config.logging.level
            },
        };

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.listen.is_empty() {
            return Err(ConfigError::MissingListen);
        }
        if self.max_connections == 0 {
            return Err(ConfigError::InvalidValue(
                "max_connections must be at least 1".to_string(),
            ));
        }
        if self.echo {
            return Ok(());
        }
        if self.targets.is_empty() {
            return Err(ConfigError::NoTargets);
        }
        if let Some(index) = self.targets.iter().position(|t| t.is_empty()) {
            return Err(ConfigError::InvalidValue(format!(
                "target #{index} is empty"
            )));
        }
        Ok(())
    }
}

/// Treat a bare `:port` listen address as all interfaces.
fn normalize_listen(listen: &str) -> String {
    let listen = listen.trim();
    if listen.starts_with(':') {
        format!("0.0.0.0{listen}")
    } else {
        listen.to_string()
    }
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file '{}': {}", .0.display(), .1)]
    FileRead(PathBuf, #[source] std::io::Error),

    #[error("Failed to parse config file '{}': {}", .0.display(), .1)]
    TomlParse(PathBuf, #[source] toml::de::Error),

    #[error("A listen address is required")]
    MissingListen,

    #[error("Must specify either echo mode or at least one target")]
    NoTargets,

    #[error("Invalid configuration: {0}")]
    InvalidValue(String),
}
