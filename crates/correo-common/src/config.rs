//! Configuration for correo

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Outbound delivery configuration
    #[serde(default)]
    pub delivery: DeliveryConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Hostname used as the EHLO/HELO identity for outbound delivery
    #[serde(default = "default_hostname")]
    pub hostname: String,

    /// Data directory holding the queue and the MTA-STS policy cache
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            hostname: default_hostname(),
            data_dir: default_data_dir(),
        }
    }
}

fn default_hostname() -> String {
    "localhost".to_string()
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("/var/lib/correo")
}

/// Outbound delivery configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryConfig {
    /// Spool directory for queued messages (default: `<data_dir>/queue`)
    pub spool_dir: Option<PathBuf>,

    /// Interval between queue processing cycles (seconds)
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,

    /// Maximum delivery attempts before a message is dropped
    #[serde(default = "default_max_attempts")]
    pub max_attempts: i32,

    /// Remote SMTP port to deliver to
    #[serde(default = "default_smtp_port")]
    pub smtp_port: u16,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            spool_dir: None,
            poll_interval_secs: default_poll_interval(),
            max_attempts: default_max_attempts(),
            smtp_port: default_smtp_port(),
        }
    }
}

fn default_poll_interval() -> u64 {
    5
}

fn default_max_attempts() -> i32 {
    5
}

fn default_smtp_port() -> u16 {
    25
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format: "json" or "text"
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "text".to_string()
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file(path: &std::path::Path) -> crate::Result<Self> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| crate::Error::Config(format!("Failed to read {}: {}", path.display(), e)))?;

        toml::from_str(&contents)
            .map_err(|e| crate::Error::Config(format!("Failed to parse {}: {}", path.display(), e)))
    }

    /// Load configuration from the default locations
    pub fn load() -> crate::Result<Self> {
        let paths = [
            std::path::PathBuf::from("./correo.toml"),
            std::path::PathBuf::from("/etc/correo/correo.toml"),
        ];

        for path in paths {
            if path.exists() {
                return Self::from_file(&path);
            }
        }

        Err(crate::Error::Config(
            "No configuration file found".to_string(),
        ))
    }
}
