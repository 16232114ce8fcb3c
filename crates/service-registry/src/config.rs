//! Configuration loading and validation for the registry server

use crate::types::{HeartbeatMode, RegistryConfig, ServerConfig};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use validator::{Validate, ValidationError};

/// Configuration error types
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Configuration file not found in search paths")]
    FileNotFound,

    #[error("Failed to read configuration file: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Failed to parse YAML: {0}")]
    ParseError(#[from] serde_yaml::Error),

    #[error("Invalid configuration: {0}")]
    ValidationError(#[from] validator::ValidationErrors),
}

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerSettings,

    #[serde(default)]
    pub registry: RegistrySettings,

    #[serde(default)]
    pub metrics: MetricsSettings,

    #[serde(default)]
    pub telemetry: TelemetrySettings,

    #[serde(default)]
    pub logging: LoggingSettings,
}

impl Validate for Config {
    fn validate(&self) -> Result<(), validator::ValidationErrors> {
        self.server.validate()?;
        self.registry.validate()?;
        self.telemetry.validate()?;
        self.logging.validate()?;
        Ok(())
    }
}

/// Server-level settings
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct ServerSettings {
    /// Admin API and metrics listen address
    #[validate(custom = "validate_listen_addr")]
    pub listen_addr: String,
}

/// Registry behaviour
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct RegistrySettings {
    #[serde(with = "humantime_serde")]
    #[validate(custom = "validate_default_ttl")]
    pub default_ttl: Duration,

    #[serde(with = "humantime_serde")]
    #[validate(custom = "validate_sweep_interval")]
    pub sweep_interval: Duration,

    pub heartbeat_mode: HeartbeatMode,

    #[validate(range(min = 1, max = 100))]
    pub failure_threshold: u32,

    #[serde(with = "humantime_serde")]
    #[validate(custom = "validate_retry_backoff")]
    pub probe_retry_backoff: Duration,
}

/// Prometheus metrics settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsSettings {
    pub enabled: bool,
}

/// OpenTelemetry settings
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct TelemetrySettings {
    pub enabled: bool,

    #[validate(length(min = 1))]
    pub service_name: String,

    #[validate(length(min = 1))]
    pub otlp_endpoint: String,
}

/// Logging settings
#[derive(Debug, Clone, Default, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct LoggingSettings {
    pub level: Option<String>,

    #[validate(custom = "validate_log_format")]
    pub format: Option<String>,
}

impl LoggingSettings {
    /// Log level, `info` unless configured
    pub fn level(&self) -> &str {
        self.level.as_deref().unwrap_or("info")
    }

    /// Whether logs are emitted as JSON
    pub fn json(&self) -> bool {
        self.format.as_deref() == Some("json")
    }
}

// Default implementations

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:8500".to_string(),
        }
    }
}

impl Default for RegistrySettings {
    fn default() -> Self {
        let defaults = RegistryConfig::default();
        Self {
            default_ttl: defaults.default_ttl,
            sweep_interval: defaults.sweep_interval,
            heartbeat_mode: defaults.heartbeat_mode,
            failure_threshold: defaults.failure_threshold,
            probe_retry_backoff: defaults.probe_retry_backoff,
        }
    }
}

impl Default for MetricsSettings {
    fn default() -> Self {
        Self { enabled: true }
    }
}

impl Default for TelemetrySettings {
    fn default() -> Self {
        Self {
            enabled: false,
            service_name: "service-registry".to_string(),
            otlp_endpoint: "http://localhost:4317".to_string(),
        }
    }
}

// Custom validators

fn validate_listen_addr(addr: &str) -> Result<(), ValidationError> {
    addr.trim()
        .parse::<SocketAddr>()
        .map(|_| ())
        .map_err(|_| ValidationError::new("listen_addr_invalid"))
}

fn validate_default_ttl(ttl: &Duration) -> Result<(), ValidationError> {
    // whole seconds only; a zero default would silently disable expiry
    if ttl.as_secs() < 1 || ttl.as_secs() > 86_400 {
        return Err(ValidationError::new("default_ttl_out_of_range"));
    }
    Ok(())
}

fn validate_sweep_interval(interval: &Duration) -> Result<(), ValidationError> {
    let millis = interval.as_millis();
    if millis < 10 || millis > 300_000 {
        return Err(ValidationError::new("sweep_interval_out_of_range"));
    }
    Ok(())
}

fn validate_retry_backoff(backoff: &Duration) -> Result<(), ValidationError> {
    if backoff.as_millis() > 60_000 {
        return Err(ValidationError::new("probe_retry_backoff_too_large"));
    }
    Ok(())
}

fn validate_log_format(format: &str) -> Result<(), ValidationError> {
    match format {
        "text" | "json" => Ok(()),
        _ => Err(ValidationError::new("log_format_invalid")),
    }
}

// Configuration loading implementation

impl Config {
    /// Load configuration from default search paths
    pub fn load() -> Result<Self, ConfigError> {
        match Self::find_config_file() {
            Some(path) => {
                tracing::info!("Loading configuration from: {}", path.display());
                Self::load_from_file(&path)
            }
            None => {
                tracing::info!("No configuration file found, using defaults");
                Ok(Self::default())
            }
        }
    }

    /// Load configuration from a specific file
    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        if !path.is_file() {
            return Err(ConfigError::FileNotFound);
        }
        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Parse and validate a YAML document
    pub fn from_yaml(contents: &str) -> Result<Self, ConfigError> {
        let config: Config = serde_yaml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Find configuration file in standard locations
    fn find_config_file() -> Option<PathBuf> {
        let mut paths = vec![PathBuf::from("/etc/service-registry/registry.yaml")];

        if let Some(home_path) = Self::home_config_path() {
            paths.push(home_path);
        }

        paths.push(PathBuf::from("./registry.yaml"));

        paths.into_iter().find(|p: &PathBuf| p.is_file())
    }

    /// Get home directory config path
    fn home_config_path() -> Option<PathBuf> {
        dirs::home_dir().map(|home| home.join(".config/service-registry/registry.yaml"))
    }

    /// Convert to the internal server configuration
    pub fn to_server_config(&self) -> ServerConfig {
        ServerConfig {
            listen_addr: self.server.listen_addr.trim().to_string(),
            metrics_enabled: self.metrics.enabled,
            registry: RegistryConfig {
                default_ttl: self.registry.default_ttl,
                sweep_interval: self.registry.sweep_interval,
                heartbeat_mode: self.registry.heartbeat_mode,
                failure_threshold: self.registry.failure_threshold,
                probe_retry_backoff: self.registry.probe_retry_backoff,
            },
        }
    }
}
