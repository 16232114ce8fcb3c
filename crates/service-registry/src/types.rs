//! Runtime configuration types for the registry and its server.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Who keeps a record's heartbeat fresh
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HeartbeatMode {
    /// Registered services call `heartbeat` themselves; the per-record timer
    /// only counts down the TTL and expires silent records.
    #[default]
    External,
    /// The registry heartbeats on the service's behalf every `max(1s, ttl/3)`.
    #[serde(rename = "self")]
    SelfHeartbeat,
}

/// Registry behaviour
#[derive(Debug, Clone, PartialEq)]
pub struct RegistryConfig {
    /// TTL applied when a registration does not carry one
    pub default_ttl: Duration,

    /// Period of the expiration sweeper
    pub sweep_interval: Duration,

    /// Heartbeat ownership
    pub heartbeat_mode: HeartbeatMode,

    /// Consecutive failed probe cycles before a service is UNHEALTHY
    pub failure_threshold: u32,

    /// Initial delay between attempts inside one probe cycle
    pub probe_retry_backoff: Duration,
}

impl RegistryConfig {
    /// Default TTL in whole seconds
    pub fn default_ttl_seconds(&self) -> u64 {
        self.default_ttl.as_secs()
    }
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            default_ttl: Duration::from_secs(30),
            sweep_interval: Duration::from_secs(5),
            heartbeat_mode: HeartbeatMode::External,
            failure_threshold: 2,
            probe_retry_backoff: Duration::from_millis(50),
        }
    }
}

/// Server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Admin API and metrics listen address
    pub listen_addr: String,

    /// Whether to collect and expose Prometheus metrics
    pub metrics_enabled: bool,

    /// Registry behaviour
    pub registry: RegistryConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:8500".to_string(),
            metrics_enabled: true,
            registry: RegistryConfig::default(),
        }
    }
}
