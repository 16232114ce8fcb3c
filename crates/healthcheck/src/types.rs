//! Probe types and structures.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Outcome of a single probe attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HealthStatus {
    /// Target answered with a success indication
    Healthy,
    /// Target answered, but not successfully
    Unhealthy,
    /// Probe did not complete within its timeout
    Timeout,
    /// Probe could not be performed (connection refused, bad URL, ...)
    Error,
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HealthStatus::Healthy => write!(f, "HEALTHY"),
            HealthStatus::Unhealthy => write!(f, "UNHEALTHY"),
            HealthStatus::Timeout => write!(f, "TIMEOUT"),
            HealthStatus::Error => write!(f, "ERROR"),
        }
    }
}

/// Result of a probe attempt, or of a whole probe cycle once retries are exhausted
#[derive(Debug, Clone)]
pub struct HealthCheckResult {
    /// Status of the probe
    pub status: HealthStatus,

    /// Duration of the probe
    pub duration: Duration,

    /// Optional error message
    pub message: Option<String>,

    /// Response code (for HTTP probes)
    pub response_code: Option<u16>,

    /// Number of attempts made in the cycle that produced this result
    pub attempts: u32,
}

impl HealthCheckResult {
    /// Create a healthy result
    pub fn healthy(duration: Duration) -> Self {
        Self {
            status: HealthStatus::Healthy,
            duration,
            message: None,
            response_code: None,
            attempts: 1,
        }
    }

    /// Create an unhealthy result
    pub fn unhealthy(duration: Duration, message: impl Into<String>) -> Self {
        Self {
            status: HealthStatus::Unhealthy,
            duration,
            message: Some(message.into()),
            response_code: None,
            attempts: 1,
        }
    }

    /// Create a timeout result
    pub fn timeout(duration: Duration) -> Self {
        Self {
            status: HealthStatus::Timeout,
            duration,
            message: Some("Health check timed out".to_string()),
            response_code: None,
            attempts: 1,
        }
    }

    /// Create an error result
    pub fn error(duration: Duration, message: impl Into<String>) -> Self {
        Self {
            status: HealthStatus::Error,
            duration,
            message: Some(message.into()),
            response_code: None,
            attempts: 1,
        }
    }

    /// Check if the result is healthy
    pub fn is_healthy(&self) -> bool {
        self.status == HealthStatus::Healthy
    }
}

/// Probe configuration for one endpoint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthCheckConfig {
    /// Target address (host:port)
    pub target: String,

    /// Timeout for a single attempt
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,

    /// Interval between probe cycles
    #[serde(with = "humantime_serde")]
    pub interval: Duration,

    /// Extra attempts within one cycle before the cycle counts as failed
    pub retries: u32,

    /// Delay before the first retry; doubled for each further retry
    #[serde(with = "humantime_serde")]
    pub retry_backoff: Duration,

    /// Check type
    pub check_type: CheckType,
}

impl HealthCheckConfig {
    /// Total attempts made per cycle.
    pub fn attempts(&self) -> u32 {
        self.retries.saturating_add(1)
    }

    /// Delay to wait after the given failed attempt (0-based).
    pub fn backoff_after(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.min(16)).unwrap_or(u32::MAX);
        self.retry_backoff
            .saturating_mul(factor)
            .min(self.interval)
    }
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            target: String::new(),
            timeout: Duration::from_secs(5),
            interval: Duration::from_secs(10),
            retries: 0,
            retry_backoff: Duration::from_millis(50),
            check_type: CheckType::Tcp,
        }
    }
}

/// Probe type
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum CheckType {
    /// TCP connection check
    Tcp,

    /// HTTP/HTTPS GET check
    Http {
        /// Request path
        path: String,
        /// Use HTTPS
        https: bool,
    },
}

impl CheckType {
    /// Short label used in logs and metrics.
    pub fn label(&self) -> &'static str {
        match self {
            CheckType::Tcp => "tcp",
            CheckType::Http { https: false, .. } => "http",
            CheckType::Http { https: true, .. } => "https",
        }
    }
}

/// Probe statistics, counted per cycle
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HealthCheckStats {
    /// Total cycles performed
    pub total_checks: u64,

    /// Successful cycles
    pub successful_checks: u64,

    /// Failed cycles
    pub failed_checks: u64,

    /// Cycles that ended in a timeout
    pub timeouts: u64,

    /// Average response time (milliseconds)
    pub avg_response_time_ms: f64,

    /// Current consecutive successes
    pub consecutive_successes: u32,

    /// Current consecutive failures
    pub consecutive_failures: u32,
}

impl HealthCheckStats {
    /// Update stats with a cycle result
    pub fn update(&mut self, result: &HealthCheckResult) {
        self.total_checks += 1;

        match result.status {
            HealthStatus::Healthy => {
                self.successful_checks += 1;
                self.consecutive_successes += 1;
                self.consecutive_failures = 0;
            }
            HealthStatus::Unhealthy | HealthStatus::Error => {
                self.failed_checks += 1;
                self.consecutive_failures += 1;
                self.consecutive_successes = 0;
            }
            HealthStatus::Timeout => {
                self.failed_checks += 1;
                self.timeouts += 1;
                self.consecutive_failures += 1;
                self.consecutive_successes = 0;
            }
        }

        let duration_ms = result.duration.as_millis() as f64;
        self.avg_response_time_ms = (self.avg_response_time_ms * (self.total_checks - 1) as f64
            + duration_ms)
            / self.total_checks as f64;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_attempts_include_first_try() {
        let config = HealthCheckConfig {
            retries: 2,
            ..Default::default()
        };
        assert_eq!(config.attempts(), 3);
        assert_eq!(HealthCheckConfig::default().attempts(), 1);
    }

    #[test]
    fn test_backoff_doubles_and_is_capped_by_interval() {
        let config = HealthCheckConfig {
            interval: Duration::from_millis(300),
            retry_backoff: Duration::from_millis(50),
            ..Default::default()
        };
        assert_eq!(config.backoff_after(0), Duration::from_millis(50));
        assert_eq!(config.backoff_after(1), Duration::from_millis(100));
        assert_eq!(config.backoff_after(2), Duration::from_millis(200));
        assert_eq!(config.backoff_after(3), Duration::from_millis(300));
        assert_eq!(config.backoff_after(40), Duration::from_millis(300));
    }

    #[test]
    fn test_timeouts_count_as_failures() {
        let mut stats = HealthCheckStats::default();
        stats.update(&HealthCheckResult::timeout(Duration::from_millis(10)));
        stats.update(&HealthCheckResult::error(Duration::from_millis(10), "refused"));

        assert_eq!(stats.total_checks, 2);
        assert_eq!(stats.failed_checks, 2);
        assert_eq!(stats.timeouts, 1);
        assert_eq!(stats.consecutive_failures, 2);

        stats.update(&HealthCheckResult::healthy(Duration::from_millis(10)));
        assert_eq!(stats.consecutive_failures, 0);
        assert_eq!(stats.consecutive_successes, 1);
    }

    #[test]
    fn test_check_type_label() {
        assert_eq!(CheckType::Tcp.label(), "tcp");
        let https = CheckType::Http {
            path: "/health".into(),
            https: true,
        };
        assert_eq!(https.label(), "https");
    }
}
