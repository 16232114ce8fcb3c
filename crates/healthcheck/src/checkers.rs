//! Probe implementations.

use crate::types::{CheckType, HealthCheckConfig, HealthCheckResult};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, warn};

/// Health checker trait
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait HealthChecker: Send + Sync {
    /// Perform a single probe attempt
    async fn check(&self) -> HealthCheckResult;

    /// Get the name of this checker
    fn name(&self) -> &'static str;
}

/// Build the checker matching a probe configuration.
pub fn build_checker(config: &HealthCheckConfig) -> common::Result<Arc<dyn HealthChecker>> {
    match &config.check_type {
        CheckType::Tcp => Ok(Arc::new(TcpChecker::new(
            config.target.clone(),
            config.timeout,
        ))),
        CheckType::Http { path, https } => {
            let url = probe_url(&config.target, path, *https);
            let checker = HttpChecker::new(url, reqwest::Method::GET, Vec::new(), config.timeout)?;
            Ok(Arc::new(checker))
        }
    }
}

/// URL for an HTTP probe against `target`, with `path` made absolute.
pub fn probe_url(target: &str, path: &str, https: bool) -> String {
    let scheme = if https { "https" } else { "http" };
    if path.starts_with('/') {
        format!("{}://{}{}", scheme, target, path)
    } else {
        format!("{}://{}/{}", scheme, target, path)
    }
}

/// TCP health checker
pub struct TcpChecker {
    target: String,
    timeout_duration: Duration,
}

impl TcpChecker {
    /// Create a new TCP health checker for a `host:port` target
    pub fn new(target: impl Into<String>, timeout_duration: Duration) -> Self {
        Self {
            target: target.into(),
            timeout_duration,
        }
    }
}

#[async_trait]
impl HealthChecker for TcpChecker {
    async fn check(&self) -> HealthCheckResult {
        let start = Instant::now();

        match timeout(self.timeout_duration, TcpStream::connect(self.target.as_str())).await {
            Ok(Ok(_stream)) => {
                let duration = start.elapsed();
                debug!(target = %self.target, duration_ms = duration.as_millis(), "TCP check successful");
                HealthCheckResult::healthy(duration)
            }
            Ok(Err(e)) => {
                let duration = start.elapsed();
                debug!(target = %self.target, error = %e, "TCP check failed");
                HealthCheckResult::error(duration, format!("Connection failed: {}", e))
            }
            Err(_) => {
                let duration = start.elapsed();
                debug!(target = %self.target, "TCP check timed out");
                HealthCheckResult::timeout(duration)
            }
        }
    }

    fn name(&self) -> &'static str {
        "tcp"
    }
}

/// HTTP health checker
pub struct HttpChecker {
    url: String,
    method: reqwest::Method,
    expected_codes: Vec<u16>,
    timeout_duration: Duration,
    client: reqwest::Client,
}

impl HttpChecker {
    /// Create a new HTTP health checker.
    ///
    /// An empty `expected_codes` list accepts any 2xx response.
    pub fn new(
        url: String,
        method: reqwest::Method,
        expected_codes: Vec<u16>,
        timeout_duration: Duration,
    ) -> common::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout_duration)
            .build()
            .map_err(common::Error::probe)?;

        Ok(Self {
            url,
            method,
            expected_codes,
            timeout_duration,
            client,
        })
    }

    /// URL probed by this checker
    pub fn url(&self) -> &str {
        &self.url
    }

    fn accepts(&self, status_code: u16) -> bool {
        if self.expected_codes.is_empty() {
            (200..300).contains(&status_code)
        } else {
            self.expected_codes.contains(&status_code)
        }
    }
}

#[async_trait]
impl HealthChecker for HttpChecker {
    async fn check(&self) -> HealthCheckResult {
        let start = Instant::now();

        let request = self.client.request(self.method.clone(), &self.url);

        match timeout(self.timeout_duration, request.send()).await {
            Ok(Ok(response)) => {
                let duration = start.elapsed();
                let status_code = response.status().as_u16();

                let mut result = if self.accepts(status_code) {
                    debug!(url = %self.url, status = status_code, duration_ms = duration.as_millis(),
                           "HTTP check successful");
                    HealthCheckResult::healthy(duration)
                } else {
                    warn!(url = %self.url, status = status_code, "HTTP check failed: unexpected status code");
                    HealthCheckResult::unhealthy(
                        duration,
                        format!("Unexpected status code: {}", status_code),
                    )
                };
                result.response_code = Some(status_code);
                result
            }
            Ok(Err(e)) if e.is_timeout() => {
                let duration = start.elapsed();
                debug!(url = %self.url, "HTTP check timed out");
                HealthCheckResult::timeout(duration)
            }
            Ok(Err(e)) => {
                let duration = start.elapsed();
                debug!(url = %self.url, error = %e, "HTTP check failed");
                HealthCheckResult::error(duration, format!("HTTP request failed: {}", e))
            }
            Err(_) => {
                let duration = start.elapsed();
                debug!(url = %self.url, "HTTP check timed out");
                HealthCheckResult::timeout(duration)
            }
        }
    }

    fn name(&self) -> &'static str {
        "http"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::HealthStatus;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_tcp_checker_refused() {
        let checker = TcpChecker::new("127.0.0.1:1", Duration::from_millis(100));

        let result = checker.check().await;
        assert!(!result.is_healthy());
        assert!(result.duration <= Duration::from_millis(200));
    }

    #[tokio::test]
    async fn test_tcp_checker_listening() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let checker = TcpChecker::new(addr.to_string(), Duration::from_millis(500));
        let result = checker.check().await;
        assert_eq!(result.status, HealthStatus::Healthy);
    }

    #[tokio::test]
    async fn test_http_checker_connection_error() {
        let checker = HttpChecker::new(
            "http://127.0.0.1:1/health".to_string(),
            reqwest::Method::GET,
            vec![],
            Duration::from_millis(100),
        )
        .unwrap();

        let result = checker.check().await;
        assert!(!result.is_healthy());
        assert!(result.duration <= Duration::from_millis(300));
    }

    #[test]
    fn test_http_checker_accepts_any_2xx_by_default() {
        let checker = HttpChecker::new(
            "http://127.0.0.1:1/health".to_string(),
            reqwest::Method::GET,
            vec![],
            Duration::from_millis(100),
        )
        .unwrap();
        assert!(checker.accepts(200));
        assert!(checker.accepts(204));
        assert!(!checker.accepts(301));
        assert!(!checker.accepts(503));
    }

    #[test]
    fn test_probe_url() {
        assert_eq!(probe_url("10.0.0.5:8080", "/health", false), "http://10.0.0.5:8080/health");
        assert_eq!(probe_url("api:443", "ready", true), "https://api:443/ready");
    }

    #[test]
    fn test_build_checker_by_type() {
        let config = HealthCheckConfig {
            target: "10.0.0.5:8080".to_string(),
            check_type: CheckType::Http {
                path: "health".to_string(),
                https: false,
            },
            ..Default::default()
        };
        let checker = build_checker(&config).unwrap();
        assert_eq!(checker.name(), "http");

        let tcp = build_checker(&HealthCheckConfig {
            target: "10.0.0.5:9000".to_string(),
            ..Default::default()
        })
        .unwrap();
        assert_eq!(tcp.name(), "tcp");
    }
}
