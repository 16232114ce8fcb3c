//! Liveness probing for registered service endpoints.
//!
//! This crate provides the probing side of the service registry:
//! - TCP connection checks (used for `tcp` and `grpc` endpoints)
//! - HTTP/HTTPS GET checks (used for `http`, `https`, `ws` and `wss` endpoints)
//!
//! # Features
//!
//! - Async/await based for high concurrency
//! - Bounded retries with exponential backoff inside one probe cycle
//! - Per-target statistics tracking
//! - Cycle results pushed to a [`ProbeSink`], which decides what a failure means
//!
//! # Example
//!
//! ```no_run
//! use healthcheck::{HealthCheckConfig, HealthCheckMonitor, ProbeSink, build_checker};
//! use healthcheck::types::{CheckType, HealthCheckResult, HealthCheckStats};
//! use std::ops::ControlFlow;
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! struct LogSink;
//!
//! impl ProbeSink for LogSink {
//!     fn report(&self, result: &HealthCheckResult, _: &HealthCheckStats) -> ControlFlow<()> {
//!         println!("probe: {}", result.status);
//!         ControlFlow::Continue(())
//!     }
//! }
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = HealthCheckConfig {
//!     target: "192.168.1.100:8080".to_string(),
//!     timeout: Duration::from_secs(2),
//!     interval: Duration::from_secs(5),
//!     retries: 2,
//!     retry_backoff: Duration::from_millis(50),
//!     check_type: CheckType::Http { path: "/health".into(), https: false },
//! };
//!
//! let checker = build_checker(&config)?;
//! let mut monitor = HealthCheckMonitor::new(checker, config);
//! monitor.start(Arc::new(LogSink));
//!
//! let stats = monitor.get_stats().await;
//! # Ok(())
//! # }
//! ```

pub mod checkers;
pub mod monitor;
pub mod types;

pub use checkers::{HealthChecker, HttpChecker, TcpChecker, build_checker};
pub use monitor::{HealthCheckMonitor, ProbeSink};
pub use types::{CheckType, HealthCheckConfig, HealthCheckResult, HealthCheckStats, HealthStatus};
