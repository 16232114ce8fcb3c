//! Multi-tenant service discovery and health registry.
//!
//! Services register their endpoints, keep themselves alive with heartbeats,
//! and are probed through the health checks their endpoints declare.
//! Consumers query the registry, pick endpoints for routing, and watch for
//! changes.
//!
//! # Components
//!
//! - **Registry** ([`store`]): the authoritative id → record map
//! - **Scheduler** ([`scheduler`]): per-record TTL watchdog or self-heartbeat,
//!   endpoint probes, and the global expiration sweeper
//! - **Query engine** ([`query`]): filtering, sorting and endpoint selection
//! - **Watch bus** ([`watch`]): per-watcher event channels
//! - **Statistics** ([`stats`]): counts over the current records
//! - **Admin API** ([`http_server`]): HTTP/JSON surface plus `/metrics`
//!
//! # Example
//!
//! ```no_run
//! use service_registry::{Endpoint, Protocol, Registry, RegistryConfig, ServiceRegistration, ServiceStatus};
//! use service_registry::query::EndpointQuery;
//!
//! # async fn example() -> common::Result<()> {
//! let registry = Registry::new(RegistryConfig::default(), None);
//!
//! let id = registry.register(
//!     ServiceRegistration::new("cache")
//!         .with_ttl(30)
//!         .with_endpoint(Endpoint::new(Protocol::Http, "10.0.0.5", 8080).with_weight(2)),
//! )?;
//! registry.set_status(&id, ServiceStatus::Healthy)?;
//!
//! let endpoints = registry.find_service_endpoints("cache", &EndpointQuery::default())?;
//! assert_eq!(endpoints[0].address(), "10.0.0.5:8080");
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod http_server;
pub mod metrics;
pub mod model;
pub mod query;
pub mod scheduler;
pub mod server;
pub mod stats;
pub mod store;
pub mod telemetry;
pub mod types;
pub mod watch;

pub use config::{Config, ConfigError};
pub use http_server::{ApiServer, router};
pub use metrics::MetricsRegistry;
pub use model::{
    Endpoint, HealthCheck, MAX_TTL_SECONDS, Metadata, Protocol, ServiceRecord, ServiceRegistration,
    ServiceStatus, ServiceUpdate,
};
pub use query::{EndpointQuery, ServiceFilter, SortBy, SortOrder};
pub use server::RegistryServer;
pub use stats::Statistics;
pub use store::Registry;
pub use telemetry::{TelemetryGuard, init_telemetry, setup_tracing_with_otel};
pub use types::{HeartbeatMode, RegistryConfig, ServerConfig};
pub use watch::{WatchEvent, WatchHandle};
