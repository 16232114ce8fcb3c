//! Prometheus metrics for the service registry.

use crate::model::ServiceStatus;
use crate::stats::Statistics;
use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::{Histogram, exponential_buckets};
use prometheus_client::registry::Registry;
use std::time::Duration;

/// Labels for per-status gauges
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct StatusLabels {
    /// Service status (HEALTHY, DEGRADED, ...)
    pub status: String,
}

/// Labels for status transition counters
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct TransitionLabels {
    /// Previous status
    pub from: String,
    /// New status
    pub to: String,
}

/// Labels for probe result counters
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ProbeLabels {
    /// Probe kind (tcp, http, https)
    pub protocol: String,
    /// Result (success, failure)
    pub result: String,
}

/// Labels for probe latency histograms
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ProtocolLabels {
    /// Probe kind (tcp, http, https)
    pub protocol: String,
}

/// Labels for watch event counters
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct EventLabels {
    /// Event kind (added, updated, removed, status_changed, expired)
    pub kind: String,
}

/// Metrics registry with all service registry metrics
pub struct MetricsRegistry {
    /// Prometheus registry
    pub registry: Registry,

    // Store metrics
    /// Registered service instances
    services: Gauge,
    /// Service instances by status
    services_by_status: Family<StatusLabels, Gauge>,
    /// Registrations (including replacements)
    registrations_total: Counter,
    /// Deregistrations that removed a record
    deregistrations_total: Counter,
    /// Heartbeats accepted
    heartbeats_total: Counter,

    // Liveness metrics
    /// Status transitions
    status_transitions_total: Family<TransitionLabels, Counter>,
    /// TTL expirations
    expirations_total: Counter,
    /// Probe cycles by result
    probes_total: Family<ProbeLabels, Counter>,
    /// Probe cycle latency
    probe_duration_seconds: Family<ProtocolLabels, Histogram>,

    // Watch metrics
    /// Active watchers
    watchers_active: Gauge,
    /// Events published by kind
    watch_events_total: Family<EventLabels, Counter>,
}

impl MetricsRegistry {
    /// Create a new metrics registry
    pub fn new() -> Self {
        let mut registry = Registry::default();

        let services = Gauge::default();
        registry.register(
            "registry_services",
            "Number of registered service instances",
            services.clone(),
        );

        let services_by_status = Family::<StatusLabels, Gauge>::default();
        registry.register(
            "registry_services_by_status",
            "Registered service instances by status",
            services_by_status.clone(),
        );

        let registrations_total = Counter::default();
        registry.register(
            "registry_registrations",
            "Total service registrations",
            registrations_total.clone(),
        );

        let deregistrations_total = Counter::default();
        registry.register(
            "registry_deregistrations",
            "Total service deregistrations",
            deregistrations_total.clone(),
        );

        let heartbeats_total = Counter::default();
        registry.register(
            "registry_heartbeats",
            "Total heartbeats accepted",
            heartbeats_total.clone(),
        );

        let status_transitions_total = Family::<TransitionLabels, Counter>::default();
        registry.register(
            "registry_status_transitions",
            "Total service status transitions",
            status_transitions_total.clone(),
        );

        let expirations_total = Counter::default();
        registry.register(
            "registry_expirations",
            "Total services expired for missing heartbeats",
            expirations_total.clone(),
        );

        let probes_total = Family::<ProbeLabels, Counter>::default();
        registry.register(
            "registry_probes",
            "Total health probe cycles",
            probes_total.clone(),
        );

        let probe_duration_seconds: Family<ProtocolLabels, Histogram> =
            Family::new_with_constructor(|| {
                // Exponential buckets from 1ms to ~8s
                Histogram::new(exponential_buckets(0.001, 2.0, 14))
            });
        registry.register(
            "registry_probe_duration_seconds",
            "Health probe cycle duration in seconds",
            probe_duration_seconds.clone(),
        );

        let watchers_active = Gauge::default();
        registry.register(
            "registry_watchers_active",
            "Number of active watches",
            watchers_active.clone(),
        );

        let watch_events_total = Family::<EventLabels, Counter>::default();
        registry.register(
            "registry_watch_events",
            "Total store events published to the watch bus",
            watch_events_total.clone(),
        );

        Self {
            registry,
            services,
            services_by_status,
            registrations_total,
            deregistrations_total,
            heartbeats_total,
            status_transitions_total,
            expirations_total,
            probes_total,
            probe_duration_seconds,
            watchers_active,
            watch_events_total,
        }
    }

    /// Record a registration
    pub fn record_registration(&self) {
        self.registrations_total.inc();
    }

    /// Record a deregistration
    pub fn record_deregistration(&self) {
        self.deregistrations_total.inc();
    }

    /// Record an accepted heartbeat
    pub fn record_heartbeat(&self) {
        self.heartbeats_total.inc();
    }

    /// Record a status transition
    pub fn record_status_transition(&self, from: ServiceStatus, to: ServiceStatus) {
        self.status_transitions_total
            .get_or_create(&TransitionLabels {
                from: from.to_string(),
                to: to.to_string(),
            })
            .inc();
    }

    /// Record a TTL expiration
    pub fn record_expiration(&self) {
        self.expirations_total.inc();
    }

    /// Record a probe cycle result
    pub fn record_probe(&self, protocol: &str, success: bool, duration: Duration) {
        self.probes_total
            .get_or_create(&ProbeLabels {
                protocol: protocol.to_string(),
                result: if success { "success" } else { "failure" }.to_string(),
            })
            .inc();

        self.probe_duration_seconds
            .get_or_create(&ProtocolLabels {
                protocol: protocol.to_string(),
            })
            .observe(duration.as_secs_f64());
    }

    /// Update the registered service count
    pub fn update_service_count(&self, count: usize) {
        self.services.set(count as i64);
    }

    /// Refresh store gauges from a statistics snapshot
    pub fn refresh_from_statistics(&self, stats: &Statistics) {
        self.services.set(stats.total_services as i64);
        for status in ServiceStatus::ALL {
            let count = stats.services_by_status.get(&status).copied().unwrap_or(0);
            self.services_by_status
                .get_or_create(&StatusLabels {
                    status: status.to_string(),
                })
                .set(count as i64);
        }
    }

    /// Update active watcher count
    pub fn update_watcher_count(&self, count: usize) {
        self.watchers_active.set(count as i64);
    }

    /// Record an event published on the watch bus
    pub fn record_watch_event(&self, kind: &str) {
        self.watch_events_total
            .get_or_create(&EventLabels {
                kind: kind.to_string(),
            })
            .inc();
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}
