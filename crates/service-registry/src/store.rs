//! The registration store.
//!
//! Records live in a sharded `DashMap`; every mutation of a record happens
//! under its entry lock, and watch events for that mutation are published
//! before the lock is released. Timers re-enter the store through the
//! crate-private methods at the bottom of this file.

use crate::metrics::MetricsRegistry;
use crate::model::{Endpoint, Metadata, ServiceRecord, ServiceRegistration, ServiceStatus, ServiceUpdate};
use crate::query::{self, EndpointQuery, ServiceFilter};
use crate::scheduler::{self, EndpointHealth, ExpiryState, ProbeVerdict, Timers};
use crate::stats::Statistics;
use crate::types::RegistryConfig;
use crate::watch::{WatchBus, WatchEvent, WatchHandle};
use chrono::Utc;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

struct StoredService {
    record: ServiceRecord,
    /// Identifies the registration (or timer-affecting update) that started `timers`
    epoch: u64,
    /// Probe outcomes of the endpoints watched by `timers`
    health: EndpointHealth,
    timers: Timers,
}

/// Thread-safe service registry
pub struct Registry {
    this: Weak<Registry>,
    records: DashMap<String, StoredService>,
    next_epoch: AtomicU64,
    bus: Arc<WatchBus>,
    metrics: Option<Arc<MetricsRegistry>>,
    config: RegistryConfig,
    sweeper: OnceLock<JoinHandle<()>>,
}

impl Registry {
    /// Create a registry and start its expiration sweeper.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new(config: RegistryConfig, metrics: Option<Arc<MetricsRegistry>>) -> Arc<Self> {
        let sweep_interval = config.sweep_interval.max(Duration::from_millis(1));

        let registry = Arc::new_cyclic(|this: &Weak<Registry>| Self {
            this: this.clone(),
            records: DashMap::new(),
            next_epoch: AtomicU64::new(1),
            bus: WatchBus::new(metrics.clone()),
            metrics,
            config,
            sweeper: OnceLock::new(),
        });

        // Spawned only once the Weak handle can be upgraded
        let sweeper = scheduler::spawn_sweeper(Arc::downgrade(&registry), sweep_interval);
        if let Err(duplicate) = registry.sweeper.set(sweeper) {
            duplicate.abort();
        }
        registry
    }

    /// Registry behaviour
    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    /// Metrics registry, when metrics are enabled
    pub fn metrics(&self) -> Option<&Arc<MetricsRegistry>> {
        self.metrics.as_ref()
    }

    /// Insert or replace a service and start its timers.
    ///
    /// An absent or empty id is replaced by a generated one that is unique
    /// within this registry. Returns the final id.
    pub fn register(&self, registration: ServiceRegistration) -> common::Result<String> {
        registration.validate()?;

        let ServiceRegistration {
            id,
            name,
            version,
            description,
            status,
            endpoints,
            metadata,
            tenant_id,
            tags,
            ttl_seconds,
        } = registration;

        let explicit = id.filter(|id| !id.is_empty());
        let generated = explicit.is_none();
        let mut id = explicit.unwrap_or_else(new_id);

        let entry = loop {
            match self.records.entry(id.clone()) {
                Entry::Occupied(_) if generated => id = new_id(),
                entry => break entry,
            }
        };

        let now = Utc::now();
        let record = ServiceRecord {
            id: id.clone(),
            name,
            version,
            description,
            status: status.unwrap_or(ServiceStatus::Starting),
            endpoints,
            metadata,
            tenant_id,
            tags,
            registered_at: now,
            last_heartbeat: now,
            ttl_seconds: ttl_seconds.unwrap_or_else(|| self.config.default_ttl_seconds()),
        };

        let epoch = self.next_epoch.fetch_add(1, Ordering::Relaxed);
        let timers = Timers::start(&self.this, &record, epoch, &self.config);
        let probes = timers.probe_count();
        let stored = StoredService {
            health: EndpointHealth::new(record.endpoints.len()),
            record,
            epoch,
            timers,
        };

        let replaced = match entry {
            Entry::Occupied(mut occupied) => {
                let previous = occupied.insert(stored);
                let record = &occupied.get().record;
                self.bus.publish(
                    record,
                    Some(&previous.record),
                    &WatchEvent::Updated(record.clone()),
                );
                Some(previous)
            }
            Entry::Vacant(vacant) => {
                let slot = vacant.insert(stored);
                self.bus
                    .publish(&slot.record, None, &WatchEvent::Added(slot.record.clone()));
                None
            }
        };

        info!(
            id = %id,
            replaced = replaced.is_some(),
            probes,
            "Service registered"
        );
        drop(replaced);

        if let Some(ref m) = self.metrics {
            m.record_registration();
            m.update_service_count(self.records.len());
        }

        Ok(id)
    }

    /// Remove a service and cancel its timers. Returns whether it existed.
    pub fn deregister(&self, id: &str) -> bool {
        let removed = match self.records.entry(id.to_string()) {
            Entry::Occupied(occupied) => {
                self.bus.publish(
                    &occupied.get().record,
                    None,
                    &WatchEvent::Removed { id: id.to_string() },
                );
                Some(occupied.remove())
            }
            Entry::Vacant(_) => None,
        };

        let Some(mut stored) = removed else {
            debug!(id = %id, "Deregister of unknown service");
            return false;
        };
        stored.timers.cancel();
        info!(id = %id, name = %stored.record.name, "Service deregistered");

        if let Some(ref m) = self.metrics {
            m.record_deregistration();
            m.update_service_count(self.records.len());
        }
        true
    }

    /// Merge `update` into an existing record and refresh its heartbeat.
    ///
    /// Timers restart when the endpoints or the TTL change.
    pub fn update(&self, id: &str, update: ServiceUpdate) -> common::Result<ServiceRecord> {
        update.validate()?;

        let (record, previous, retired) = {
            let mut stored = self
                .records
                .get_mut(id)
                .ok_or_else(|| common::Error::not_found(id))?;

            let previous = stored.record.status;
            if let Some(next) = update.status {
                if !previous.can_transition_to(next) {
                    return Err(common::Error::invalid_input(format!(
                        "service '{}' cannot move from {} to {}",
                        id, previous, next
                    )));
                }
            }

            let restart = update.touches_timers(&stored.record);
            let before = stored.record.clone();
            merge(&mut stored.record, update);
            stored.record.last_heartbeat = Utc::now();

            let retired = if restart {
                let epoch = self.next_epoch.fetch_add(1, Ordering::Relaxed);
                let timers = Timers::start(&self.this, &stored.record, epoch, &self.config);
                stored.epoch = epoch;
                stored.health = EndpointHealth::new(stored.record.endpoints.len());
                Some(std::mem::replace(&mut stored.timers, timers))
            } else {
                None
            };

            self.bus.publish(
                &stored.record,
                Some(&before),
                &WatchEvent::Updated(stored.record.clone()),
            );
            if stored.record.status != previous {
                self.publish_status_change(&stored.record, &before);
            }

            (stored.record.clone(), previous, retired)
        };

        if retired.is_some() {
            debug!(id = %id, "Service timers restarted");
        }
        if record.status != previous {
            info!(id = %id, from = %previous, to = %record.status, "Service status changed");
            self.record_transition(previous, record.status);
        }
        Ok(record)
    }

    /// Refresh a service's heartbeat. Returns false when the id is unknown.
    pub fn heartbeat(&self, id: &str) -> bool {
        let Some(mut stored) = self.records.get_mut(id) else {
            return false;
        };
        stored.record.last_heartbeat = Utc::now();
        drop(stored);

        debug!(id = %id, "Heartbeat");
        if let Some(ref m) = self.metrics {
            m.record_heartbeat();
        }
        true
    }

    pub fn get(&self, id: &str) -> Option<ServiceRecord> {
        self.records.get(id).map(|stored| stored.record.clone())
    }

    /// Change a service's status
    pub fn set_status(&self, id: &str, status: ServiceStatus) -> common::Result<ServiceRecord> {
        self.update(id, ServiceUpdate::status(status))
    }

    /// Replace a service's tag set
    pub fn set_tags<I, S>(&self, id: &str, tags: I) -> common::Result<ServiceRecord>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.update(
            id,
            ServiceUpdate {
                tags: Some(tags.into_iter().map(Into::into).collect()),
                ..Default::default()
            },
        )
    }

    /// Overlay keys onto a service's metadata
    pub fn set_metadata(&self, id: &str, metadata: Metadata) -> common::Result<ServiceRecord> {
        self.update(
            id,
            ServiceUpdate {
                metadata: Some(metadata),
                ..Default::default()
            },
        )
    }

    /// Drop every record and cancel all timers. Emits no events.
    pub fn reset(&self) {
        self.records.clear();
        info!("Registry reset");

        if let Some(ref m) = self.metrics {
            m.update_service_count(0);
        }
    }

    /// Records selected by `filter`
    pub fn query(&self, filter: &ServiceFilter) -> common::Result<Vec<ServiceRecord>> {
        filter.validate()?;
        Ok(query::query(self.snapshot(), filter))
    }

    /// Usable endpoints of the HEALTHY and DEGRADED instances of `name`,
    /// ordered for routing. An empty list is not an error.
    pub fn find_service_endpoints(
        &self,
        name: &str,
        options: &EndpointQuery,
    ) -> common::Result<Vec<Endpoint>> {
        if options.limit == Some(0) {
            return Err(common::Error::invalid_input("limit must be greater than zero"));
        }
        let records = self.query(&options.service_filter(name))?;
        Ok(query::select_endpoints(&records, options))
    }

    /// Subscribe to changes of records selected by `filter`
    pub fn watch(&self, filter: ServiceFilter) -> common::Result<WatchHandle> {
        filter.validate()?;
        Ok(self.bus.subscribe(filter))
    }

    /// Number of active watches
    pub fn watcher_count(&self) -> usize {
        self.bus.len()
    }

    /// Counts over the current records, each read under its own lock
    pub fn statistics(&self) -> Statistics {
        let mut stats = Statistics::default();
        for stored in self.records.iter() {
            stats.add(&stored.record);
        }
        stats
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Copy of every record, each read under its own lock
    pub fn snapshot(&self) -> Vec<ServiceRecord> {
        self.records
            .iter()
            .map(|stored| stored.record.clone())
            .collect()
    }

    /// Stop the sweeper and every per-record timer. Records stay readable.
    pub fn shutdown(&self) {
        if let Some(sweeper) = self.sweeper.get() {
            sweeper.abort();
        }
        for mut stored in self.records.iter_mut() {
            stored.timers.cancel();
        }
        info!(services = self.records.len(), "Registry timers stopped");
    }

    /// Fold one endpoint's probe cycle into the record status. Returns
    /// false once the registration identified by `(id, epoch)` no longer
    /// exists.
    ///
    /// The status follows all checked endpoints together: HEALTHY when all
    /// pass, UNHEALTHY when all have failed `failure_threshold` cycles in a
    /// row, DEGRADED in between. A HEALTHY record always passes through
    /// DEGRADED on its way down.
    pub(crate) fn apply_probe(
        &self,
        id: &str,
        epoch: u64,
        endpoint: usize,
        consecutive_failures: u32,
    ) -> bool {
        let (previous, next) = {
            let Some(mut stored) = self.records.get_mut(id) else {
                return false;
            };
            if stored.epoch != epoch || !stored.health.record(endpoint, consecutive_failures) {
                return false;
            }
            let Some(verdict) = stored.health.verdict(self.config.failure_threshold) else {
                return true;
            };

            let previous = stored.record.status;
            // silence outranks a passing probe; only a heartbeat revives an expired record
            let expired = stored.record.is_expired(Utc::now());
            let next = match (verdict, previous) {
                (
                    ProbeVerdict::AllPassing,
                    ServiceStatus::Starting
                    | ServiceStatus::Unknown
                    | ServiceStatus::Degraded
                    | ServiceStatus::Unhealthy,
                ) if !expired => ServiceStatus::Healthy,
                (ProbeVerdict::Mixed { .. } | ProbeVerdict::AllFailing, ServiceStatus::Healthy) => {
                    ServiceStatus::Degraded
                }
                (
                    ProbeVerdict::Mixed { passing },
                    ServiceStatus::Starting | ServiceStatus::Unknown | ServiceStatus::Unhealthy,
                ) if passing > 0 && !expired => ServiceStatus::Degraded,
                (
                    ProbeVerdict::AllFailing,
                    ServiceStatus::Starting | ServiceStatus::Unknown | ServiceStatus::Degraded,
                ) => ServiceStatus::Unhealthy,
                _ => previous,
            };

            if next == previous {
                return true;
            }
            let before = stored.record.clone();
            stored.record.status = next;
            self.bus.publish(
                &stored.record,
                Some(&before),
                &WatchEvent::Updated(stored.record.clone()),
            );
            self.publish_status_change(&stored.record, &before);
            (previous, next)
        };

        if next == ServiceStatus::Healthy {
            info!(id = %id, from = %previous, "Service passed health check");
        } else {
            warn!(id = %id, endpoint, from = %previous, to = %next, consecutive_failures, "Service failed health check");
        }
        self.record_transition(previous, next);
        true
    }

    /// Re-read a record's deadline and expire it if it has passed.
    ///
    /// With `epoch`, a record from another registration counts as gone.
    pub(crate) fn check_expiry(&self, id: &str, epoch: Option<u64>) -> ExpiryState {
        let now = Utc::now();
        let previous = {
            let Some(mut stored) = self.records.get_mut(id) else {
                return ExpiryState::Gone;
            };
            if epoch.is_some_and(|epoch| epoch != stored.epoch) {
                return ExpiryState::Gone;
            }
            let Some(deadline) = stored.record.expires_at() else {
                return ExpiryState::Unbounded;
            };
            if now <= deadline {
                return ExpiryState::Alive(deadline);
            }

            let previous = stored.record.status;
            if previous == ServiceStatus::Unhealthy || previous.is_terminal() {
                return ExpiryState::Expired;
            }
            let before = stored.record.clone();
            stored.record.status = ServiceStatus::Unhealthy;
            self.bus.publish(
                &stored.record,
                Some(&before),
                &WatchEvent::Updated(stored.record.clone()),
            );
            self.publish_status_change(&stored.record, &before);
            self.bus.publish(
                &stored.record,
                Some(&before),
                &WatchEvent::Expired { id: id.to_string() },
            );
            previous
        };

        info!(id = %id, from = %previous, "Service expired");
        self.record_transition(previous, ServiceStatus::Unhealthy);
        if let Some(ref m) = self.metrics {
            m.record_expiration();
        }
        ExpiryState::Expired
    }

    /// Heartbeat on behalf of the registration `(id, epoch)`.
    pub(crate) fn touch(&self, id: &str, epoch: u64) -> bool {
        match self.records.get_mut(id) {
            Some(mut stored) if stored.epoch == epoch => {
                stored.record.last_heartbeat = Utc::now();
            }
            _ => return false,
        }
        if let Some(ref m) = self.metrics {
            m.record_heartbeat();
        }
        true
    }

    /// Expire every silent record. Returns how many were examined as due.
    pub(crate) fn sweep(&self) -> usize {
        let now = Utc::now();
        let due: Vec<String> = self
            .records
            .iter()
            .filter(|stored| {
                let record = &stored.record;
                record.is_expired(now)
                    && record.status != ServiceStatus::Unhealthy
                    && !record.status.is_terminal()
            })
            .map(|stored| stored.key().clone())
            .collect();

        let mut expired = 0;
        for id in due {
            match catch_unwind(AssertUnwindSafe(|| self.check_expiry(&id, None))) {
                Ok(ExpiryState::Expired) => expired += 1,
                Ok(_) => {}
                Err(payload) => {
                    let fault = scheduler::timer_fault("Expiration sweep", payload);
                    error!(id = %id, error = %fault, "Skipping service");
                }
            }
        }
        expired
    }

    fn publish_status_change(&self, record: &ServiceRecord, before: &ServiceRecord) {
        self.bus.publish(
            record,
            Some(before),
            &WatchEvent::StatusChanged {
                id: record.id.clone(),
                status: record.status,
                previous: before.status,
            },
        );
    }

    fn record_transition(&self, from: ServiceStatus, to: ServiceStatus) {
        if let Some(ref m) = self.metrics {
            m.record_status_transition(from, to);
        }
    }
}

impl Drop for Registry {
    fn drop(&mut self) {
        if let Some(sweeper) = self.sweeper.get() {
            sweeper.abort();
        }
    }
}

fn new_id() -> String {
    Uuid::new_v4().to_string()
}

fn merge(record: &mut ServiceRecord, update: ServiceUpdate) {
    let ServiceUpdate {
        name,
        version,
        description,
        status,
        endpoints,
        metadata,
        tenant_id,
        tags,
        ttl_seconds,
    } = update;

    if let Some(name) = name {
        record.name = name;
    }
    if let Some(version) = version {
        record.version = version;
    }
    if description.is_some() {
        record.description = description;
    }
    if let Some(status) = status {
        record.status = status;
    }
    if let Some(endpoints) = endpoints {
        record.endpoints = endpoints;
    }
    if let Some(metadata) = metadata {
        record.metadata.extend(metadata);
    }
    if tenant_id.is_some() {
        record.tenant_id = tenant_id;
    }
    if let Some(tags) = tags {
        record.tags = tags;
    }
    if let Some(ttl_seconds) = ttl_seconds {
        record.ttl_seconds = ttl_seconds;
    }
}
