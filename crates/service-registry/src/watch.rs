//! Standing subscriptions to store changes.

use crate::metrics::MetricsRegistry;
use crate::model::{ServiceRecord, ServiceStatus};
use crate::query::ServiceFilter;
use dashmap::DashMap;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;
use tracing::debug;

/// A change to a record, delivered to every watcher whose filter matches it
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WatchEvent {
    Added(ServiceRecord),
    Updated(ServiceRecord),
    Removed {
        id: String,
    },
    StatusChanged {
        id: String,
        status: ServiceStatus,
        previous: ServiceStatus,
    },
    /// The record went UNHEALTHY because its TTL elapsed without a heartbeat.
    Expired {
        id: String,
    },
}

impl WatchEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            WatchEvent::Added(_) => "added",
            WatchEvent::Updated(_) => "updated",
            WatchEvent::Removed { .. } => "removed",
            WatchEvent::StatusChanged { .. } => "status_changed",
            WatchEvent::Expired { .. } => "expired",
        }
    }

    pub fn service_id(&self) -> &str {
        match self {
            WatchEvent::Added(record) | WatchEvent::Updated(record) => &record.id,
            WatchEvent::Removed { id }
            | WatchEvent::StatusChanged { id, .. }
            | WatchEvent::Expired { id } => id,
        }
    }
}

struct Watcher {
    filter: ServiceFilter,
    tx: mpsc::UnboundedSender<WatchEvent>,
}

/// Fan-out of store changes to watchers
pub struct WatchBus {
    watchers: DashMap<u64, Watcher>,
    next_id: AtomicU64,
    metrics: Option<Arc<MetricsRegistry>>,
}

impl WatchBus {
    pub fn new(metrics: Option<Arc<MetricsRegistry>>) -> Arc<Self> {
        Arc::new(Self {
            watchers: DashMap::new(),
            next_id: AtomicU64::new(1),
            metrics,
        })
    }

    /// Register a watcher. The filter must already be validated.
    pub fn subscribe(self: &Arc<Self>, filter: ServiceFilter) -> WatchHandle {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        self.watchers.insert(id, Watcher { filter, tx });
        self.update_gauge();
        debug!(watch_id = id, "Watch registered");

        WatchHandle {
            id,
            rx,
            bus: Arc::downgrade(self),
        }
    }

    /// Deliver `event` to every watcher whose filter matches `record` or
    /// matched `previous`, the state before the change. A watcher therefore
    /// sees a record both entering and leaving its result set.
    ///
    /// Never blocks; callers invoke it while holding the record's entry lock
    /// so that events for one record reach each watcher in mutation order.
    pub fn publish(&self, record: &ServiceRecord, previous: Option<&ServiceRecord>, event: &WatchEvent) {
        let mut closed = Vec::new();

        for watcher in self.watchers.iter() {
            let filter = &watcher.filter;
            if !filter.matches(record) && !previous.is_some_and(|before| filter.matches(before)) {
                continue;
            }
            let delivered = match event {
                WatchEvent::Added(record) => WatchEvent::Added(watcher.filter.project(record.clone())),
                WatchEvent::Updated(record) => {
                    WatchEvent::Updated(watcher.filter.project(record.clone()))
                }
                other => other.clone(),
            };
            if watcher.tx.send(delivered).is_err() {
                closed.push(*watcher.key());
            }
        }

        if let Some(ref m) = self.metrics {
            m.record_watch_event(event.kind());
        }

        if !closed.is_empty() {
            for id in closed {
                self.watchers.remove(&id);
            }
            self.update_gauge();
        }
    }

    /// Remove a watcher; returns whether it was still registered.
    pub fn unsubscribe(&self, id: u64) -> bool {
        let removed = self.watchers.remove(&id).is_some();
        if removed {
            debug!(watch_id = id, "Watch cancelled");
            self.update_gauge();
        }
        removed
    }

    /// Number of active watchers
    pub fn len(&self) -> usize {
        self.watchers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.watchers.is_empty()
    }

    fn update_gauge(&self) {
        if let Some(ref m) = self.metrics {
            m.update_watcher_count(self.watchers.len());
        }
    }
}

/// Receiving side of a watch; cancels itself on drop
pub struct WatchHandle {
    id: u64,
    rx: mpsc::UnboundedReceiver<WatchEvent>,
    bus: Weak<WatchBus>,
}

impl WatchHandle {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Wait for the next event. Returns `None` once cancelled and drained.
    pub async fn recv(&mut self) -> Option<WatchEvent> {
        self.rx.recv().await
    }

    /// Next buffered event, if any.
    pub fn try_recv(&mut self) -> Option<WatchEvent> {
        self.rx.try_recv().ok()
    }

    /// Stop receiving new events. Safe to call more than once.
    pub fn cancel(&self) {
        if let Some(bus) = self.bus.upgrade() {
            bus.unsubscribe(self.id);
        }
    }
}

impl Drop for WatchHandle {
    fn drop(&mut self) {
        self.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Endpoint, Metadata, Protocol};
    use chrono::Utc;
    use std::collections::BTreeSet;

    fn record(id: &str, name: &str) -> ServiceRecord {
        let now = Utc::now();
        ServiceRecord {
            id: id.to_string(),
            name: name.to_string(),
            version: String::new(),
            description: None,
            status: ServiceStatus::Starting,
            endpoints: vec![Endpoint::new(Protocol::Http, "10.0.0.1", 80)],
            metadata: Metadata::from([("secret".to_string(), serde_json::json!(true))]),
            tenant_id: None,
            tags: BTreeSet::new(),
            registered_at: now,
            last_heartbeat: now,
            ttl_seconds: 0,
        }
    }

    #[test]
    fn test_publish_only_reaches_matching_watchers() {
        let bus = WatchBus::new(None);
        let mut x_watch = bus.subscribe(ServiceFilter::by_name("X"));
        let mut all_watch = bus.subscribe(ServiceFilter::default());

        let y = record("1", "Y");
        bus.publish(&y, None, &WatchEvent::Added(y.clone()));

        assert!(x_watch.try_recv().is_none());
        assert_eq!(all_watch.try_recv(), Some(WatchEvent::Added(y)));
    }

    #[test]
    fn test_watchers_see_records_leave_their_filter() {
        let bus = WatchBus::new(None);
        let mut healthy_watch = bus.subscribe(ServiceFilter {
            status: Some(ServiceStatus::Healthy),
            ..Default::default()
        });

        let mut before = record("1", "X");
        before.status = ServiceStatus::Healthy;
        let mut after = before.clone();
        after.status = ServiceStatus::Unhealthy;
        let change = WatchEvent::StatusChanged {
            id: "1".into(),
            status: ServiceStatus::Unhealthy,
            previous: ServiceStatus::Healthy,
        };

        bus.publish(&after, Some(&before), &change);
        assert_eq!(healthy_watch.try_recv(), Some(change.clone()));

        bus.publish(&after, None, &change);
        assert!(healthy_watch.try_recv().is_none());

        bus.publish(&after, Some(&after), &WatchEvent::Updated(after.clone()));
        assert!(healthy_watch.try_recv().is_none());
    }

    #[test]
    fn test_projection_applies_to_delivered_records() {
        let bus = WatchBus::new(None);
        let mut watch = bus.subscribe(ServiceFilter {
            include_metadata: false,
            ..Default::default()
        });

        let svc = record("1", "X");
        bus.publish(&svc, None, &WatchEvent::Updated(svc.clone()));

        match watch.try_recv() {
            Some(WatchEvent::Updated(delivered)) => assert!(delivered.metadata.is_empty()),
            other => panic!("expected Updated, got {:?}", other),
        }
    }

    #[test]
    fn test_cancel_is_idempotent_and_drop_unsubscribes() {
        let bus = WatchBus::new(None);
        let watch = bus.subscribe(ServiceFilter::default());
        let other = bus.subscribe(ServiceFilter::default());
        assert_eq!(bus.len(), 2);

        watch.cancel();
        watch.cancel();
        assert_eq!(bus.len(), 1);

        drop(other);
        assert!(bus.is_empty());
        drop(watch);
    }

    #[test]
    fn test_closed_receivers_are_pruned() {
        let bus = WatchBus::new(None);
        let mut watch = bus.subscribe(ServiceFilter::default());
        let id = watch.id();
        watch.rx.close();

        let svc = record("1", "X");
        bus.publish(&svc, None, &WatchEvent::Removed { id: svc.id.clone() });
        assert!(bus.is_empty());
        assert!(!bus.unsubscribe(id));
    }

    #[test]
    fn test_event_accessors() {
        let event = WatchEvent::StatusChanged {
            id: "svc-1".into(),
            status: ServiceStatus::Healthy,
            previous: ServiceStatus::Starting,
        };
        assert_eq!(event.kind(), "status_changed");
        assert_eq!(event.service_id(), "svc-1");

        let json = serde_json::to_value(&WatchEvent::Expired { id: "svc-1".into() }).unwrap();
        assert_eq!(json["type"], "expired");
    }
}
