//! Stateless filtering, sorting and endpoint selection over record snapshots.
//!
//! The same [`ServiceFilter::matches`] predicate backs direct queries and
//! watch subscriptions, so both always agree on what a filter selects.

use crate::model::{Endpoint, Metadata, Protocol, ServiceRecord, ServiceStatus};
use rand::Rng;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// Sort key for query results
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortBy {
    Name,
    #[serde(alias = "registeredAt")]
    RegisteredAt,
    #[serde(alias = "lastHeartbeat")]
    LastHeartbeat,
    /// Mean of the record's endpoint weights
    Weight,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortOrder {
    #[default]
    Asc,
    Desc,
}

/// Query and watch filter
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceFilter {
    pub name: Option<String>,
    pub version: Option<String>,
    pub status: Option<ServiceStatus>,
    pub tenant_id: Option<String>,
    /// A record must carry every listed tag.
    pub tags: Vec<String>,
    /// A record matches if any endpoint uses this protocol.
    pub protocol: Option<Protocol>,
    /// Restrict to HEALTHY and DEGRADED records.
    pub require_healthy: bool,
    pub sort_by: Option<SortBy>,
    pub sort_order: SortOrder,
    /// Applied after sorting.
    pub limit: Option<usize>,
    /// `false` strips record metadata from results.
    pub include_metadata: bool,
}

impl Default for ServiceFilter {
    fn default() -> Self {
        Self {
            name: None,
            version: None,
            status: None,
            tenant_id: None,
            tags: Vec::new(),
            protocol: None,
            require_healthy: false,
            sort_by: None,
            sort_order: SortOrder::Asc,
            limit: None,
            include_metadata: true,
        }
    }
}

impl ServiceFilter {
    pub fn by_name(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            ..Default::default()
        }
    }

    pub fn validate(&self) -> common::Result<()> {
        if self.limit == Some(0) {
            return Err(common::Error::invalid_input("limit must be greater than zero"));
        }
        if self.tags.iter().any(|tag| tag.trim().is_empty()) {
            return Err(common::Error::invalid_input("tags must not be empty strings"));
        }
        Ok(())
    }

    /// Whether `record` is selected by this filter. Sorting, limit and
    /// projection options do not take part in matching.
    pub fn matches(&self, record: &ServiceRecord) -> bool {
        if self.name.as_ref().is_some_and(|name| *name != record.name) {
            return false;
        }
        if self.version.as_ref().is_some_and(|version| *version != record.version) {
            return false;
        }
        if self.status.is_some_and(|status| status != record.status) {
            return false;
        }
        if self.tenant_id.is_some() && self.tenant_id != record.tenant_id {
            return false;
        }
        if !self.tags.iter().all(|tag| record.tags.contains(tag)) {
            return false;
        }
        if let Some(protocol) = self.protocol {
            if !record.endpoints.iter().any(|endpoint| endpoint.protocol == protocol) {
                return false;
            }
        }
        !self.require_healthy || record.status.is_usable()
    }

    /// Apply the projection options to a matching record.
    pub fn project(&self, mut record: ServiceRecord) -> ServiceRecord {
        if !self.include_metadata {
            record.metadata = Metadata::new();
        }
        record
    }
}

/// Filter, sort, limit and project a snapshot of records.
pub fn query(records: impl IntoIterator<Item = ServiceRecord>, filter: &ServiceFilter) -> Vec<ServiceRecord> {
    let mut results: Vec<ServiceRecord> = records
        .into_iter()
        .filter(|record| filter.matches(record))
        .collect();

    if let Some(sort_by) = filter.sort_by {
        results.sort_by(|a, b| {
            let ordering = compare(a, b, sort_by);
            match filter.sort_order {
                SortOrder::Asc => ordering,
                SortOrder::Desc => ordering.reverse(),
            }
        });
    }

    if let Some(limit) = filter.limit {
        results.truncate(limit);
    }

    results
        .into_iter()
        .map(|record| filter.project(record))
        .collect()
}

fn compare(a: &ServiceRecord, b: &ServiceRecord, sort_by: SortBy) -> Ordering {
    match sort_by {
        SortBy::Name => a.name.cmp(&b.name),
        SortBy::RegisteredAt => a.registered_at.cmp(&b.registered_at),
        SortBy::LastHeartbeat => a.last_heartbeat.cmp(&b.last_heartbeat),
        SortBy::Weight => a.mean_weight().total_cmp(&b.mean_weight()),
    }
}

/// Options for `find_service_endpoints`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EndpointQuery {
    pub version: Option<String>,
    pub protocol: Option<Protocol>,
    pub tenant_id: Option<String>,
    pub limit: Option<usize>,
    /// Uniform shuffle. Takes precedence over weight ordering.
    pub random: bool,
}

impl EndpointQuery {
    /// Record-level filter used to pick candidate services.
    pub fn service_filter(&self, name: &str) -> ServiceFilter {
        ServiceFilter {
            name: Some(name.to_string()),
            version: self.version.clone(),
            protocol: self.protocol,
            tenant_id: self.tenant_id.clone(),
            require_healthy: true,
            ..Default::default()
        }
    }
}

/// Flatten the endpoints of already-matched records and order them for routing.
///
/// Endpoints are sorted by descending weight (missing weight counts as 1,
/// ties keep registration order). With `random`, the weight-sorted list is
/// then shuffled, so random mode deliberately discards weight ordering.
pub fn select_endpoints(records: &[ServiceRecord], options: &EndpointQuery) -> Vec<Endpoint> {
    select_endpoints_with_rng(records, options, &mut rand::thread_rng())
}

pub fn select_endpoints_with_rng<R: Rng + ?Sized>(
    records: &[ServiceRecord],
    options: &EndpointQuery,
    rng: &mut R,
) -> Vec<Endpoint> {
    let mut endpoints: Vec<Endpoint> = records
        .iter()
        .flat_map(|record| record.endpoints.iter())
        .filter(|endpoint| options.protocol.is_none_or(|protocol| endpoint.protocol == protocol))
        .cloned()
        .collect();

    endpoints.sort_by(|a, b| b.effective_weight().cmp(&a.effective_weight()));

    if options.random {
        endpoints.shuffle(rng);
    }

    if let Some(limit) = options.limit {
        endpoints.truncate(limit);
    }

    endpoints
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};
    use rand::SeedableRng;
    use rand::rngs::StdRng;
    use std::collections::BTreeSet;

    fn record(id: &str, name: &str, status: ServiceStatus, tags: &[&str]) -> ServiceRecord {
        let now = Utc::now();
        ServiceRecord {
            id: id.to_string(),
            name: name.to_string(),
            version: "1.0.0".to_string(),
            description: None,
            status,
            endpoints: vec![Endpoint::new(Protocol::Http, "10.0.0.1", 8080)],
            metadata: Metadata::from([("zone".to_string(), serde_json::json!("eu-1"))]),
            tenant_id: None,
            tags: tags.iter().map(|tag| tag.to_string()).collect::<BTreeSet<_>>(),
            registered_at: now,
            last_heartbeat: now,
            ttl_seconds: 30,
        }
    }

    #[test]
    fn test_tags_use_and_semantics() {
        let tagged = record("1", "api", ServiceStatus::Healthy, &["a", "b"]);

        let both = ServiceFilter {
            tags: vec!["a".into(), "b".into()],
            ..Default::default()
        };
        let mixed = ServiceFilter {
            tags: vec!["a".into(), "c".into()],
            ..Default::default()
        };
        assert!(both.matches(&tagged));
        assert!(!mixed.matches(&tagged));
    }

    #[test]
    fn test_require_healthy_keeps_degraded() {
        let filter = ServiceFilter {
            require_healthy: true,
            ..Default::default()
        };
        assert!(filter.matches(&record("1", "api", ServiceStatus::Healthy, &[])));
        assert!(filter.matches(&record("2", "api", ServiceStatus::Degraded, &[])));
        assert!(!filter.matches(&record("3", "api", ServiceStatus::Starting, &[])));
        assert!(!filter.matches(&record("4", "api", ServiceStatus::Unhealthy, &[])));
    }

    #[test]
    fn test_protocol_matches_any_endpoint() {
        let mut mixed = record("1", "api", ServiceStatus::Healthy, &[]);
        mixed.endpoints.push(Endpoint::new(Protocol::Grpc, "10.0.0.1", 9090));

        let grpc = ServiceFilter {
            protocol: Some(Protocol::Grpc),
            ..Default::default()
        };
        let udp = ServiceFilter {
            protocol: Some(Protocol::Udp),
            ..Default::default()
        };
        assert!(grpc.matches(&mixed));
        assert!(!udp.matches(&mixed));
    }

    #[test]
    fn test_tenant_is_exact_match() {
        let mut scoped = record("1", "api", ServiceStatus::Healthy, &[]);
        scoped.tenant_id = Some("acme".into());
        let unscoped = record("2", "api", ServiceStatus::Healthy, &[]);

        let filter = ServiceFilter {
            tenant_id: Some("acme".into()),
            ..Default::default()
        };
        assert!(filter.matches(&scoped));
        assert!(!filter.matches(&unscoped));
        assert!(ServiceFilter::default().matches(&scoped));
    }

    #[test]
    fn test_sort_limit_and_projection() {
        let mut early = record("1", "b-service", ServiceStatus::Healthy, &[]);
        early.registered_at = Utc::now() - Duration::seconds(60);
        let late = record("2", "a-service", ServiceStatus::Healthy, &[]);
        let mut heavy = record("3", "c-service", ServiceStatus::Healthy, &[]);
        heavy.endpoints[0].weight = Some(10);
        let records = vec![early, late, heavy];

        let by_name = query(
            records.clone(),
            &ServiceFilter {
                sort_by: Some(SortBy::Name),
                ..Default::default()
            },
        );
        let names: Vec<_> = by_name.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, ["a-service", "b-service", "c-service"]);

        let by_weight = query(
            records.clone(),
            &ServiceFilter {
                sort_by: Some(SortBy::Weight),
                sort_order: SortOrder::Desc,
                limit: Some(1),
                include_metadata: false,
                ..Default::default()
            },
        );
        assert_eq!(by_weight.len(), 1);
        assert_eq!(by_weight[0].id, "3");
        assert!(by_weight[0].metadata.is_empty());

        let oldest = query(
            records,
            &ServiceFilter {
                sort_by: Some(SortBy::RegisteredAt),
                limit: Some(1),
                ..Default::default()
            },
        );
        assert_eq!(oldest[0].id, "1");
        assert_eq!(oldest[0].metadata["zone"], serde_json::json!("eu-1"));
    }

    #[test]
    fn test_filter_validation() {
        assert!(ServiceFilter::default().validate().is_ok());
        let zero = ServiceFilter {
            limit: Some(0),
            ..Default::default()
        };
        assert!(zero.validate().is_err());
        let blank_tag = ServiceFilter {
            tags: vec!["".into()],
            ..Default::default()
        };
        assert!(blank_tag.validate().is_err());
    }

    #[test]
    fn test_selection_orders_by_descending_weight() {
        let mut svc = record("1", "api", ServiceStatus::Healthy, &[]);
        svc.endpoints = [1, 5, 3]
            .into_iter()
            .enumerate()
            .map(|(i, weight)| Endpoint::new(Protocol::Http, format!("10.0.0.{}", i), 80).with_weight(weight))
            .collect();

        let selected = select_endpoints(&[svc.clone()], &EndpointQuery::default());
        let weights: Vec<_> = selected.iter().map(|e| e.effective_weight()).collect();
        assert_eq!(weights, [5, 3, 1]);

        // stored order is untouched
        let stored: Vec<_> = svc.endpoints.iter().map(|e| e.effective_weight()).collect();
        assert_eq!(stored, [1, 5, 3]);

        let limited = select_endpoints(
            &[svc],
            &EndpointQuery {
                limit: Some(2),
                ..Default::default()
            },
        );
        assert_eq!(limited.len(), 2);
        assert_eq!(limited[0].effective_weight(), 5);
    }

    #[test]
    fn test_selection_filters_endpoint_protocol() {
        let mut svc = record("1", "api", ServiceStatus::Healthy, &[]);
        svc.endpoints.push(Endpoint::new(Protocol::Grpc, "10.0.0.1", 9090).with_weight(7));

        let grpc_only = select_endpoints(
            &[svc],
            &EndpointQuery {
                protocol: Some(Protocol::Grpc),
                ..Default::default()
            },
        );
        assert_eq!(grpc_only.len(), 1);
        assert_eq!(grpc_only[0].port, 9090);
    }

    #[test]
    fn test_random_selection_is_a_permutation() {
        let mut svc = record("1", "api", ServiceStatus::Healthy, &[]);
        svc.endpoints = (1..=8)
            .map(|port| Endpoint::new(Protocol::Tcp, "10.0.0.1", port).with_weight(port as u32))
            .collect();

        let options = EndpointQuery {
            random: true,
            ..Default::default()
        };
        let mut rng = StdRng::seed_from_u64(7);
        let shuffled = select_endpoints_with_rng(&[svc], &options, &mut rng);

        let mut ports: Vec<_> = shuffled.iter().map(|e| e.port).collect();
        assert_eq!(ports.len(), 8);
        ports.sort_unstable();
        assert_eq!(ports, (1..=8).collect::<Vec<u16>>());
    }
}
