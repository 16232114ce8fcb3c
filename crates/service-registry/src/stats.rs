//! Point-in-time counts over the store.

use crate::model::{Protocol, ServiceRecord, ServiceStatus};
use serde::Serialize;
use std::collections::BTreeMap;

/// Aggregated view of all registered services
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Statistics {
    pub total_services: usize,
    /// Records whose status is exactly HEALTHY
    pub healthy_services: usize,
    /// Records whose status is exactly UNHEALTHY
    pub unhealthy_services: usize,
    /// Instances per service name, across versions
    pub services_by_name: BTreeMap<String, usize>,
    pub services_by_status: BTreeMap<ServiceStatus, usize>,
    /// Endpoints (not services) per protocol, regardless of health
    pub endpoints_by_protocol: BTreeMap<Protocol, usize>,
}

impl Statistics {
    /// Fold one record into the counts.
    pub fn add(&mut self, record: &ServiceRecord) {
        self.total_services += 1;
        match record.status {
            ServiceStatus::Healthy => self.healthy_services += 1,
            ServiceStatus::Unhealthy => self.unhealthy_services += 1,
            _ => {}
        }
        *self.services_by_name.entry(record.name.clone()).or_default() += 1;
        *self.services_by_status.entry(record.status).or_default() += 1;
        for endpoint in &record.endpoints {
            *self.endpoints_by_protocol.entry(endpoint.protocol).or_default() += 1;
        }
    }
}
