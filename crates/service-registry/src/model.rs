//! Service records, endpoints and the payloads used to create and change them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::str::FromStr;

/// Opaque key/value data attached to services and endpoints.
pub type Metadata = HashMap<String, serde_json::Value>;

/// Lifecycle status of a service instance
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ServiceStatus {
    #[default]
    Unknown,
    Starting,
    Healthy,
    Degraded,
    Unhealthy,
    Stopping,
    Stopped,
}

impl ServiceStatus {
    pub const ALL: [ServiceStatus; 7] = [
        ServiceStatus::Unknown,
        ServiceStatus::Starting,
        ServiceStatus::Healthy,
        ServiceStatus::Degraded,
        ServiceStatus::Unhealthy,
        ServiceStatus::Stopping,
        ServiceStatus::Stopped,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceStatus::Unknown => "UNKNOWN",
            ServiceStatus::Starting => "STARTING",
            ServiceStatus::Healthy => "HEALTHY",
            ServiceStatus::Degraded => "DEGRADED",
            ServiceStatus::Unhealthy => "UNHEALTHY",
            ServiceStatus::Stopping => "STOPPING",
            ServiceStatus::Stopped => "STOPPED",
        }
    }

    /// Eligible for traffic: HEALTHY, or DEGRADED with reduced confidence.
    pub fn is_usable(&self) -> bool {
        matches!(self, ServiceStatus::Healthy | ServiceStatus::Degraded)
    }

    /// STOPPING and STOPPED are only left through re-registration.
    pub fn is_terminal(&self) -> bool {
        matches!(self, ServiceStatus::Stopping | ServiceStatus::Stopped)
    }

    /// Whether a caller may move a record from `self` to `next`.
    pub fn can_transition_to(&self, next: ServiceStatus) -> bool {
        match self {
            ServiceStatus::Stopped => next == ServiceStatus::Stopped,
            ServiceStatus::Stopping => next.is_terminal(),
            _ => true,
        }
    }
}

impl fmt::Display for ServiceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ServiceStatus {
    type Err = common::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ServiceStatus::ALL
            .into_iter()
            .find(|status| status.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| common::Error::invalid_input(format!("unknown status '{}'", s)))
    }
}

/// Transport protocol of an endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Http,
    Https,
    Grpc,
    Ws,
    Wss,
    Tcp,
    Udp,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Http => "http",
            Protocol::Https => "https",
            Protocol::Grpc => "grpc",
            Protocol::Ws => "ws",
            Protocol::Wss => "wss",
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Active probing declared by an endpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthCheck {
    pub path: String,
    pub interval_ms: u64,
    pub timeout_ms: u64,
    #[serde(default)]
    pub retries: u32,
}

/// One network address a service exposes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Endpoint {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub name: String,
    pub protocol: Protocol,
    pub host: String,
    pub port: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub health_check: Option<HealthCheck>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub weight: Option<u32>,
    #[serde(default)]
    pub metadata: Metadata,
    #[serde(default)]
    pub secure: bool,
}

impl Endpoint {
    pub fn new(protocol: Protocol, host: impl Into<String>, port: u16) -> Self {
        Self {
            id: String::new(),
            name: String::new(),
            protocol,
            host: host.into(),
            port,
            path: None,
            health_check: None,
            weight: None,
            metadata: Metadata::new(),
            secure: false,
        }
    }

    pub fn with_weight(mut self, weight: u32) -> Self {
        self.weight = Some(weight);
        self
    }

    pub fn with_health_check(mut self, health_check: HealthCheck) -> Self {
        self.health_check = Some(health_check);
        self
    }

    /// Selection weight, defaulting to 1.
    pub fn effective_weight(&self) -> u32 {
        self.weight.unwrap_or(1)
    }

    /// `host:port`
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    fn validate(&self, index: usize) -> common::Result<()> {
        if self.host.trim().is_empty() {
            return Err(common::Error::invalid_input(format!(
                "endpoint {} has an empty host",
                index
            )));
        }
        if self.port == 0 {
            return Err(common::Error::invalid_input(format!(
                "endpoint {} has port 0",
                index
            )));
        }
        if let Some(check) = &self.health_check {
            if check.interval_ms == 0 || check.timeout_ms == 0 {
                return Err(common::Error::invalid_input(format!(
                    "endpoint {} health check needs non-zero interval and timeout",
                    index
                )));
            }
        }
        Ok(())
    }
}

/// The registry's view of one running service instance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceRecord {
    pub id: String,
    pub name: String,
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub status: ServiceStatus,
    pub endpoints: Vec<Endpoint>,
    #[serde(default)]
    pub metadata: Metadata,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tenant_id: Option<String>,
    #[serde(default)]
    pub tags: BTreeSet<String>,
    pub registered_at: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
    /// Zero means the record never expires through missing heartbeats.
    pub ttl_seconds: u64,
}

impl ServiceRecord {
    /// Mean endpoint weight; zero when the record has no endpoints.
    pub fn mean_weight(&self) -> f64 {
        if self.endpoints.is_empty() {
            return 0.0;
        }
        let total: u64 = self
            .endpoints
            .iter()
            .map(|endpoint| u64::from(endpoint.effective_weight()))
            .sum();
        total as f64 / self.endpoints.len() as f64
    }

    /// Instant after which the record counts as expired.
    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        if self.ttl_seconds == 0 {
            return None;
        }
        let ttl = chrono::Duration::try_seconds(i64::try_from(self.ttl_seconds).ok()?)?;
        self.last_heartbeat.checked_add_signed(ttl)
    }

    /// `now > last_heartbeat + ttl`
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at().is_some_and(|deadline| now > deadline)
    }
}

/// Longest accepted TTL, ten years. Anything larger would put the
/// expiry deadline beyond what timestamps can represent.
pub const MAX_TTL_SECONDS: u64 = 10 * 365 * 24 * 60 * 60;

/// Payload for `register`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServiceRegistration {
    /// Generated when absent or empty.
    #[serde(default)]
    pub id: Option<String>,
    pub name: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub description: Option<String>,
    /// Defaults to STARTING.
    #[serde(default)]
    pub status: Option<ServiceStatus>,
    #[serde(default)]
    pub endpoints: Vec<Endpoint>,
    #[serde(default)]
    pub metadata: Metadata,
    #[serde(default)]
    pub tenant_id: Option<String>,
    #[serde(default)]
    pub tags: BTreeSet<String>,
    /// Defaults to the registry's default TTL; zero disables expiry.
    #[serde(default)]
    pub ttl_seconds: Option<u64>,
}

impl ServiceRegistration {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn with_endpoint(mut self, endpoint: Endpoint) -> Self {
        self.endpoints.push(endpoint);
        self
    }

    pub fn with_ttl(mut self, ttl_seconds: u64) -> Self {
        self.ttl_seconds = Some(ttl_seconds);
        self
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }

    pub fn validate(&self) -> common::Result<()> {
        if self.name.trim().is_empty() {
            return Err(common::Error::invalid_input("service name must not be empty"));
        }
        validate_ttl(self.ttl_seconds)?;
        validate_endpoints(&self.endpoints)
    }
}

/// Partial update merged into an existing record by `update`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServiceUpdate {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub status: Option<ServiceStatus>,
    /// Replaces the endpoint list and restarts probing.
    #[serde(default)]
    pub endpoints: Option<Vec<Endpoint>>,
    /// Shallow overlay onto the existing metadata.
    #[serde(default)]
    pub metadata: Option<Metadata>,
    #[serde(default)]
    pub tenant_id: Option<String>,
    /// Replaces the tag set.
    #[serde(default)]
    pub tags: Option<BTreeSet<String>>,
    #[serde(default)]
    pub ttl_seconds: Option<u64>,
}

impl ServiceUpdate {
    pub fn status(status: ServiceStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    pub fn validate(&self) -> common::Result<()> {
        if let Some(name) = &self.name {
            if name.trim().is_empty() {
                return Err(common::Error::invalid_input("service name must not be empty"));
            }
        }
        validate_ttl(self.ttl_seconds)?;
        match &self.endpoints {
            Some(endpoints) => validate_endpoints(endpoints),
            None => Ok(()),
        }
    }

    /// Whether applying this update requires restarting the record's timers.
    pub(crate) fn touches_timers(&self, record: &ServiceRecord) -> bool {
        self.endpoints
            .as_ref()
            .is_some_and(|endpoints| *endpoints != record.endpoints)
            || self
                .ttl_seconds
                .is_some_and(|ttl| ttl != record.ttl_seconds)
    }
}

fn validate_ttl(ttl_seconds: Option<u64>) -> common::Result<()> {
    match ttl_seconds {
        Some(ttl) if ttl > MAX_TTL_SECONDS => Err(common::Error::invalid_input(format!(
            "ttl_seconds must be at most {} (got {})",
            MAX_TTL_SECONDS, ttl
        ))),
        _ => Ok(()),
    }
}

fn validate_endpoints(endpoints: &[Endpoint]) -> common::Result<()> {
    endpoints
        .iter()
        .enumerate()
        .try_for_each(|(index, endpoint)| endpoint.validate(index))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record_with_weights(weights: &[Option<u32>]) -> ServiceRecord {
        let now = Utc::now();
        ServiceRecord {
            id: "svc-1".into(),
            name: "cache".into(),
            version: "1.0.0".into(),
            description: None,
            status: ServiceStatus::Healthy,
            endpoints: weights
                .iter()
                .map(|weight| Endpoint {
                    weight: *weight,
                    ..Endpoint::new(Protocol::Http, "10.0.0.5", 8080)
                })
                .collect(),
            metadata: Metadata::new(),
            tenant_id: None,
            tags: BTreeSet::new(),
            registered_at: now,
            last_heartbeat: now,
            ttl_seconds: 30,
        }
    }

    #[test]
    fn test_status_serializes_uppercase() {
        let json = serde_json::to_string(&ServiceStatus::Degraded).unwrap();
        assert_eq!(json, "\"DEGRADED\"");
        assert_eq!("healthy".parse::<ServiceStatus>().unwrap(), ServiceStatus::Healthy);
        assert!("sleepy".parse::<ServiceStatus>().is_err());
    }

    #[test]
    fn test_terminal_transitions() {
        assert!(ServiceStatus::Stopping.can_transition_to(ServiceStatus::Stopped));
        assert!(!ServiceStatus::Stopping.can_transition_to(ServiceStatus::Healthy));
        assert!(!ServiceStatus::Stopped.can_transition_to(ServiceStatus::Starting));
        assert!(ServiceStatus::Unhealthy.can_transition_to(ServiceStatus::Healthy));
    }

    #[test]
    fn test_mean_weight_defaults_missing_weights_to_one() {
        let record = record_with_weights(&[Some(4), None, Some(1)]);
        assert_eq!(record.mean_weight(), 2.0);
        assert_eq!(record_with_weights(&[]).mean_weight(), 0.0);
    }

    #[test]
    fn test_expiry_is_strictly_after_deadline() {
        let mut record = record_with_weights(&[None]);
        record.ttl_seconds = 2;
        let deadline = record.last_heartbeat + chrono::Duration::seconds(2);
        assert!(!record.is_expired(deadline));
        assert!(record.is_expired(deadline + chrono::Duration::milliseconds(1)));

        record.ttl_seconds = 0;
        assert!(!record.is_expired(deadline + chrono::Duration::days(365)));
    }

    #[test]
    fn test_registration_validation() {
        assert!(ServiceRegistration::new("").validate().is_err());
        assert!(
            ServiceRegistration::new("api")
                .with_endpoint(Endpoint::new(Protocol::Tcp, "10.0.0.1", 0))
                .validate()
                .is_err()
        );
        assert!(
            ServiceRegistration::new("api")
                .with_endpoint(Endpoint::new(Protocol::Tcp, " ", 80))
                .validate()
                .is_err()
        );
        let bad_check = Endpoint::new(Protocol::Http, "10.0.0.1", 80).with_health_check(HealthCheck {
            path: "/health".into(),
            interval_ms: 0,
            timeout_ms: 100,
            retries: 0,
        });
        assert!(ServiceRegistration::new("api").with_endpoint(bad_check).validate().is_err());
        assert!(
            ServiceRegistration::new("api")
                .with_endpoint(Endpoint::new(Protocol::Grpc, "10.0.0.1", 9090))
                .validate()
                .is_ok()
        );
    }

    #[test]
    fn test_ttl_is_capped() {
        let at_cap = ServiceRegistration::new("api").with_ttl(MAX_TTL_SECONDS);
        assert!(at_cap.validate().is_ok());

        let huge = ServiceRegistration::new("api").with_ttl(u64::MAX);
        let err = huge.validate().unwrap_err();
        assert!(matches!(err, common::Error::InvalidInput(_)));

        let update = ServiceUpdate {
            ttl_seconds: Some(MAX_TTL_SECONDS + 1),
            ..Default::default()
        };
        assert!(matches!(update.validate(), Err(common::Error::InvalidInput(_))));

        let mut record = record_with_weights(&[None]);
        record.ttl_seconds = MAX_TTL_SECONDS;
        assert!(record.expires_at().is_some());
    }

    #[test]
    fn test_registration_json_defaults() {
        let json = r#"{
            "name": "cache",
            "endpoints": [{"protocol": "http", "host": "10.0.0.5", "port": 8080, "weight": 2}]
        }"#;
        let registration: ServiceRegistration = serde_json::from_str(json).unwrap();
        assert_eq!(registration.name, "cache");
        assert!(registration.id.is_none());
        assert!(registration.ttl_seconds.is_none());
        assert_eq!(registration.endpoints[0].protocol, Protocol::Http);
        assert_eq!(registration.endpoints[0].effective_weight(), 2);
    }
}
