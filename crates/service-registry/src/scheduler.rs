//! Per-record timers: TTL watchdog or self-heartbeat, endpoint probes, and
//! the global expiration sweeper.
//!
//! Timers never hold the registry alive. Each one carries a `Weak` handle
//! plus the `(id, epoch)` of the registration that started it, and stops as
//! soon as the registry, the record or that registration is gone.

use crate::model::{Endpoint, Protocol, ServiceRecord};
use crate::store::Registry;
use crate::types::{HeartbeatMode, RegistryConfig};
use chrono::{DateTime, Utc};
use healthcheck::{
    CheckType, HealthCheckConfig, HealthCheckMonitor, HealthCheckResult, HealthCheckStats,
    ProbeSink, build_checker,
};
use std::any::Any;
use std::ops::ControlFlow;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval, sleep};
use tracing::{debug, error, warn};

/// Result of re-reading a record's expiry under its entry lock
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ExpiryState {
    /// Record removed, or replaced by a newer registration
    Gone,
    /// Not expired yet; wake again at this instant
    Alive(DateTime<Utc>),
    /// Expired, either just now or earlier
    Expired,
    /// TTL disabled
    Unbounded,
}

/// Latest consecutive-failure count of each endpoint of one registration.
///
/// Indexed like the record's endpoint list; `None` until the endpoint's
/// first probe cycle completes. Rebuilt whenever the timers restart.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct EndpointHealth {
    failures: Vec<Option<u32>>,
}

/// Combined outcome of the latest probe cycle of every reporting endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ProbeVerdict {
    /// Every reporting endpoint passed its last cycle
    AllPassing,
    /// Some endpoints fail, or none has failed `failure_threshold` times yet
    Mixed { passing: usize },
    /// Every reporting endpoint has failed `failure_threshold` cycles in a row
    AllFailing,
}

impl EndpointHealth {
    pub(crate) fn new(endpoints: usize) -> Self {
        Self {
            failures: vec![None; endpoints],
        }
    }

    /// Store the cycle outcome of one endpoint. False for an unknown index.
    pub(crate) fn record(&mut self, endpoint: usize, consecutive_failures: u32) -> bool {
        match self.failures.get_mut(endpoint) {
            Some(slot) => {
                *slot = Some(consecutive_failures);
                true
            }
            None => false,
        }
    }

    pub(crate) fn verdict(&self, failure_threshold: u32) -> Option<ProbeVerdict> {
        let threshold = failure_threshold.max(1);
        let reported: Vec<u32> = self.failures.iter().flatten().copied().collect();
        if reported.is_empty() {
            return None;
        }

        let passing = reported.iter().filter(|failures| **failures == 0).count();
        let verdict = if passing == reported.len() {
            ProbeVerdict::AllPassing
        } else if reported.iter().all(|failures| *failures >= threshold) {
            ProbeVerdict::AllFailing
        } else {
            ProbeVerdict::Mixed { passing }
        };
        Some(verdict)
    }
}

/// Period of the self-heartbeat timer and of the post-expiry poll: `max(1s, ttl/3)`.
pub fn heartbeat_period(ttl_seconds: u64) -> Duration {
    Duration::from_millis(ttl_seconds.saturating_mul(1000) / 3).max(Duration::from_secs(1))
}

/// Timers owned by one stored registration. Dropping cancels them.
#[derive(Default)]
pub(crate) struct Timers {
    liveness: Option<JoinHandle<()>>,
    probes: Vec<HealthCheckMonitor>,
}

impl Timers {
    /// Start the liveness timer and one probe monitor per checked endpoint.
    ///
    /// Must be called from within a Tokio runtime.
    pub(crate) fn start(
        registry: &Weak<Registry>,
        record: &ServiceRecord,
        epoch: u64,
        config: &RegistryConfig,
    ) -> Self {
        let liveness = match (record.ttl_seconds, record.expires_at()) {
            (0, _) | (_, None) => None,
            (ttl, Some(deadline)) => Some(match config.heartbeat_mode {
                HeartbeatMode::External => tokio::spawn(watch_ttl(
                    registry.clone(),
                    record.id.clone(),
                    epoch,
                    deadline,
                    heartbeat_period(ttl),
                )),
                HeartbeatMode::SelfHeartbeat => tokio::spawn(self_heartbeat(
                    registry.clone(),
                    record.id.clone(),
                    epoch,
                    heartbeat_period(ttl),
                )),
            }),
        };

        let mut probes = Vec::new();
        for (index, endpoint) in record.endpoints.iter().enumerate() {
            let Some(probe_config) = probe_config(endpoint, config.probe_retry_backoff) else {
                continue;
            };
            let checker = match build_checker(&probe_config) {
                Ok(checker) => checker,
                Err(e) => {
                    warn!(id = %record.id, target = %probe_config.target, error = %e, "Cannot build health checker");
                    continue;
                }
            };

            let sink = Arc::new(RecordProbe {
                registry: registry.clone(),
                id: record.id.clone(),
                epoch,
                endpoint: index,
                kind: probe_config.check_type.label(),
            });
            let mut monitor = HealthCheckMonitor::new(checker, probe_config);
            monitor.start(sink);
            probes.push(monitor);
        }

        Self { liveness, probes }
    }

    /// Number of running probe monitors
    pub(crate) fn probe_count(&self) -> usize {
        self.probes.len()
    }

    /// Stop every timer. Safe to call more than once.
    pub(crate) fn cancel(&mut self) {
        if let Some(task) = self.liveness.take() {
            task.abort();
        }
        for mut monitor in self.probes.drain(..) {
            monitor.stop();
        }
    }
}

impl Drop for Timers {
    fn drop(&mut self) {
        self.cancel();
    }
}

/// Probe configuration for an endpoint declaring a health check.
///
/// `udp` endpoints are never probed.
pub fn probe_config(endpoint: &Endpoint, retry_backoff: Duration) -> Option<HealthCheckConfig> {
    let check = endpoint.health_check.as_ref()?;

    let check_type = match endpoint.protocol {
        Protocol::Http | Protocol::Ws => CheckType::Http {
            path: check.path.clone(),
            https: false,
        },
        Protocol::Https | Protocol::Wss => CheckType::Http {
            path: check.path.clone(),
            https: true,
        },
        Protocol::Grpc | Protocol::Tcp => CheckType::Tcp,
        Protocol::Udp => {
            warn!(target = %endpoint.address(), "Health checks are not supported for udp endpoints");
            return None;
        }
    };

    Some(HealthCheckConfig {
        target: endpoint.address(),
        timeout: Duration::from_millis(check.timeout_ms),
        interval: Duration::from_millis(check.interval_ms),
        retries: check.retries,
        retry_backoff,
        check_type,
    })
}

/// Feeds probe cycle results for one endpoint back into the store.
struct RecordProbe {
    registry: Weak<Registry>,
    id: String,
    epoch: u64,
    endpoint: usize,
    kind: &'static str,
}

impl ProbeSink for RecordProbe {
    fn report(&self, result: &HealthCheckResult, stats: &HealthCheckStats) -> ControlFlow<()> {
        let Some(registry) = self.registry.upgrade() else {
            return ControlFlow::Break(());
        };

        if let Some(metrics) = registry.metrics() {
            metrics.record_probe(self.kind, result.is_healthy(), result.duration);
        }

        if registry.apply_probe(&self.id, self.epoch, self.endpoint, stats.consecutive_failures) {
            ControlFlow::Continue(())
        } else {
            debug!(id = %self.id, epoch = self.epoch, "Probed registration is gone");
            ControlFlow::Break(())
        }
    }
}

/// TTL countdown for caller-driven heartbeats.
///
/// Sleeps until the record's deadline, then re-reads it: a heartbeat that
/// arrived in the meantime re-arms the timer, silence expires the record.
/// After expiry the record is polled every `poll` in case it comes back.
async fn watch_ttl(
    registry: Weak<Registry>,
    id: String,
    epoch: u64,
    first_deadline: DateTime<Utc>,
    poll: Duration,
) {
    sleep(until(first_deadline)).await;

    loop {
        let state = {
            let Some(registry) = registry.upgrade() else {
                return;
            };
            match catch_unwind(AssertUnwindSafe(|| registry.check_expiry(&id, Some(epoch)))) {
                Ok(state) => state,
                Err(payload) => {
                    let fault = timer_fault("TTL watchdog", payload);
                    error!(id = %id, error = %fault, "Cancelling timer");
                    return;
                }
            }
        };

        match state {
            ExpiryState::Gone | ExpiryState::Unbounded => return,
            ExpiryState::Alive(deadline) => sleep(until(deadline)).await,
            ExpiryState::Expired => sleep(poll).await,
        }
    }
}

/// Heartbeat on the service's behalf until its registration goes away.
async fn self_heartbeat(registry: Weak<Registry>, id: String, epoch: u64, period: Duration) {
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await;

    loop {
        ticker.tick().await;

        let Some(registry) = registry.upgrade() else {
            return;
        };
        match catch_unwind(AssertUnwindSafe(|| registry.touch(&id, epoch))) {
            Ok(true) => {}
            Ok(false) => {
                debug!(id = %id, "Heartbeat timer found no registration, stopping");
                return;
            }
            Err(payload) => {
                let fault = timer_fault("Heartbeat timer", payload);
                error!(id = %id, error = %fault, "Cancelling timer");
                return;
            }
        }
    }
}

/// Periodic full-store expiration scan.
pub(crate) fn spawn_sweeper(registry: Weak<Registry>, period: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            ticker.tick().await;
            let Some(registry) = registry.upgrade() else {
                debug!("Registry dropped, sweeper exiting");
                return;
            };
            let expired = registry.sweep();
            if expired > 0 {
                debug!(expired, "Expiration sweep finished");
            }
        }
    })
}

/// Turn a caught timer panic into a `Timer` error for logging.
pub(crate) fn timer_fault(timer: &str, payload: Box<dyn Any + Send>) -> common::Error {
    let detail = payload
        .downcast_ref::<&str>()
        .map(|message| message.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string());
    common::Error::timer(format!("{} panicked: {}", timer, detail))
}

/// Time left until `deadline`, plus a millisecond so the strict
/// `now > deadline` comparison holds on wake-up.
fn until(deadline: DateTime<Utc>) -> Duration {
    (deadline - Utc::now()).to_std().unwrap_or_default() + Duration::from_millis(1)
}
