//! Periodic probing of a single target.

use crate::checkers::HealthChecker;
use crate::types::{HealthCheckConfig, HealthCheckResult, HealthCheckStats, HealthStatus};
use std::ops::ControlFlow;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use tokio::sync::{Notify, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep};
use tracing::{debug, error, info, warn};

/// Receives the outcome of every probe cycle.
///
/// Returning `ControlFlow::Break` stops the monitor, e.g. when the probed
/// service no longer exists.
pub trait ProbeSink: Send + Sync {
    fn report(&self, result: &HealthCheckResult, stats: &HealthCheckStats) -> ControlFlow<()>;
}

/// Health check monitor
pub struct HealthCheckMonitor {
    checker: Arc<dyn HealthChecker>,
    config: HealthCheckConfig,
    stats: Arc<RwLock<HealthCheckStats>>,
    stop_signal: Arc<Notify>,
    task: Option<JoinHandle<()>>,
}

impl HealthCheckMonitor {
    /// Create a new health check monitor
    pub fn new(checker: Arc<dyn HealthChecker>, config: HealthCheckConfig) -> Self {
        Self {
            checker,
            config,
            stats: Arc::new(RwLock::new(HealthCheckStats::default())),
            stop_signal: Arc::new(Notify::new()),
            task: None,
        }
    }

    /// Probe configuration
    pub fn config(&self) -> &HealthCheckConfig {
        &self.config
    }

    /// Start monitoring; every cycle result is handed to `sink`.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start(&mut self, sink: Arc<dyn ProbeSink>) {
        if self.task.is_some() {
            return;
        }

        let checker = self.checker.clone();
        let config = self.config.clone();
        let stats = self.stats.clone();
        let stop_signal = self.stop_signal.clone();

        self.task = Some(tokio::spawn(async move {
            let mut check_interval = interval(config.interval);
            check_interval.tick().await; // Skip first immediate tick

            loop {
                tokio::select! {
                    _ = check_interval.tick() => {
                        let result = Self::run_cycle(checker.as_ref(), &config).await;
                        let snapshot = {
                            let mut guard = stats.write().await;
                            guard.update(&result);
                            guard.clone()
                        };
                        Self::log_result(&result, &config, &snapshot);

                        match catch_unwind(AssertUnwindSafe(|| sink.report(&result, &snapshot))) {
                            Ok(ControlFlow::Continue(())) => {}
                            Ok(ControlFlow::Break(())) => {
                                debug!(target = %config.target, "Probe sink released monitor");
                                break;
                            }
                            Err(_) => {
                                error!(target = %config.target, "Probe sink panicked, stopping monitor");
                                break;
                            }
                        }
                    }
                    _ = stop_signal.notified() => {
                        info!(target = %config.target, "Health check monitor stopping");
                        break;
                    }
                }
            }
        }));
    }

    /// Stop monitoring. Safe to call more than once.
    pub fn stop(&mut self) {
        self.stop_signal.notify_one();
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }

    /// Whether the monitor task is still alive
    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|task| !task.is_finished())
    }

    /// Get statistics
    pub async fn get_stats(&self) -> HealthCheckStats {
        self.stats.read().await.clone()
    }

    /// Perform one probe cycle: up to `1 + retries` attempts with backoff.
    pub async fn run_cycle(
        checker: &dyn HealthChecker,
        config: &HealthCheckConfig,
    ) -> HealthCheckResult {
        let attempts = config.attempts();
        let mut attempt = 0;

        loop {
            let mut result = checker.check().await;
            result.attempts = attempt + 1;

            if result.is_healthy() || attempt + 1 >= attempts {
                return result;
            }

            debug!(
                target = %config.target,
                attempt = attempt + 1,
                attempts,
                status = %result.status,
                "Probe attempt failed, retrying"
            );
            sleep(config.backoff_after(attempt)).await;
            attempt += 1;
        }
    }

    fn log_result(result: &HealthCheckResult, config: &HealthCheckConfig, stats: &HealthCheckStats) {
        match result.status {
            HealthStatus::Healthy => {
                debug!(
                    target = %config.target,
                    duration_ms = result.duration.as_millis(),
                    consecutive = stats.consecutive_successes,
                    "Health check passed"
                );
            }
            HealthStatus::Unhealthy | HealthStatus::Error => {
                warn!(
                    target = %config.target,
                    message = result.message.as_deref().unwrap_or("unknown"),
                    attempts = result.attempts,
                    consecutive = stats.consecutive_failures,
                    "Health check failed"
                );
            }
            HealthStatus::Timeout => {
                warn!(
                    target = %config.target,
                    attempts = result.attempts,
                    consecutive = stats.consecutive_failures,
                    "Health check timed out"
                );
            }
        }
    }
}

impl Drop for HealthCheckMonitor {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkers::{MockHealthChecker, TcpChecker};
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    fn config(interval_ms: u64, retries: u32) -> HealthCheckConfig {
        HealthCheckConfig {
            target: "127.0.0.1:1".to_string(),
            timeout: Duration::from_millis(100),
            interval: Duration::from_millis(interval_ms),
            retries,
            retry_backoff: Duration::from_millis(1),
            ..Default::default()
        }
    }

    #[derive(Default)]
    struct RecordingSink {
        results: Mutex<Vec<(HealthStatus, u32)>>,
        stop_after: Option<usize>,
    }

    impl ProbeSink for RecordingSink {
        fn report(&self, result: &HealthCheckResult, stats: &HealthCheckStats) -> ControlFlow<()> {
            let mut results = self.results.lock().unwrap();
            results.push((result.status, stats.consecutive_failures));
            match self.stop_after {
                Some(limit) if results.len() >= limit => ControlFlow::Break(()),
                _ => ControlFlow::Continue(()),
            }
        }
    }

    struct PanickingSink;

    impl ProbeSink for PanickingSink {
        fn report(&self, _: &HealthCheckResult, _: &HealthCheckStats) -> ControlFlow<()> {
            panic!("sink failure");
        }
    }

    #[tokio::test]
    async fn test_cycle_retries_until_success() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();

        let mut checker = MockHealthChecker::new();
        checker.expect_check().times(3).returning(move || {
            if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                HealthCheckResult::error(Duration::from_millis(1), "refused")
            } else {
                HealthCheckResult::healthy(Duration::from_millis(1))
            }
        });

        let result = HealthCheckMonitor::run_cycle(&checker, &config(100, 2)).await;
        assert!(result.is_healthy());
        assert_eq!(result.attempts, 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_cycle_gives_up_after_retries() {
        let mut checker = MockHealthChecker::new();
        checker
            .expect_check()
            .times(2)
            .returning(|| HealthCheckResult::timeout(Duration::from_millis(1)));

        let result = HealthCheckMonitor::run_cycle(&checker, &config(100, 1)).await;
        assert_eq!(result.status, HealthStatus::Timeout);
        assert_eq!(result.attempts, 2);
    }

    #[tokio::test]
    async fn test_monitor_reports_each_cycle() {
        let checker = Arc::new(TcpChecker::new("127.0.0.1:1", Duration::from_millis(100)));
        let sink = Arc::new(RecordingSink::default());

        let mut monitor = HealthCheckMonitor::new(checker, config(50, 0));
        monitor.start(sink.clone());
        assert!(monitor.is_running());

        sleep(Duration::from_millis(300)).await;
        monitor.stop();

        let results = sink.results.lock().unwrap().clone();
        assert!(results.len() >= 2, "expected several cycles, got {:?}", results);
        assert!(results.iter().all(|(status, _)| *status != HealthStatus::Healthy));
        assert_eq!(results[1].1, 2);

        let stats = monitor.get_stats().await;
        assert_eq!(stats.successful_checks, 0);
        assert!(stats.failed_checks >= 2);
    }

    #[tokio::test]
    async fn test_sink_break_stops_monitor() {
        let checker = Arc::new(TcpChecker::new("127.0.0.1:1", Duration::from_millis(100)));
        let sink = Arc::new(RecordingSink {
            stop_after: Some(1),
            ..Default::default()
        });

        let mut monitor = HealthCheckMonitor::new(checker, config(30, 0));
        monitor.start(sink.clone());

        sleep(Duration::from_millis(250)).await;
        assert_eq!(sink.results.lock().unwrap().len(), 1);
        assert!(!monitor.is_running());
    }

    #[tokio::test]
    async fn test_panicking_sink_stops_only_its_monitor() {
        let checker = Arc::new(TcpChecker::new("127.0.0.1:1", Duration::from_millis(100)));

        let healthy_sink = Arc::new(RecordingSink::default());

        let mut broken = HealthCheckMonitor::new(checker.clone(), config(30, 0));
        let mut working = HealthCheckMonitor::new(checker, config(30, 0));
        broken.start(Arc::new(PanickingSink));
        working.start(healthy_sink.clone());

        sleep(Duration::from_millis(250)).await;
        assert!(!broken.is_running());
        assert!(working.is_running());
        assert!(healthy_sink.results.lock().unwrap().len() >= 2);
    }
}
