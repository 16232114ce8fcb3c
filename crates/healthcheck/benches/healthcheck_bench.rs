use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};
use healthcheck::{
    checkers::{HealthChecker, HttpChecker, TcpChecker},
    monitor::HealthCheckMonitor,
    types::{CheckType, HealthCheckConfig},
};
use std::hint::black_box;
use std::sync::Arc;
use std::time::Duration;

fn refused_config(retries: u32) -> HealthCheckConfig {
    HealthCheckConfig {
        target: "127.0.0.1:1".to_string(),
        timeout: Duration::from_millis(100),
        interval: Duration::from_secs(1),
        retries,
        retry_backoff: Duration::from_millis(1),
        check_type: CheckType::Tcp,
    }
}

fn probe_attempt_benchmark(c: &mut Criterion) {
    let mut group = c.benchmark_group("probe_attempt");

    // Failure paths against a port nothing listens on
    let tcp_checker = Arc::new(TcpChecker::new("127.0.0.1:1", Duration::from_millis(100)));
    group.bench_function("tcp_connection_refused", |b| {
        let rt = tokio::runtime::Runtime::new().unwrap();
        b.iter(|| rt.block_on(async { black_box(tcp_checker.check().await) }));
    });

    let http_checker = Arc::new(
        HttpChecker::new(
            "http://127.0.0.1:1/health".to_string(),
            reqwest::Method::GET,
            vec![],
            Duration::from_millis(100),
        )
        .unwrap(),
    );
    group.bench_function("http_connection_error", |b| {
        let rt = tokio::runtime::Runtime::new().unwrap();
        b.iter(|| rt.block_on(async { black_box(http_checker.check().await) }));
    });

    group.finish();
}

fn probe_cycle_benchmark(c: &mut Criterion) {
    let mut group = c.benchmark_group("probe_cycle");
    group.sample_size(20);

    let checker = TcpChecker::new("127.0.0.1:1", Duration::from_millis(100));
    for retries in [0u32, 2].iter() {
        group.bench_with_input(BenchmarkId::from_parameter(retries), retries, |b, &retries| {
            let rt = tokio::runtime::Runtime::new().unwrap();
            let config = refused_config(retries);
            b.iter(|| {
                rt.block_on(async { black_box(HealthCheckMonitor::run_cycle(&checker, &config).await) })
            });
        });
    }

    group.finish();
}

fn concurrent_checks_benchmark(c: &mut Criterion) {
    let mut group = c.benchmark_group("concurrent_checks");
    group.sample_size(10); // Concurrent tests are expensive

    for count in [1, 10, 100].iter() {
        group.bench_with_input(BenchmarkId::from_parameter(count), count, |b, &count| {
            let rt = tokio::runtime::Runtime::new().unwrap();
            b.iter(|| {
                rt.block_on(async move {
                    let mut handles = vec![];

                    for _ in 0..count {
                        let checker = Arc::new(TcpChecker::new("127.0.0.1:1", Duration::from_millis(100)));
                        handles.push(tokio::spawn(async move { checker.check().await }));
                    }

                    for handle in handles {
                        black_box(handle.await.unwrap());
                    }
                })
            });
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    probe_attempt_benchmark,
    probe_cycle_benchmark,
    concurrent_checks_benchmark,
);

criterion_main!(benches);
