use criterion::{black_box, criterion_group, criterion_main, Criterion};
use quotaguard::{CircuitBreaker, CircuitBreakerConfig};
use std::time::Duration;
use tokio::runtime::Runtime;

#[derive(Debug)]
struct BenchError;

impl std::fmt::Display for BenchError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "bench error")
    }
}

impl std::error::Error for BenchError {}

fn closed_path(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let breaker = CircuitBreaker::new("bench", CircuitBreakerConfig::default());

    c.bench_function("call/closed_success", |b| {
        b.to_async(&rt).iter(|| async {
            let value = breaker
                .call(|| async { Ok::<_, BenchError>(black_box(42u64)) })
                .await
                .unwrap();
            black_box(value)
        })
    });
}

fn open_path(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let breaker =
        CircuitBreaker::with_thresholds("bench", 1, Duration::from_secs(3600)).unwrap();
    rt.block_on(async {
        let _ = breaker.call(|| async { Err::<(), _>(BenchError) }).await;
    });

    c.bench_function("call/open_rejection", |b| {
        b.to_async(&rt).iter(|| async {
            let err = breaker
                .call(|| async { Ok::<_, BenchError>(42u64) })
                .await
                .unwrap_err();
            black_box(err.is_circuit_open())
        })
    });
}

fn metrics_snapshot(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let breaker = CircuitBreaker::new("bench", CircuitBreakerConfig::default());
    rt.block_on(async {
        for _ in 0..1000 {
            let _ = breaker.call(|| async { Ok::<_, BenchError>(1u64) }).await;
        }
    });

    c.bench_function("metrics/snapshot", |b| b.iter(|| black_box(breaker.metrics())));
}

criterion_group!(benches, closed_path, open_path, metrics_snapshot);
criterion_main!(benches);
