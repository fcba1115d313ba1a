mod common;

use common::ManualClock;
use quotaguard::{
    BreakerRegistry, CircuitBreaker, CircuitBreakerConfig, CircuitState, GuardError,
    InMemoryBreakerRegistry,
};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq)]
struct DependencyDown;

impl std::fmt::Display for DependencyDown {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "dependency unavailable")
    }
}

impl std::error::Error for DependencyDown {}

#[tokio::test]
async fn breaker_trips_cools_down_and_probes_on_schedule() {
    common::init_tracing();
    let clock = ManualClock::new();
    let breaker = CircuitBreaker::with_thresholds("database", 2, Duration::from_secs(1))
        .unwrap()
        .with_clock(clock.clone());

    // Two failing calls open the circuit.
    for _ in 0..2 {
        let result = breaker.call(|| async { Err::<(), _>(DependencyDown) }).await;
        assert!(result.unwrap_err().is_inner());
    }
    assert_eq!(breaker.state(), CircuitState::Open);

    // 0.5s later: still open, rejected without invoking the operation.
    clock.advance(500);
    let err = breaker.call(|| async { Ok::<_, DependencyDown>(()) }).await.unwrap_err();
    assert!(err.is_circuit_open());
    assert_eq!(err.circuit_name(), Some("database"));
    assert_eq!(err.retry_after(), Some(Duration::from_millis(500)));

    // 1.1s after opening: the next call goes through as a probe and closes
    // the circuit.
    clock.advance(600);
    let probed = breaker.call(|| async { Ok::<_, DependencyDown>("pong") }).await;
    assert_eq!(probed.unwrap(), "pong");
    assert_eq!(breaker.state(), CircuitState::Closed);
}

#[tokio::test]
async fn fallback_bridges_an_open_circuit() {
    let clock = ManualClock::new();
    let breaker = CircuitBreaker::with_thresholds("recommendations", 1, Duration::from_secs(30))
        .unwrap()
        .with_clock(clock.clone());

    let _ = breaker.call(|| async { Err::<Vec<u32>, _>(DependencyDown) }).await;
    assert_eq!(breaker.state(), CircuitState::Open);

    // Callers get the fallback value instead of an error while open.
    let result = breaker
        .call_with_fallback(|| async { Ok::<_, DependencyDown>(vec![1, 2, 3]) }, Vec::new)
        .await;
    assert_eq!(result.unwrap(), Vec::<u32>::new());

    // Once recovered, the real value flows again.
    clock.advance(31_000);
    let result = breaker
        .call_with_fallback(|| async { Ok::<_, DependencyDown>(vec![1, 2, 3]) }, Vec::new)
        .await;
    assert_eq!(result.unwrap(), vec![1, 2, 3]);
}

#[tokio::test]
async fn dependency_error_reaches_the_first_caller_then_gets_replaced() {
    let breaker =
        CircuitBreaker::with_thresholds("external_api", 1, Duration::from_secs(30)).unwrap();

    // The tripping call still surfaces the real error.
    let first = breaker.call(|| async { Err::<(), _>(DependencyDown) }).await.unwrap_err();
    assert!(matches!(first, GuardError::Inner(DependencyDown)));

    // Subsequent callers see the cheap short-circuit signal instead.
    let second = breaker.call(|| async { Err::<(), _>(DependencyDown) }).await.unwrap_err();
    assert!(second.is_circuit_open());
}

#[tokio::test]
async fn registry_shares_one_breaker_per_dependency_across_call_sites() {
    let registry = InMemoryBreakerRegistry::new();
    let config = CircuitBreakerConfig::builder()
        .failure_threshold(2)
        .reset_timeout(Duration::from_secs(30))
        .build()
        .unwrap();

    // Two call sites fetch "database" independently.
    let checkout = registry.get_or_create("database", config.clone());
    let reporting = registry.get_or_create("database", config);

    let _ = checkout.call(|| async { Err::<(), _>(DependencyDown) }).await;
    let _ = reporting.call(|| async { Err::<(), _>(DependencyDown) }).await;

    // Both handles observe the shared trip.
    assert_eq!(checkout.state(), CircuitState::Open);
    assert_eq!(reporting.state(), CircuitState::Open);

    let snapshot = registry.snapshot();
    assert_eq!(snapshot.len(), 1);
    assert_eq!(snapshot[0].0, "database");
    assert_eq!(snapshot[0].1.failed_calls, 2);

    registry.reset("database").unwrap();
    assert_eq!(checkout.state(), CircuitState::Closed);
}
