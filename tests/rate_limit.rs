mod common;

use common::ManualClock;
use futures::future::join_all;
use quotaguard::rate_limit::store::MemoryStore;
use quotaguard::rate_limit::{RateLimitConfig, RateLimiter, Strategy};
use std::sync::Arc;
use std::time::Duration;

fn limiter(config: RateLimitConfig, clock: ManualClock) -> RateLimiter {
    RateLimiter::new(config, Arc::new(MemoryStore::new())).with_clock(clock)
}

#[tokio::test]
async fn sliding_window_counts_down_then_denies_the_eleventh() {
    common::init_tracing();
    let clock = ManualClock::at(1_700_000_000_000);
    let config = RateLimitConfig::builder()
        .requests_per_minute(10)
        .strategy(Strategy::SlidingWindow)
        .build()
        .unwrap();
    let limiter = limiter(config, clock.clone());

    for expected_remaining in (0..10).rev() {
        let result = limiter.check_rate_limit("user:42", Some("/api/x"), "free", None).await;
        assert!(result.allowed);
        assert_eq!(result.remaining, expected_remaining);
        clock.advance(50);
    }

    let denied = limiter.check_rate_limit("user:42", Some("/api/x"), "free", None).await;
    assert!(!denied.allowed);
    assert_eq!(denied.remaining, 0);
    assert!(denied.retry_after.unwrap() > Duration::ZERO);

    let headers = denied.headers();
    assert_eq!(headers["X-RateLimit-Limit"], "10");
    assert_eq!(headers["X-RateLimit-Remaining"], "0");
    assert!(headers.contains_key("Retry-After"));
}

#[tokio::test]
async fn concurrent_checks_never_exceed_the_quota() {
    for strategy in [Strategy::SlidingWindow, Strategy::SlidingLog, Strategy::FixedWindow] {
        let config = RateLimitConfig::builder()
            .requests_per_minute(10)
            .strategy(strategy)
            .build()
            .unwrap();
        let limiter = Arc::new(limiter(config, ManualClock::at(1_000_000)));

        let tasks = 100;
        let barrier = Arc::new(tokio::sync::Barrier::new(tasks));
        let handles: Vec<_> = (0..tasks)
            .map(|_| {
                let limiter = limiter.clone();
                let barrier = barrier.clone();
                tokio::spawn(async move {
                    barrier.wait().await;
                    limiter.check_rate_limit("hot-key", None, "free", None).await.allowed
                })
            })
            .collect();

        let admitted =
            join_all(handles).await.into_iter().filter(|r| *r.as_ref().unwrap()).count();
        assert_eq!(admitted, 10, "strategy {strategy:?} over- or under-admitted");
    }
}

#[tokio::test]
async fn exhausted_window_recovers_fully_after_it_elapses() {
    let clock = ManualClock::at(0);
    let config = RateLimitConfig::builder().requests_per_minute(5).build().unwrap();
    let limiter = limiter(config, clock.clone());

    for _ in 0..5 {
        assert!(limiter.check_rate_limit("u", None, "free", None).await.allowed);
    }
    assert!(!limiter.check_rate_limit("u", None, "free", None).await.allowed);

    clock.advance(61_000);
    // No permanent lockout: the full limit is available again.
    for _ in 0..5 {
        assert!(limiter.check_rate_limit("u", None, "free", None).await.allowed);
    }
    assert!(!limiter.check_rate_limit("u", None, "free", None).await.allowed);
}

#[tokio::test]
async fn token_bucket_conserves_and_replenishes_tokens() {
    let clock = ManualClock::at(0);
    let config = RateLimitConfig::builder()
        .strategy(Strategy::TokenBucket)
        .bucket_capacity(5.0)
        .refill_rate(2.0)
        .build()
        .unwrap();
    let limiter = limiter(config, clock.clone());

    // Spend one token, then idle for an hour: the balance refills to
    // capacity, not capacity + elapsed * rate.
    assert!(limiter.check_rate_limit("u", None, "free", None).await.allowed);
    clock.advance(3_600_000);
    for _ in 0..5 {
        assert!(limiter.check_rate_limit("u", None, "free", None).await.allowed);
    }
    assert!(!limiter.check_rate_limit("u", None, "free", None).await.allowed);

    // capacity / refill_rate seconds later the bucket is full again.
    clock.advance(2_500);
    for _ in 0..5 {
        assert!(limiter.check_rate_limit("u", None, "free", None).await.allowed);
    }
    assert!(!limiter.check_rate_limit("u", None, "free", None).await.allowed);
}

#[tokio::test]
async fn higher_tier_always_gets_at_least_the_lower_tier_limit() {
    let config = RateLimitConfig::builder()
        .requests_per_minute(7)
        .tier_multiplier("free", 1.0)
        .tier_multiplier("pro", 3.5)
        .tier_multiplier("enterprise", 10.0)
        .build()
        .unwrap();
    let limiter = limiter(config, ManualClock::at(0));

    let free = limiter.check_rate_limit("a", None, "free", None).await.limit;
    let pro = limiter.check_rate_limit("b", None, "pro", None).await.limit;
    let enterprise = limiter.check_rate_limit("c", None, "enterprise", None).await.limit;

    assert_eq!(free, 7);
    assert_eq!(pro, 24); // 7 * 3.5 truncated
    assert_eq!(enterprise, 70);
    assert!(free <= pro && pro <= enterprise);
}

#[tokio::test]
async fn sliding_log_distinguishes_same_millisecond_requests() {
    // All requests land on the same timestamp; the log strategy must still
    // count each one individually.
    let config = RateLimitConfig::builder()
        .requests_per_minute(3)
        .strategy(Strategy::SlidingLog)
        .build()
        .unwrap();
    let limiter = limiter(config, ManualClock::at(42_000));

    for _ in 0..3 {
        assert!(limiter.check_rate_limit("u", None, "free", None).await.allowed);
    }
    assert!(!limiter.check_rate_limit("u", None, "free", None).await.allowed);
}

#[tokio::test]
async fn usage_stats_and_reset_work_end_to_end() {
    let config = RateLimitConfig::builder().requests_per_minute(10).build().unwrap();
    let limiter = limiter(config, ManualClock::at(0));

    for _ in 0..4 {
        assert!(limiter.check_rate_limit("u", Some("/api/x"), "free", None).await.allowed);
    }
    let stats = limiter.get_usage_stats("u", Some("/api/x")).await.unwrap();
    assert_eq!(stats.minute, 4);

    limiter.reset_limits("u", None).await.unwrap();
    let stats = limiter.get_usage_stats("u", Some("/api/x")).await.unwrap();
    assert_eq!(stats.minute, 0);
}
