//! Circuit breaker guarding calls to a downstream dependency.
//!
//! State machine: Closed (normal operation, failures counted) → Open (calls
//! short-circuited until the reset timeout elapses) → HalfOpen (a bounded
//! number of probe calls test recovery) → Closed. State transitions use
//! lock-free atomics; the rolling failure-rate sample sits behind a mutex
//! touched only on call completion.

use crate::clock::{Clock, MonotonicClock};
use crate::error::GuardError;
use serde::Serialize;
use std::collections::VecDeque;
use std::future::Future;
use std::sync::atomic::{AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

const STATE_CLOSED: u8 = 0;
const STATE_OPEN: u8 = 1;
const STATE_HALF_OPEN: u8 = 2;

/// Minimum wait hint for callers rejected while every half-open probe slot
/// is taken; the raw open-timer remainder is ~0 by then.
const HALF_OPEN_RETRY_MILLIS: u64 = 100;

/// Current state of the circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Normal operating mode.
    Closed,
    /// Short-circuits calls until the reset timeout elapses.
    Open,
    /// Probe mode allowing a limited number of calls to test recovery.
    HalfOpen,
}

impl CircuitState {
    fn to_u8(self) -> u8 {
        match self {
            CircuitState::Closed => STATE_CLOSED,
            CircuitState::Open => STATE_OPEN,
            CircuitState::HalfOpen => STATE_HALF_OPEN,
        }
    }

    fn from_u8(v: u8) -> CircuitState {
        match v {
            STATE_OPEN => CircuitState::Open,
            STATE_HALF_OPEN => CircuitState::HalfOpen,
            _ => CircuitState::Closed,
        }
    }
}

/// Decides whether an error counts against the breaker.
///
/// The Rust-native replacement for expected/excluded exception lists: return
/// `true` when the error indicates the dependency is unhealthy (network
/// failure, 5xx), `false` for caller-side errors (validation, 4xx) that say
/// nothing about the dependency.
pub type FailureClassifier = Arc<dyn Fn(&(dyn std::error::Error + 'static)) -> bool + Send + Sync>;

/// Errors produced when validating breaker configuration.
#[derive(Debug, Clone, PartialEq)]
pub enum BreakerConfigError {
    /// Failure threshold must be > 0.
    InvalidFailureThreshold {
        /// Value provided by caller.
        provided: usize,
    },
    /// Reset timeout must be > 0 unless breaker disabled.
    InvalidResetTimeout(Duration),
    /// Success threshold must be > 0.
    InvalidSuccessThreshold {
        /// Value provided by caller.
        provided: usize,
    },
    /// Half-open probe limit must be > 0.
    InvalidHalfOpenLimit {
        /// Value provided by caller.
        provided: usize,
    },
    /// Failure-rate threshold must be within (0, 1].
    InvalidFailureRate {
        /// Value provided by caller.
        provided: f64,
    },
    /// Rolling sample size must be > 0.
    InvalidSampleSize {
        /// Value provided by caller.
        provided: usize,
    },
    /// Per-call timeout must be > 0 when set.
    InvalidCallTimeout(Duration),
}

impl std::fmt::Display for BreakerConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BreakerConfigError::InvalidFailureThreshold { provided } => {
                write!(f, "failure_threshold must be > 0 (got {})", provided)
            }
            BreakerConfigError::InvalidResetTimeout(timeout) => write!(
                f,
                "reset_timeout must be > 0 unless breaker is disabled (got {:?})",
                timeout
            ),
            BreakerConfigError::InvalidSuccessThreshold { provided } => {
                write!(f, "success_threshold must be > 0 (got {})", provided)
            }
            BreakerConfigError::InvalidHalfOpenLimit { provided } => {
                write!(f, "half_open_max_calls must be > 0 (got {})", provided)
            }
            BreakerConfigError::InvalidFailureRate { provided } => {
                write!(f, "failure_rate_threshold must be within (0, 1] (got {})", provided)
            }
            BreakerConfigError::InvalidSampleSize { provided } => {
                write!(f, "sample_size must be > 0 (got {})", provided)
            }
            BreakerConfigError::InvalidCallTimeout(timeout) => {
                write!(f, "call_timeout must be > 0 when set (got {:?})", timeout)
            }
        }
    }
}

impl std::error::Error for BreakerConfigError {}

/// Validated configuration for the circuit breaker.
#[derive(Clone)]
pub struct CircuitBreakerConfig {
    failure_threshold: usize,
    failure_rate_threshold: Option<f64>,
    sample_size: usize,
    reset_timeout: Duration,
    call_timeout: Option<Duration>,
    success_threshold: usize,
    half_open_max_calls: usize,
    classifier: Option<FailureClassifier>,
}

impl std::fmt::Debug for CircuitBreakerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreakerConfig")
            .field("failure_threshold", &self.failure_threshold)
            .field("failure_rate_threshold", &self.failure_rate_threshold)
            .field("sample_size", &self.sample_size)
            .field("reset_timeout", &self.reset_timeout)
            .field("call_timeout", &self.call_timeout)
            .field("success_threshold", &self.success_threshold)
            .field("half_open_max_calls", &self.half_open_max_calls)
            .field("classifier", &self.classifier.as_ref().map(|_| "<fn>"))
            .finish()
    }
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            failure_rate_threshold: None,
            sample_size: 100,
            reset_timeout: Duration::from_secs(30),
            call_timeout: None,
            success_threshold: 1,
            half_open_max_calls: 1,
            classifier: None,
        }
    }
}

impl CircuitBreakerConfig {
    /// Start building a configuration.
    pub fn builder() -> CircuitBreakerConfigBuilder {
        CircuitBreakerConfigBuilder { config: Self::default() }
    }

    /// Creates a disabled circuit breaker config that never opens.
    /// Uses `usize::MAX` thresholds and `Duration::MAX` timeout to effectively
    /// disable all circuit breaking logic.
    pub fn disabled() -> Self {
        Self {
            failure_threshold: usize::MAX,
            reset_timeout: Duration::MAX,
            half_open_max_calls: usize::MAX,
            ..Self::default()
        }
    }

    /// Threshold of consecutive failures before opening from Closed.
    pub fn failure_threshold(&self) -> usize {
        self.failure_threshold
    }

    /// Failure fraction over the rolling sample that opens the circuit.
    pub fn failure_rate_threshold(&self) -> Option<f64> {
        self.failure_rate_threshold
    }

    /// Size of the rolling outcome sample.
    pub fn sample_size(&self) -> usize {
        self.sample_size
    }

    /// Duration to stay Open before Half-Open probes.
    pub fn reset_timeout(&self) -> Duration {
        self.reset_timeout
    }

    /// Per-call deadline, if any.
    pub fn call_timeout(&self) -> Option<Duration> {
        self.call_timeout
    }

    /// Consecutive half-open successes required to close.
    pub fn success_threshold(&self) -> usize {
        self.success_threshold
    }

    /// Maximum concurrent calls while Half-Open.
    pub fn half_open_max_calls(&self) -> usize {
        self.half_open_max_calls
    }

    fn validate(&self) -> Result<(), BreakerConfigError> {
        if self.failure_threshold == 0 {
            return Err(BreakerConfigError::InvalidFailureThreshold { provided: 0 });
        }
        if self.success_threshold == 0 {
            return Err(BreakerConfigError::InvalidSuccessThreshold { provided: 0 });
        }
        if self.half_open_max_calls == 0 {
            return Err(BreakerConfigError::InvalidHalfOpenLimit { provided: 0 });
        }
        if let Some(rate) = self.failure_rate_threshold {
            if !(rate > 0.0 && rate <= 1.0) {
                return Err(BreakerConfigError::InvalidFailureRate { provided: rate });
            }
        }
        if self.sample_size == 0 {
            return Err(BreakerConfigError::InvalidSampleSize { provided: 0 });
        }
        if let Some(timeout) = self.call_timeout {
            if timeout == Duration::ZERO {
                return Err(BreakerConfigError::InvalidCallTimeout(timeout));
            }
        }
        let disabled = self.failure_threshold == usize::MAX;
        if self.reset_timeout == Duration::ZERO && !disabled {
            return Err(BreakerConfigError::InvalidResetTimeout(self.reset_timeout));
        }
        Ok(())
    }
}

/// Builder for [`CircuitBreakerConfig`]; `build` validates eagerly so an
/// invalid configuration is rejected before the process accepts traffic.
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfigBuilder {
    config: CircuitBreakerConfig,
}

impl CircuitBreakerConfigBuilder {
    /// Consecutive qualifying failures that open the circuit.
    pub fn failure_threshold(mut self, threshold: usize) -> Self {
        self.config.failure_threshold = threshold;
        self
    }

    /// Open when failures/total over the rolling sample reaches `rate`.
    /// The sample must hold at least `sample_size / 2` outcomes before the
    /// rate is evaluated, so a single early failure cannot trip the breaker.
    pub fn failure_rate_threshold(mut self, rate: f64) -> Self {
        self.config.failure_rate_threshold = Some(rate);
        self
    }

    /// Size of the fixed rolling sample used for rate-based tripping.
    pub fn sample_size(mut self, size: usize) -> Self {
        self.config.sample_size = size;
        self
    }

    /// Duration to stay Open before allowing half-open probes.
    pub fn reset_timeout(mut self, timeout: Duration) -> Self {
        self.config.reset_timeout = timeout;
        self
    }

    /// Deadline applied around every guarded call; expiry counts as a failure.
    pub fn call_timeout(mut self, timeout: Duration) -> Self {
        self.config.call_timeout = Some(timeout);
        self
    }

    /// Consecutive half-open successes required before closing.
    pub fn success_threshold(mut self, threshold: usize) -> Self {
        self.config.success_threshold = threshold;
        self
    }

    /// Maximum concurrent probe calls while half-open.
    pub fn half_open_max_calls(mut self, limit: usize) -> Self {
        self.config.half_open_max_calls = limit;
        self
    }

    /// Install a failure classifier; errors it rejects neither trip nor heal
    /// the breaker.
    pub fn failure_classifier<F>(mut self, classifier: F) -> Self
    where
        F: Fn(&(dyn std::error::Error + 'static)) -> bool + Send + Sync + 'static,
    {
        self.config.classifier = Some(Arc::new(classifier));
        self
    }

    /// Validate and produce the configuration.
    pub fn build(self) -> Result<CircuitBreakerConfig, BreakerConfigError> {
        self.config.validate()?;
        Ok(self.config)
    }
}

/// Point-in-time metrics snapshot for one breaker.
///
/// Counters accumulate for the breaker's lifetime; only an administrative
/// [`CircuitBreaker::reset`] clears them.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CircuitMetrics {
    pub state: CircuitState,
    pub total_calls: u64,
    pub successful_calls: u64,
    pub failed_calls: u64,
    pub rejected_calls: u64,
    pub failure_rate: f64,
}

#[derive(Debug, Default)]
struct OutcomeRing {
    outcomes: VecDeque<bool>,
    failures: usize,
}

impl OutcomeRing {
    fn record(&mut self, failed: bool, capacity: usize) {
        if self.outcomes.len() == capacity {
            if let Some(evicted) = self.outcomes.pop_front() {
                if evicted {
                    self.failures -= 1;
                }
            }
        }
        self.outcomes.push_back(failed);
        if failed {
            self.failures += 1;
        }
    }

    fn failure_fraction(&self, min_observations: usize) -> Option<f64> {
        if self.outcomes.len() < min_observations.max(1) {
            return None;
        }
        Some(self.failures as f64 / self.outcomes.len() as f64)
    }

    fn clear(&mut self) {
        self.outcomes.clear();
        self.failures = 0;
    }
}

#[derive(Debug)]
struct BreakerShared {
    state: AtomicU8,
    consecutive_failures: AtomicUsize,
    half_open_successes: AtomicUsize,
    opened_at_millis: AtomicU64,
    half_open_calls: AtomicUsize,
    total_calls: AtomicU64,
    successful_calls: AtomicU64,
    failed_calls: AtomicU64,
    rejected_calls: AtomicU64,
    ring: Mutex<OutcomeRing>,
}

impl BreakerShared {
    fn new() -> Self {
        Self {
            state: AtomicU8::new(CircuitState::Closed.to_u8()),
            consecutive_failures: AtomicUsize::new(0),
            half_open_successes: AtomicUsize::new(0),
            opened_at_millis: AtomicU64::new(0),
            half_open_calls: AtomicUsize::new(0),
            total_calls: AtomicU64::new(0),
            successful_calls: AtomicU64::new(0),
            failed_calls: AtomicU64::new(0),
            rejected_calls: AtomicU64::new(0),
            ring: Mutex::new(OutcomeRing::default()),
        }
    }
}

/// Named circuit breaker guarding an async operation.
///
/// Clones share the same underlying state via `Arc`, so all handles observe
/// and affect the same circuit lifecycle; the registry hands out clones of a
/// single instance per logical dependency.
#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    name: Arc<str>,
    shared: Arc<BreakerShared>,
    config: CircuitBreakerConfig,
    clock: Arc<dyn Clock>,
}

impl CircuitBreaker {
    /// Create a breaker from a validated config.
    ///
    /// # Examples
    /// ```
    /// use quotaguard::{CircuitBreaker, CircuitBreakerConfig};
    /// use std::time::Duration;
    /// let config = CircuitBreakerConfig::builder()
    ///     .failure_threshold(5)
    ///     .reset_timeout(Duration::from_secs(30))
    ///     .build()
    ///     .unwrap();
    /// let breaker = CircuitBreaker::new("database", config);
    /// ```
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: Arc::from(name.into()),
            shared: Arc::new(BreakerShared::new()),
            config,
            clock: Arc::new(MonotonicClock::default()),
        }
    }

    /// Shorthand for the common threshold/timeout pair, validating both.
    pub fn with_thresholds(
        name: impl Into<String>,
        failure_threshold: usize,
        reset_timeout: Duration,
    ) -> Result<Self, BreakerConfigError> {
        let config = CircuitBreakerConfig::builder()
            .failure_threshold(failure_threshold)
            .reset_timeout(reset_timeout)
            .build()?;
        Ok(Self::new(name, config))
    }

    /// Override the clock (useful for deterministic tests).
    pub fn with_clock<C: Clock + 'static>(mut self, clock: C) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    /// Logical dependency name this breaker guards.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current breaker state.
    pub fn state(&self) -> CircuitState {
        CircuitState::from_u8(self.shared.state.load(Ordering::Acquire))
    }

    /// Snapshot of lifetime metrics.
    pub fn metrics(&self) -> CircuitMetrics {
        let total = self.shared.total_calls.load(Ordering::Acquire);
        let failed = self.shared.failed_calls.load(Ordering::Acquire);
        CircuitMetrics {
            state: self.state(),
            total_calls: total,
            successful_calls: self.shared.successful_calls.load(Ordering::Acquire),
            failed_calls: failed,
            rejected_calls: self.shared.rejected_calls.load(Ordering::Acquire),
            failure_rate: if total == 0 { 0.0 } else { failed as f64 / total as f64 },
        }
    }

    /// Administrative reset: back to Closed with all counters and metrics
    /// cleared.
    pub fn reset(&self) {
        self.shared.state.store(CircuitState::Closed.to_u8(), Ordering::Release);
        self.shared.consecutive_failures.store(0, Ordering::Release);
        self.shared.half_open_successes.store(0, Ordering::Release);
        self.shared.opened_at_millis.store(0, Ordering::Release);
        self.shared.half_open_calls.store(0, Ordering::Release);
        self.shared.total_calls.store(0, Ordering::Release);
        self.shared.successful_calls.store(0, Ordering::Release);
        self.shared.failed_calls.store(0, Ordering::Release);
        self.shared.rejected_calls.store(0, Ordering::Release);
        self.ring_lock().clear();
        tracing::info!(circuit = %self.name, "circuit breaker reset → closed");
    }

    /// Executes the provided async operation under circuit breaker protection.
    ///
    /// # Behavior
    /// - **Closed**: Executes the operation, under `call_timeout` when
    ///   configured. Qualifying failures increment the failure count and feed
    ///   the rolling sample; either threshold crossing opens the circuit.
    /// - **Open**: Rejects calls with `GuardError::CircuitOpen` until
    ///   `reset_timeout` elapses, then admits probes.
    /// - **HalfOpen**: Allows up to `half_open_max_calls` concurrent probes.
    ///   `success_threshold` consecutive successes close the circuit; any
    ///   failure reopens it.
    ///
    /// Dropping the returned future mid-flight releases the probe slot and
    /// records nothing: caller cancellation is not a dependency failure.
    ///
    /// # Errors
    /// Returns `GuardError::CircuitOpen` if the circuit rejects the call,
    /// `GuardError::Timeout` if the deadline expires, and `GuardError::Inner`
    /// if the operation itself fails.
    pub async fn call<T, E, Fut, Op>(&self, operation: Op) -> Result<T, GuardError<E>>
    where
        T: Send,
        E: std::error::Error + Send + Sync + 'static,
        Fut: Future<Output = Result<T, E>> + Send,
        Op: FnOnce() -> Fut + Send,
    {
        struct HalfOpenGuard<'a> {
            shared: &'a BreakerShared,
            did_increment: bool,
        }
        impl Drop for HalfOpenGuard<'_> {
            fn drop(&mut self) {
                if self.did_increment {
                    self.shared.half_open_calls.fetch_sub(1, Ordering::Release);
                }
            }
        }
        let mut guard: Option<HalfOpenGuard<'_>> = None;

        loop {
            match self.state() {
                CircuitState::Open => {
                    let opened_at = self.shared.opened_at_millis.load(Ordering::Acquire);
                    let now = self.clock.now_millis();
                    let elapsed = now.saturating_sub(opened_at);
                    let reset_millis = duration_to_millis(self.config.reset_timeout);

                    if elapsed >= reset_millis {
                        // Try transition to half-open
                        match self.shared.state.compare_exchange(
                            STATE_OPEN,
                            STATE_HALF_OPEN,
                            Ordering::AcqRel,
                            Ordering::Acquire,
                        ) {
                            Ok(_) => {
                                // We won the race - we're the first probe
                                tracing::info!(circuit = %self.name, "circuit breaker → half-open");
                                self.shared.half_open_calls.store(1, Ordering::Release);
                                self.shared.half_open_successes.store(0, Ordering::Release);
                                guard = Some(HalfOpenGuard {
                                    shared: &self.shared,
                                    did_increment: true,
                                });
                                break;
                            }
                            // Someone else moved the state; re-evaluate
                            Err(STATE_HALF_OPEN) => continue,
                            Err(_) => break,
                        }
                    } else {
                        return Err(self.reject(reset_millis.saturating_sub(elapsed)));
                    }
                }
                CircuitState::HalfOpen => {
                    // Limit concurrent probe requests
                    let current = self.shared.half_open_calls.fetch_add(1, Ordering::AcqRel);
                    if current >= self.config.half_open_max_calls {
                        self.shared.half_open_calls.fetch_sub(1, Ordering::Release);
                        let opened_at = self.shared.opened_at_millis.load(Ordering::Acquire);
                        let elapsed = self.clock.now_millis().saturating_sub(opened_at);
                        let reset_millis = duration_to_millis(self.config.reset_timeout);
                        let wait =
                            reset_millis.saturating_sub(elapsed).max(HALF_OPEN_RETRY_MILLIS);
                        return Err(self.reject(wait));
                    }
                    guard = Some(HalfOpenGuard { shared: &self.shared, did_increment: true });
                    tracing::debug!(
                        circuit = %self.name,
                        in_flight = current + 1,
                        max = self.config.half_open_max_calls,
                        "circuit breaker: half-open probe"
                    );
                    break;
                }
                CircuitState::Closed => break,
            }
        }

        self.shared.total_calls.fetch_add(1, Ordering::AcqRel);

        let result = match self.config.call_timeout {
            Some(limit) => {
                let start = Instant::now();
                match tokio::time::timeout(limit, operation()).await {
                    Ok(inner) => inner.map_err(GuardError::Inner),
                    Err(_) => Err(GuardError::Timeout { elapsed: start.elapsed(), timeout: limit }),
                }
            }
            None => operation().await.map_err(GuardError::Inner),
        };
        drop(guard);

        match &result {
            Ok(_) => self.on_success(),
            Err(GuardError::Timeout { .. }) => self.on_failure(),
            Err(GuardError::Inner(e)) => {
                if self.counts_as_failure(e) {
                    self.on_failure();
                }
                // Non-qualifying errors say nothing about the dependency:
                // they neither trip nor heal the breaker.
            }
            Err(_) => {}
        }

        result
    }

    /// Like [`call`](Self::call), but an open-circuit rejection yields
    /// `fallback()` instead of an error, so callers need not special-case
    /// open-circuit behavior.
    pub async fn call_with_fallback<T, E, Fut, Op, Fb>(
        &self,
        operation: Op,
        fallback: Fb,
    ) -> Result<T, GuardError<E>>
    where
        T: Send,
        E: std::error::Error + Send + Sync + 'static,
        Fut: Future<Output = Result<T, E>> + Send,
        Op: FnOnce() -> Fut + Send,
        Fb: FnOnce() -> T + Send,
    {
        match self.call(operation).await {
            Err(err) if err.is_circuit_open() => {
                tracing::debug!(circuit = %self.name, "circuit open, serving fallback");
                Ok(fallback())
            }
            other => other,
        }
    }

    fn reject<E>(&self, wait_millis: u64) -> GuardError<E> {
        self.shared.rejected_calls.fetch_add(1, Ordering::AcqRel);
        GuardError::CircuitOpen {
            circuit: self.name.to_string(),
            failure_count: self.shared.consecutive_failures.load(Ordering::Acquire) as u64,
            retry_after: Duration::from_millis(wait_millis),
        }
    }

    fn counts_as_failure<E>(&self, error: &E) -> bool
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        match &self.config.classifier {
            Some(classifier) => classifier(error),
            None => true,
        }
    }

    fn on_success(&self) {
        self.shared.successful_calls.fetch_add(1, Ordering::AcqRel);

        match self.state() {
            CircuitState::HalfOpen => {
                let successes = self.shared.half_open_successes.fetch_add(1, Ordering::AcqRel) + 1;
                if successes >= self.config.success_threshold
                    && self
                        .shared
                        .state
                        .compare_exchange(
                            STATE_HALF_OPEN,
                            STATE_CLOSED,
                            Ordering::AcqRel,
                            Ordering::Acquire,
                        )
                        .is_ok()
                {
                    self.shared.half_open_calls.store(0, Ordering::Release);
                    self.shared.half_open_successes.store(0, Ordering::Release);
                    self.shared.consecutive_failures.store(0, Ordering::Release);
                    self.shared.opened_at_millis.store(0, Ordering::Release);
                    self.ring_lock().clear();
                    tracing::info!(circuit = %self.name, "circuit breaker → closed");
                }
            }
            CircuitState::Closed => {
                // Any success resets the streak: only consecutive failures
                // trip the absolute threshold.
                self.shared.consecutive_failures.store(0, Ordering::Release);
                self.record_outcome(false);
            }
            CircuitState::Open => {}
        }
    }

    fn on_failure(&self) {
        self.shared.failed_calls.fetch_add(1, Ordering::AcqRel);
        let failures = self.shared.consecutive_failures.fetch_add(1, Ordering::AcqRel) + 1;

        match self.state() {
            CircuitState::HalfOpen => {
                if self
                    .shared
                    .state
                    .compare_exchange(
                        STATE_HALF_OPEN,
                        STATE_OPEN,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    )
                    .is_ok()
                {
                    self.shared.half_open_calls.store(0, Ordering::Release);
                    self.shared.half_open_successes.store(0, Ordering::Release);
                    self.shared.opened_at_millis.store(self.clock.now_millis(), Ordering::Release);
                    tracing::warn!(circuit = %self.name, failures, "circuit breaker: probe failed → open");
                }
            }
            CircuitState::Closed => {
                let rate_tripped = self.record_outcome(true);
                if (failures >= self.config.failure_threshold || rate_tripped)
                    && self
                        .shared
                        .state
                        .compare_exchange(
                            STATE_CLOSED,
                            STATE_OPEN,
                            Ordering::AcqRel,
                            Ordering::Acquire,
                        )
                        .is_ok()
                {
                    self.shared.half_open_calls.store(0, Ordering::Release);
                    self.shared.opened_at_millis.store(self.clock.now_millis(), Ordering::Release);
                    tracing::error!(
                        circuit = %self.name,
                        failures,
                        threshold = self.config.failure_threshold,
                        rate_tripped,
                        "circuit breaker → open"
                    );
                }
            }
            CircuitState::Open => {}
        }
    }

    /// Record an outcome in the rolling sample; returns whether the failure
    /// fraction crossed the configured rate threshold.
    fn record_outcome(&self, failed: bool) -> bool {
        let Some(threshold) = self.config.failure_rate_threshold else {
            return false;
        };
        let mut ring = self.ring_lock();
        ring.record(failed, self.config.sample_size);
        ring.failure_fraction(self.config.sample_size / 2).is_some_and(|rate| rate >= threshold)
    }

    fn ring_lock(&self) -> std::sync::MutexGuard<'_, OutcomeRing> {
        // The ring holds plain counters; a poisoned lock cannot leave them in
        // a state worse than a missed sample.
        self.shared.ring.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn duration_to_millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}
