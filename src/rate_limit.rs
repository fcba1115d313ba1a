//! Rate limiting primitives.
//!
//! The system is split the same way the storage seam splits in production
//! deployments:
//! - **Configuration**: [`RateLimitConfig`] — immutable quotas, strategy,
//!   scope, tier multipliers, endpoint overrides, penalty settings.
//! - **Logic**: [`RateLimiter`] — resolves the effective limit and dispatches
//!   to the configured strategy.
//! - **Storage**: [`store::QuotaStore`] — the atomic check-and-update
//!   operations, enabling in-memory or distributed backends. Every strategy's
//!   read-decide-write sequence is a single store operation, so two
//!   concurrent checks on the same key can never both slip past a unit quota.
//! - **Middleware**: [`RateLimitLayer`] — tower layer enforcing the limit in
//!   front of a service.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

pub mod limiter;
pub mod middleware;
pub mod store;

pub use limiter::{RateLimiter, UsageStats};
pub use middleware::{RateLimitLayer, RateLimitService, RequestKey};

/// Rate limiting algorithm.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    /// Counter per fixed time bucket; resets at window boundaries.
    FixedWindow,
    /// Trailing window over recorded request timestamps.
    SlidingWindow,
    /// Sliding window with unique per-request entry ids, so concurrent
    /// requests at the same timestamp are distinguishable.
    SlidingLog,
    /// Tokens replenish at a fixed rate up to a capacity; one spent per
    /// admitted request.
    TokenBucket,
}

impl Strategy {
    /// Key suffix separating state written by different strategies.
    pub(crate) fn key_suffix(self) -> &'static str {
        match self {
            Strategy::FixedWindow => "fixed",
            Strategy::SlidingWindow => "sliding",
            Strategy::SlidingLog => "log",
            Strategy::TokenBucket => "bucket",
        }
    }
}

/// What the identifier scopes the quota to.
///
/// The limiter treats the identifier as an opaque string; the scope is
/// recorded in keys (so e.g. IP-scoped and user-scoped quotas never collide)
/// and tells the middleware's key extractor what to pull from a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Scope {
    Global,
    Ip,
    User,
    ApiKey,
    Endpoint,
    /// Identifier combines several dimensions (e.g. user + endpoint).
    Combined,
}

impl Scope {
    pub(crate) fn key_segment(self) -> &'static str {
        match self {
            Scope::Global => "global",
            Scope::Ip => "ip",
            Scope::User => "user",
            Scope::ApiKey => "api_key",
            Scope::Endpoint => "endpoint",
            Scope::Combined => "combined",
        }
    }
}

/// Errors produced when validating rate limit configuration.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RateLimitConfigError {
    #[error("requests_per_minute must be > 0")]
    InvalidMinuteQuota,
    #[error("quota for window '{window}' must be > 0")]
    InvalidWindowQuota { window: &'static str },
    #[error("endpoint limit for '{endpoint}' must be > 0")]
    InvalidEndpointLimit { endpoint: String },
    #[error("tier multiplier for '{tier}' must be > 0 (got {provided})")]
    InvalidTierMultiplier { tier: String, provided: f64 },
    #[error("bucket_capacity must be >= 1 (got {provided})")]
    InvalidBucketCapacity { provided: f64 },
    #[error("refill_rate must be > 0 (got {provided})")]
    InvalidRefillRate { provided: f64 },
    #[error("key_prefix must not be empty")]
    EmptyKeyPrefix,
    #[error("key_ttl must be > 0")]
    InvalidKeyTtl,
    #[error("store_timeout must be > 0")]
    InvalidStoreTimeout,
    #[error("penalty_duration must be > 0 when penalties are enabled")]
    InvalidPenaltyDuration,
    #[error("penalty_multiplier must be >= 1 (got {provided})")]
    InvalidPenaltyMultiplier { provided: f64 },
}

/// Immutable rate limiter configuration. Created once at startup via
/// [`RateLimitConfig::builder`]; read-only thereafter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    requests_per_minute: u32,
    requests_per_hour: Option<u32>,
    requests_per_day: Option<u32>,
    burst_size: u32,
    strategy: Strategy,
    scope: Scope,
    bucket_capacity: Option<f64>,
    refill_rate: Option<f64>,
    endpoint_limits: HashMap<String, u32>,
    tier_multipliers: HashMap<String, f64>,
    key_prefix: String,
    key_ttl: Duration,
    store_timeout: Duration,
    enable_penalties: bool,
    penalty_duration: Duration,
    penalty_multiplier: f64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            requests_per_minute: 60,
            requests_per_hour: None,
            requests_per_day: None,
            burst_size: 10,
            strategy: Strategy::SlidingWindow,
            scope: Scope::Ip,
            bucket_capacity: None,
            refill_rate: None,
            endpoint_limits: HashMap::new(),
            tier_multipliers: HashMap::new(),
            key_prefix: "quotaguard".to_string(),
            key_ttl: Duration::from_secs(24 * 60 * 60),
            store_timeout: Duration::from_secs(1),
            enable_penalties: false,
            penalty_duration: Duration::from_secs(300),
            penalty_multiplier: 2.0,
        }
    }
}

impl RateLimitConfig {
    /// Start building a configuration.
    pub fn builder() -> RateLimitConfigBuilder {
        RateLimitConfigBuilder { config: Self::default() }
    }

    /// Base per-minute quota.
    pub fn requests_per_minute(&self) -> u32 {
        self.requests_per_minute
    }

    /// Optional hourly cap enforced on top of the primary check.
    pub fn requests_per_hour(&self) -> Option<u32> {
        self.requests_per_hour
    }

    /// Optional daily cap enforced on top of the primary check.
    pub fn requests_per_day(&self) -> Option<u32> {
        self.requests_per_day
    }

    /// Burst allowance; the token bucket capacity defaults to this.
    pub fn burst_size(&self) -> u32 {
        self.burst_size
    }

    /// Selected algorithm.
    pub fn strategy(&self) -> Strategy {
        self.strategy
    }

    /// What the identifier scopes the quota to.
    pub fn scope(&self) -> Scope {
        self.scope
    }

    /// Token bucket capacity; falls back to `burst_size` when unset.
    pub fn bucket_capacity(&self) -> f64 {
        self.bucket_capacity.unwrap_or(f64::from(self.burst_size))
    }

    /// Token refill rate per second; falls back to the per-minute quota
    /// spread over a minute.
    pub fn refill_rate(&self) -> f64 {
        self.refill_rate.unwrap_or(f64::from(self.requests_per_minute) / 60.0)
    }

    /// Per-endpoint quota override, if configured.
    pub fn endpoint_limit(&self, endpoint: &str) -> Option<u32> {
        self.endpoint_limits.get(endpoint).copied()
    }

    /// Tier multiplier; unknown tiers get 1.0.
    pub fn tier_multiplier(&self, tier: &str) -> f64 {
        self.tier_multipliers.get(tier).copied().unwrap_or(1.0)
    }

    /// Whether any tier multipliers are configured.
    pub fn tiers_enabled(&self) -> bool {
        !self.tier_multipliers.is_empty()
    }

    /// Prefix for all store keys.
    pub fn key_prefix(&self) -> &str {
        &self.key_prefix
    }

    /// TTL applied to store keys with no natural window expiry.
    pub fn key_ttl(&self) -> Duration {
        self.key_ttl
    }

    /// Deadline for the store round trips of one check; expiry fails open.
    pub fn store_timeout(&self) -> Duration {
        self.store_timeout
    }

    /// Whether progressive penalties are enabled.
    pub fn penalties_enabled(&self) -> bool {
        self.enable_penalties
    }

    /// Lifetime (and debounce window) of a penalty level.
    pub fn penalty_duration(&self) -> Duration {
        self.penalty_duration
    }

    /// Multiplicative back-off factor per penalty level.
    pub fn penalty_multiplier(&self) -> f64 {
        self.penalty_multiplier
    }

    fn validate(&self) -> Result<(), RateLimitConfigError> {
        if self.requests_per_minute == 0 {
            return Err(RateLimitConfigError::InvalidMinuteQuota);
        }
        if self.requests_per_hour == Some(0) {
            return Err(RateLimitConfigError::InvalidWindowQuota { window: "hour" });
        }
        if self.requests_per_day == Some(0) {
            return Err(RateLimitConfigError::InvalidWindowQuota { window: "day" });
        }
        for (endpoint, limit) in &self.endpoint_limits {
            if *limit == 0 {
                return Err(RateLimitConfigError::InvalidEndpointLimit {
                    endpoint: endpoint.clone(),
                });
            }
        }
        for (tier, multiplier) in &self.tier_multipliers {
            if *multiplier <= 0.0 {
                return Err(RateLimitConfigError::InvalidTierMultiplier {
                    tier: tier.clone(),
                    provided: *multiplier,
                });
            }
        }
        if let Some(capacity) = self.bucket_capacity {
            if capacity < 1.0 {
                return Err(RateLimitConfigError::InvalidBucketCapacity { provided: capacity });
            }
        }
        if let Some(rate) = self.refill_rate {
            if rate <= 0.0 {
                return Err(RateLimitConfigError::InvalidRefillRate { provided: rate });
            }
        }
        if self.key_prefix.is_empty() {
            return Err(RateLimitConfigError::EmptyKeyPrefix);
        }
        if self.key_ttl == Duration::ZERO {
            return Err(RateLimitConfigError::InvalidKeyTtl);
        }
        if self.store_timeout == Duration::ZERO {
            return Err(RateLimitConfigError::InvalidStoreTimeout);
        }
        if self.enable_penalties && self.penalty_duration == Duration::ZERO {
            return Err(RateLimitConfigError::InvalidPenaltyDuration);
        }
        if self.penalty_multiplier < 1.0 {
            return Err(RateLimitConfigError::InvalidPenaltyMultiplier {
                provided: self.penalty_multiplier,
            });
        }
        Ok(())
    }
}

/// Builder for [`RateLimitConfig`]; `build` validates eagerly so invalid
/// quotas are rejected before the process accepts traffic.
#[derive(Debug, Clone)]
pub struct RateLimitConfigBuilder {
    config: RateLimitConfig,
}

impl RateLimitConfigBuilder {
    pub fn requests_per_minute(mut self, quota: u32) -> Self {
        self.config.requests_per_minute = quota;
        self
    }

    pub fn requests_per_hour(mut self, quota: u32) -> Self {
        self.config.requests_per_hour = Some(quota);
        self
    }

    pub fn requests_per_day(mut self, quota: u32) -> Self {
        self.config.requests_per_day = Some(quota);
        self
    }

    pub fn burst_size(mut self, size: u32) -> Self {
        self.config.burst_size = size;
        self
    }

    pub fn strategy(mut self, strategy: Strategy) -> Self {
        self.config.strategy = strategy;
        self
    }

    pub fn scope(mut self, scope: Scope) -> Self {
        self.config.scope = scope;
        self
    }

    pub fn bucket_capacity(mut self, capacity: f64) -> Self {
        self.config.bucket_capacity = Some(capacity);
        self
    }

    pub fn refill_rate(mut self, rate: f64) -> Self {
        self.config.refill_rate = Some(rate);
        self
    }

    /// Override the quota for a single endpoint path.
    pub fn endpoint_limit(mut self, endpoint: impl Into<String>, limit: u32) -> Self {
        self.config.endpoint_limits.insert(endpoint.into(), limit);
        self
    }

    /// Set the quota multiplier for a tier name (e.g. free=1.0, enterprise=10.0).
    pub fn tier_multiplier(mut self, tier: impl Into<String>, multiplier: f64) -> Self {
        self.config.tier_multipliers.insert(tier.into(), multiplier);
        self
    }

    pub fn key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.config.key_prefix = prefix.into();
        self
    }

    pub fn key_ttl(mut self, ttl: Duration) -> Self {
        self.config.key_ttl = ttl;
        self
    }

    pub fn store_timeout(mut self, timeout: Duration) -> Self {
        self.config.store_timeout = timeout;
        self
    }

    /// Enable progressive penalties: repeat offenders see exponentially
    /// growing `retry_after`.
    pub fn penalties(mut self, duration: Duration, multiplier: f64) -> Self {
        self.config.enable_penalties = true;
        self.config.penalty_duration = duration;
        self.config.penalty_multiplier = multiplier;
        self
    }

    /// Validate and produce the configuration.
    pub fn build(self) -> Result<RateLimitConfig, RateLimitConfigError> {
        self.config.validate()?;
        Ok(self.config)
    }
}

/// Outcome of one rate limit check. Created fresh per call, never mutated;
/// the middleware layer turns it into response headers and, when denied, a
/// 429.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RateLimitResult {
    /// Whether the request may proceed.
    pub allowed: bool,
    /// Effective limit applied to this check.
    pub limit: u32,
    /// Requests left in the current window after this one.
    pub remaining: u32,
    /// Unix timestamp (seconds) at which the window resets.
    pub reset_at: u64,
    /// How long to wait before retrying; set when denied.
    pub retry_after: Option<Duration>,
    /// Human-readable annotation (denial reason, fail-open notice).
    pub reason: Option<String>,
}

impl RateLimitResult {
    /// Response headers for this decision. Emitted on every response,
    /// allowed or not; `Retry-After` only when denied.
    pub fn headers(&self) -> HashMap<&'static str, String> {
        let mut headers = HashMap::from([
            ("X-RateLimit-Limit", self.limit.to_string()),
            ("X-RateLimit-Remaining", self.remaining.to_string()),
            ("X-RateLimit-Reset", self.reset_at.to_string()),
        ]);
        if let Some(retry_after) = self.retry_after {
            headers.insert("Retry-After", retry_after.as_secs().max(1).to_string());
        }
        headers
    }
}
