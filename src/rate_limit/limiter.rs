//! The rate limiter: limit resolution, strategy dispatch, penalties, and
//! fail-open behavior.

use crate::clock::{Clock, WallClock};
use crate::rate_limit::store::{QuotaStore, StoreError};
use crate::rate_limit::{RateLimitConfig, RateLimitResult, Strategy};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

const MINUTE: Duration = Duration::from_secs(60);
const HOUR: Duration = Duration::from_secs(60 * 60);
const DAY: Duration = Duration::from_secs(24 * 60 * 60);

/// Admitted-request counts over the trailing minute/hour/day buckets.
/// Read-only; produced by [`RateLimiter::get_usage_stats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct UsageStats {
    pub minute: u64,
    pub hour: u64,
    pub day: u64,
}

/// Decides admit/reject for `(identifier, endpoint, tier)` under the
/// configured strategy.
///
/// The store is the sole source of truth; every check round-trips to it and
/// nothing is cached in between, so multiple limiter instances (or processes)
/// sharing a store enforce one quota. If the store fails, the limiter fails
/// open: availability wins over strict enforcement during an outage.
#[derive(Debug, Clone)]
pub struct RateLimiter {
    config: RateLimitConfig,
    store: Arc<dyn QuotaStore>,
    clock: Arc<dyn Clock>,
}

impl RateLimiter {
    /// Create a limiter over a shared quota store.
    ///
    /// # Examples
    /// ```
    /// use quotaguard::rate_limit::{RateLimitConfig, RateLimiter, Strategy};
    /// use quotaguard::rate_limit::store::MemoryStore;
    /// use std::sync::Arc;
    ///
    /// # #[tokio::main(flavor = "current_thread")]
    /// # async fn main() {
    /// let config = RateLimitConfig::builder()
    ///     .requests_per_minute(10)
    ///     .strategy(Strategy::SlidingWindow)
    ///     .build()
    ///     .unwrap();
    /// let limiter = RateLimiter::new(config, Arc::new(MemoryStore::new()));
    /// let result = limiter.check_rate_limit("user:42", Some("/api/x"), "free", None).await;
    /// assert!(result.allowed);
    /// # }
    /// ```
    pub fn new(config: RateLimitConfig, store: Arc<dyn QuotaStore>) -> Self {
        Self { config, store, clock: Arc::new(WallClock) }
    }

    /// Override the clock (useful for deterministic tests).
    pub fn with_clock<C: Clock + 'static>(mut self, clock: C) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    /// The immutable configuration this limiter was built with.
    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    /// Check whether a request is permitted.
    ///
    /// `identifier` is any stable string scoping the quota (IP, user id, API
    /// key); `endpoint` selects a per-endpoint override; `tier` selects a
    /// multiplier; `custom_limit` overrides both. Resolution order:
    /// `custom_limit` > endpoint override > base per-minute quota, then the
    /// tier multiplier, truncated to an integer.
    ///
    /// Never fails: a store error is logged and the request is allowed with
    /// an explanatory `reason`.
    pub async fn check_rate_limit(
        &self,
        identifier: &str,
        endpoint: Option<&str>,
        tier: &str,
        custom_limit: Option<u32>,
    ) -> RateLimitResult {
        let limit = self.effective_limit(endpoint, tier, custom_limit);
        // A hung store is handled the same way as an erroring one: the whole
        // check runs under a deadline and expiry fails open.
        let checked = tokio::time::timeout(
            self.config.store_timeout(),
            self.try_check(identifier, endpoint, tier, limit),
        )
        .await
        .unwrap_or_else(|_| Err(StoreError::Timeout(self.config.store_timeout())));
        match checked {
            Ok(result) => result,
            Err(err) => {
                tracing::warn!(
                    identifier,
                    endpoint = endpoint.unwrap_or("_"),
                    error = %err,
                    "quota store unreachable, failing open"
                );
                RateLimitResult {
                    allowed: true,
                    limit,
                    remaining: limit,
                    reset_at: self.unix_secs(self.clock.now_millis()) + MINUTE.as_secs(),
                    retry_after: None,
                    reason: Some("Rate limit check failed, allowing request".to_string()),
                }
            }
        }
    }

    async fn try_check(
        &self,
        identifier: &str,
        endpoint: Option<&str>,
        tier: &str,
        limit: u32,
    ) -> Result<RateLimitResult, StoreError> {
        let now = self.clock.now_millis();
        let base = self.base_key(identifier, endpoint);

        let mut result = match self.config.strategy() {
            Strategy::SlidingWindow | Strategy::SlidingLog => {
                self.check_sliding(&base, limit, now).await?
            }
            Strategy::TokenBucket => self.check_token_bucket(&base, limit, now).await?,
            Strategy::FixedWindow => self.check_fixed_window(&base, limit, now).await?,
        };

        if result.allowed {
            if let Some(capped) = self.enforce_secondary_caps(&base, tier, now).await? {
                result = capped;
            }
        }

        if !result.allowed && self.config.penalties_enabled() {
            self.apply_penalty(identifier, &mut result, now).await?;
        }

        Ok(result)
    }

    async fn check_sliding(
        &self,
        base: &str,
        limit: u32,
        now: u64,
    ) -> Result<RateLimitResult, StoreError> {
        let strategy = self.config.strategy();
        let key = format!("{base}:{}", strategy.key_suffix());
        // The log variant tags entries with a unique id so two requests
        // landing on the same millisecond stay distinguishable.
        let entry_id = match strategy {
            Strategy::SlidingLog => Uuid::new_v4().to_string(),
            _ => now.to_string(),
        };
        let claim = self.store.claim_sliding(&key, MINUTE, limit, now, &entry_id).await?;

        if claim.admitted {
            Ok(RateLimitResult {
                allowed: true,
                limit,
                remaining: limit - claim.count - 1,
                reset_at: self.unix_secs(now) + MINUTE.as_secs(),
                retry_after: None,
                reason: None,
            })
        } else {
            // The window frees one slot when its oldest entry ages out.
            let reopen_at = claim
                .oldest_millis
                .map(|oldest| oldest.saturating_add(millis(MINUTE)))
                .unwrap_or_else(|| now.saturating_add(millis(MINUTE)));
            Ok(RateLimitResult {
                allowed: false,
                limit,
                remaining: 0,
                reset_at: self.unix_secs(reopen_at),
                retry_after: Some(Duration::from_millis(reopen_at.saturating_sub(now))),
                reason: Some("minute quota exhausted".to_string()),
            })
        }
    }

    async fn check_token_bucket(
        &self,
        base: &str,
        limit: u32,
        now: u64,
    ) -> Result<RateLimitResult, StoreError> {
        let key = format!("{base}:{}", Strategy::TokenBucket.key_suffix());
        let capacity = self.config.bucket_capacity();
        let rate = self.config.refill_rate();
        let claim = self.store.claim_token(&key, capacity, rate, now).await?;

        if claim.admitted {
            let until_full = (capacity - claim.tokens) / rate;
            Ok(RateLimitResult {
                allowed: true,
                limit,
                remaining: claim.tokens as u32,
                reset_at: self.unix_secs(now) + until_full.ceil() as u64,
                retry_after: None,
                reason: None,
            })
        } else {
            let wait = Duration::from_secs_f64(((1.0 - claim.tokens) / rate).max(0.0));
            Ok(RateLimitResult {
                allowed: false,
                limit,
                remaining: 0,
                reset_at: self.unix_secs(now) + wait.as_secs().max(1),
                retry_after: Some(wait),
                reason: Some("token bucket empty".to_string()),
            })
        }
    }

    async fn check_fixed_window(
        &self,
        base: &str,
        limit: u32,
        now: u64,
    ) -> Result<RateLimitResult, StoreError> {
        let window_id = now / millis(MINUTE);
        let key = format!("{base}:{}:{window_id}", Strategy::FixedWindow.key_suffix());
        let count = self.store.incr_counter(&key, MINUTE, now).await?;
        let boundary = (window_id + 1) * millis(MINUTE);

        if count <= u64::from(limit) {
            Ok(RateLimitResult {
                allowed: true,
                limit,
                remaining: limit - count as u32,
                reset_at: self.unix_secs(boundary),
                retry_after: None,
                reason: None,
            })
        } else {
            Ok(RateLimitResult {
                allowed: false,
                limit,
                remaining: 0,
                reset_at: self.unix_secs(boundary),
                retry_after: Some(Duration::from_millis(boundary.saturating_sub(now))),
                reason: Some("minute quota exhausted".to_string()),
            })
        }
    }

    /// Track hour/day admitted counts and enforce the optional caps on top of
    /// the primary check. Returns a denial result when a cap is hit.
    async fn enforce_secondary_caps(
        &self,
        base: &str,
        tier: &str,
        now: u64,
    ) -> Result<Option<RateLimitResult>, StoreError> {
        // Only admitted requests reach this point, so the stat counters hold
        // admitted counts under every strategy; hour/day double as cap
        // counters.
        let window_id = now / millis(MINUTE);
        self.store.incr_counter(&format!("{base}:minute:{window_id}"), MINUTE, now).await?;

        for (window, name, cap) in [
            (HOUR, "hour", self.config.requests_per_hour()),
            (DAY, "day", self.config.requests_per_day()),
        ] {
            let window_id = now / millis(window);
            let key = format!("{base}:{name}:{window_id}");
            let count = self.store.incr_counter(&key, window, now).await?;
            if let Some(cap) = cap {
                let cap = self.scale_for_tier(cap, tier);
                if count > u64::from(cap) {
                    let boundary = (window_id + 1) * millis(window);
                    return Ok(Some(RateLimitResult {
                        allowed: false,
                        limit: cap,
                        remaining: 0,
                        reset_at: self.unix_secs(boundary),
                        retry_after: Some(Duration::from_millis(boundary.saturating_sub(now))),
                        reason: Some(format!("{name} quota exhausted")),
                    }));
                }
            }
        }
        Ok(None)
    }

    /// Multiplicative back-off for repeat offenders: level increments at most
    /// once per penalty window, and `retry_after` scales by
    /// `multiplier^(level-1)`.
    async fn apply_penalty(
        &self,
        identifier: &str,
        result: &mut RateLimitResult,
        now: u64,
    ) -> Result<(), StoreError> {
        let key = format!("{}:penalty:{identifier}:level", self.config.key_prefix());
        let level = self.store.bump_penalty(&key, self.config.penalty_duration(), now).await?;
        if level > 1 {
            let factor = self.config.penalty_multiplier().powi(level as i32 - 1);
            if let Some(retry_after) = result.retry_after {
                let scaled = Duration::from_secs_f64(retry_after.as_secs_f64() * factor);
                result.retry_after = Some(scaled);
                result.reset_at = self.unix_secs(now) + scaled.as_secs();
            }
            tracing::debug!(identifier, level, factor, "progressive penalty applied");
        }
        Ok(())
    }

    /// Delete all quota state for an identifier (administrative only).
    /// With an endpoint, only that endpoint's keys are removed; without one,
    /// every endpoint and the identifier's penalty state go too.
    pub async fn reset_limits(
        &self,
        identifier: &str,
        endpoint: Option<&str>,
    ) -> Result<usize, StoreError> {
        let mut removed =
            self.store.remove_prefix(&format!("{}:", self.base_key(identifier, endpoint))).await?;
        if endpoint.is_none() {
            let scoped = format!(
                "{}:{}:{identifier}:",
                self.config.key_prefix(),
                self.config.scope().key_segment()
            );
            removed += self.store.remove_prefix(&scoped).await?;
            removed += self
                .store
                .remove_prefix(&format!("{}:penalty:{identifier}:", self.config.key_prefix()))
                .await?;
        }
        tracing::info!(identifier, endpoint = endpoint.unwrap_or("_"), removed, "limits reset");
        Ok(removed)
    }

    /// Read admitted-request counts for the current minute/hour/day windows
    /// without mutating any state.
    pub async fn get_usage_stats(
        &self,
        identifier: &str,
        endpoint: Option<&str>,
    ) -> Result<UsageStats, StoreError> {
        let now = self.clock.now_millis();
        let base = self.base_key(identifier, endpoint);
        let read = |window: Duration, name: &str| {
            let key = format!("{base}:{name}:{}", now / millis(window));
            async move { self.store.get_counter(&key, now).await }
        };
        Ok(UsageStats {
            minute: read(MINUTE, "minute").await?,
            hour: read(HOUR, "hour").await?,
            day: read(DAY, "day").await?,
        })
    }

    fn effective_limit(&self, endpoint: Option<&str>, tier: &str, custom: Option<u32>) -> u32 {
        let base = custom
            .or_else(|| endpoint.and_then(|e| self.config.endpoint_limit(e)))
            .unwrap_or_else(|| self.config.requests_per_minute());
        self.scale_for_tier(base, tier)
    }

    fn scale_for_tier(&self, base: u32, tier: &str) -> u32 {
        if self.config.tiers_enabled() {
            // A fractional multiplier slows a tier down but never produces a
            // zero limit that would lock it out of a fresh window.
            ((f64::from(base) * self.config.tier_multiplier(tier)) as u32).max(1)
        } else {
            base
        }
    }

    fn base_key(&self, identifier: &str, endpoint: Option<&str>) -> String {
        format!(
            "{}:{}:{identifier}:{}",
            self.config.key_prefix(),
            self.config.scope().key_segment(),
            endpoint.unwrap_or("_")
        )
    }

    fn unix_secs(&self, millis: u64) -> u64 {
        millis / 1000
    }
}

fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}
