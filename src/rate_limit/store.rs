//! Storage seam for rate limit state.
//!
//! [`QuotaStore`] exposes the whole read-decide-write sequence of each
//! strategy as one operation, mirroring what a server-side script would do on
//! a distributed store. The store is the sole source of truth for quota
//! state; the limiter never caches counts across calls.

use async_trait::async_trait;
use dashmap::DashMap;
use std::time::Duration;

/// Failure talking to the quota store. The limiter recovers from these
/// locally by failing open; they never reach the caller.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("quota store unavailable: {0}")]
    Unavailable(String),
    #[error("quota store operation timed out after {0:?}")]
    Timeout(Duration),
}

/// Outcome of a sliding window/log claim.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlidingClaim {
    /// Whether the entry was appended (request admitted).
    pub admitted: bool,
    /// Entries inside the window after eviction, excluding the new one.
    pub count: u32,
    /// Timestamp of the oldest surviving entry; lets a denied caller compute
    /// when the window frees up one slot.
    pub oldest_millis: Option<u64>,
}

/// Outcome of a token bucket claim.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TokenClaim {
    /// Whether a token was deducted (request admitted).
    pub admitted: bool,
    /// Token balance after refill (and deduction when admitted).
    pub tokens: f64,
}

/// Atomic check-and-update operations backing the rate limiter.
///
/// Each method must be indivisible with respect to other concurrent calls on
/// the same key; calls on different keys must not serialize against each
/// other.
#[async_trait]
pub trait QuotaStore: Send + Sync + std::fmt::Debug {
    /// Sliding window/log: evict entries older than `now - window`, count the
    /// survivors, and append `entry_id` iff the count is below `limit`.
    async fn claim_sliding(
        &self,
        key: &str,
        window: Duration,
        limit: u32,
        now_millis: u64,
        entry_id: &str,
    ) -> Result<SlidingClaim, StoreError>;

    /// Fixed window: increment the counter under `key`, stamping an expiry of
    /// `ttl` on first write. Returns the count after the increment.
    async fn incr_counter(
        &self,
        key: &str,
        ttl: Duration,
        now_millis: u64,
    ) -> Result<u64, StoreError>;

    /// Read a fixed-window counter without mutating it; 0 when missing or
    /// expired.
    async fn get_counter(&self, key: &str, now_millis: u64) -> Result<u64, StoreError>;

    /// Token bucket: refill from `last_refill` at `refill_rate` tokens/sec
    /// capped at `capacity`, then deduct one token iff available.
    async fn claim_token(
        &self,
        key: &str,
        capacity: f64,
        refill_rate: f64,
        now_millis: u64,
    ) -> Result<TokenClaim, StoreError>;

    /// Bump the penalty level under `key`, at most once per `window`
    /// (debounced), refreshing its expiry on every call. Returns the level.
    async fn bump_penalty(
        &self,
        key: &str,
        window: Duration,
        now_millis: u64,
    ) -> Result<u32, StoreError>;

    /// Administrative reset: delete every key starting with `prefix`.
    /// Returns the number of keys removed.
    async fn remove_prefix(&self, prefix: &str) -> Result<usize, StoreError>;
}

#[derive(Debug, Clone)]
struct SlidingEntry {
    at_millis: u64,
    #[allow(dead_code)] // retained for parity with external stores' member payloads
    id: String,
}

#[derive(Debug, Clone)]
enum Slot {
    Entries(Vec<SlidingEntry>),
    Counter { count: u64, expires_at: u64 },
    Bucket { tokens: f64, last_refill_millis: u64 },
    Penalty { level: u32, expires_at: u64, last_bump_millis: u64 },
}

/// Sharded in-memory [`QuotaStore`].
///
/// Each operation runs under the dashmap shard lock for its key, making the
/// read-decide-write sequence indivisible per key while leaving other keys
/// untouched. Expired state is evicted lazily on access.
#[derive(Debug, Default, Clone)]
pub struct MemoryStore {
    slots: DashMap<String, Slot>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live slots, for tests and introspection.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

#[async_trait]
impl QuotaStore for MemoryStore {
    async fn claim_sliding(
        &self,
        key: &str,
        window: Duration,
        limit: u32,
        now_millis: u64,
        entry_id: &str,
    ) -> Result<SlidingClaim, StoreError> {
        let window_millis = u64::try_from(window.as_millis()).unwrap_or(u64::MAX);
        let cutoff = now_millis.saturating_sub(window_millis);

        let mut slot = self
            .slots
            .entry(key.to_string())
            .or_insert_with(|| Slot::Entries(Vec::new()));
        let entries = match &mut *slot {
            Slot::Entries(entries) => entries,
            other => {
                *other = Slot::Entries(Vec::new());
                match other {
                    Slot::Entries(entries) => entries,
                    _ => unreachable!(),
                }
            }
        };

        entries.retain(|e| e.at_millis >= cutoff);
        let count = u32::try_from(entries.len()).unwrap_or(u32::MAX);
        let oldest_millis = entries.first().map(|e| e.at_millis);
        let admitted = count < limit;
        if admitted {
            entries.push(SlidingEntry { at_millis: now_millis, id: entry_id.to_string() });
        }

        Ok(SlidingClaim { admitted, count, oldest_millis })
    }

    async fn incr_counter(
        &self,
        key: &str,
        ttl: Duration,
        now_millis: u64,
    ) -> Result<u64, StoreError> {
        let ttl_millis = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX);
        let fresh = || Slot::Counter { count: 0, expires_at: now_millis.saturating_add(ttl_millis) };

        let mut slot = self.slots.entry(key.to_string()).or_insert_with(fresh);
        match &mut *slot {
            Slot::Counter { count, expires_at } if now_millis < *expires_at => {
                *count += 1;
                Ok(*count)
            }
            other => {
                *other = fresh();
                if let Slot::Counter { count, .. } = other {
                    *count = 1;
                }
                Ok(1)
            }
        }
    }

    async fn get_counter(&self, key: &str, now_millis: u64) -> Result<u64, StoreError> {
        Ok(match self.slots.get(key).as_deref() {
            Some(Slot::Counter { count, expires_at }) if now_millis < *expires_at => *count,
            _ => 0,
        })
    }

    async fn claim_token(
        &self,
        key: &str,
        capacity: f64,
        refill_rate: f64,
        now_millis: u64,
    ) -> Result<TokenClaim, StoreError> {
        let mut slot = self
            .slots
            .entry(key.to_string())
            .or_insert_with(|| Slot::Bucket { tokens: capacity, last_refill_millis: now_millis });
        let (tokens, last_refill) = match &mut *slot {
            Slot::Bucket { tokens, last_refill_millis } => (tokens, last_refill_millis),
            other => {
                *other = Slot::Bucket { tokens: capacity, last_refill_millis: now_millis };
                match other {
                    Slot::Bucket { tokens, last_refill_millis } => (tokens, last_refill_millis),
                    _ => unreachable!(),
                }
            }
        };

        let elapsed_secs = now_millis.saturating_sub(*last_refill) as f64 / 1000.0;
        let refilled = (*tokens + elapsed_secs * refill_rate).min(capacity);
        *last_refill = now_millis;

        if refilled >= 1.0 {
            *tokens = refilled - 1.0;
            Ok(TokenClaim { admitted: true, tokens: *tokens })
        } else {
            *tokens = refilled;
            Ok(TokenClaim { admitted: false, tokens: refilled })
        }
    }

    async fn bump_penalty(
        &self,
        key: &str,
        window: Duration,
        now_millis: u64,
    ) -> Result<u32, StoreError> {
        let window_millis = u64::try_from(window.as_millis()).unwrap_or(u64::MAX);
        let expires_at = now_millis.saturating_add(window_millis);
        let fresh = || Slot::Penalty { level: 1, expires_at, last_bump_millis: now_millis };

        let mut slot = self.slots.entry(key.to_string()).or_insert_with(fresh);
        match &mut *slot {
            Slot::Penalty { level, expires_at: exp, last_bump_millis }
                if now_millis < *exp =>
            {
                // Sliding expiry; the level itself moves at most once per
                // window so a single burst cannot stack levels.
                *exp = expires_at;
                if now_millis.saturating_sub(*last_bump_millis) >= window_millis {
                    *level += 1;
                    *last_bump_millis = now_millis;
                }
                Ok(*level)
            }
            other => {
                *other = fresh();
                Ok(1)
            }
        }
    }

    async fn remove_prefix(&self, prefix: &str) -> Result<usize, StoreError> {
        let before = self.slots.len();
        self.slots.retain(|k, _| !k.starts_with(prefix));
        Ok(before - self.slots.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::future::join_all;
    use std::sync::Arc;

    #[tokio::test]
    async fn sliding_claim_admits_up_to_limit_then_denies() {
        let store = MemoryStore::new();
        for i in 0..3 {
            let claim = store
                .claim_sliding("k", Duration::from_secs(60), 3, 1_000, &format!("e{i}"))
                .await
                .unwrap();
            assert!(claim.admitted);
            assert_eq!(claim.count, i);
        }
        let claim =
            store.claim_sliding("k", Duration::from_secs(60), 3, 1_500, "e3").await.unwrap();
        assert!(!claim.admitted);
        assert_eq!(claim.count, 3);
        assert_eq!(claim.oldest_millis, Some(1_000));
    }

    #[tokio::test]
    async fn sliding_claim_evicts_expired_entries() {
        let store = MemoryStore::new();
        let window = Duration::from_secs(60);
        for _ in 0..3 {
            assert!(store.claim_sliding("k", window, 3, 1_000, "e").await.unwrap().admitted);
        }
        assert!(!store.claim_sliding("k", window, 3, 2_000, "e").await.unwrap().admitted);

        // One window later the old entries are gone.
        let claim = store.claim_sliding("k", window, 3, 62_000, "e").await.unwrap();
        assert!(claim.admitted);
        assert_eq!(claim.count, 0);
    }

    #[tokio::test]
    async fn counter_resets_after_expiry() {
        let store = MemoryStore::new();
        let ttl = Duration::from_secs(60);
        assert_eq!(store.incr_counter("c", ttl, 0).await.unwrap(), 1);
        assert_eq!(store.incr_counter("c", ttl, 10_000).await.unwrap(), 2);
        assert_eq!(store.get_counter("c", 10_000).await.unwrap(), 2);

        assert_eq!(store.incr_counter("c", ttl, 61_000).await.unwrap(), 1);
        assert_eq!(store.get_counter("c", 200_000).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn token_claim_refills_and_caps_at_capacity() {
        let store = MemoryStore::new();
        // capacity 2, 1 token/sec
        assert!(store.claim_token("b", 2.0, 1.0, 0).await.unwrap().admitted);
        assert!(store.claim_token("b", 2.0, 1.0, 0).await.unwrap().admitted);
        let denied = store.claim_token("b", 2.0, 1.0, 0).await.unwrap();
        assert!(!denied.admitted);
        assert!(denied.tokens < 1.0);

        // After an hour the balance is capped at capacity, not 3600.
        let claim = store.claim_token("b", 2.0, 1.0, 3_600_000).await.unwrap();
        assert!(claim.admitted);
        assert!((claim.tokens - 1.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn penalty_bump_is_debounced_per_window() {
        let store = MemoryStore::new();
        let window = Duration::from_secs(300);

        assert_eq!(store.bump_penalty("p", window, 0).await.unwrap(), 1);
        // A burst of rejections within the window stays at level 1.
        assert_eq!(store.bump_penalty("p", window, 1_000).await.unwrap(), 1);
        assert_eq!(store.bump_penalty("p", window, 2_000).await.unwrap(), 1);

        // A full window after the last bump, the level escalates.
        assert_eq!(store.bump_penalty("p", window, 300_000).await.unwrap(), 2);
        assert_eq!(store.bump_penalty("p", window, 301_000).await.unwrap(), 2);

        // Quiet for longer than the (refreshed) expiry: back to level 1.
        assert_eq!(store.bump_penalty("p", window, 1_000_000).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn remove_prefix_deletes_matching_keys_only() {
        let store = MemoryStore::new();
        store.incr_counter("app:u1:minute", Duration::from_secs(60), 0).await.unwrap();
        store.incr_counter("app:u1:hour", Duration::from_secs(3600), 0).await.unwrap();
        store.incr_counter("app:u2:minute", Duration::from_secs(60), 0).await.unwrap();

        assert_eq!(store.remove_prefix("app:u1").await.unwrap(), 2);
        assert_eq!(store.len(), 1);
        assert_eq!(store.get_counter("app:u2:minute", 0).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn concurrent_sliding_claims_never_over_admit() {
        let store = Arc::new(MemoryStore::new());
        let limit = 10u32;
        let tasks = 100;
        let barrier = Arc::new(tokio::sync::Barrier::new(tasks));

        let handles: Vec<_> = (0..tasks)
            .map(|i| {
                let store = store.clone();
                let barrier = barrier.clone();
                tokio::spawn(async move {
                    barrier.wait().await;
                    store
                        .claim_sliding("hot", Duration::from_secs(60), limit, 5_000, &i.to_string())
                        .await
                        .unwrap()
                        .admitted
                })
            })
            .collect();

        let admitted =
            join_all(handles).await.into_iter().filter(|r| *r.as_ref().unwrap()).count();
        assert_eq!(admitted, limit as usize);
    }
}
