#![forbid(unsafe_code)]
#![deny(warnings)]
#![cfg_attr(not(test), deny(clippy::all))]

//! # quotaguard
//!
//! Distributed rate limiting and circuit breaking primitives for async Rust.
//!
//! ## Features
//!
//! - **Rate limiting** with pluggable strategies (fixed window, sliding
//!   window, sliding log, token bucket) over an atomic [`rate_limit::store::QuotaStore`]
//! - **Tier multipliers and per-endpoint overrides** for quota resolution
//! - **Progressive penalties** with debounced exponential back-off
//! - **Circuit breakers** with half-open probing, failure-rate tripping,
//!   per-call deadlines, and fallbacks
//! - **Named breaker registry** for sharing one breaker per dependency
//! - **Tower middleware** enforcing limits in front of a service
//!
//! ## Quick Start
//!
//! ```rust
//! use quotaguard::rate_limit::{RateLimitConfig, RateLimiter, Strategy};
//! use quotaguard::rate_limit::store::MemoryStore;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = RateLimitConfig::builder()
//!         .requests_per_minute(60)
//!         .strategy(Strategy::SlidingWindow)
//!         .tier_multiplier("free", 1.0)
//!         .tier_multiplier("enterprise", 10.0)
//!         .build()
//!         .unwrap();
//!
//!     let limiter = RateLimiter::new(config, Arc::new(MemoryStore::new()));
//!     let decision = limiter.check_rate_limit("user:42", Some("/api/x"), "free", None).await;
//!     assert!(decision.allowed);
//! }
//! ```

pub mod circuit_breaker;
pub mod circuit_breaker_registry;
pub mod clock;
pub mod error;
pub mod rate_limit;

// Re-exports
pub use circuit_breaker::{
    BreakerConfigError, CircuitBreaker, CircuitBreakerConfig, CircuitMetrics, CircuitState,
};
pub use circuit_breaker_registry::{
    BreakerRegistry, BreakerRegistryError, InMemoryBreakerRegistry,
};
pub use clock::{Clock, MonotonicClock, WallClock};
pub use error::GuardError;
pub use rate_limit::{
    RateLimitConfig, RateLimitLayer, RateLimitResult, RateLimiter, Scope, Strategy,
};
