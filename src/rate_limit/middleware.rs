//! Tower middleware enforcing rate limits in front of a service.
//!
//! The layer doesn't know *how* limiting works, only that it should ask the
//! [`RateLimiter`] before dispatching. A key extractor pulls the
//! `(identifier, endpoint, tier)` triple out of each request, so the layer
//! stays agnostic of the request type.

use crate::error::GuardError;
use crate::rate_limit::limiter::RateLimiter;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tower_layer::Layer;
use tower_service::Service;

/// Quota coordinates extracted from one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestKey {
    /// Stable string scoping the quota (IP, user id, API key).
    pub identifier: String,
    /// Endpoint path, for per-endpoint overrides.
    pub endpoint: Option<String>,
    /// Tier name selecting a quota multiplier.
    pub tier: String,
}

impl RequestKey {
    /// Key for an anonymous caller on the free tier.
    pub fn anonymous(identifier: impl Into<String>) -> Self {
        Self { identifier: identifier.into(), endpoint: None, tier: "free".to_string() }
    }
}

/// A layer that enforces rate limits using a [`RateLimiter`].
#[derive(Clone, Debug)]
pub struct RateLimitLayer<K> {
    limiter: Arc<RateLimiter>,
    key_fn: Arc<K>,
}

impl<K> RateLimitLayer<K> {
    /// Create a rate limit layer with a request key extractor.
    pub fn new(limiter: RateLimiter, key_fn: K) -> Self {
        Self { limiter: Arc::new(limiter), key_fn: Arc::new(key_fn) }
    }
}

impl<S, K> Layer<S> for RateLimitLayer<K> {
    type Service = RateLimitService<S, K>;

    fn layer(&self, service: S) -> Self::Service {
        RateLimitService {
            inner: service,
            limiter: self.limiter.clone(),
            key_fn: self.key_fn.clone(),
        }
    }
}

/// Middleware service that enforces rate limits.
#[derive(Clone, Debug)]
pub struct RateLimitService<S, K> {
    inner: S,
    limiter: Arc<RateLimiter>,
    key_fn: Arc<K>,
}

impl<S, K, Req> Service<Req> for RateLimitService<S, K>
where
    S: Service<Req> + Clone + Send + 'static,
    S::Future: Send + 'static,
    S::Error: Send + Sync + std::error::Error + 'static,
    K: Fn(&Req) -> RequestKey + Send + Sync + 'static,
    Req: Send + 'static,
{
    type Response = S::Response;
    type Error = GuardError<S::Error>;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx).map_err(GuardError::Inner)
    }

    fn call(&mut self, req: Req) -> Self::Future {
        let key = (self.key_fn)(&req);
        let limiter = self.limiter.clone();
        let mut inner = self.inner.clone();

        Box::pin(async move {
            let result = limiter
                .check_rate_limit(
                    &key.identifier,
                    key.endpoint.as_deref(),
                    &key.tier,
                    None,
                )
                .await;
            if result.allowed {
                inner.call(req).await.map_err(GuardError::Inner)
            } else {
                Err(GuardError::RateLimited {
                    retry_after: result.retry_after.unwrap_or(Duration::from_secs(1)),
                    reason: result.reason.unwrap_or_else(|| "quota exhausted".to_string()),
                })
            }
        })
    }
}
