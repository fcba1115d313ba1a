//! Registry for managing named circuit breakers.
//!
//! One breaker per logical dependency ("database", "external_api", ...): the
//! registry hands out clones of a single shared instance so every call site
//! observes the same circuit lifecycle. The registry is an explicitly
//! constructed object owned by the application's composition root and passed
//! by reference; there is no global state.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitMetrics};
use tracing::debug;

/// Errors from breaker registries.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BreakerRegistryError {
    /// The requested circuit breaker name was not found.
    #[error("circuit breaker '{name}' not found")]
    NotFound {
        /// Name that could not be located.
        name: String,
    },
}

/// Trait for breaker registries (injectable at the composition root).
pub trait BreakerRegistry: Send + Sync + std::fmt::Debug {
    /// Get the breaker registered under `name`, creating it with `config` on
    /// first use. First writer wins: the config is ignored when the name
    /// already exists, so call sites cannot drift to different thresholds for
    /// the same logical dependency.
    fn get_or_create(&self, name: &str, config: CircuitBreakerConfig) -> CircuitBreaker;

    /// Get an existing breaker by name.
    fn get(&self, name: &str) -> Option<CircuitBreaker>;

    /// Administratively reset a breaker by name, erroring if missing.
    fn reset(&self, name: &str) -> Result<(), BreakerRegistryError>;

    /// Snapshot of all breakers sorted by name, for status endpoints.
    fn snapshot(&self) -> Vec<(String, CircuitMetrics)>;
}

/// In-memory implementation backed by an RwLock.
#[derive(Default, Clone, Debug)]
pub struct InMemoryBreakerRegistry {
    inner: Arc<RwLock<HashMap<String, CircuitBreaker>>>,
}

impl InMemoryBreakerRegistry {
    pub fn new() -> Self {
        Self::default()
    }
}

impl BreakerRegistry for InMemoryBreakerRegistry {
    fn get_or_create(&self, name: &str, config: CircuitBreakerConfig) -> CircuitBreaker {
        if let Some(existing) =
            self.inner.read().expect("circuit breaker registry poisoned").get(name)
        {
            return existing.clone();
        }
        let mut map = self.inner.write().expect("circuit breaker registry poisoned");
        // Double-check under the write lock; a racing creator may have won.
        if let Some(existing) = map.get(name) {
            return existing.clone();
        }
        debug!(circuit = %name, "registering circuit breaker");
        let breaker = CircuitBreaker::new(name, config);
        map.insert(name.to_string(), breaker.clone());
        breaker
    }

    fn get(&self, name: &str) -> Option<CircuitBreaker> {
        let guard = self.inner.read().expect("circuit breaker registry poisoned");
        guard.get(name).cloned()
    }

    fn reset(&self, name: &str) -> Result<(), BreakerRegistryError> {
        let guard = self.inner.read().expect("circuit breaker registry poisoned");
        match guard.get(name) {
            Some(breaker) => {
                breaker.reset();
                Ok(())
            }
            None => Err(BreakerRegistryError::NotFound { name: name.to_string() }),
        }
    }

    fn snapshot(&self) -> Vec<(String, CircuitMetrics)> {
        let map = self.inner.read().expect("circuit breaker registry poisoned");
        let mut entries: Vec<(String, CircuitMetrics)> =
            map.iter().map(|(k, v)| (k.clone(), v.metrics())).collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        entries
    }
}
