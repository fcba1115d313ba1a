//! Error types shared by the guard policies.

use std::fmt;
use std::time::Duration;

/// Unified error type returned by the guard policies.
///
/// `Inner` carries the wrapped operation's own error so the immediate caller
/// still sees the real failure; the other variants are cheap, distinguishable
/// signals produced by the guards themselves.
#[derive(Debug, Clone)]
pub enum GuardError<E> {
    /// The guarded operation exceeded its per-call deadline.
    Timeout { elapsed: Duration, timeout: Duration },
    /// The named circuit breaker is open and short-circuited the call.
    CircuitOpen { circuit: String, failure_count: u64, retry_after: Duration },
    /// The rate limiter denied the request.
    RateLimited { retry_after: Duration, reason: String },
    /// The underlying operation failed.
    Inner(E),
}

impl<E: fmt::Display> fmt::Display for GuardError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Timeout { elapsed, timeout } => {
                write!(f, "operation timed out after {:?} (limit: {:?})", elapsed, timeout)
            }
            Self::CircuitOpen { circuit, failure_count, retry_after } => {
                write!(
                    f,
                    "circuit breaker '{}' open ({} failures, retry after {:?})",
                    circuit, failure_count, retry_after
                )
            }
            Self::RateLimited { retry_after, reason } => {
                write!(f, "rate limited ({}), retry after {:?}", reason, retry_after)
            }
            Self::Inner(e) => write!(f, "{}", e),
        }
    }
}

impl<E: std::error::Error + 'static> std::error::Error for GuardError<E> {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Inner(e) => Some(e),
            _ => None,
        }
    }
}

impl<E> GuardError<E> {
    /// Check if this error is due to the per-call deadline.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    /// Check if this error is an open-circuit rejection.
    pub fn is_circuit_open(&self) -> bool {
        matches!(self, Self::CircuitOpen { .. })
    }

    /// Check if this error is a rate limit denial.
    pub fn is_rate_limited(&self) -> bool {
        matches!(self, Self::RateLimited { .. })
    }

    /// Check if this error wraps an inner error.
    pub fn is_inner(&self) -> bool {
        matches!(self, Self::Inner(_))
    }

    /// Get the inner error if this is an Inner variant.
    pub fn into_inner(self) -> Option<E> {
        match self {
            Self::Inner(e) => Some(e),
            _ => None,
        }
    }

    /// Borrow the inner error if present.
    pub fn as_inner(&self) -> Option<&E> {
        match self {
            Self::Inner(e) => Some(e),
            _ => None,
        }
    }

    /// Access timeout details if this is a timeout error.
    pub fn timeout_details(&self) -> Option<(Duration, Duration)> {
        match self {
            Self::Timeout { elapsed, timeout } => Some((*elapsed, *timeout)),
            _ => None,
        }
    }

    /// How long the caller should wait before retrying, for the variants that
    /// carry one. Maps directly onto a `Retry-After` header.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::CircuitOpen { retry_after, .. } | Self::RateLimited { retry_after, .. } => {
                Some(*retry_after)
            }
            _ => None,
        }
    }

    /// Name of the circuit that rejected the call, if any. Maps onto an
    /// `X-Circuit-Breaker` header.
    pub fn circuit_name(&self) -> Option<&str> {
        match self {
            Self::CircuitOpen { circuit, .. } => Some(circuit),
            _ => None,
        }
    }
}
