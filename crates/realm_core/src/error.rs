//! Error types for the core.
//!
//! Each component reports failures through its own enum so callers can tell a
//! retryable conflict from a rejected call or a tripped breaker without
//! string matching.

use crate::state::Domain;
use crate::types::SessionId;
use std::time::Duration;

/// Errors produced by [`GameState`](crate::state::GameState) updates.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum StateError {
    /// Another update committed between the snapshot and the write lock.
    #[error("concurrent modification: expected version {expected}, found {actual}")]
    ConcurrentModification { expected: u64, actual: u64 },

    /// The apply step did not finish within the update deadline.
    #[error("state update timed out after {0:?}")]
    Timeout(Duration),

    /// An injected mutation refused the update.
    #[error("{domain} update rejected: {reason}")]
    Rejected { domain: Domain, reason: String },

    /// An injected mutation panicked; the update was rolled back.
    #[error("state update panicked: {0}")]
    ApplyPanicked(String),

    /// The update payload could not be interpreted.
    #[error("invalid state update: {0}")]
    InvalidUpdate(String),
}

impl StateError {
    /// Convenience constructor used by mutation closures.
    pub fn rejected(domain: Domain, reason: impl Into<String>) -> Self {
        Self::Rejected {
            domain,
            reason: reason.into(),
        }
    }

    /// Conflicts and timeouts leave state untouched and can be retried with the
    /// same update.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::ConcurrentModification { .. } | Self::Timeout(_))
    }
}

/// Errors returned by [`CircuitBreaker`](crate::circuit_breaker::CircuitBreaker).
///
/// `E` is the protected call's own error type; `Open` is kept distinct from it
/// so a fast-fail can be told apart from a real dependency failure.
#[derive(Debug, thiserror::Error)]
pub enum BreakerError<E> {
    /// The breaker is open (or out of half-open trial slots).
    #[error("circuit breaker '{name}' is open")]
    Open { name: String },

    /// The protected call returned an error.
    #[error("protected call failed: {0}")]
    Failed(E),

    /// The protected call panicked.
    #[error("protected call panicked: {0}")]
    Panicked(String),

    /// The caller's deadline elapsed before the call finished.
    #[error("protected call timed out after {0:?}")]
    TimedOut(Duration),

    /// The caller cancelled before the call finished.
    #[error("protected call cancelled")]
    Cancelled,
}

impl<E> BreakerError<E> {
    pub fn is_open(&self) -> bool {
        matches!(self, Self::Open { .. })
    }
}

/// Top-level error for the server facade.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    /// State container failure.
    #[error("State error: {0}")]
    State(#[from] StateError),

    /// Client exceeded its request budget.
    #[error("Too many requests, retry after {retry_after:?}")]
    RateLimited { retry_after: Duration },

    /// A dependency is behind an open circuit breaker.
    #[error("Dependency unavailable: {0}")]
    DependencyUnavailable(String),

    /// No live session for the given id.
    #[error("Session not found: {0}")]
    SessionNotFound(SessionId),

    /// Internal server error (invalid state, background task failure, etc.)
    #[error("Internal error: {0}")]
    Internal(String),
}

impl ServerError {
    /// Hint for callers that should back off and retry.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimited { retry_after } => Some(*retry_after),
            Self::State(e) if e.is_retryable() => Some(Duration::ZERO),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(StateError::ConcurrentModification { expected: 1, actual: 2 }.is_retryable());
        assert!(StateError::Timeout(Duration::from_secs(5)).is_retryable());
        assert!(!StateError::rejected(Domain::World, "no").is_retryable());
        assert!(!StateError::ApplyPanicked("boom".into()).is_retryable());
    }

    #[test]
    fn test_error_messages() {
        let err = StateError::rejected(Domain::Turns, "not in combat");
        assert_eq!(err.to_string(), "turns update rejected: not in combat");

        let open: BreakerError<String> = BreakerError::Open { name: "db".into() };
        assert!(open.is_open());
        assert_eq!(open.to_string(), "circuit breaker 'db' is open");

        let failed: BreakerError<String> = BreakerError::Failed("disk full".into());
        assert!(!failed.is_open());
    }

    #[test]
    fn test_server_error_retry_hint() {
        let limited = ServerError::RateLimited { retry_after: Duration::from_secs(1) };
        assert_eq!(limited.retry_after(), Some(Duration::from_secs(1)));

        let conflict: ServerError = StateError::ConcurrentModification { expected: 0, actual: 1 }.into();
        assert_eq!(conflict.retry_after(), Some(Duration::ZERO));

        assert_eq!(ServerError::Internal("x".into()).retry_after(), None);
    }
}
