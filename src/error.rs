//! Error types for Hangar registry operations.

use thiserror::Error;

/// Main error type for Hangar operations
#[derive(Error, Debug)]
pub enum HangarError {
    /// Duplicate provider id found in config
    #[error("duplicate provider id: {0}")]
    DuplicateProvider(String),

    /// Invalid configuration for a named provider
    #[error("invalid config for provider '{0}': {1}")]
    InvalidConfig(String, String),

    /// A state-machine transition that the lifecycle table forbids
    #[error("invalid state transition for provider '{provider}': {from} -> {to}")]
    InvalidStateTransition {
        provider: String,
        from: &'static str,
        to: &'static str,
    },

    /// Provider is degraded and its backoff window has not elapsed
    #[error("cannot start provider '{provider}': backoff not elapsed, retry in {retry_in_s:.1}s")]
    CannotStartProvider { provider: String, retry_in_s: f64 },

    /// Spawn, handshake, or tool discovery failed while starting a provider
    #[error("provider '{0}' failed to start: {1}")]
    ProviderStart(String, String),

    /// Tool absent from the catalog after a single refresh
    #[error("tool '{tool}' not found on provider '{provider}'")]
    ToolNotFound { provider: String, tool: String },

    /// RPC-level or transport error during a tool call
    #[error("tool invocation failed on provider '{0}': {1}")]
    ToolInvocation(String, String),

    /// Per-call or batch deadline elapsed
    #[error("call timed out after {timeout_s:.1}s")]
    Timeout { timeout_s: f64 },

    /// Unknown provider id at invocation time
    #[error("provider '{0}' not found")]
    ProviderNotFound(String),

    /// Health tracker indicates degradation; no attempt is made
    #[error("circuit breaker open for provider '{0}' (too many consecutive failures)")]
    CircuitBreakerOpen(String),

    /// Token bucket for the caller's key is empty
    #[error("rate limit exceeded: {limit} requests per {window_s}s window")]
    RateLimitExceeded { limit: u32, window_s: u32 },

    /// Input failed validation before any work was done
    #[error("validation failed for field '{field}': {message}")]
    Validation { field: String, message: String },

    /// The RPC client's reader task has terminated; all pending calls receive this
    #[error("rpc client for provider '{0}' is dead: {1}")]
    ClientDead(String, String),

    /// Transport-level error talking to a child process
    #[error("transport error for provider '{0}': {1}")]
    Transport(String, String),

    /// No handler registered for a command or query variant
    #[error("no handler registered for '{0}'")]
    NoHandler(&'static str),
}

impl HangarError {
    /// Stable kind string surfaced to clients as `error_type`.
    pub fn kind(&self) -> &'static str {
        match self {
            HangarError::DuplicateProvider(_) => "DuplicateProvider",
            HangarError::InvalidConfig(_, _) => "InvalidConfig",
            HangarError::InvalidStateTransition { .. } => "InvalidStateTransition",
            HangarError::CannotStartProvider { .. } => "CannotStartProvider",
            HangarError::ProviderStart(_, _) => "ProviderStartError",
            HangarError::ToolNotFound { .. } => "ToolNotFoundError",
            HangarError::ToolInvocation(_, _) => "ToolInvocationError",
            HangarError::Timeout { .. } => "TimeoutError",
            HangarError::ProviderNotFound(_) => "ProviderNotFoundError",
            HangarError::CircuitBreakerOpen(_) => "CircuitBreakerOpen",
            HangarError::RateLimitExceeded { .. } => "RateLimitExceeded",
            HangarError::Validation { .. } => "ValidationError",
            HangarError::ClientDead(_, _) => "ClientDead",
            HangarError::Transport(_, _) => "TransportError",
            HangarError::NoHandler(_) => "NoHandler",
        }
    }

    /// Whether a batch retry may help. Only transport-shaped failures are
    /// transient; validation, not-found, and circuit errors are not.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            HangarError::Timeout { .. }
                | HangarError::ClientDead(_, _)
                | HangarError::Transport(_, _)
                | HangarError::ToolInvocation(_, _)
        )
    }
}

/// Result type alias for Hangar operations
pub type Result<T> = std::result::Result<T, HangarError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_duplicate_provider_display() {
        let err = HangarError::DuplicateProvider("math".to_string());
        assert_eq!(err.to_string(), "duplicate provider id: math");
    }

    #[test]
    fn test_cannot_start_display_includes_retry() {
        let err = HangarError::CannotStartProvider {
            provider: "math".to_string(),
            retry_in_s: 4.0,
        };
        assert!(err.to_string().contains("retry in 4.0s"));
    }

    #[test]
    fn test_kind_strings_are_stable() {
        assert_eq!(
            HangarError::Timeout { timeout_s: 1.0 }.kind(),
            "TimeoutError"
        );
        assert_eq!(
            HangarError::CircuitBreakerOpen("x".into()).kind(),
            "CircuitBreakerOpen"
        );
        assert_eq!(
            HangarError::ProviderNotFound("x".into()).kind(),
            "ProviderNotFoundError"
        );
    }

    #[test]
    fn test_transience_classification() {
        assert!(HangarError::Timeout { timeout_s: 1.0 }.is_transient());
        assert!(HangarError::ClientDead("p".into(), "reader_died".into()).is_transient());
        assert!(!HangarError::ProviderNotFound("p".into()).is_transient());
        assert!(
            !HangarError::Validation {
                field: "tool".into(),
                message: "bad".into()
            }
            .is_transient()
        );
    }
}
