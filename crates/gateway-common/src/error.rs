//! Error types shared across the Oversight Gateway workspace.

use thiserror::Error;

/// Result type alias for gateway operations.
pub type GatewayResult<T> = Result<T, GatewayError>;

/// Unified error type for the Oversight Gateway.
#[derive(Error, Debug)]
pub enum GatewayError {
    // ─────────────────────────────────────────────────────────────────────
    // Authentication
    // ─────────────────────────────────────────────────────────────────────
    #[error("missing or invalid API key")]
    Unauthorized,

    // ─────────────────────────────────────────────────────────────────────
    // Input validation
    // ─────────────────────────────────────────────────────────────────────
    #[error("validation failed on {field}: {message}")]
    ValidationFailed { field: String, message: String },

    // ─────────────────────────────────────────────────────────────────────
    // Not found
    // ─────────────────────────────────────────────────────────────────────
    #[error("not found: {0}")]
    NotFound(String),

    // ─────────────────────────────────────────────────────────────────────
    // Conflict
    // ─────────────────────────────────────────────────────────────────────
    #[error("action {0} already decided")]
    AlreadyDecided(i64),

    // ─────────────────────────────────────────────────────────────────────
    // Transient backend
    // ─────────────────────────────────────────────────────────────────────
    #[error("backend unavailable: {0}")]
    Backend(String),

    // ─────────────────────────────────────────────────────────────────────
    // Policy
    // ─────────────────────────────────────────────────────────────────────
    #[error("policy load failed: {0}")]
    PolicyLoad(String),

    // ─────────────────────────────────────────────────────────────────────
    // Configuration
    // ─────────────────────────────────────────────────────────────────────
    #[error("configuration error: {0}")]
    Configuration(String),

    // ─────────────────────────────────────────────────────────────────────
    // Generic
    // ─────────────────────────────────────────────────────────────────────
    #[error("internal error: {0}")]
    Internal(String),
}

#[cfg(feature = "sqlx")]
impl From<sqlx::Error> for GatewayError {
    fn from(err: sqlx::Error) -> Self {
        GatewayError::Backend(err.to_string())
    }
}

#[cfg(feature = "config")]
impl From<figment::Error> for GatewayError {
    fn from(err: figment::Error) -> Self {
        GatewayError::Configuration(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn already_decided_carries_action_id() {
        let err = GatewayError::AlreadyDecided(42);
        assert_eq!(err.to_string(), "action 42 already decided");
    }

    #[test]
    fn validation_failed_names_the_field() {
        let err = GatewayError::ValidationFailed {
            field: "actual_severity".into(),
            message: "must be within [0, 1]".into(),
        };
        assert!(err.to_string().contains("actual_severity"));
    }
}
