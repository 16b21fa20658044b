//! Error types for the feature-flag engine.

use thiserror::Error;

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, MagickError>;

/// Engine-level errors.
#[derive(Debug, Error)]
pub enum MagickError {
    /// Unknown feature type name.
    #[error("Invalid feature type: {0}")]
    InvalidType(String),

    /// Value does not match the declared type, or enable/disable misuse.
    #[error("Invalid value for feature '{feature}': {reason}")]
    InvalidValue {
        /// Feature the value was destined for.
        feature: String,
        /// Why the value was rejected.
        reason: String,
    },

    /// Strict lookup failed. Evaluation paths never raise this; they
    /// fall back to a default-valued flag instead.
    #[error("Feature not found: {0}")]
    NotFound(String),

    /// Failure originating in a storage adapter.
    #[error(transparent)]
    Adapter(#[from] AdapterError),
}

impl MagickError {
    /// Build an `InvalidValue` error.
    pub fn invalid_value(feature: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidValue {
            feature: feature.into(),
            reason: reason.into(),
        }
    }
}

/// Errors raised by the Remote and Durable store adapters.
#[derive(Debug, Error)]
pub enum AdapterError {
    /// Remote (shared key/value) store failure.
    #[error("Remote store error: {0}")]
    Remote(String),

    /// Durable (relational) store failure.
    #[error("Durable store error: {0}")]
    Durable(String),

    /// Attribute encoding or decoding failure.
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl AdapterError {
    /// Check if this error is worth retrying with backoff.
    pub fn is_retryable(&self) -> bool {
        let text = match self {
            Self::Remote(msg) | Self::Durable(msg) => msg.to_ascii_lowercase(),
            Self::Serialization(_) => return false,
        };
        text.contains("busy") || text.contains("locked") || text.contains("timeout")
    }
}

impl From<serde_json::Error> for AdapterError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(AdapterError::Durable("database is locked".into()).is_retryable());
        assert!(AdapterError::Durable("SQLITE_BUSY".to_ascii_lowercase()).is_retryable());
        assert!(AdapterError::Remote("command timeout".into()).is_retryable());
        assert!(!AdapterError::Durable("syntax error".into()).is_retryable());
        assert!(!AdapterError::Serialization("bad json".into()).is_retryable());
    }

    #[test]
    fn test_display_carries_feature_name() {
        let err = MagickError::invalid_value("dark_mode", "expected boolean");
        assert!(err.to_string().contains("dark_mode"));
        assert!(err.to_string().contains("expected boolean"));
    }
}
