//! Error types for txcache operations

use thiserror::Error;

/// Cache construction errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BuildError {
    #[error("Cache build failed: {reason}")]
    Failed { reason: String },

    #[error("Cache build panicked: {reason}")]
    Panicked { reason: String },

    #[error("Cache build aborted: initialization no longer required")]
    Aborted,
}

impl BuildError {
    /// Shorthand for a factory-reported failure.
    pub fn failed(reason: impl Into<String>) -> Self {
        BuildError::Failed {
            reason: reason.into(),
        }
    }
}

/// Transaction demarcation errors raised by a transactional executor.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransactionError {
    #[error("Transaction failed: {reason}")]
    Failed { reason: String },
}

/// Configuration errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid value for {field}: {value} - {reason}")]
    InvalidValue {
        field: String,
        value: String,
        reason: String,
    },
}

/// Master error type for all txcache errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CacheError {
    #[error("Build error: {0}")]
    Build(#[from] BuildError),

    #[error("Transaction error: {0}")]
    Transaction(#[from] TransactionError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),
}

/// Result type alias for txcache operations.
pub type CacheResult<T> = Result<T, CacheError>;

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_error_display_failed() {
        let err = BuildError::failed("database unavailable");
        let msg = format!("{}", err);
        assert!(msg.contains("Cache build failed"));
        assert!(msg.contains("database unavailable"));
    }

    #[test]
    fn test_build_error_display_panicked() {
        let err = BuildError::Panicked {
            reason: "index out of bounds".to_string(),
        };
        let msg = format!("{}", err);
        assert!(msg.contains("panicked"));
        assert!(msg.contains("index out of bounds"));
    }

    #[test]
    fn test_config_error_display_invalid_value() {
        let err = ConfigError::InvalidValue {
            field: "TXCACHE_ISOLATED_STATE_MACHINE".to_string(),
            value: "maybe".to_string(),
            reason: "expected true or false".to_string(),
        };
        let msg = format!("{}", err);
        assert!(msg.contains("TXCACHE_ISOLATED_STATE_MACHINE"));
        assert!(msg.contains("maybe"));
        assert!(msg.contains("expected true or false"));
    }

    #[test]
    fn test_cache_error_from_variants() {
        let build = CacheError::from(BuildError::Aborted);
        assert!(matches!(build, CacheError::Build(_)));

        let tx = CacheError::from(TransactionError::Failed {
            reason: "rollback".to_string(),
        });
        assert!(matches!(tx, CacheError::Transaction(_)));

        let config = CacheError::from(ConfigError::InvalidValue {
            field: "policy".to_string(),
            value: "x".to_string(),
            reason: "unknown".to_string(),
        });
        assert!(matches!(config, CacheError::Config(_)));
    }
}
