//! Error types for MemVault.
//!
//! Provides structured error handling with:
//! - Machine-readable error codes (`ErrorCode`)
//! - Severity levels driving the propagation policy (configuration and
//!   permission errors propagate; storage errors become sentinels at the
//!   tool boundary)
//! - Retryability flags for agent self-correction

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for MemVault operations.
pub type Result<T> = std::result::Result<T, Error>;

// ── Error Code ────────────────────────────────────────────────

/// Machine-readable error codes grouped by category.
///
/// Each code maps to a SCREAMING_SNAKE string and a severity. Agents match
/// on the string; the dispatch layer matches on the severity to decide
/// between sentinel conversion and propagation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    // Configuration (critical - propagates out of initialize())
    ConfigError,
    UnsupportedScheme,
    InvalidConnectionString,

    // Storage (high - sentinel at the tool boundary)
    StorageError,
    DatabaseError,
    RedisError,

    // Validation (low - typed rejection)
    ValidationError,

    // Permission (high - propagates)
    PermissionError,

    // Internal (medium - sentinel)
    InternalError,
}

/// How bad an error is, per the propagation policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl ErrorCode {
    /// Machine-readable SCREAMING_SNAKE code string.
    #[must_use]
    pub const fn as_str(&self) -> &str {
        match self {
            Self::ConfigError => "CONFIG_ERROR",
            Self::UnsupportedScheme => "UNSUPPORTED_SCHEME",
            Self::InvalidConnectionString => "INVALID_CONNECTION_STRING",
            Self::StorageError => "STORAGE_ERROR",
            Self::DatabaseError => "DATABASE_ERROR",
            Self::RedisError => "REDIS_ERROR",
            Self::ValidationError => "VALIDATION_ERROR",
            Self::PermissionError => "PERMISSION_ERROR",
            Self::InternalError => "INTERNAL_ERROR",
        }
    }

    /// Severity for this code.
    #[must_use]
    pub const fn severity(&self) -> Severity {
        match self {
            Self::ConfigError | Self::UnsupportedScheme | Self::InvalidConnectionString => {
                Severity::Critical
            }
            Self::StorageError
            | Self::DatabaseError
            | Self::RedisError
            | Self::PermissionError => Severity::High,
            Self::InternalError => Severity::Medium,
            Self::ValidationError => Severity::Low,
        }
    }

    /// Whether an agent should retry with corrected input.
    ///
    /// True only for validation errors; configuration, permission, and
    /// storage failures need operator attention, not a retry.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::ValidationError)
    }
}

// ── Error Enum ────────────────────────────────────────────────

/// Errors that can occur in MemVault operations.
#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Unsupported scheme '{scheme}'. Supported: sqlite, redis")]
    UnsupportedScheme { scheme: String },

    #[error("Invalid connection string: {0}")]
    InvalidConnectionString(String),

    #[error("Storage error during {operation}: {message}")]
    Storage { operation: String, message: String },

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Invalid argument: {0}")]
    Validation(String),

    #[error("Refusing to read blocked instruction path: {}", path.display())]
    Permission { path: PathBuf },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{0}")]
    Internal(String),
}

impl Error {
    /// Map this error to its structured `ErrorCode`.
    #[must_use]
    pub const fn error_code(&self) -> ErrorCode {
        match self {
            Self::Config(_) => ErrorCode::ConfigError,
            Self::UnsupportedScheme { .. } => ErrorCode::UnsupportedScheme,
            Self::InvalidConnectionString(_) => ErrorCode::InvalidConnectionString,
            Self::Storage { .. } => ErrorCode::StorageError,
            Self::Database(_) => ErrorCode::DatabaseError,
            Self::Redis(_) => ErrorCode::RedisError,
            Self::Validation(_) => ErrorCode::ValidationError,
            Self::Permission { .. } => ErrorCode::PermissionError,
            Self::Io(_) | Self::Json(_) | Self::Internal(_) => ErrorCode::InternalError,
        }
    }

    /// Severity, delegating to the `ErrorCode`.
    #[must_use]
    pub const fn severity(&self) -> Severity {
        self.error_code().severity()
    }

    /// Whether this error must propagate instead of becoming a sentinel.
    ///
    /// A misconfigured backend must crash at startup, and a blocked
    /// instruction path must surface to the operator; everything else is
    /// converted to the method's sentinel at the tool boundary.
    #[must_use]
    pub const fn must_propagate(&self) -> bool {
        matches!(
            self.error_code(),
            ErrorCode::ConfigError
                | ErrorCode::UnsupportedScheme
                | ErrorCode::InvalidConnectionString
                | ErrorCode::PermissionError
        )
    }

    /// Shorthand for a storage error with operation context.
    pub fn storage(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Storage {
            operation: operation.into(),
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_errors_are_critical_and_propagate() {
        let err = Error::Config("bad".into());
        assert_eq!(err.severity(), Severity::Critical);
        assert!(err.must_propagate());
        assert!(!err.error_code().is_retryable());
    }

    #[test]
    fn validation_errors_are_retryable() {
        let err = Error::Validation("importance_level must be 1-10".into());
        assert_eq!(err.severity(), Severity::Low);
        assert!(err.error_code().is_retryable());
        assert!(!err.must_propagate());
    }

    #[test]
    fn permission_errors_propagate() {
        let err = Error::Permission {
            path: PathBuf::from("/etc/passwd"),
        };
        assert!(err.must_propagate());
        assert_eq!(err.error_code().as_str(), "PERMISSION_ERROR");
    }
}
