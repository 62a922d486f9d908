//! Error types for mailpipe.

use thiserror::Error;

/// Application result type.
pub type AppResult<T> = Result<T, AppError>;

/// Application error type.
#[derive(Debug, Error)]
pub enum AppError {
    // === Domain Errors ===
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    // === Infrastructure Errors ===
    #[error("Database error: {0}")]
    Database(String),

    #[error("Broker error: {0}")]
    Broker(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Metrics sink error: {0}")]
    Metrics(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Error category used as the `error_type` metric label.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorType {
    Database,
    Broker,
    Timeout,
    Serialization,
    Other,
}

impl ErrorType {
    /// All error types, in exposition order.
    pub const ALL: [Self; 5] = [
        Self::Database,
        Self::Broker,
        Self::Timeout,
        Self::Serialization,
        Self::Other,
    ];

    /// Label value for this error type.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Database => "database",
            Self::Broker => "broker",
            Self::Timeout => "timeout",
            Self::Serialization => "serialization",
            Self::Other => "other",
        }
    }

    pub(crate) const fn index(self) -> usize {
        self as usize
    }
}

impl AppError {
    /// Whether retrying the same operation later may succeed.
    ///
    /// Transient errors take the requeue path; everything else is treated as
    /// permanent by the stage processor.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Database(_) | Self::Broker(_) | Self::Timeout(_) | Self::Metrics(_)
        )
    }

    /// Returns the error code for log fields and CLI output.
    #[must_use]
    pub const fn error_code(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "NOT_FOUND",
            Self::Validation(_) => "VALIDATION_ERROR",
            Self::Conflict(_) => "CONFLICT",
            Self::Database(_) => "DATABASE_ERROR",
            Self::Broker(_) => "BROKER_ERROR",
            Self::Timeout(_) => "TIMEOUT",
            Self::Serialization(_) => "SERIALIZATION_ERROR",
            Self::Config(_) => "CONFIG_ERROR",
            Self::Metrics(_) => "METRICS_ERROR",
            Self::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// Returns the metric label category for this error.
    #[must_use]
    pub const fn error_type(&self) -> ErrorType {
        match self {
            Self::Database(_) => ErrorType::Database,
            Self::Broker(_) => ErrorType::Broker,
            Self::Timeout(_) => ErrorType::Timeout,
            Self::Serialization(_) => ErrorType::Serialization,
            _ => ErrorType::Other,
        }
    }
}

// === From implementations ===

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<config::ConfigError> for AppError {
    fn from(err: config::ConfigError) -> Self {
        Self::Config(err.to_string())
    }
}
