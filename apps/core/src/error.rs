use std::io;
use thiserror::Error;

/// Application-wide error type, consolidating all possible errors into a single enum.
#[derive(Debug, Error)]
pub enum AppError {
    /// Represents errors originating from the relational store, typically from `sqlx`.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Represents standard input/output errors.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The embedding or generation oracle failed or returned something unusable.
    #[error("Oracle error: {0}")]
    Oracle(String),

    /// The vector index rejected or failed an operation.
    #[error("Vector index error: {0}")]
    VectorIndex(String),

    /// The chat platform could not deliver a thread.
    #[error("Message source error: {0}")]
    MessageSource(String),

    /// Represents data validation errors (e.g., invalid input format).
    #[error("Validation error: {0}")]
    Validation(String),

    /// A lookup referenced a record that does not exist.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Represents configuration-related errors (e.g., missing environment variables).
    #[error("Configuration error: {0}")]
    Config(String),

    /// Represents unexpected internal errors that indicate a bug.
    #[error("Internal error: {0}")]
    Internal(String),

    /// Represents errors from operations that did not complete in time.
    #[error("Operation timed out: {0}")]
    Timeout(String),
}

impl AppError {
    /// Infrastructure failures that leave state untouched and may succeed on retry.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            AppError::Database(_)
                | AppError::Io(_)
                | AppError::Oracle(_)
                | AppError::VectorIndex(_)
                | AppError::MessageSource(_)
                | AppError::Timeout(_)
        )
    }
}

impl Clone for AppError {
    fn clone(&self) -> Self {
        match self {
            AppError::Database(e) => AppError::Database(sqlx::Error::Protocol(e.to_string())),
            AppError::Io(e) => AppError::Io(io::Error::new(e.kind(), e.to_string())),
            AppError::Oracle(s) => AppError::Oracle(s.clone()),
            AppError::VectorIndex(s) => AppError::VectorIndex(s.clone()),
            AppError::MessageSource(s) => AppError::MessageSource(s.clone()),
            AppError::Validation(s) => AppError::Validation(s.clone()),
            AppError::NotFound(s) => AppError::NotFound(s.clone()),
            AppError::Config(s) => AppError::Config(s.clone()),
            AppError::Internal(s) => AppError::Internal(s.clone()),
            AppError::Timeout(s) => AppError::Timeout(s.clone()),
        }
    }
}

impl From<tokio::time::error::Elapsed> for AppError {
    fn from(err: tokio::time::error::Elapsed) -> Self {
        AppError::Timeout(format!("Operation timed out: {}", err))
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::Validation(format!("JSON error: {}", err))
    }
}

impl From<url::ParseError> for AppError {
    fn from(err: url::ParseError) -> Self {
        AppError::Config(format!("URL parse error: {}", err))
    }
}

impl From<uuid::Error> for AppError {
    fn from(err: uuid::Error) -> Self {
        AppError::Validation(format!("Invalid identifier: {}", err))
    }
}

impl From<validator::ValidationErrors> for AppError {
    fn from(err: validator::ValidationErrors) -> Self {
        AppError::Validation(format!("Validation errors: {}", err))
    }
}

impl From<sqlx::migrate::MigrateError> for AppError {
    fn from(err: sqlx::migrate::MigrateError) -> Self {
        AppError::Database(sqlx::Error::Migrate(Box::new(err)))
    }
}

impl From<reqwest::Error> for AppError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            AppError::Timeout(format!("HTTP request timed out: {}", err))
        } else {
            AppError::Oracle(format!("HTTP error: {}", err))
        }
    }
}

impl From<lancedb::Error> for AppError {
    fn from(err: lancedb::Error) -> Self {
        AppError::VectorIndex(format!("LanceDB error: {}", err))
    }
}

impl From<arrow::error::ArrowError> for AppError {
    fn from(err: arrow::error::ArrowError) -> Self {
        AppError::VectorIndex(format!("Arrow error: {}", err))
    }
}

impl From<regex::Error> for AppError {
    fn from(err: regex::Error) -> Self {
        AppError::Validation(format!("Invalid pattern: {}", err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn oracle_and_index_failures_are_transient() {
        assert!(AppError::Oracle("down".into()).is_transient());
        assert!(AppError::VectorIndex("locked".into()).is_transient());
        assert!(AppError::Timeout("slow".into()).is_transient());
        assert!(!AppError::Validation("bad id".into()).is_transient());
        assert!(!AppError::Config("missing".into()).is_transient());
    }

    #[test]
    fn clone_preserves_message() {
        let err = AppError::NotFound("solution 42".into());
        assert_eq!(err.clone().to_string(), err.to_string());
    }
}
