//! Error types for formguard.

use std::time::Duration;

use thiserror::Error;

/// Main error type for formguard operations.
#[derive(Error, Debug)]
pub enum FormGuardError {
    /// Invalid limiter or backend configuration. Fatal at startup.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// The remote window store could not complete an operation
    #[error("Backend unavailable: {0}")]
    BackendUnavailable(String),

    /// A caller-supplied deadline expired before the check finished
    #[error("Deadline exceeded after {0:?}")]
    DeadlineExceeded(Duration),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl FormGuardError {
    /// Whether this error is a runtime backend fault that the failure policy absorbs.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            FormGuardError::BackendUnavailable(_) | FormGuardError::DeadlineExceeded(_)
        )
    }
}

impl From<config::ConfigError> for FormGuardError {
    fn from(err: config::ConfigError) -> Self {
        FormGuardError::Configuration(err.to_string())
    }
}

impl From<redis::RedisError> for FormGuardError {
    fn from(err: redis::RedisError) -> Self {
        FormGuardError::BackendUnavailable(err.to_string())
    }
}

/// Result type alias for formguard operations.
pub type Result<T> = std::result::Result<T, FormGuardError>;
