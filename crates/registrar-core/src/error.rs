//! Error types for registrar-core

use thiserror::Error;

/// Result type alias for registrar operations
pub type Result<T> = std::result::Result<T, RegistrarError>;

/// Main error type for registrar operations
#[derive(Error, Debug)]
pub enum RegistrarError {
    /// Configuration could not be read or is invalid
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Query or connection failure during a sync pass; retried on next trigger
    #[error("Store error: {0}")]
    StoreError(String),

    /// The dedicated change-notification connection could not be established
    #[error("Listener unavailable: {0}")]
    ListenerUnavailable(String),

    /// SIP message could not be parsed or built
    #[error("SIP message error: {0}")]
    SipError(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl RegistrarError {
    /// Whether the process cannot continue after this error.
    pub fn is_fatal(&self) -> bool {
        matches!(self, RegistrarError::ListenerUnavailable(_))
    }
}

impl From<std::io::Error> for RegistrarError {
    fn from(err: std::io::Error) -> Self {
        RegistrarError::Internal(err.to_string())
    }
}

impl From<sqlx::Error> for RegistrarError {
    fn from(err: sqlx::Error) -> Self {
        RegistrarError::StoreError(err.to_string())
    }
}

impl From<rsip::Error> for RegistrarError {
    fn from(err: rsip::Error) -> Self {
        RegistrarError::SipError(err.to_string())
    }
}

impl From<config::ConfigError> for RegistrarError {
    fn from(err: config::ConfigError) -> Self {
        RegistrarError::ConfigError(err.to_string())
    }
}
