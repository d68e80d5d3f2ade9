//! Error types for registrar-core

use thiserror::Error;

/// Result type alias for registrar operations
pub type Result<T> = std::result::Result<T, RegistrarError>;

/// Main error type for registrar operations
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistrarError {
    /// Extension is unknown to the entity collaborator
    #[error("Extension not found: {0}")]
    ExtensionNotFound(String),

    /// Invalid registration parameters
    #[error("Invalid registration: {0}")]
    InvalidRegistration(String),

    /// Digest response did not match the stored secret
    #[error("Authentication failed for {0}")]
    AuthenticationFailed(String),

    /// Nonce was never issued, already expired or was purged
    #[error("Stale nonce: {0}")]
    StaleNonce(String),

    /// Authorization header could not be parsed
    #[error("Malformed credentials: {0}")]
    MalformedCredentials(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl RegistrarError {
    /// Create a new ExtensionNotFound error
    pub fn not_found<S: Into<String>>(extension: S) -> Self {
        Self::ExtensionNotFound(extension.into())
    }

    /// Create a new InvalidRegistration error
    pub fn invalid<S: Into<String>>(msg: S) -> Self {
        Self::InvalidRegistration(msg.into())
    }

    /// Create a new MalformedCredentials error
    pub fn malformed<S: Into<String>>(msg: S) -> Self {
        Self::MalformedCredentials(msg.into())
    }

    /// Whether the failure should be answered with a fresh challenge
    /// rather than a hard rejection.
    pub fn is_challengeable(&self) -> bool {
        matches!(
            self,
            RegistrarError::StaleNonce(_) | RegistrarError::MalformedCredentials(_)
        )
    }
}
