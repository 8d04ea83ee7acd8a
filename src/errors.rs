//! Error types shared by every layer of the activation service.

use thiserror::Error;

/// Crate-wide error type.
///
/// Business outcomes of a verification (valid / invalid) are never errors;
/// these variants describe requests that could not be answered normally.
#[derive(Debug, Error)]
pub enum LicenseError {
    /// Missing or wrong shared secret.
    #[error("unauthorized")]
    Unauthorized,

    /// Missing or malformed input.
    #[error("validation error: {0}")]
    Validation(String),

    /// The license key does not exist.
    #[error("license not found: {0}")]
    NotFound(String),

    /// A license with this key already exists.
    #[error("license already exists: {0}")]
    Conflict(String),

    /// The store rejected or failed an operation.
    #[error("storage error: {0}")]
    StorageError(String),

    /// A store operation exceeded the configured deadline.
    #[error("storage timeout during {0}")]
    Timeout(String),

    /// Invalid or incomplete configuration.
    #[error("configuration error: {0}")]
    ConfigError(String),

    /// Anything else that went wrong on the server side.
    #[error("server error: {0}")]
    ServerError(String),
}

impl LicenseError {
    /// Stable machine-readable code used in HTTP error bodies.
    pub fn code(&self) -> &'static str {
        match self {
            LicenseError::Unauthorized => "UNAUTHORIZED",
            LicenseError::Validation(_) => "INVALID_REQUEST",
            LicenseError::NotFound(_) => "LICENSE_NOT_FOUND",
            LicenseError::Conflict(_) => "LICENSE_EXISTS",
            LicenseError::StorageError(_) => "DATABASE_ERROR",
            LicenseError::Timeout(_) => "DATABASE_TIMEOUT",
            LicenseError::ConfigError(_) => "CONFIG_ERROR",
            LicenseError::ServerError(_) => "INTERNAL_ERROR",
        }
    }
}

/// Result alias used throughout the crate.
pub type LicenseResult<T> = Result<T, LicenseError>;
