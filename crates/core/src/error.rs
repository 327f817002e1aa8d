//! Unified error types for the backup pipeline.
//!
//! Collaborator failures carry a code:
//! - SVC_001: Permission denied
//! - SVC_002: Not found
//! - SVC_003: Unavailable
//! - SVC_004: Invalid response

use std::time::Duration;

use thiserror::Error;

/// Result type alias using our Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Error codes returned by external collaborators (organization listing,
/// warehouse metadata, export).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceErrorCode {
    /// SVC_001: Caller lacks permission on the resource
    PermissionDenied,
    /// SVC_002: Resource does not exist
    NotFound,
    /// SVC_003: Service unreachable or overloaded
    Unavailable,
    /// SVC_004: Service answered with something we could not read
    InvalidResponse,
}

impl ServiceErrorCode {
    /// Get the error code string.
    pub fn code(&self) -> &'static str {
        match self {
            Self::PermissionDenied => "SVC_001",
            Self::NotFound => "SVC_002",
            Self::Unavailable => "SVC_003",
            Self::InvalidResponse => "SVC_004",
        }
    }

    /// Maps an HTTP status to a service error code.
    pub fn from_http_status(status: u16) -> Self {
        match status {
            401 | 403 => Self::PermissionDenied,
            404 => Self::NotFound,
            408 | 429 => Self::Unavailable,
            s if s >= 500 => Self::Unavailable,
            _ => Self::InvalidResponse,
        }
    }
}

/// Unified error type for the backup pipeline.
#[derive(Debug, Error)]
pub enum Error {
    /// External collaborator error with code.
    #[error("[{code}] {message}")]
    Service {
        code: &'static str,
        kind: ServiceErrorCode,
        message: String,
    },

    #[error("bus error: {0}")]
    Bus(String),

    #[error("publish error: {0}")]
    Publish(String),

    #[error("export failed: {0}")]
    ExportFailed(String),

    #[error("export timed out after {0:?}")]
    ExportTimeout(Duration),

    #[error("validation error: {0}")]
    Validation(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a collaborator error.
    pub fn service(kind: ServiceErrorCode, msg: impl Into<String>) -> Self {
        Self::Service {
            code: kind.code(),
            kind,
            message: msg.into(),
        }
    }

    pub fn permission_denied(msg: impl Into<String>) -> Self {
        Self::service(ServiceErrorCode::PermissionDenied, msg)
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::service(ServiceErrorCode::NotFound, msg)
    }

    pub fn unavailable(msg: impl Into<String>) -> Self {
        Self::service(ServiceErrorCode::Unavailable, msg)
    }

    pub fn invalid_response(msg: impl Into<String>) -> Self {
        Self::service(ServiceErrorCode::InvalidResponse, msg)
    }

    pub fn bus(msg: impl Into<String>) -> Self {
        Self::Bus(msg.into())
    }

    pub fn publish(msg: impl Into<String>) -> Self {
        Self::Publish(msg.into())
    }

    pub fn export_failed(msg: impl Into<String>) -> Self {
        Self::ExportFailed(msg.into())
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Returns the collaborator error kind, if this is one.
    pub fn service_kind(&self) -> Option<ServiceErrorCode> {
        match self {
            Self::Service { kind, .. } => Some(*kind),
            _ => None,
        }
    }

    /// Get the error code if this is a coded error.
    pub fn error_code(&self) -> Option<&'static str> {
        match self {
            Self::Service { code, .. } => Some(code),
            _ => None,
        }
    }

    /// True when the resource is gone, e.g. a table deleted between
    /// listing and metadata fetch.
    pub fn is_not_found(&self) -> bool {
        self.service_kind() == Some(ServiceErrorCode::NotFound)
    }
}
