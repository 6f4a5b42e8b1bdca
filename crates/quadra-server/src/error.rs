//! Error types for the Quadra server
//!
//! This module contains the error types used throughout the server.

use thiserror::Error;

use quadra_core::CoreError;
use quadra_lock::LockError;
use quadra_reconcile::ReconcileError;

/// Server error types
#[derive(Error, Debug)]
pub enum ServerError {
    /// Resource not found
    #[error("{0} not found")]
    NotFound(String),

    /// Validation error
    #[error("Validation error: {0}")]
    ValidationError(String),

    /// Unauthorized error
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// Upstream API error
    #[error("Upstream error: {0}")]
    UpstreamError(String),

    /// Job engine error
    #[error("Job engine error: {0}")]
    EngineError(String),

    /// Lock service error
    #[error("Lock service error: {0}")]
    LockServiceError(String),

    /// Reconciliation error
    #[error("Reconciliation error: {0}")]
    ReconcileError(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Internal server error
    #[error("Internal server error: {0}")]
    InternalError(String),
}

/// Result type for server operations
pub type ServerResult<T> = Result<T, ServerError>;

// Implement conversions from other error types
impl From<CoreError> for ServerError {
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::JobNotFound(id) => ServerError::NotFound(format!("Job {}", id)),
            CoreError::UnknownJob(name) => {
                ServerError::ValidationError(format!("Unknown job name: {}", name))
            }
            CoreError::InvalidTransition { job_id, reason } => {
                ServerError::ValidationError(format!("Job {}: {}", job_id, reason))
            }
            _ => ServerError::EngineError(format!("{}", err)),
        }
    }
}

impl From<LockError> for ServerError {
    fn from(err: LockError) -> Self {
        ServerError::LockServiceError(format!("{}", err))
    }
}

impl From<ReconcileError> for ServerError {
    fn from(err: ReconcileError) -> Self {
        ServerError::ReconcileError(format!("{}", err))
    }
}

impl From<reqwest::Error> for ServerError {
    fn from(err: reqwest::Error) -> Self {
        ServerError::UpstreamError(format!("HTTP request error: {}", err))
    }
}

impl From<serde_json::Error> for ServerError {
    fn from(err: serde_json::Error) -> Self {
        ServerError::ValidationError(format!("JSON error: {}", err))
    }
}

impl From<std::io::Error> for ServerError {
    fn from(err: std::io::Error) -> Self {
        ServerError::InternalError(format!("IO error: {}", err))
    }
}

impl From<anyhow::Error> for ServerError {
    fn from(err: anyhow::Error) -> Self {
        ServerError::InternalError(format!("Error: {}", err))
    }
}
