//! Error taxonomy for the orchestrator core (spec.md §7).
//!
//! Each subsystem owns a narrower error enum and converts into
//! `OrchestratorError` at the boundary, the way `cloud-service`'s
//! `grpcapi::worker` converts `WorkerServiceError`/`ComponentError` into
//! the gRPC wire error type.

use thiserror::Error;

use crate::model::{EmptyIdError, JobTransitionError};

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("validation error: {0}")]
    Validation(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("business rule violation: {0}")]
    BusinessRule(String),

    #[error("insufficient resources: {0}")]
    InsufficientResources(String),

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("worker lost: {0}")]
    WorkerLost(String),

    #[error("worker disconnected: {0}")]
    WorkerDisconnected(String),

    #[error("operation failed")]
    RepositoryError(#[from] anyhow::Error),
}

impl From<EmptyIdError> for OrchestratorError {
    fn from(_: EmptyIdError) -> Self {
        OrchestratorError::Validation("identifier must not be empty".to_string())
    }
}

impl From<JobTransitionError> for OrchestratorError {
    fn from(err: JobTransitionError) -> Self {
        OrchestratorError::BusinessRule(err.to_string())
    }
}

/// Maps an error to the taxonomy's category, the way an (out-of-scope)
/// HTTP façade would pick a status code (spec.md §7). Exposed so callers
/// outside this crate can do the mapping without re-matching variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Validation,
    NotFound,
    Conflict,
    Forbidden,
    InsufficientResources,
    Internal,
}

impl OrchestratorError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            OrchestratorError::Validation(_) | OrchestratorError::ProtocolViolation(_) => {
                ErrorCategory::Validation
            }
            OrchestratorError::NotFound(_) => ErrorCategory::NotFound,
            OrchestratorError::Conflict(_) => ErrorCategory::Conflict,
            OrchestratorError::BusinessRule(_) => ErrorCategory::Forbidden,
            OrchestratorError::InsufficientResources(_) => ErrorCategory::InsufficientResources,
            OrchestratorError::Timeout(_)
            | OrchestratorError::WorkerLost(_)
            | OrchestratorError::WorkerDisconnected(_)
            | OrchestratorError::RepositoryError(_) => ErrorCategory::Internal,
        }
    }
}
