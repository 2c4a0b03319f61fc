use crate::core::transport::TransportError;

use super::types::JobStatus;

/// Errors returned synchronously to the caller of an orchestrator operation.
#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error("{0} not found")]
    NotFound(String),
    #[error("{0}")]
    Validation(String),
    #[error("device {device} already has active job {job_id}")]
    Conflict { device: String, job_id: String },
    #[error("upgrade of {device} blocked by prechecks: {}", .failing.join("; "))]
    PrecheckGate { device: String, failing: Vec<String> },
    #[error("job {job_id} is {status:?} and cannot be {action}")]
    InvalidTransition {
        job_id: String,
        status: JobStatus,
        action: &'static str,
    },
    #[error("storage error: {0}")]
    Storage(String),
}

impl From<anyhow::Error> for OrchestratorError {
    fn from(err: anyhow::Error) -> Self {
        OrchestratorError::Storage(format!("{:#}", err))
    }
}

/// Reasons a background job ends in `Failed`.
#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("device state changed since prechecks: {}", .failing.join("; "))]
    StaleState { failing: Vec<String> },
    #[error("{0}")]
    Validation(String),
    #[error("{0}")]
    Device(String),
    #[error("storage error: {0}")]
    Storage(String),
}

impl From<anyhow::Error> for JobError {
    fn from(err: anyhow::Error) -> Self {
        JobError::Storage(format!("{:#}", err))
    }
}
