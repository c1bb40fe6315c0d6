//! Error types for the orchestration core.

use crate::task::TaskId;
use thiserror::Error;

/// Errors from the task registry.
#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("task {0} already exists")]
    Duplicate(TaskId),

    #[error("task {0} not found")]
    NotFound(TaskId),
}

/// Errors from the artifact store.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("artifact not found: {0}")]
    NotFound(String),

    #[error("invalid artifact reference: {0}")]
    InvalidRef(String),
}

/// Errors surfaced by orchestrator entry points.
///
/// Pipeline failures do not appear here: they are recorded on the task
/// itself and delivered through the progress channel.
#[derive(Error, Debug)]
pub enum OrchestratorError {
    #[error("task {0} not found")]
    NotFound(TaskId),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl From<RegistryError> for OrchestratorError {
    fn from(err: RegistryError) -> Self {
        match err {
            RegistryError::NotFound(id) | RegistryError::Duplicate(id) => Self::NotFound(id),
        }
    }
}
