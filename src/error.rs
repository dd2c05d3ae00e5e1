use crate::execution::ExecutorStatus;
use crate::models::{ControllerId, ExecutorId};
use thiserror::Error;

/// Errors surfaced by the orchestrator to the controller that submitted an action.
///
/// None of these are fatal to the orchestrator loop except `RecorderUnavailable`
/// returned from recovery at boot.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum OrchestratorError {
    #[error("Invalid executor config: {0}")]
    InvalidConfig(String),

    #[error("Controller '{controller_id}' already runs an equivalent executor ({existing})")]
    DuplicateExecutor {
        controller_id: ControllerId,
        existing: ExecutorId,
    },

    #[error("Executor {0} not found")]
    UnknownExecutor(ExecutorId),

    #[error("Executor {executor_id} is not terminal (status: {status:?})")]
    NotTerminal {
        executor_id: ExecutorId,
        status: ExecutorStatus,
    },

    #[error("Action queue full, dropped {dropped} action(s) from '{controller_id}'")]
    QueueFull {
        controller_id: ControllerId,
        dropped: usize,
    },

    #[error("Action queue closed")]
    QueueClosed,

    #[error("Recorder unavailable: {0}")]
    RecorderUnavailable(String),
}

impl From<crate::persistence::RecorderError> for OrchestratorError {
    fn from(err: crate::persistence::RecorderError) -> Self {
        OrchestratorError::RecorderUnavailable(err.to_string())
    }
}
