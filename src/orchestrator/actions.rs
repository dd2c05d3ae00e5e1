use crate::error::OrchestratorError;
use crate::execution::ExecutorConfig;
use crate::models::{ControllerId, ExecutorId};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::{self, error::TrySendError};

/// Command from a controller to the orchestrator
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum Action {
    Create(ExecutorConfig),
    Stop {
        executor_id: ExecutorId,
        keep_position: bool,
    },
    Store {
        executor_id: ExecutorId,
    },
}

impl Action {
    pub fn create(config: ExecutorConfig) -> Self {
        Action::Create(config)
    }

    pub fn stop(executor_id: ExecutorId, keep_position: bool) -> Self {
        Action::Stop {
            executor_id,
            keep_position,
        }
    }

    pub fn store(executor_id: ExecutorId) -> Self {
        Action::Store { executor_id }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Action::Create(_) => "create",
            Action::Stop { .. } => "stop",
            Action::Store { .. } => "store",
        }
    }
}

/// Actions one controller emitted in one tick, applied in order
#[derive(Debug, Clone, PartialEq)]
pub struct ActionBatch {
    pub controller_id: ControllerId,
    pub actions: Vec<Action>,
}

/// Successful result of an applied action
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionAck {
    Created(ExecutorId),
    Stopped(ExecutorId),
    Stored(ExecutorId),
}

/// Result of applying one action, as returned by `process_pending`
#[derive(Debug, Clone, PartialEq)]
pub struct ActionOutcome {
    pub controller_id: ControllerId,
    pub action: &'static str,
    pub result: Result<ActionAck, OrchestratorError>,
}

impl ActionOutcome {
    pub fn is_ok(&self) -> bool {
        self.result.is_ok()
    }
}

/// Producer side of the action queue, one per controller.
///
/// Submission never waits: a full queue drops the batch and reports
/// `QueueFull` back to the caller.
#[derive(Debug, Clone)]
pub struct ActionSender {
    controller_id: ControllerId,
    tx: mpsc::Sender<ActionBatch>,
}

impl ActionSender {
    pub(crate) fn new(controller_id: ControllerId, tx: mpsc::Sender<ActionBatch>) -> Self {
        Self { controller_id, tx }
    }

    pub fn controller_id(&self) -> &str {
        &self.controller_id
    }

    pub fn submit(&self, action: Action) -> Result<(), OrchestratorError> {
        self.submit_batch(vec![action])
    }

    pub fn submit_batch(&self, actions: Vec<Action>) -> Result<(), OrchestratorError> {
        if actions.is_empty() {
            return Ok(());
        }
        let batch = ActionBatch {
            controller_id: self.controller_id.clone(),
            actions,
        };

        match self.tx.try_send(batch) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(batch)) => {
                tracing::warn!(
                    controller_id = %self.controller_id,
                    dropped = batch.actions.len(),
                    "Action queue full, batch dropped"
                );
                Err(OrchestratorError::QueueFull {
                    controller_id: self.controller_id.clone(),
                    dropped: batch.actions.len(),
                })
            }
            Err(TrySendError::Closed(_)) => Err(OrchestratorError::QueueClosed),
        }
    }
}
