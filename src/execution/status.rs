use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle of an executor.
///
/// `NotStarted -> Active -> Closed* -> Terminated`. Every closed state and
/// `Terminated` are terminal: an executor never re-opens.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutorStatus {
    NotStarted,
    Active,
    ClosedByTp,
    ClosedBySl,
    ClosedByTime,
    ClosedByCancel,
    ClosedByFailure,
    /// Archived by the orchestrator after it was stored
    Terminated,
}

impl ExecutorStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, ExecutorStatus::NotStarted | ExecutorStatus::Active)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ExecutorStatus::NotStarted => "NOT_STARTED",
            ExecutorStatus::Active => "ACTIVE",
            ExecutorStatus::ClosedByTp => "CLOSED_BY_TP",
            ExecutorStatus::ClosedBySl => "CLOSED_BY_SL",
            ExecutorStatus::ClosedByTime => "CLOSED_BY_TIME",
            ExecutorStatus::ClosedByCancel => "CLOSED_BY_CANCEL",
            ExecutorStatus::ClosedByFailure => "CLOSED_BY_FAILURE",
            ExecutorStatus::Terminated => "TERMINATED",
        }
    }
}

impl fmt::Display for ExecutorStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why an executor closed. Survives the move to `Terminated`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum CloseType {
    StopLoss,
    TakeProfit,
    TimeLimit,
    /// Upstream stop request, or nothing was ever filled
    EarlyStop,
    /// Stopped with the exposure handed over as a held position
    PositionHold,
    Failed,
}

impl CloseType {
    /// Closed status this close reason lands in
    pub fn status(self) -> ExecutorStatus {
        match self {
            CloseType::StopLoss => ExecutorStatus::ClosedBySl,
            CloseType::TakeProfit => ExecutorStatus::ClosedByTp,
            CloseType::TimeLimit => ExecutorStatus::ClosedByTime,
            CloseType::EarlyStop | CloseType::PositionHold => ExecutorStatus::ClosedByCancel,
            CloseType::Failed => ExecutorStatus::ClosedByFailure,
        }
    }
}
