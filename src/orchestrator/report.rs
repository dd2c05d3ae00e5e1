use super::performance::PerformanceSnapshot;
use super::positions::HeldPosition;
use crate::execution::ExecutorInfo;
use crate::models::ControllerId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::watch;

/// Everything a controller may know about its own state
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ControllerReport {
    pub controller_id: ControllerId,
    pub performance: PerformanceSnapshot,
    /// Executors not yet stored, closed ones included
    pub executors: Vec<ExecutorInfo>,
    pub held_positions: Vec<HeldPosition>,
    /// Most recent rejected actions, oldest first
    pub recent_errors: Vec<String>,
    pub persistence_degraded: bool,
    pub updated_at: Option<DateTime<Utc>>,
}

impl ControllerReport {
    pub fn empty(controller_id: impl Into<ControllerId>) -> Self {
        Self {
            controller_id: controller_id.into(),
            ..Default::default()
        }
    }

    pub fn active_executors(&self) -> impl Iterator<Item = &ExecutorInfo> {
        self.executors.iter().filter(|e| e.is_active())
    }

    /// Executors that closed and wait to be stored
    pub fn closed_executors(&self) -> impl Iterator<Item = &ExecutorInfo> {
        self.executors.iter().filter(|e| e.status.is_terminal())
    }
}

/// Immutable set of reports published after each orchestrator step
#[derive(Debug, Clone, Default)]
pub struct ReportBoard {
    pub reports: HashMap<ControllerId, ControllerReport>,
    pub persistence_degraded: bool,
    pub published_at: Option<DateTime<Utc>>,
}

/// Read side of the published reports, cheap to clone and share
#[derive(Debug, Clone)]
pub struct ReportHandle {
    rx: watch::Receiver<Arc<ReportBoard>>,
}

impl ReportHandle {
    pub(crate) fn new(rx: watch::Receiver<Arc<ReportBoard>>) -> Self {
        Self { rx }
    }

    /// Copy of the latest report for `controller_id`
    pub fn report(&self, controller_id: &str) -> ControllerReport {
        let board = self.board();
        board
            .reports
            .get(controller_id)
            .cloned()
            .unwrap_or_else(|| ControllerReport {
                persistence_degraded: board.persistence_degraded,
                ..ControllerReport::empty(controller_id)
            })
    }

    pub fn board(&self) -> Arc<ReportBoard> {
        self.rx.borrow().clone()
    }

    pub fn is_persistence_degraded(&self) -> bool {
        self.rx.borrow().persistence_degraded
    }

    /// Wait for the next publication
    pub async fn changed(&mut self) -> bool {
        self.rx.changed().await.is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_readers_see_whole_boards() {
        let (tx, rx) = watch::channel(Arc::new(ReportBoard::default()));
        let mut handle = ReportHandle::new(rx);
        assert!(handle.report("ctrl").executors.is_empty());

        let mut board = ReportBoard {
            persistence_degraded: true,
            ..Default::default()
        };
        board.reports.insert(
            "ctrl".to_string(),
            ControllerReport {
                recent_errors: vec!["boom".to_string()],
                ..ControllerReport::empty("ctrl")
            },
        );
        let held = handle.board();
        tx.send(Arc::new(board)).unwrap();

        assert!(handle.changed().await);
        assert_eq!(handle.report("ctrl").recent_errors, vec!["boom".to_string()]);
        assert!(handle.report("other").persistence_degraded);
        // Boards already handed out are never mutated
        assert!(held.reports.is_empty());
    }
}
