//! Executor orchestration.
//!
//! The orchestrator owns every executor and the held-position book. Controllers
//! submit actions through a bounded queue and read back published reports.

pub mod actions;
pub mod engine;
pub mod performance;
pub mod positions;
pub mod report;

pub use actions::{Action, ActionAck, ActionBatch, ActionOutcome, ActionSender};
pub use engine::{Orchestrator, RecoverySummary, ShutdownSummary, TickSummary};
pub use performance::{ClosedTotals, PerformanceCache, PerformanceSnapshot};
pub use positions::{HeldPosition, HeldSnapshot, PositionBook};
pub use report::{ControllerReport, ReportBoard, ReportHandle};
