//! Strategy decision units.
//!
//! A controller turns market data and its own orchestrator report into
//! actions. It never touches the gateway or the recorder; the runner feeds it
//! and forwards whatever it emits to the action queue.

pub mod registry;
pub mod runner;
pub mod signal;
pub mod simple;
pub mod status;

pub use registry::{ControllerFactory, ControllerRegistry};
pub use runner::{ControllerHandle, ControllerRunner};
pub use signal::{MidMomentum, Signal, SignalSource};
pub use simple::{EntryOrder, SimpleTradingController, SimpleTradingParams};

use crate::error::OrchestratorError;
use crate::market_data::MarketDataError;
use crate::models::MarketSnapshot;
use crate::orchestrator::{Action, ControllerReport};
use serde_json::{Map, Value};
use thiserror::Error;

pub type ControllerParams = Map<String, Value>;

#[derive(Error, Debug)]
pub enum ControllerError {
    #[error("Unknown controller type: {0}")]
    UnknownType(String),

    #[error("Invalid parameters for controller '{controller_id}': {reason}")]
    InvalidParams {
        controller_id: String,
        reason: String,
    },

    #[error("Action submission failed: {0}")]
    Submit(#[from] OrchestratorError),

    #[error("Market data unavailable: {0}")]
    MarketData(#[from] MarketDataError),

    #[error("Controller '{0}' is no longer running")]
    Stopped(String),
}

/// Decision logic of one strategy instance
pub trait Controller: Send {
    fn id(&self) -> &str;

    fn instrument(&self) -> &str;

    /// Rebuild the processed view from the newest snapshot and report
    fn update_processed_data(&mut self, snapshot: &MarketSnapshot, report: &ControllerReport);

    /// Actions for this tick, in the order they must be applied.
    ///
    /// Only reads the processed view. Takes `&mut self` so a controller can
    /// remember what it already asked for until the report reflects it.
    fn determine_executor_actions(&mut self) -> Vec<Action>;

    /// Apply new parameters, effective from the next tick
    fn reconfigure(&mut self, params: &ControllerParams) -> Result<(), ControllerError>;

    fn format_status(&self) -> Vec<String>;
}
