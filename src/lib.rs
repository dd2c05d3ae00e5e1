// Core modules
pub mod controller;
pub mod error;
pub mod execution;
pub mod gateway;
pub mod market_data;
pub mod models;
pub mod orchestrator;
pub mod persistence;
pub mod scheduler;
pub mod settings;

// Re-export commonly used types
pub use error::OrchestratorError;
pub use models::*;
pub use orchestrator::{Action, Orchestrator};
pub use settings::Settings;
