//! Durable storage for executor state, closed positions and held positions.
//!
//! Executor records carry the full executor as an opaque JSON payload. The
//! backends only index the few columns they need to find pending records.
pub mod memory;
pub mod postgres;
pub mod redis;

pub use self::memory::InMemoryRecorder;
pub use self::postgres::PostgresRecorder;
pub use self::redis::RedisRecorder;

use crate::execution::{CloseType, Executor, ExecutorInfo, ExecutorStatus};
use crate::models::{ControllerId, ExecutorId, TradeSide};
use crate::orchestrator::HeldSnapshot;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RecorderError {
    #[error("Recorder connection failed: {0}")]
    Connection(String),

    #[error("Recorder backend error: {0}")]
    Backend(String),

    #[error("Record serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<::redis::RedisError> for RecorderError {
    fn from(err: ::redis::RedisError) -> Self {
        RecorderError::Backend(err.to_string())
    }
}

impl From<sqlx::Error> for RecorderError {
    fn from(err: sqlx::Error) -> Self {
        RecorderError::Backend(err.to_string())
    }
}

impl From<sqlx::migrate::MigrateError> for RecorderError {
    fn from(err: sqlx::migrate::MigrateError) -> Self {
        RecorderError::Backend(err.to_string())
    }
}

/// Snapshot of one executor as stored
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExecutorRecord {
    pub executor_id: ExecutorId,
    pub controller_id: ControllerId,
    pub instrument: String,
    pub status: ExecutorStatus,
    pub revision: u64,
    pub updated_at: DateTime<Utc>,
    pub payload: serde_json::Value,
}

impl ExecutorRecord {
    pub fn from_executor(executor: &Executor) -> Result<Self, RecorderError> {
        Ok(Self {
            executor_id: executor.id(),
            controller_id: executor.controller_id().to_string(),
            instrument: executor.config().instrument.clone(),
            status: executor.status(),
            revision: executor.revision(),
            updated_at: Utc::now(),
            payload: serde_json::to_value(executor)?,
        })
    }

    pub fn to_executor(&self) -> Result<Executor, RecorderError> {
        Ok(serde_json::from_value(self.payload.clone())?)
    }

    /// Not stored yet: still to be driven, or closed without a Store
    pub fn is_pending(&self) -> bool {
        self.status != ExecutorStatus::Terminated
    }
}

/// Final outcome of a stored executor
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ClosedPositionRecord {
    pub executor_id: ExecutorId,
    pub controller_id: ControllerId,
    pub instrument: String,
    pub side: TradeSide,
    pub close_type: Option<CloseType>,
    pub filled_amount: Decimal,
    pub entry_price: Option<Decimal>,
    pub exit_price: Option<Decimal>,
    pub realized_pnl: Decimal,
    pub fees: Decimal,
    pub volume_quote: Decimal,
    pub opened_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
}

impl From<&ExecutorInfo> for ClosedPositionRecord {
    fn from(info: &ExecutorInfo) -> Self {
        Self {
            executor_id: info.id,
            controller_id: info.controller_id.clone(),
            instrument: info.instrument.clone(),
            side: info.side,
            close_type: info.close_type,
            filled_amount: info.filled_amount,
            entry_price: info.entry_price,
            exit_price: info.exit_price,
            realized_pnl: info.realized_pnl,
            fees: info.fees,
            volume_quote: info.volume_quote,
            opened_at: info.created_at,
            closed_at: info.closed_at,
        }
    }
}

/// Key/value style store the orchestrator persists through
#[async_trait]
pub trait Recorder: Send + Sync {
    /// Insert or replace the record of one executor
    async fn save_executor(&self, record: &ExecutorRecord) -> Result<(), RecorderError>;

    /// Records of executors that were never stored
    async fn load_pending_executors(&self) -> Result<Vec<ExecutorRecord>, RecorderError>;

    async fn save_closed_position(&self, record: &ClosedPositionRecord) -> Result<(), RecorderError>;

    /// Every closed position ever stored, oldest first
    async fn load_closed_positions(&self) -> Result<Vec<ClosedPositionRecord>, RecorderError>;

    /// Replace the full held-book snapshot
    async fn save_held_positions(&self, snapshot: &HeldSnapshot) -> Result<(), RecorderError>;

    async fn load_held_positions(&self) -> Result<HeldSnapshot, RecorderError>;
}
