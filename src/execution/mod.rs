// Executor state machine and the pieces it is built from
pub mod barrier;
pub mod config;
pub mod executor;
pub mod retry;
pub mod status;

pub use config::{DcaLevel, ExecutorConfig, ExecutorKind, TripleBarrierConfig};
pub use executor::{Executor, ExecutorInfo, OrderPurpose, TrackedOrder, TrackedState};
pub use retry::RetryPolicy;
pub use status::{CloseType, ExecutorStatus};
