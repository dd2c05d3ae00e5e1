use super::{ClosedPositionRecord, ExecutorRecord, Recorder, RecorderError};
use crate::models::ExecutorId;
use crate::orchestrator::{HeldPosition, HeldSnapshot};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};

#[derive(Debug, Default)]
struct Store {
    executors: HashMap<ExecutorId, ExecutorRecord>,
    closed: Vec<ClosedPositionRecord>,
    held: HeldSnapshot,
}

/// Process-local recorder. State survives as long as the value does, which is
/// enough for paper trading and for restart tests sharing one instance.
#[derive(Debug, Default)]
pub struct InMemoryRecorder {
    store: Mutex<Store>,
    unavailable: AtomicBool,
}

impl InMemoryRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every call fail until switched back
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub fn executor(&self, id: ExecutorId) -> Option<ExecutorRecord> {
        self.store().executors.get(&id).cloned()
    }

    pub fn closed_positions(&self) -> Vec<ClosedPositionRecord> {
        self.store().closed.clone()
    }

    pub fn held_positions(&self) -> Vec<HeldPosition> {
        self.store().held.positions.clone()
    }

    fn store(&self) -> std::sync::MutexGuard<'_, Store> {
        self.store.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn check(&self) -> Result<(), RecorderError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(RecorderError::Connection("recorder marked unavailable".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl Recorder for InMemoryRecorder {
    async fn save_executor(&self, record: &ExecutorRecord) -> Result<(), RecorderError> {
        self.check()?;
        self.store().executors.insert(record.executor_id, record.clone());
        Ok(())
    }

    async fn load_pending_executors(&self) -> Result<Vec<ExecutorRecord>, RecorderError> {
        self.check()?;
        let mut records: Vec<ExecutorRecord> = self
            .store()
            .executors
            .values()
            .filter(|r| r.is_pending())
            .cloned()
            .collect();
        records.sort_by_key(|r| r.executor_id);
        Ok(records)
    }

    async fn save_closed_position(&self, record: &ClosedPositionRecord) -> Result<(), RecorderError> {
        self.check()?;
        let mut store = self.store();
        store.closed.retain(|r| r.executor_id != record.executor_id);
        store.closed.push(record.clone());
        Ok(())
    }

    async fn load_closed_positions(&self) -> Result<Vec<ClosedPositionRecord>, RecorderError> {
        self.check()?;
        Ok(self.store().closed.clone())
    }

    async fn save_held_positions(&self, snapshot: &HeldSnapshot) -> Result<(), RecorderError> {
        self.check()?;
        self.store().held = snapshot.clone();
        Ok(())
    }

    async fn load_held_positions(&self) -> Result<HeldSnapshot, RecorderError> {
        self.check()?;
        Ok(self.store().held.clone())
    }
}
