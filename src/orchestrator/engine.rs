use super::actions::{Action, ActionAck, ActionBatch, ActionOutcome, ActionSender};
use super::performance::{ClosedTotals, PerformanceCache, PerformanceSnapshot};
use super::positions::{HeldPosition, HeldSnapshot, PositionBook};
use super::report::{ControllerReport, ReportBoard, ReportHandle};
use crate::error::OrchestratorError;
use crate::execution::{Executor, ExecutorConfig, ExecutorInfo, ExecutorStatus, RetryPolicy};
use crate::gateway::ExchangeGateway;
use crate::market_data::MarketDataProvider;
use crate::models::{ControllerId, ExecutorId};
use crate::persistence::{ClosedPositionRecord, ExecutorRecord, Recorder, RecorderError};
use crate::scheduler;
use crate::settings::OrchestratorSettings;
use chrono::Utc;
use futures::future::join_all;
use futures::FutureExt;
use std::any::Any;
use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::{timeout, timeout_at, Instant};

const RECORDER_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoverySummary {
    pub executors: usize,
    /// Executors closed before the restart, stored during recovery
    pub archived: usize,
    pub closed_positions: usize,
    pub held_positions: usize,
    /// Records that could not be turned back into executors
    pub skipped: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickSummary {
    pub ticked: usize,
    /// Executors that panicked during their tick, now closed as failed
    pub failed: Vec<(ExecutorId, String)>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShutdownSummary {
    pub cancelled: usize,
    pub failed: Vec<ExecutorId>,
    pub persistence_degraded: bool,
}

#[derive(Debug, Clone)]
enum PendingWrite {
    Executor(ExecutorRecord),
    Closed(ClosedPositionRecord),
    Held(HeldSnapshot),
}

/// Writes the recorder refused, retried in order on a backoff
#[derive(Debug)]
struct Outbox {
    writes: VecDeque<PendingWrite>,
    failures: u32,
    next_attempt_at: Option<Instant>,
    retry: RetryPolicy,
}

impl Outbox {
    fn push(&mut self, write: PendingWrite) {
        match &write {
            PendingWrite::Executor(record) => {
                let existing = self.writes.iter_mut().find(|w| {
                    matches!(w, PendingWrite::Executor(r) if r.executor_id == record.executor_id)
                });
                if let Some(slot) = existing {
                    *slot = write;
                    return;
                }
            }
            PendingWrite::Held(_) => {
                self.writes.retain(|w| !matches!(w, PendingWrite::Held(_)));
            }
            PendingWrite::Closed(_) => {}
        }
        self.writes.push_back(write);
    }

    fn schedule_retry(&mut self) {
        self.failures = self.failures.saturating_add(1);
        self.next_attempt_at = Some(Instant::now() + self.retry.backoff(self.failures));
    }
}

/// Owner of every executor and held position.
///
/// Single writer: the executor set and the held book only change inside
/// `process_pending`, `tick_all` and `shutdown`, all driven from the loop that
/// owns this value. Controllers talk to it through `ActionSender`s and read
/// state through `ReportHandle`s.
pub struct Orchestrator {
    config: OrchestratorSettings,
    gateway: Arc<dyn ExchangeGateway>,
    market: Arc<dyn MarketDataProvider>,
    recorder: Arc<dyn Recorder>,
    executors: HashMap<ExecutorId, Executor>,
    held: PositionBook,
    stored: HashMap<ControllerId, ClosedTotals>,
    performance: PerformanceCache,
    recent_errors: HashMap<ControllerId, VecDeque<String>>,
    controllers: BTreeSet<ControllerId>,
    persisted: HashMap<ExecutorId, u64>,
    outbox: Outbox,
    tx: mpsc::Sender<ActionBatch>,
    rx: mpsc::Receiver<ActionBatch>,
    reports: watch::Sender<Arc<ReportBoard>>,
}

impl Orchestrator {
    pub fn new(
        config: OrchestratorSettings,
        gateway: Arc<dyn ExchangeGateway>,
        market: Arc<dyn MarketDataProvider>,
        recorder: Arc<dyn Recorder>,
    ) -> Self {
        let (tx, rx) = mpsc::channel(config.queue_capacity.max(1));
        let (reports, _) = watch::channel(Arc::new(ReportBoard::default()));

        Self {
            config,
            gateway,
            market,
            recorder,
            executors: HashMap::new(),
            held: PositionBook::new(),
            stored: HashMap::new(),
            performance: PerformanceCache::new(),
            recent_errors: HashMap::new(),
            controllers: BTreeSet::new(),
            persisted: HashMap::new(),
            outbox: Outbox {
                writes: VecDeque::new(),
                failures: 0,
                next_attempt_at: None,
                retry: crate::settings::RecorderSettings::default().retry,
            },
            tx,
            rx,
            reports,
        }
    }

    /// Backoff used for failed recorder writes
    pub fn with_recorder_retry(mut self, retry: RetryPolicy) -> Self {
        self.outbox.retry = retry;
        self
    }

    /// Queue handle for one controller
    pub fn sender(&mut self, controller_id: impl Into<ControllerId>) -> ActionSender {
        let controller_id = controller_id.into();
        self.controllers.insert(controller_id.clone());
        ActionSender::new(controller_id, self.tx.clone())
    }

    pub fn submit(&self, controller_id: &str, action: Action) -> Result<(), OrchestratorError> {
        ActionSender::new(controller_id.to_string(), self.tx.clone()).submit(action)
    }

    pub fn reports(&self) -> ReportHandle {
        ReportHandle::new(self.reports.subscribe())
    }

    pub fn executor(&self, id: ExecutorId) -> Option<&Executor> {
        self.executors.get(&id)
    }

    /// Size of the active set, closed executors awaiting storage included
    pub fn executor_count(&self) -> usize {
        self.executors.len()
    }

    pub fn held_positions(&self) -> Vec<HeldPosition> {
        self.held.all()
    }

    pub fn is_persistence_degraded(&self) -> bool {
        !self.outbox.writes.is_empty()
    }

    /// Reload non-terminal executors, closed-position totals and the held
    /// book. Executors that closed before the restart but were never stored
    /// are stored now. Failing to read the recorder here is fatal to startup.
    pub async fn recover(&mut self) -> Result<RecoverySummary, OrchestratorError> {
        let records = timeout(RECORDER_TIMEOUT, self.recorder.load_pending_executors())
            .await
            .map_err(|_| {
                OrchestratorError::RecorderUnavailable("timed out loading executors".to_string())
            })??;
        let closed = timeout(RECORDER_TIMEOUT, self.recorder.load_closed_positions())
            .await
            .map_err(|_| {
                OrchestratorError::RecorderUnavailable("timed out loading closed positions".to_string())
            })??;
        let held = timeout(RECORDER_TIMEOUT, self.recorder.load_held_positions())
            .await
            .map_err(|_| {
                OrchestratorError::RecorderUnavailable("timed out loading held positions".to_string())
            })??;

        let mut summary = RecoverySummary::default();
        let mut unstored = Vec::new();
        for record in records {
            if !record.is_pending() {
                continue;
            }
            match record.to_executor() {
                Ok(executor) if executor.status() == ExecutorStatus::Terminated => {}
                Ok(executor) if executor.status().is_terminal() => unstored.push(executor),
                Ok(mut executor) => {
                    executor.set_retry_policy(self.config.retry.clone());
                    let id = executor.id();
                    let controller_id = executor.controller_id().to_string();
                    self.persisted.insert(id, executor.revision());
                    self.performance.invalidate(&controller_id);
                    self.controllers.insert(controller_id);
                    self.executors.insert(id, executor);
                    summary.executors += 1;
                }
                Err(e) => {
                    tracing::error!(
                        executor_id = %record.executor_id,
                        error = %e,
                        "Skipping unreadable executor record"
                    );
                    summary.skipped += 1;
                }
            }
        }

        let mut recorded = HashSet::new();
        for record in closed {
            if !recorded.insert(record.executor_id) {
                continue;
            }
            self.performance.invalidate(&record.controller_id);
            self.controllers.insert(record.controller_id.clone());
            self.stored
                .entry(record.controller_id.clone())
                .or_default()
                .add(&record);
            summary.closed_positions += 1;
        }

        for mut executor in unstored {
            executor.terminate()?;
            tracing::info!(
                executor_id = %executor.id(),
                controller_id = %executor.controller_id(),
                close_type = ?executor.close_type(),
                "Storing executor closed before restart"
            );
            let already_recorded = recorded.contains(&executor.id());
            self.archive(executor, already_recorded).await;
            summary.archived += 1;
        }

        summary.held_positions = held.positions.len();
        for controller_id in held.realized.keys() {
            self.performance.invalidate(controller_id);
        }
        self.held = PositionBook::restore(held);
        self.publish_reports();

        tracing::info!(
            executors = summary.executors,
            archived = summary.archived,
            closed_positions = summary.closed_positions,
            held_positions = summary.held_positions,
            skipped = summary.skipped,
            "Recovered orchestrator state"
        );
        Ok(summary)
    }

    /// One loop iteration: apply queued actions, tick executors, retry
    /// pending writes, publish reports
    pub async fn step(&mut self) -> Vec<ActionOutcome> {
        let outcomes = self.process_pending().await;
        self.tick_all().await;
        self.flush_outbox().await;
        self.publish_reports();
        outcomes
    }

    /// Apply queued batches: in order within a batch, in arrival order across
    /// batches. Drains at most one queue's worth per call.
    pub async fn process_pending(&mut self) -> Vec<ActionOutcome> {
        let mut outcomes = Vec::new();

        for _ in 0..self.config.queue_capacity.max(1) {
            let Ok(ActionBatch {
                controller_id,
                actions,
            }) = self.rx.try_recv()
            else {
                break;
            };

            for action in actions {
                let name = action.name();
                let result = self.apply(&controller_id, action).await;
                if let Err(e) = &result {
                    tracing::warn!(
                        controller_id = %controller_id,
                        action = name,
                        error = %e,
                        "Action rejected"
                    );
                    self.remember_error(&controller_id, e);
                }
                outcomes.push(ActionOutcome {
                    controller_id: controller_id.clone(),
                    action: name,
                    result,
                });
            }
        }

        outcomes
    }

    async fn apply(&mut self, controller_id: &str, action: Action) -> Result<ActionAck, OrchestratorError> {
        match action {
            Action::Create(config) => self.create_executor(controller_id, config).await,
            Action::Stop {
                executor_id,
                keep_position,
            } => self.stop_executor(controller_id, executor_id, keep_position).await,
            Action::Store { executor_id } => self.store_executor(controller_id, executor_id).await,
        }
    }

    async fn create_executor(
        &mut self,
        controller_id: &str,
        config: ExecutorConfig,
    ) -> Result<ActionAck, OrchestratorError> {
        if config.controller_id != controller_id {
            return Err(OrchestratorError::InvalidConfig(format!(
                "config belongs to '{}', submitted by '{}'",
                config.controller_id, controller_id
            )));
        }
        config.validate()?;

        let duplicate = self.executors.values().find(|e| {
            e.controller_id() == controller_id
                && !e.status().is_terminal()
                && e.config().is_equivalent(&config)
        });
        if let Some(existing) = duplicate {
            return Err(OrchestratorError::DuplicateExecutor {
                controller_id: controller_id.to_string(),
                existing: existing.id(),
            });
        }

        let mut executor = Executor::new(config, self.config.retry.clone())?;
        if executor.config().adopt_held_position {
            let (instrument, side) = (executor.config().instrument.clone(), executor.config().side);
            if let Some(held) = self.held.take(controller_id, &instrument, side) {
                executor.adopt(&held);
                self.persist_held().await;
            }
        }

        let started = AssertUnwindSafe(executor.start(self.gateway.as_ref(), self.config.gateway_timeout()))
            .catch_unwind()
            .await;
        match started {
            Ok(result) => result?,
            Err(payload) => {
                executor.mark_failed(format!("panicked during start: {}", panic_message(payload)));
            }
        }

        let id = executor.id();
        self.executors.insert(id, executor);
        self.controllers.insert(controller_id.to_string());
        self.performance.invalidate(controller_id);
        self.persist_executor(id).await;

        Ok(ActionAck::Created(id))
    }

    async fn stop_executor(
        &mut self,
        controller_id: &str,
        executor_id: ExecutorId,
        keep_position: bool,
    ) -> Result<ActionAck, OrchestratorError> {
        let instrument = match self.executors.get(&executor_id) {
            Some(executor) if executor.controller_id() == controller_id => {
                executor.config().instrument.clone()
            }
            _ => return Err(OrchestratorError::UnknownExecutor(executor_id)),
        };
        let snapshot = self.market.get_snapshot(&instrument).await.ok();
        let deadline = self.config.gateway_timeout();

        let executor = self
            .executors
            .get_mut(&executor_id)
            .ok_or(OrchestratorError::UnknownExecutor(executor_id))?;
        let stopped = AssertUnwindSafe(executor.stop(self.gateway.as_ref(), keep_position, snapshot.as_ref(), deadline))
            .catch_unwind()
            .await;
        let held = match stopped {
            Ok(held) => held,
            Err(payload) => {
                executor.mark_failed(format!("panicked during stop: {}", panic_message(payload)));
                None
            }
        };

        if let Some(held) = held {
            tracing::info!(
                executor_id = %executor_id,
                instrument = %held.instrument,
                amount = %held.amount,
                "Position handed over to held book"
            );
            self.held.apply(held);
            self.persist_held().await;
        }
        self.performance.invalidate(controller_id);
        self.persist_executor(executor_id).await;

        Ok(ActionAck::Stopped(executor_id))
    }

    async fn store_executor(
        &mut self,
        controller_id: &str,
        executor_id: ExecutorId,
    ) -> Result<ActionAck, OrchestratorError> {
        let executor = match self.executors.get_mut(&executor_id) {
            Some(executor) if executor.controller_id() == controller_id => executor,
            _ => return Err(OrchestratorError::UnknownExecutor(executor_id)),
        };
        executor.terminate()?;
        if let Some(executor) = self.executors.remove(&executor_id) {
            self.archive(executor, false).await;
        }

        tracing::info!(executor_id = %executor_id, controller_id = %controller_id, "Executor stored");
        Ok(ActionAck::Stored(executor_id))
    }

    /// Tick every active executor concurrently. A panic inside one tick closes
    /// that executor as failed and leaves the others untouched.
    pub async fn tick_all(&mut self) -> TickSummary {
        let instruments: BTreeSet<String> = self
            .executors
            .values()
            .filter(|e| e.status() == ExecutorStatus::Active)
            .map(|e| e.config().instrument.clone())
            .collect();

        let mut snapshots = HashMap::new();
        for instrument in instruments {
            match self.market.get_snapshot(&instrument).await {
                Ok(snapshot) => {
                    snapshots.insert(instrument, snapshot);
                }
                Err(e) => {
                    tracing::warn!(instrument = %instrument, error = %e, "No snapshot, skipping executors");
                }
            }
        }

        let deadline = self.config.gateway_timeout();
        let gateway = self.gateway.as_ref();
        let ticks = self
            .executors
            .values_mut()
            .filter(|e| e.status() == ExecutorStatus::Active)
            .filter_map(|e| {
                let snapshot = snapshots.get(&e.config().instrument)?;
                Some((e, snapshot))
            })
            .map(|(executor, snapshot)| async move {
                let id = executor.id();
                let result = AssertUnwindSafe(executor.tick(gateway, snapshot, deadline))
                    .catch_unwind()
                    .await;
                (id, result.err().map(panic_message))
            });
        let results = join_all(ticks).await;

        let mut summary = TickSummary {
            ticked: results.len(),
            ..Default::default()
        };
        for (id, panic) in results {
            if let Some(executor) = self.executors.get_mut(&id) {
                if let Some(message) = panic {
                    executor.mark_failed(format!("panicked during tick: {}", message));
                    summary.failed.push((id, message));
                }
                let controller_id = executor.controller_id().to_string();
                self.performance.invalidate(&controller_id);
            }
            self.persist_executor(id).await;
        }

        summary
    }

    /// Fresh report for one controller
    pub fn report(&mut self, controller_id: &str) -> ControllerReport {
        let mut executors: Vec<ExecutorInfo> = self
            .executors
            .values()
            .filter(|e| e.controller_id() == controller_id)
            .map(|e| e.info())
            .collect();
        executors.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));

        let stored = self.stored.get(controller_id);
        let held_realized = self.held.realized_for(controller_id);
        let current = &executors;
        let performance = self.performance.get_or_compute(controller_id, || {
            PerformanceSnapshot::compute(stored, current.iter(), held_realized)
        });

        ControllerReport {
            controller_id: controller_id.to_string(),
            performance,
            held_positions: self.held.positions_for(controller_id),
            recent_errors: self
                .recent_errors
                .get(controller_id)
                .map(|errors| errors.iter().cloned().collect())
                .unwrap_or_default(),
            persistence_degraded: self.is_persistence_degraded(),
            updated_at: Some(Utc::now()),
            executors,
        }
    }

    /// Build every controller's report and publish them as one board
    pub fn publish_reports(&mut self) {
        let mut controllers: BTreeSet<ControllerId> = self.controllers.clone();
        controllers.extend(self.executors.values().map(|e| e.controller_id().to_string()));
        controllers.extend(self.stored.keys().cloned());
        controllers.extend(self.held.controllers().cloned());

        let reports = controllers
            .into_iter()
            .map(|cid| {
                let report = self.report(&cid);
                (cid, report)
            })
            .collect();

        self.reports.send_replace(Arc::new(ReportBoard {
            reports,
            persistence_degraded: self.is_persistence_degraded(),
            published_at: Some(Utc::now()),
        }));
    }

    /// Retry queued writes once their backoff elapsed. True when nothing is
    /// left queued.
    pub async fn flush_outbox(&mut self) -> bool {
        if self.outbox.writes.is_empty() {
            return true;
        }
        if let Some(at) = self.outbox.next_attempt_at {
            if Instant::now() < at {
                return false;
            }
        }

        while let Some(write) = self.outbox.writes.front() {
            let result = self.try_write(write).await;
            match result {
                Ok(()) => {
                    self.outbox.writes.pop_front();
                }
                Err(e) => {
                    self.outbox.schedule_retry();
                    tracing::warn!(
                        queued = self.outbox.writes.len(),
                        attempt = self.outbox.failures,
                        error = %e,
                        "Recorder still unavailable"
                    );
                    return false;
                }
            }
        }

        self.outbox.failures = 0;
        self.outbox.next_attempt_at = None;
        tracing::info!("Recorder writes caught up, persistence restored");
        true
    }

    /// Cancel open orders of every active executor within `deadline`, close
    /// the unconfirmed ones as failed, then persist the final state
    pub async fn shutdown(&mut self, deadline: Duration) -> ShutdownSummary {
        tracing::info!(
            executors = self.executors.len(),
            deadline_ms = deadline.as_millis() as u64,
            "Orchestrator shutting down"
        );
        self.rx.close();

        let until = Instant::now() + deadline;
        let call_deadline = self.config.gateway_timeout();
        let gateway = self.gateway.as_ref();
        let cancels = self
            .executors
            .values_mut()
            .filter(|e| e.status() == ExecutorStatus::Active)
            .map(|executor| async move {
                let id = executor.id();
                let confirmed = matches!(
                    timeout_at(until, executor.cancel_all(gateway, call_deadline)).await,
                    Ok(true)
                );
                (id, confirmed)
            });
        let results = join_all(cancels).await;

        let mut summary = ShutdownSummary::default();
        for (id, confirmed) in results {
            if confirmed {
                summary.cancelled += 1;
            } else if let Some(executor) = self.executors.get_mut(&id) {
                executor.mark_failed("cancellation not confirmed before shutdown deadline");
                summary.failed.push(id);
            }
        }

        let ids: Vec<ExecutorId> = self.executors.keys().copied().collect();
        for id in ids {
            self.persist_executor(id).await;
        }
        self.persist_held().await;

        self.outbox.next_attempt_at = None;
        self.flush_outbox().await;
        summary.persistence_degraded = self.is_persistence_degraded();
        self.publish_reports();

        tracing::info!(
            cancelled = summary.cancelled,
            failed = summary.failed.len(),
            persistence_degraded = summary.persistence_degraded,
            "Orchestrator stopped"
        );
        summary
    }

    /// Drive the orchestrator until `shutdown` flips to true
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> ShutdownSummary {
        let mut ticker = scheduler::ticker(self.config.tick_interval());
        tracing::info!(
            tick_interval_ms = self.config.tick_interval_ms,
            queue_capacity = self.config.queue_capacity,
            "Orchestrator loop started"
        );

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.step().await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        let deadline = self.config.shutdown_deadline();
        self.shutdown(deadline).await
    }

    async fn persist_executor(&mut self, id: ExecutorId) {
        let Some(executor) = self.executors.get(&id) else {
            return;
        };
        let revision = executor.revision();
        if self.persisted.get(&id) == Some(&revision) {
            return;
        }

        match ExecutorRecord::from_executor(executor) {
            Ok(record) => {
                self.persisted.insert(id, revision);
                self.write(PendingWrite::Executor(record)).await;
            }
            Err(e) => {
                tracing::error!(executor_id = %id, error = %e, "Failed to serialize executor");
            }
        }
    }

    /// Write the final record of a terminated executor and fold it into its
    /// controller's totals, unless its closed position is already recorded
    async fn archive(&mut self, executor: Executor, already_recorded: bool) {
        let id = executor.id();
        let controller_id = executor.controller_id().to_string();
        self.persisted.remove(&id);
        match ExecutorRecord::from_executor(&executor) {
            Ok(record) => self.write(PendingWrite::Executor(record)).await,
            Err(e) => {
                tracing::error!(executor_id = %id, error = %e, "Failed to serialize executor");
            }
        }

        if !already_recorded {
            let record = ClosedPositionRecord::from(&executor.info());
            self.stored
                .entry(controller_id.clone())
                .or_default()
                .add(&record);
            self.write(PendingWrite::Closed(record)).await;
        }
        self.controllers.insert(controller_id.clone());
        self.performance.invalidate(&controller_id);
    }

    async fn persist_held(&mut self) {
        let snapshot = self.held.snapshot();
        self.write(PendingWrite::Held(snapshot)).await;
    }

    /// Write now, or queue behind earlier failed writes to keep their order
    async fn write(&mut self, write: PendingWrite) {
        if !self.outbox.writes.is_empty() {
            self.outbox.push(write);
            return;
        }

        if let Err(e) = self.try_write(&write).await {
            tracing::warn!(error = %e, "Recorder write failed, persistence degraded");
            self.outbox.push(write);
            self.outbox.schedule_retry();
        }
    }

    async fn try_write(&self, write: &PendingWrite) -> Result<(), RecorderError> {
        let call = async {
            match write {
                PendingWrite::Executor(record) => self.recorder.save_executor(record).await,
                PendingWrite::Closed(record) => self.recorder.save_closed_position(record).await,
                PendingWrite::Held(snapshot) => self.recorder.save_held_positions(snapshot).await,
            }
        };
        timeout(RECORDER_TIMEOUT, call)
            .await
            .map_err(|_| RecorderError::Connection("recorder write timed out".to_string()))?
    }

    fn remember_error(&mut self, controller_id: &str, error: &OrchestratorError) {
        let errors = self.recent_errors.entry(controller_id.to_string()).or_default();
        errors.push_back(error.to_string());
        while errors.len() > self.config.error_history.max(1) {
            errors.pop_front();
        }
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
