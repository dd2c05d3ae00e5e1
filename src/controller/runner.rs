use super::status::format_boxed;
use super::{Controller, ControllerError, ControllerParams};
use crate::market_data::{MarketDataProvider, Subscription};
use crate::models::MarketSnapshot;
use crate::orchestrator::{ActionSender, ReportHandle};
use crate::scheduler;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};

const SUBSCRIPTION_CAPACITY: usize = 64;
const RECONFIGURE_CAPACITY: usize = 8;

/// Sends parameter updates to a running controller
#[derive(Debug, Clone)]
pub struct ControllerHandle {
    controller_id: String,
    tx: mpsc::Sender<ControllerParams>,
}

impl ControllerHandle {
    pub fn controller_id(&self) -> &str {
        &self.controller_id
    }

    /// Queue new parameters, applied at the start of the next tick
    pub fn reconfigure(&self, params: ControllerParams) -> Result<(), ControllerError> {
        self.tx
            .try_send(params)
            .map_err(|_| ControllerError::Stopped(self.controller_id.clone()))
    }
}

/// Fixed-interval loop around one controller
pub struct ControllerRunner {
    controller: Box<dyn Controller>,
    market: Arc<dyn MarketDataProvider>,
    reports: ReportHandle,
    actions: ActionSender,
    tick_interval: Duration,
    params_rx: mpsc::Receiver<ControllerParams>,
    subscription: Option<Subscription>,
}

impl ControllerRunner {
    pub fn new(
        controller: Box<dyn Controller>,
        market: Arc<dyn MarketDataProvider>,
        reports: ReportHandle,
        actions: ActionSender,
        tick_interval: Duration,
    ) -> (Self, ControllerHandle) {
        let (tx, params_rx) = mpsc::channel(RECONFIGURE_CAPACITY);
        let handle = ControllerHandle {
            controller_id: controller.id().to_string(),
            tx,
        };

        let runner = Self {
            controller,
            market,
            reports,
            actions,
            tick_interval,
            params_rx,
            subscription: None,
        };
        (runner, handle)
    }

    pub fn controller(&self) -> &dyn Controller {
        self.controller.as_ref()
    }

    /// Open the market data subscription. Without one the runner polls
    /// `get_snapshot` every tick.
    pub async fn subscribe(&mut self) {
        let instrument = self.controller.instrument().to_string();
        match self.market.subscribe(&instrument, SUBSCRIPTION_CAPACITY).await {
            Ok(subscription) => self.subscription = Some(subscription),
            Err(e) => {
                tracing::warn!(
                    controller_id = %self.controller.id(),
                    instrument = %instrument,
                    error = %e,
                    "Subscription failed, falling back to polling"
                );
            }
        }
    }

    /// One controller tick. Returns how many actions were submitted.
    pub async fn tick(&mut self) -> Result<usize, ControllerError> {
        while let Ok(params) = self.params_rx.try_recv() {
            if let Err(e) = self.controller.reconfigure(&params) {
                tracing::warn!(controller_id = %self.controller.id(), error = %e, "Reconfiguration rejected");
            }
        }

        let snapshot = self.next_snapshot().await?;
        let report = self.reports.report(self.controller.id());

        self.controller.update_processed_data(&snapshot, &report);
        let actions = self.controller.determine_executor_actions();
        let count = actions.len();

        tracing::debug!(
            "\n{}",
            format_boxed(self.controller.id(), &self.controller.format_status())
        );

        if count > 0 {
            tracing::debug!(controller_id = %self.controller.id(), actions = count, "Submitting actions");
            self.actions.submit_batch(actions)?;
        }
        Ok(count)
    }

    async fn next_snapshot(&mut self) -> Result<MarketSnapshot, ControllerError> {
        if let Some(snapshot) = self.subscription.as_mut().and_then(Subscription::latest) {
            return Ok(snapshot);
        }
        let instrument = self.controller.instrument().to_string();
        let snapshot = self.market.get_snapshot(&instrument).await?;
        Ok(snapshot)
    }

    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        self.subscribe().await;
        let mut ticker = scheduler::ticker(self.tick_interval);

        tracing::info!(
            controller_id = %self.controller.id(),
            instrument = %self.controller.instrument(),
            tick_interval_ms = self.tick_interval.as_millis() as u64,
            "Controller started"
        );

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.tick().await {
                        tracing::warn!(controller_id = %self.controller.id(), error = %e, "Controller tick failed");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        tracing::info!(controller_id = %self.controller.id(), "Controller stopped");
    }
}
