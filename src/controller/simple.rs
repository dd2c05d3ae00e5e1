use super::signal::{MidMomentum, Signal, SignalSource};
use super::{Controller, ControllerError, ControllerParams};
use crate::execution::{ExecutorConfig, ExecutorInfo, ExecutorKind, ExecutorStatus, TripleBarrierConfig};
use crate::models::{ExecutorId, MarketSnapshot, TradeSide};
use crate::orchestrator::{Action, ControllerReport, HeldPosition};
use crate::settings::ControllerSettings;
use chrono::{DateTime, Duration, Utc};
use rust_decimal::prelude::*;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;

const AMOUNT_DECIMALS: u32 = 8;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryOrder {
    Market,
    #[default]
    Limit,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimpleTradingParams {
    /// Quote currency committed per executor
    pub total_amount_quote: Decimal,
    /// Unfilled executors older than this are stopped
    pub order_refresh_time_secs: u64,
    pub emergency_stop_loss: Option<Decimal>,
    pub take_profit: Option<Decimal>,
    pub time_limit_secs: Option<u64>,
    pub entry_order: EntryOrder,
    pub signal_lookback: usize,
    pub signal_threshold: Decimal,
}

impl Default for SimpleTradingParams {
    fn default() -> Self {
        Self {
            total_amount_quote: Decimal::from(100),
            order_refresh_time_secs: 30,
            emergency_stop_loss: Some(Decimal::new(5, 2)),
            take_profit: None,
            time_limit_secs: None,
            entry_order: EntryOrder::Limit,
            signal_lookback: 5,
            signal_threshold: Decimal::new(1, 3),
        }
    }
}

impl SimpleTradingParams {
    pub fn from_map(params: &ControllerParams) -> Result<Self, serde_json::Error> {
        serde_json::from_value(Value::Object(params.clone()))
    }

    /// Overlay `params` on the current values, keys not given keep theirs
    pub fn merged(&self, params: &ControllerParams) -> Result<Self, serde_json::Error> {
        let mut current = match serde_json::to_value(self)? {
            Value::Object(map) => map,
            _ => ControllerParams::new(),
        };
        for (key, value) in params {
            current.insert(key.clone(), value.clone());
        }
        Self::from_map(&current)
    }

    pub fn barriers(&self) -> TripleBarrierConfig {
        TripleBarrierConfig {
            stop_loss: self.emergency_stop_loss,
            take_profit: self.take_profit,
            time_limit_secs: self.time_limit_secs,
        }
    }

    fn refresh_time(&self) -> Duration {
        Duration::seconds(i64::try_from(self.order_refresh_time_secs).unwrap_or(i64::MAX))
    }
}

#[derive(Debug, Clone, Default)]
struct ProcessedData {
    signal: Signal,
    snapshot: Option<MarketSnapshot>,
    executors: Vec<ExecutorInfo>,
    held_positions: Vec<HeldPosition>,
}

/// Opens one position executor per signal, refreshes entries that never
/// filled and stores whatever closed
pub struct SimpleTradingController {
    id: String,
    instrument: String,
    params: SimpleTradingParams,
    signal_source: Box<dyn SignalSource>,
    custom_source: bool,
    processed: ProcessedData,
    /// Creation time of the executor requested but not yet reported
    pending_create: Option<DateTime<Utc>>,
    stops_sent: HashSet<ExecutorId>,
    stores_sent: HashSet<ExecutorId>,
}

impl SimpleTradingController {
    pub const TYPE: &'static str = "simple_trading";

    pub fn new(
        id: impl Into<String>,
        instrument: impl Into<String>,
        params: SimpleTradingParams,
    ) -> Result<Self, ControllerError> {
        let id = id.into();
        let signal_source = momentum_source(&id, &params)?;

        Ok(Self {
            id,
            instrument: instrument.into(),
            params,
            signal_source,
            custom_source: false,
            processed: ProcessedData::default(),
            pending_create: None,
            stops_sent: HashSet::new(),
            stores_sent: HashSet::new(),
        })
    }

    pub fn from_settings(settings: &ControllerSettings) -> Result<Self, ControllerError> {
        let params = SimpleTradingParams::from_map(&settings.params).map_err(|e| {
            ControllerError::InvalidParams {
                controller_id: settings.id.clone(),
                reason: e.to_string(),
            }
        })?;
        Self::new(settings.id.clone(), settings.instrument.clone(), params)
    }

    /// Replace the built-in momentum source
    pub fn with_signal_source(mut self, source: Box<dyn SignalSource>) -> Self {
        self.signal_source = source;
        self.custom_source = true;
        self
    }

    pub fn params(&self) -> &SimpleTradingParams {
        &self.params
    }

    pub fn signal(&self) -> Signal {
        self.processed.signal
    }

    fn entry_config(&self, side: TradeSide, snapshot: &MarketSnapshot) -> Option<ExecutorConfig> {
        let price = snapshot.taker_price(side);
        if price <= Decimal::ZERO {
            tracing::warn!(
                controller_id = %self.id,
                instrument = %self.instrument,
                "Could not get a valid entry price"
            );
            return None;
        }

        let amount_quote = self.params.total_amount_quote;
        if amount_quote <= Decimal::ZERO {
            tracing::warn!(
                controller_id = %self.id,
                amount_quote = %amount_quote,
                "Non-positive total_amount_quote"
            );
            return None;
        }

        let amount = (amount_quote / price).round_dp_with_strategy(AMOUNT_DECIMALS, RoundingStrategy::ToZero);
        if amount <= Decimal::ZERO {
            tracing::warn!(controller_id = %self.id, price = %price, "Base amount rounds to zero");
            return None;
        }

        let entry_price = match self.params.entry_order {
            EntryOrder::Limit => Some(price),
            EntryOrder::Market => None,
        };

        Some(ExecutorConfig {
            kind: ExecutorKind::Position { amount, entry_price },
            ..ExecutorConfig::position(self.id.clone(), self.instrument.clone(), side, amount, snapshot.timestamp)
                .with_barriers(self.params.barriers())
        })
    }
}

impl Controller for SimpleTradingController {
    fn id(&self) -> &str {
        &self.id
    }

    fn instrument(&self) -> &str {
        &self.instrument
    }

    fn update_processed_data(&mut self, snapshot: &MarketSnapshot, report: &ControllerReport) {
        let signal = self.signal_source.update(snapshot);

        if let Some(requested) = self.pending_create {
            let reported = report.executors.iter().any(|e| e.created_at == requested);
            let expired = snapshot.timestamp - requested > self.params.refresh_time();
            if reported || expired {
                self.pending_create = None;
            }
        }
        self.stops_sent
            .retain(|id| report.executors.iter().any(|e| e.id == *id && e.is_active()));
        self.stores_sent
            .retain(|id| report.executors.iter().any(|e| e.id == *id));

        self.processed = ProcessedData {
            signal,
            snapshot: Some(snapshot.clone()),
            executors: report.executors.clone(),
            held_positions: report.held_positions.clone(),
        };
    }

    fn determine_executor_actions(&mut self) -> Vec<Action> {
        let mut actions = Vec::new();
        let Some(snapshot) = self.processed.snapshot.clone() else {
            return actions;
        };

        if let Some(side) = self.processed.signal.side() {
            let has_active = self.processed.executors.iter().any(|e| e.is_active());
            if !has_active && self.pending_create.is_none() {
                if let Some(config) = self.entry_config(side, &snapshot) {
                    self.pending_create = Some(config.timestamp);
                    actions.push(Action::create(config));
                }
            }
        }

        let refresh = self.params.refresh_time();
        for info in &self.processed.executors {
            let stale = info.is_active() && !info.is_trading() && snapshot.timestamp - info.created_at > refresh;
            if stale && self.stops_sent.insert(info.id) {
                actions.push(Action::stop(info.id, false));
            }
        }

        for info in &self.processed.executors {
            let closed = info.status.is_terminal() && info.status != ExecutorStatus::Terminated;
            if closed && self.stores_sent.insert(info.id) {
                actions.push(Action::store(info.id));
            }
        }

        actions
    }

    fn reconfigure(&mut self, params: &ControllerParams) -> Result<(), ControllerError> {
        let updated = self
            .params
            .merged(params)
            .map_err(|e| ControllerError::InvalidParams {
                controller_id: self.id.clone(),
                reason: e.to_string(),
            })?;

        let signal_changed = updated.signal_lookback != self.params.signal_lookback
            || updated.signal_threshold != self.params.signal_threshold;
        if signal_changed && !self.custom_source {
            self.signal_source = momentum_source(&self.id, &updated)?;
        }

        tracing::info!(controller_id = %self.id, "Controller reconfigured");
        self.params = updated;
        Ok(())
    }

    fn format_status(&self) -> Vec<String> {
        let mut lines = vec![
            format!("Controller: {}", self.id),
            format!("Instrument: {}", self.instrument),
            format!("Amount: {}", self.params.total_amount_quote),
            format!("Signal: {} ({})", self.processed.signal, self.signal_source.name()),
        ];

        let active: Vec<&ExecutorInfo> = self.processed.executors.iter().filter(|e| e.is_active()).collect();
        if !active.is_empty() {
            lines.push(format!("Active Executors: {}", active.len()));
            for executor in active {
                lines.push(format!("  - {}: {}", executor.id, executor.status));
            }
        }
        for held in &self.processed.held_positions {
            lines.push(format!("Held: {} {} @ {}", held.side, held.amount, held.entry_price));
        }

        lines
    }
}

fn momentum_source(
    controller_id: &str,
    params: &SimpleTradingParams,
) -> Result<Box<dyn SignalSource>, ControllerError> {
    MidMomentum::new(params.signal_lookback, params.signal_threshold)
        .map(|source| Box::new(source) as Box<dyn SignalSource>)
        .ok_or_else(|| ControllerError::InvalidParams {
            controller_id: controller_id.to_string(),
            reason: "signal_lookback must be >= 1 and signal_threshold > 0".to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use serde_json::json;
    use uuid::Uuid;

    struct Fixed(Signal);

    impl SignalSource for Fixed {
        fn name(&self) -> &'static str {
            "fixed"
        }

        fn update(&mut self, _snapshot: &MarketSnapshot) -> Signal {
            self.0
        }
    }

    fn controller(signal: Signal) -> SimpleTradingController {
        let params = SimpleTradingParams {
            take_profit: Some(dec!(0.02)),
            ..Default::default()
        };
        SimpleTradingController::new("ctrl", "BTCUSDT", params)
            .unwrap()
            .with_signal_source(Box::new(Fixed(signal)))
    }

    fn snapshot(at: DateTime<Utc>) -> MarketSnapshot {
        MarketSnapshot::new("BTCUSDT", dec!(99), dec!(101), at)
    }

    fn info(status: ExecutorStatus, filled: Decimal, created_at: DateTime<Utc>) -> ExecutorInfo {
        ExecutorInfo {
            id: Uuid::new_v4(),
            controller_id: "ctrl".to_string(),
            instrument: "BTCUSDT".to_string(),
            side: TradeSide::Buy,
            kind: "position".to_string(),
            status,
            close_type: None,
            created_at,
            closed_at: None,
            open_amount: Decimal::ZERO,
            filled_amount: filled,
            entry_price: None,
            exit_price: None,
            realized_pnl: Decimal::ZERO,
            unrealized_pnl: Decimal::ZERO,
            fees: Decimal::ZERO,
            volume_quote: Decimal::ZERO,
            last_error: None,
        }
    }

    fn report(executors: Vec<ExecutorInfo>) -> ControllerReport {
        ControllerReport {
            executors,
            updated_at: Some(Utc::now()),
            ..ControllerReport::empty("ctrl")
        }
    }

    #[test]
    fn test_buy_signal_creates_limit_entry_at_ask() {
        let mut controller = controller(Signal::Buy);
        let now = Utc::now();
        controller.update_processed_data(&snapshot(now), &report(vec![]));

        let actions = controller.determine_executor_actions();
        assert_eq!(actions.len(), 1);
        let Action::Create(config) = &actions[0] else {
            panic!("expected create, got {:?}", actions[0]);
        };
        assert_eq!(config.side, TradeSide::Buy);
        assert_eq!(config.timestamp, now);
        assert_eq!(
            config.kind,
            ExecutorKind::Position {
                amount: dec!(0.99009900),
                entry_price: Some(dec!(101)),
            }
        );
        assert_eq!(config.barriers.stop_loss, Some(dec!(0.05)));
        assert_eq!(config.barriers.take_profit, Some(dec!(0.02)));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_no_second_create_while_pending_or_active() {
        let mut controller = controller(Signal::Sell);
        let t0 = Utc::now();
        controller.update_processed_data(&snapshot(t0), &report(vec![]));
        assert_eq!(controller.determine_executor_actions().len(), 1);

        // Report not caught up yet
        let t1 = t0 + Duration::seconds(1);
        controller.update_processed_data(&snapshot(t1), &report(vec![]));
        assert!(controller.determine_executor_actions().is_empty());

        // Executor shows up as active
        let t2 = t0 + Duration::seconds(2);
        controller.update_processed_data(&snapshot(t2), &report(vec![info(ExecutorStatus::Active, dec!(1), t0)]));
        assert!(controller.determine_executor_actions().is_empty());
    }

    #[test]
    fn test_neutral_signal_still_refreshes_and_stores() {
        let mut controller = controller(Signal::Neutral);
        let t0 = Utc::now();
        let stale = info(ExecutorStatus::Active, Decimal::ZERO, t0);
        let filled = info(ExecutorStatus::Active, dec!(1), t0);
        let closed = info(ExecutorStatus::ClosedByTp, dec!(1), t0);
        let (stale_id, closed_id) = (stale.id, closed.id);

        let later = t0 + Duration::seconds(31);
        controller.update_processed_data(&snapshot(later), &report(vec![stale, filled, closed]));
        let actions = controller.determine_executor_actions();

        assert_eq!(actions, vec![Action::stop(stale_id, false), Action::store(closed_id)]);

        // Not repeated while the report still shows them
        assert!(controller.determine_executor_actions().is_empty());
    }

    #[test]
    fn test_skips_non_positive_amount() {
        let params = SimpleTradingParams {
            total_amount_quote: Decimal::ZERO,
            ..Default::default()
        };
        let mut controller = SimpleTradingController::new("ctrl", "BTCUSDT", params)
            .unwrap()
            .with_signal_source(Box::new(Fixed(Signal::Buy)));

        controller.update_processed_data(&snapshot(Utc::now()), &report(vec![]));
        assert!(controller.determine_executor_actions().is_empty());
    }

    #[test]
    fn test_reconfigure_keeps_unspecified_params() {
        let mut controller = controller(Signal::Neutral);
        let update = json!({ "total_amount_quote": "250", "entry_order": "market" });
        let Value::Object(update) = update else { unreachable!() };

        controller.reconfigure(&update).unwrap();
        assert_eq!(controller.params().total_amount_quote, dec!(250));
        assert_eq!(controller.params().entry_order, EntryOrder::Market);
        assert_eq!(controller.params().take_profit, Some(dec!(0.02)));

        let Value::Object(bad) = json!({ "signal_lookback": "many" }) else { unreachable!() };
        assert!(controller.reconfigure(&bad).is_err());
        assert_eq!(controller.params().total_amount_quote, dec!(250));
    }

    #[test]
    fn test_invalid_signal_params() {
        let params = SimpleTradingParams {
            signal_lookback: 0,
            ..Default::default()
        };
        assert!(matches!(
            SimpleTradingController::new("ctrl", "BTCUSDT", params),
            Err(ControllerError::InvalidParams { .. })
        ));
    }
}
