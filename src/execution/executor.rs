use super::barrier::{self, BarrierInput};
use super::config::{ExecutorConfig, ExecutorKind};
use super::retry::RetryPolicy;
use super::status::{CloseType, ExecutorStatus};
use crate::error::OrchestratorError;
use crate::gateway::{with_deadline, ExchangeGateway, GatewayError, OrderHandle, OrderSpec, OrderState};
use crate::models::{ControllerId, ExecutorId, MarketSnapshot, TradeSide};
use crate::orchestrator::HeldPosition;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum OrderPurpose {
    Entry,
    Exit,
}

/// Local view of one order
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum TrackedState {
    /// Not accepted by the exchange yet
    Pending,
    Open,
    Filled,
    Cancelled,
    Rejected,
}

impl TrackedState {
    pub fn is_final(self) -> bool {
        matches!(
            self,
            TrackedState::Filled | TrackedState::Cancelled | TrackedState::Rejected
        )
    }
}

impl From<OrderState> for TrackedState {
    fn from(state: OrderState) -> Self {
        match state {
            OrderState::Open => TrackedState::Open,
            OrderState::Filled => TrackedState::Filled,
            OrderState::Cancelled => TrackedState::Cancelled,
            OrderState::Rejected => TrackedState::Rejected,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TrackedOrder {
    pub spec: OrderSpec,
    pub purpose: OrderPurpose,
    pub handle: Option<OrderHandle>,
    pub state: TrackedState,
    pub filled: Decimal,
    pub average_price: Option<Decimal>,
    pub fee: Decimal,
    /// Taken over from a held position. Feeds the entry price and exposure,
    /// its fee and volume stay with the executor that traded it.
    #[serde(default)]
    pub adopted: bool,
}

impl TrackedOrder {
    fn pending(spec: OrderSpec, purpose: OrderPurpose) -> Self {
        Self {
            spec,
            purpose,
            handle: None,
            state: TrackedState::Pending,
            filled: Decimal::ZERO,
            average_price: None,
            fee: Decimal::ZERO,
            adopted: false,
        }
    }

    fn is_live(&self) -> bool {
        !self.state.is_final()
    }

    fn notional(&self) -> Decimal {
        self.average_price.map_or(Decimal::ZERO, |p| p * self.filled)
    }
}

/// Read-only view of an executor handed to controllers through reports
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExecutorInfo {
    pub id: ExecutorId,
    pub controller_id: ControllerId,
    pub instrument: String,
    pub side: TradeSide,
    pub kind: String,
    pub status: ExecutorStatus,
    pub close_type: Option<CloseType>,
    pub created_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
    /// Net amount still held by the executor
    pub open_amount: Decimal,
    pub filled_amount: Decimal,
    pub entry_price: Option<Decimal>,
    pub exit_price: Option<Decimal>,
    pub realized_pnl: Decimal,
    pub unrealized_pnl: Decimal,
    pub fees: Decimal,
    pub volume_quote: Decimal,
    pub last_error: Option<String>,
}

impl ExecutorInfo {
    pub fn net_pnl(&self) -> Decimal {
        self.realized_pnl + self.unrealized_pnl - self.fees
    }

    /// Something was filled, the executor carries exposure or PnL
    pub fn is_trading(&self) -> bool {
        self.status == ExecutorStatus::Active && self.filled_amount > Decimal::ZERO
    }

    pub fn is_active(&self) -> bool {
        self.status == ExecutorStatus::Active
    }
}

/// Order lifecycle worker following the triple-barrier policy.
///
/// Time is taken from the snapshots it is ticked with, never from the wall
/// clock, so a reloaded executor behaves the same as the one that was saved.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Executor {
    id: ExecutorId,
    config: ExecutorConfig,
    status: ExecutorStatus,
    close_type: Option<CloseType>,
    orders: Vec<TrackedOrder>,
    cancel_requested: bool,
    /// Condition that won, set while cancelling entries and flattening
    closing: Option<CloseType>,
    failures: u32,
    next_attempt_at: Option<DateTime<Utc>>,
    retry: RetryPolicy,
    last_mid: Option<Decimal>,
    last_seen: DateTime<Utc>,
    closed_at: Option<DateTime<Utc>>,
    errors: Vec<String>,
    revision: u64,
}

impl Executor {
    pub fn new(config: ExecutorConfig, retry: RetryPolicy) -> Result<Self, OrchestratorError> {
        config.validate()?;

        let orders = entry_orders(&config)
            .into_iter()
            .map(|spec| TrackedOrder::pending(spec, OrderPurpose::Entry))
            .collect();

        Ok(Self {
            id: Uuid::new_v4(),
            last_seen: config.timestamp,
            config,
            status: ExecutorStatus::NotStarted,
            close_type: None,
            orders,
            cancel_requested: false,
            closing: None,
            failures: 0,
            next_attempt_at: None,
            retry,
            last_mid: None,
            closed_at: None,
            errors: Vec::new(),
            revision: 0,
        })
    }

    pub fn id(&self) -> ExecutorId {
        self.id
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    pub fn controller_id(&self) -> &str {
        &self.config.controller_id
    }

    pub fn status(&self) -> ExecutorStatus {
        self.status
    }

    pub fn close_type(&self) -> Option<CloseType> {
        self.close_type
    }

    pub fn orders(&self) -> &[TrackedOrder] {
        &self.orders
    }

    pub fn errors(&self) -> &[String] {
        &self.errors
    }

    /// Bumped on every state change, used to decide when to persist
    pub fn revision(&self) -> u64 {
        self.revision
    }

    pub fn set_retry_policy(&mut self, retry: RetryPolicy) {
        self.retry = retry;
    }

    pub fn open_order_count(&self) -> usize {
        self.orders.iter().filter(|o| o.state == TrackedState::Open).count()
    }

    /// Take over a held position as an already filled entry leg
    pub fn adopt(&mut self, held: &HeldPosition) {
        if self.status != ExecutorStatus::NotStarted || held.side != self.config.side {
            return;
        }
        let mut spec = OrderSpec::market(&self.config.instrument, held.side, held.amount);
        spec.price = Some(held.entry_price);
        self.orders.push(TrackedOrder {
            spec,
            purpose: OrderPurpose::Entry,
            handle: None,
            state: TrackedState::Filled,
            filled: held.amount,
            average_price: Some(held.entry_price),
            fee: held.fees,
            adopted: true,
        });
        self.touch();

        tracing::info!(
            executor_id = %self.id,
            amount = %held.amount,
            entry_price = %held.entry_price,
            "Adopted held position"
        );
    }

    /// Activate and send the entry orders. Placement failures are retried on
    /// later ticks.
    pub async fn start(
        &mut self,
        gateway: &dyn ExchangeGateway,
        deadline: Duration,
    ) -> Result<(), OrchestratorError> {
        if self.status != ExecutorStatus::NotStarted {
            return Ok(());
        }
        self.config.validate()?;
        self.status = ExecutorStatus::Active;
        self.touch();

        tracing::info!(
            executor_id = %self.id,
            controller_id = %self.config.controller_id,
            instrument = %self.config.instrument,
            side = %self.config.side,
            kind = self.config.kind.name(),
            "Executor started"
        );

        let now = self.last_seen;
        if let Err(e) = self.place_pending(gateway, deadline).await {
            self.record_failure(e, now);
        } else {
            self.reset_failures();
        }
        Ok(())
    }

    /// One evaluation step against a fresh snapshot
    pub async fn tick(
        &mut self,
        gateway: &dyn ExchangeGateway,
        snapshot: &MarketSnapshot,
        deadline: Duration,
    ) {
        if self.status != ExecutorStatus::Active {
            return;
        }
        self.observe(snapshot);
        self.advance(gateway, deadline).await;
    }

    /// External stop request. No-op once terminal.
    ///
    /// With `keep_position` the fills are reconciled into one held position
    /// (entries minus exits at the entries' volume-weighted price) and
    /// returned; otherwise the executor flattens through a market exit.
    pub async fn stop(
        &mut self,
        gateway: &dyn ExchangeGateway,
        keep_position: bool,
        snapshot: Option<&MarketSnapshot>,
        deadline: Duration,
    ) -> Option<HeldPosition> {
        if self.status.is_terminal() {
            return None;
        }
        if let Some(snapshot) = snapshot {
            self.observe(snapshot);
        }

        if self.status == ExecutorStatus::NotStarted {
            self.finish(CloseType::EarlyStop);
            return None;
        }

        if !keep_position {
            self.cancel_requested = true;
            self.touch();
            self.advance(gateway, deadline).await;
            return None;
        }

        if let Err(e) = self.cancel_live_orders(gateway, deadline, true).await {
            tracing::warn!(
                executor_id = %self.id,
                error = %e,
                "Could not confirm every cancellation, holding last known fills"
            );
            self.errors.push(e.to_string());
        }

        let held = self.held_position();
        self.finish(if held.is_some() {
            CloseType::PositionHold
        } else {
            CloseType::EarlyStop
        });
        held
    }

    /// Cancel every live order for shutdown. True when all of them are
    /// confirmed final.
    pub async fn cancel_all(&mut self, gateway: &dyn ExchangeGateway, deadline: Duration) -> bool {
        if self.status.is_terminal() {
            return true;
        }
        match self.cancel_live_orders(gateway, deadline, true).await {
            Ok(()) => self.orders.iter().all(|o| o.state.is_final()),
            Err(e) => {
                self.errors.push(e.to_string());
                false
            }
        }
    }

    /// Close as failed, keeping whatever error explains it
    pub fn mark_failed(&mut self, reason: impl Into<String>) {
        if self.status.is_terminal() {
            return;
        }
        let reason = reason.into();
        tracing::error!(executor_id = %self.id, reason = %reason, "Executor failed");
        self.errors.push(reason);
        self.finish(CloseType::Failed);
    }

    /// Archive a closed executor. The close type stays readable.
    pub fn terminate(&mut self) -> Result<(), OrchestratorError> {
        if !self.status.is_terminal() {
            return Err(OrchestratorError::NotTerminal {
                executor_id: self.id,
                status: self.status,
            });
        }
        if self.status != ExecutorStatus::Terminated {
            self.status = ExecutorStatus::Terminated;
            self.touch();
        }
        Ok(())
    }

    pub fn info(&self) -> ExecutorInfo {
        let (entry_qty, entry_price) = self.vwap(OrderPurpose::Entry);
        let (exit_qty, exit_price) = self.vwap(OrderPurpose::Exit);
        let sign = self.config.side.sign();

        let realized_pnl = match (entry_price, exit_price) {
            (Some(entry), Some(exit)) => sign * (exit - entry) * exit_qty,
            _ => Decimal::ZERO,
        };
        let open_amount = (entry_qty - exit_qty).max(Decimal::ZERO);
        let unrealized_pnl = match (entry_price, self.last_mid) {
            (Some(entry), Some(mid)) if self.status == ExecutorStatus::Active => {
                sign * (mid - entry) * open_amount
            }
            _ => Decimal::ZERO,
        };

        ExecutorInfo {
            id: self.id,
            controller_id: self.config.controller_id.clone(),
            instrument: self.config.instrument.clone(),
            side: self.config.side,
            kind: self.config.kind.name().to_string(),
            status: self.status,
            close_type: self.close_type,
            created_at: self.config.timestamp,
            closed_at: self.closed_at,
            open_amount,
            filled_amount: entry_qty,
            entry_price,
            exit_price,
            realized_pnl,
            unrealized_pnl,
            fees: self.traded().map(|o| o.fee).sum(),
            volume_quote: self.traded().map(|o| o.notional()).sum(),
            last_error: self.errors.last().cloned(),
        }
    }

    /// Orders this executor sent itself
    fn traded(&self) -> impl Iterator<Item = &TrackedOrder> {
        self.orders.iter().filter(|o| !o.adopted)
    }

    fn observe(&mut self, snapshot: &MarketSnapshot) {
        self.last_mid = Some(snapshot.mid);
        if snapshot.timestamp > self.last_seen {
            self.last_seen = snapshot.timestamp;
        }
    }

    /// Refresh orders, check barriers, then act on the result
    async fn advance(&mut self, gateway: &dyn ExchangeGateway, deadline: Duration) {
        let now = self.last_seen;
        let mut due = self.next_attempt_at.map_or(true, |at| now >= at);

        if due {
            if let Err(e) = self.refresh_live_orders(gateway, deadline).await {
                self.record_failure(e, now);
                due = false;
            }
        }
        if self.status != ExecutorStatus::Active {
            return;
        }

        // Barriers are checked on the last known fills even when the refresh failed
        if self.closing.is_none() {
            if let Some(close_type) = self.evaluate_barriers(now) {
                tracing::info!(
                    executor_id = %self.id,
                    close_type = ?close_type,
                    mid = ?self.last_mid,
                    "Barrier hit, closing"
                );
                self.closing = Some(close_type);
                self.touch();
            } else if self.entries_exhausted() {
                tracing::info!(executor_id = %self.id, "No entry filled, closing");
                self.closing = Some(CloseType::EarlyStop);
                self.touch();
            }
        }

        if !due {
            return;
        }

        let step = match self.closing {
            Some(close_type) => self.close_step(gateway, deadline, close_type).await,
            None => self.place_pending(gateway, deadline).await,
        };
        match step {
            Ok(()) => self.reset_failures(),
            Err(e) => self.record_failure(e, now),
        }
    }

    fn evaluate_barriers(&self, now: DateTime<Utc>) -> Option<CloseType> {
        let (_, entry_price) = self.vwap(OrderPurpose::Entry);
        let pnl_pct = match (entry_price, self.last_mid) {
            (Some(entry), Some(mid)) if !entry.is_zero() => {
                Some(self.config.side.sign() * (mid - entry) / entry)
            }
            _ => None,
        };

        barrier::evaluate(
            &self.config.barriers,
            &BarrierInput {
                pnl_pct,
                elapsed_secs: (now - self.config.timestamp).num_seconds(),
                cancel_requested: self.cancel_requested,
            },
        )
    }

    /// Every entry finished without a single fill
    fn entries_exhausted(&self) -> bool {
        let mut entries = self
            .orders
            .iter()
            .filter(|o| o.purpose == OrderPurpose::Entry)
            .peekable();
        entries.peek().is_some() && entries.all(|o| o.state.is_final() && o.filled.is_zero())
    }

    /// Cancel entries, then flatten what was filled, then close
    async fn close_step(
        &mut self,
        gateway: &dyn ExchangeGateway,
        deadline: Duration,
        close_type: CloseType,
    ) -> Result<(), GatewayError> {
        self.cancel_live_orders(gateway, deadline, false).await?;
        let entries_settled = self
            .orders
            .iter()
            .filter(|o| o.purpose == OrderPurpose::Entry)
            .all(|o| o.state.is_final());
        if !entries_settled {
            return Ok(());
        }

        let exposure = self.net_exposure();
        if exposure > Decimal::ZERO {
            let exit_live = self
                .orders
                .iter()
                .any(|o| o.purpose == OrderPurpose::Exit && o.is_live());
            if !exit_live {
                let spec = OrderSpec::market(&self.config.instrument, self.config.side.opposite(), exposure);
                self.orders.push(TrackedOrder::pending(spec, OrderPurpose::Exit));
                self.touch();
            }
            self.place_pending(gateway, deadline).await?;
        }

        let exit_live = self
            .orders
            .iter()
            .any(|o| o.purpose == OrderPurpose::Exit && o.is_live());
        if self.net_exposure() <= Decimal::ZERO && !exit_live {
            self.finish(close_type);
        } else if !exit_live {
            // Exit ended without filling everything, the next attempt re-sends it
            return Err(GatewayError::Rejected("exit order did not fill".to_string()));
        }
        Ok(())
    }

    async fn place_pending(
        &mut self,
        gateway: &dyn ExchangeGateway,
        deadline: Duration,
    ) -> Result<(), GatewayError> {
        for index in 0..self.orders.len() {
            if self.orders[index].state != TrackedState::Pending {
                continue;
            }
            let handle = with_deadline(deadline, gateway.place_order(&self.orders[index].spec)).await?;
            tracing::debug!(
                executor_id = %self.id,
                order_id = %handle.order_id,
                purpose = ?self.orders[index].purpose,
                "Order placed"
            );
            let order = &mut self.orders[index];
            order.handle = Some(handle);
            order.state = TrackedState::Open;
            self.touch();
            self.refresh_order(gateway, deadline, index).await?;
        }
        Ok(())
    }

    async fn refresh_live_orders(
        &mut self,
        gateway: &dyn ExchangeGateway,
        deadline: Duration,
    ) -> Result<(), GatewayError> {
        for index in 0..self.orders.len() {
            if self.orders[index].state != TrackedState::Open {
                continue;
            }
            self.refresh_order(gateway, deadline, index).await?;
        }
        Ok(())
    }

    async fn refresh_order(
        &mut self,
        gateway: &dyn ExchangeGateway,
        deadline: Duration,
        index: usize,
    ) -> Result<(), GatewayError> {
        let Some(handle) = self.orders[index].handle.clone() else {
            return Ok(());
        };
        let update = with_deadline(deadline, gateway.order_status(&handle)).await?;

        let order = &mut self.orders[index];
        let state = TrackedState::from(update.state);
        let changed = order.state != state || order.filled != update.filled_amount;
        order.state = state;
        order.filled = update.filled_amount;
        order.average_price = update.average_price.or(order.average_price);
        order.fee = update.cumulative_fee;
        if changed {
            self.touch();
        }
        Ok(())
    }

    /// Cancel open orders and re-read their final fills. Pending orders are
    /// dropped locally. Exits are only touched when `include_exits` is set.
    async fn cancel_live_orders(
        &mut self,
        gateway: &dyn ExchangeGateway,
        deadline: Duration,
        include_exits: bool,
    ) -> Result<(), GatewayError> {
        for index in 0..self.orders.len() {
            let (purpose, state) = (self.orders[index].purpose, self.orders[index].state);
            if purpose == OrderPurpose::Exit && !include_exits {
                continue;
            }
            match state {
                TrackedState::Pending => {
                    self.orders[index].state = TrackedState::Cancelled;
                    self.touch();
                }
                TrackedState::Open => {
                    if let Some(handle) = self.orders[index].handle.clone() {
                        with_deadline(deadline, gateway.cancel_order(&handle)).await?;
                    }
                    self.refresh_order(gateway, deadline, index).await?;
                    if self.orders[index].state == TrackedState::Open {
                        return Err(GatewayError::Rejected(format!(
                            "cancellation of {} not confirmed",
                            self.orders[index]
                                .handle
                                .as_ref()
                                .map_or("unplaced order", |h| h.order_id.as_str())
                        )));
                    }
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// Filled entries minus filled exits
    fn net_exposure(&self) -> Decimal {
        let entries = self.filled(OrderPurpose::Entry);
        let exits = self.filled(OrderPurpose::Exit);
        entries - exits
    }

    fn filled(&self, purpose: OrderPurpose) -> Decimal {
        self.orders
            .iter()
            .filter(|o| o.purpose == purpose)
            .map(|o| o.filled)
            .sum()
    }

    /// Filled amount and volume-weighted price for one purpose
    fn vwap(&self, purpose: OrderPurpose) -> (Decimal, Option<Decimal>) {
        let (qty, notional) = self
            .orders
            .iter()
            .filter(|o| o.purpose == purpose && o.filled > Decimal::ZERO)
            .fold((Decimal::ZERO, Decimal::ZERO), |(q, n), o| {
                (q + o.filled, n + o.notional())
            });
        if qty.is_zero() {
            (qty, None)
        } else {
            (qty, Some(notional / qty))
        }
    }

    fn held_position(&self) -> Option<HeldPosition> {
        let amount = self.net_exposure();
        let (_, entry_price) = self.vwap(OrderPurpose::Entry);
        match entry_price {
            Some(entry_price) if amount > Decimal::ZERO => Some(HeldPosition {
                controller_id: self.config.controller_id.clone(),
                instrument: self.config.instrument.clone(),
                side: self.config.side,
                amount,
                entry_price,
                fees: self.orders.iter().map(|o| o.fee).sum(),
                updated_at: self.last_seen,
            }),
            _ => None,
        }
    }

    fn record_failure(&mut self, err: GatewayError, now: DateTime<Utc>) {
        self.failures += 1;
        self.errors.push(err.to_string());
        self.touch();

        if self.retry.exhausted(self.failures) {
            tracing::error!(
                executor_id = %self.id,
                attempts = self.failures,
                error = %err,
                "Gateway retries exhausted"
            );
            self.finish(CloseType::Failed);
            return;
        }

        let backoff = self.retry.backoff(self.failures);
        self.next_attempt_at = Some(now + chrono::Duration::milliseconds(backoff.as_millis() as i64));
        tracing::warn!(
            executor_id = %self.id,
            attempt = self.failures,
            max_attempts = self.retry.max_attempts,
            backoff_ms = backoff.as_millis() as u64,
            error = %err,
            "Gateway call failed, retrying later"
        );
    }

    fn reset_failures(&mut self) {
        if self.failures > 0 || self.next_attempt_at.is_some() {
            self.failures = 0;
            self.next_attempt_at = None;
            self.touch();
        }
    }

    fn finish(&mut self, close_type: CloseType) {
        self.status = close_type.status();
        self.close_type = Some(close_type);
        self.closing = None;
        self.closed_at = Some(self.last_seen);
        self.touch();

        let info = self.info();
        tracing::info!(
            executor_id = %self.id,
            controller_id = %self.config.controller_id,
            status = %self.status,
            close_type = ?close_type,
            realized_pnl = %info.realized_pnl,
            fees = %info.fees,
            "Executor closed"
        );
    }

    fn touch(&mut self) {
        self.revision += 1;
    }
}

fn entry_orders(config: &ExecutorConfig) -> Vec<OrderSpec> {
    match &config.kind {
        ExecutorKind::Position {
            amount,
            entry_price: None,
        } => vec![OrderSpec::market(&config.instrument, config.side, *amount)],
        ExecutorKind::Position {
            amount,
            entry_price: Some(price),
        } => vec![OrderSpec::limit(&config.instrument, config.side, *amount, *price)],
        ExecutorKind::Dca { levels } => levels
            .iter()
            .map(|level| OrderSpec::limit(&config.instrument, config.side, level.amount, level.price))
            .collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::config::{DcaLevel, TripleBarrierConfig};
    use crate::gateway::PaperGateway;
    use crate::market_data::PriceBoard;
    use chrono::Duration as ChronoDuration;
    use rust_decimal_macros::dec;
    use std::sync::Arc;

    const DEADLINE: Duration = Duration::from_secs(1);

    struct Harness {
        board: Arc<PriceBoard>,
        gateway: PaperGateway,
        start: DateTime<Utc>,
    }

    impl Harness {
        fn new(price: Decimal) -> Self {
            let board = Arc::new(PriceBoard::new());
            let start = Utc::now();
            board.publish(MarketSnapshot::at_price("BTC-USDT", price, start));
            let gateway = PaperGateway::new(board.clone(), Decimal::ZERO);
            Self { board, gateway, start }
        }

        fn snapshot(&self, price: Decimal, secs: i64) -> MarketSnapshot {
            let snapshot = MarketSnapshot::at_price("BTC-USDT", price, self.start + ChronoDuration::seconds(secs));
            self.board.publish(snapshot.clone());
            snapshot
        }

        fn config(&self) -> ExecutorConfig {
            ExecutorConfig::position("ctrl", "BTC-USDT", TradeSide::Buy, dec!(1), self.start).with_barriers(
                TripleBarrierConfig {
                    stop_loss: Some(dec!(0.005)),
                    take_profit: Some(dec!(0.01)),
                    time_limit_secs: Some(60),
                },
            )
        }

        async fn started(&self, config: ExecutorConfig) -> Executor {
            let mut executor = Executor::new(config, RetryPolicy::fixed(3, 100)).unwrap();
            executor.start(&self.gateway, DEADLINE).await.unwrap();
            executor
        }
    }

    #[tokio::test]
    async fn test_take_profit() {
        let h = Harness::new(dec!(100));
        let mut executor = h.started(h.config()).await;
        assert_eq!(executor.status(), ExecutorStatus::Active);

        executor.tick(&h.gateway, &h.snapshot(dec!(100.5), 5), DEADLINE).await;
        assert_eq!(executor.status(), ExecutorStatus::Active);

        executor.tick(&h.gateway, &h.snapshot(dec!(101), 10), DEADLINE).await;
        assert_eq!(executor.status(), ExecutorStatus::ClosedByTp);
        assert_eq!(executor.close_type(), Some(CloseType::TakeProfit));

        let info = executor.info();
        assert_eq!(info.realized_pnl, dec!(1));
        assert_eq!(info.open_amount, Decimal::ZERO);
    }

    #[tokio::test]
    async fn test_stop_loss() {
        let h = Harness::new(dec!(100));
        let mut executor = h.started(h.config()).await;

        executor.tick(&h.gateway, &h.snapshot(dec!(99.4), 5), DEADLINE).await;
        assert_eq!(executor.status(), ExecutorStatus::ClosedBySl);
        assert_eq!(executor.info().realized_pnl, dec!(-0.6));
    }

    #[tokio::test]
    async fn test_time_limit() {
        let h = Harness::new(dec!(100));
        let mut executor = h.started(h.config()).await;

        executor.tick(&h.gateway, &h.snapshot(dec!(100.2), 30), DEADLINE).await;
        assert_eq!(executor.status(), ExecutorStatus::Active);

        executor.tick(&h.gateway, &h.snapshot(dec!(100.2), 60), DEADLINE).await;
        assert_eq!(executor.status(), ExecutorStatus::ClosedByTime);
    }

    #[tokio::test]
    async fn test_no_orders_after_close() {
        let h = Harness::new(dec!(100));
        let mut executor = h.started(h.config()).await;
        executor.tick(&h.gateway, &h.snapshot(dec!(102), 5), DEADLINE).await;
        assert!(executor.status().is_terminal());
        let placed = h.gateway.placed_count();

        executor.tick(&h.gateway, &h.snapshot(dec!(90), 10), DEADLINE).await;
        executor.stop(&h.gateway, false, None, DEADLINE).await;
        assert!(executor.stop(&h.gateway, true, None, DEADLINE).await.is_none());

        assert_eq!(h.gateway.placed_count(), placed);
        assert_eq!(executor.status(), ExecutorStatus::ClosedByTp);
    }

    #[tokio::test]
    async fn test_stop_keep_position_hands_over_fill() {
        let h = Harness::new(dec!(100));
        let mut executor = h.started(h.config()).await;

        let held = executor.stop(&h.gateway, true, None, DEADLINE).await.unwrap();

        assert_eq!(held.amount, dec!(1));
        assert_eq!(held.entry_price, dec!(100));
        assert_eq!(held.side, TradeSide::Buy);
        assert_eq!(executor.status(), ExecutorStatus::ClosedByCancel);
        assert_eq!(executor.close_type(), Some(CloseType::PositionHold));
        assert_eq!(h.gateway.open_order_count(), 0);
    }

    #[tokio::test]
    async fn test_stop_without_keep_flattens() {
        let h = Harness::new(dec!(100));
        let mut executor = h.started(h.config()).await;
        h.snapshot(dec!(100.3), 2);

        let held = executor.stop(&h.gateway, false, None, DEADLINE).await;

        assert!(held.is_none());
        assert_eq!(executor.status(), ExecutorStatus::ClosedByCancel);
        assert_eq!(executor.close_type(), Some(CloseType::EarlyStop));
        let info = executor.info();
        assert_eq!(info.open_amount, Decimal::ZERO);
        assert_eq!(info.realized_pnl, dec!(0.3));
    }

    #[tokio::test]
    async fn test_dca_partial_fill_reconciles_to_one_position() {
        let h = Harness::new(dec!(100));
        let mut config = h.config();
        config.kind = ExecutorKind::Dca {
            levels: vec![
                DcaLevel { price: dec!(99), amount: dec!(1) },
                DcaLevel { price: dec!(97), amount: dec!(3) },
                DcaLevel { price: dec!(95), amount: dec!(2) },
            ],
        };
        config.barriers = TripleBarrierConfig::default();
        let mut executor = h.started(config).await;
        assert_eq!(executor.open_order_count(), 3);

        // First two levels fill, the last one keeps resting
        executor.tick(&h.gateway, &h.snapshot(dec!(97), 5), DEADLINE).await;
        assert_eq!(executor.open_order_count(), 1);

        let held = executor.stop(&h.gateway, true, None, DEADLINE).await.unwrap();

        assert_eq!(held.amount, dec!(4));
        assert_eq!(held.entry_price, dec!(97.5));
        assert_eq!(executor.open_order_count(), 0);
        assert_eq!(h.gateway.open_order_count(), 0);
    }

    #[tokio::test]
    async fn test_unfilled_limit_closes_on_time_without_exit() {
        let h = Harness::new(dec!(100));
        let mut config = h.config();
        config.kind = ExecutorKind::Position {
            amount: dec!(1),
            entry_price: Some(dec!(90)),
        };
        let mut executor = h.started(config).await;

        executor.tick(&h.gateway, &h.snapshot(dec!(100), 61), DEADLINE).await;

        assert_eq!(executor.status(), ExecutorStatus::ClosedByTime);
        assert_eq!(executor.info().filled_amount, Decimal::ZERO);
        assert_eq!(h.gateway.placed_count(), 1);
        assert_eq!(h.gateway.open_order_count(), 0);
    }

    #[tokio::test]
    async fn test_retry_then_recover() {
        let h = Harness::new(dec!(100));
        h.gateway.fail_next_places(1);
        let mut executor = h.started(h.config()).await;
        assert_eq!(executor.info().filled_amount, Decimal::ZERO);
        assert_eq!(executor.errors().len(), 1);

        // Backoff of 100ms has elapsed by the next snapshot
        executor.tick(&h.gateway, &h.snapshot(dec!(100), 1), DEADLINE).await;

        assert_eq!(executor.status(), ExecutorStatus::Active);
        assert_eq!(executor.info().filled_amount, dec!(1));
    }

    #[tokio::test]
    async fn test_retries_exhausted_closes_by_failure() {
        let h = Harness::new(dec!(100));
        h.gateway.fail_next_places(10);
        let mut executor = h.started(h.config()).await;

        executor.tick(&h.gateway, &h.snapshot(dec!(100), 1), DEADLINE).await;
        executor.tick(&h.gateway, &h.snapshot(dec!(100), 2), DEADLINE).await;

        assert_eq!(executor.status(), ExecutorStatus::ClosedByFailure);
        assert_eq!(executor.errors().len(), 3);
        assert_eq!(h.gateway.placed_count(), 0);
    }

    #[tokio::test]
    async fn test_gateway_timeout_counts_as_failure() {
        let h = Harness::new(dec!(100));
        h.gateway.set_latency(Some(Duration::from_millis(200)));
        let mut executor = Executor::new(h.config(), RetryPolicy::fixed(3, 100)).unwrap();

        executor.start(&h.gateway, Duration::from_millis(20)).await.unwrap();

        assert_eq!(executor.status(), ExecutorStatus::Active);
        assert!(executor.errors()[0].contains("timed out"));
    }

    #[tokio::test]
    async fn test_backoff_defers_retry() {
        let h = Harness::new(dec!(100));
        h.gateway.fail_next_places(1);
        let mut executor = Executor::new(h.config(), RetryPolicy::fixed(3, 5_000)).unwrap();
        executor.start(&h.gateway, DEADLINE).await.unwrap();

        executor.tick(&h.gateway, &h.snapshot(dec!(100), 1), DEADLINE).await;
        assert_eq!(h.gateway.placed_count(), 0);

        executor.tick(&h.gateway, &h.snapshot(dec!(100), 6), DEADLINE).await;
        assert_eq!(h.gateway.placed_count(), 1);
    }

    #[tokio::test]
    async fn test_adopted_position_counts_as_entry() {
        let h = Harness::new(dec!(100));
        let mut config = h.config();
        config.adopt_held_position = true;
        let mut executor = Executor::new(config, RetryPolicy::default()).unwrap();
        executor.adopt(&HeldPosition {
            controller_id: "ctrl".to_string(),
            instrument: "BTC-USDT".to_string(),
            side: TradeSide::Buy,
            amount: dec!(2),
            entry_price: dec!(97),
            fees: dec!(0.5),
            updated_at: h.start,
        });
        executor.start(&h.gateway, DEADLINE).await.unwrap();

        let info = executor.info();
        assert_eq!(info.filled_amount, dec!(3));
        assert_eq!(info.entry_price, Some(dec!(98)));
        // Only the fill sent by this executor counts as its own trading
        assert_eq!(info.fees, Decimal::ZERO);
        assert_eq!(info.volume_quote, dec!(100));

        // Handing it back keeps the fee history of the whole position
        let held = executor.stop(&h.gateway, true, None, DEADLINE).await.unwrap();
        assert_eq!(held.amount, dec!(3));
        assert_eq!(held.fees, dec!(0.5));
    }

    #[tokio::test]
    async fn test_gap_through_stop_loss_and_time_limit_closes_by_stop_loss() {
        // Positive thresholds keep stop loss and take profit apart, so the
        // contested case is a stale gap that breaches a price barrier and the
        // time limit in the same tick
        let h = Harness::new(dec!(100));
        let mut executor = h.started(h.config()).await;

        executor.tick(&h.gateway, &h.snapshot(dec!(90), 600), DEADLINE).await;

        assert_eq!(executor.status(), ExecutorStatus::ClosedBySl);
        assert_eq!(executor.close_type(), Some(CloseType::StopLoss));
    }

    #[tokio::test]
    async fn test_gap_through_take_profit_and_time_limit_closes_by_take_profit() {
        let h = Harness::new(dec!(100));
        let mut executor = h.started(h.config()).await;

        executor.tick(&h.gateway, &h.snapshot(dec!(110), 600), DEADLINE).await;

        assert_eq!(executor.status(), ExecutorStatus::ClosedByTp);
    }

    #[tokio::test]
    async fn test_stop_loss_wins_over_pending_cancel() {
        let h = Harness::new(dec!(100));
        let mut executor = h.started(h.config()).await;
        let snapshot = h.snapshot(dec!(95), 5);

        executor.stop(&h.gateway, false, Some(&snapshot), DEADLINE).await;

        assert_eq!(executor.status(), ExecutorStatus::ClosedBySl);
        assert_eq!(executor.close_type(), Some(CloseType::StopLoss));
    }

    #[tokio::test]
    async fn test_rejected_entry_is_retried() {
        let h = Harness::new(dec!(100));
        h.gateway.reject_next_places(1);
        let mut executor = h.started(h.config()).await;
        assert_eq!(h.gateway.placed_count(), 0);
        assert!(executor.errors()[0].contains("simulated rejection"));

        executor.tick(&h.gateway, &h.snapshot(dec!(100), 1), DEADLINE).await;

        assert_eq!(executor.status(), ExecutorStatus::Active);
        assert_eq!(executor.info().filled_amount, dec!(1));
    }

    #[tokio::test]
    async fn test_failed_cancel_is_retried_before_closing() {
        let h = Harness::new(dec!(100));
        let mut config = h.config();
        config.kind = ExecutorKind::Position {
            amount: dec!(1),
            entry_price: Some(dec!(90)),
        };
        let mut executor = h.started(config).await;
        h.gateway.fail_next_cancels(1);

        executor.stop(&h.gateway, false, None, DEADLINE).await;
        assert_eq!(executor.status(), ExecutorStatus::Active);
        assert_eq!(h.gateway.open_order_count(), 1);

        executor.tick(&h.gateway, &h.snapshot(dec!(100), 1), DEADLINE).await;

        assert_eq!(executor.status(), ExecutorStatus::ClosedByCancel);
        assert_eq!(executor.close_type(), Some(CloseType::EarlyStop));
        assert_eq!(h.gateway.open_order_count(), 0);
    }

    #[tokio::test]
    async fn test_time_limit_is_noted_while_gateway_is_down() {
        let h = Harness::new(dec!(100));
        let mut config = h.config();
        config.kind = ExecutorKind::Position {
            amount: dec!(1),
            entry_price: Some(dec!(90)),
        };
        let mut executor = h.started(config).await;

        h.gateway.set_latency(Some(Duration::from_millis(200)));
        executor
            .tick(&h.gateway, &h.snapshot(dec!(100), 61), Duration::from_millis(20))
            .await;

        assert_eq!(executor.status(), ExecutorStatus::Active);
        assert_eq!(executor.closing, Some(CloseType::TimeLimit));

        h.gateway.set_latency(None);
        executor.tick(&h.gateway, &h.snapshot(dec!(100), 62), DEADLINE).await;
        assert_eq!(executor.status(), ExecutorStatus::ClosedByTime);
    }

    #[tokio::test]
    async fn test_record_roundtrip_preserves_state() {
        let h = Harness::new(dec!(100));
        let executor = h.started(h.config()).await;

        let json = serde_json::to_value(&executor).unwrap();
        let restored: Executor = serde_json::from_value(json).unwrap();

        assert_eq!(restored.id(), executor.id());
        assert_eq!(restored.revision(), executor.revision());
        assert_eq!(restored.info(), executor.info());
    }
}
