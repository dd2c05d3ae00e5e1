use super::{ExchangeGateway, GatewayError, OrderHandle, OrderSpec, OrderState, OrderType, OrderUpdate};
use crate::market_data::PriceBoard;
use crate::models::TradeSide;
use async_trait::async_trait;
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

#[derive(Debug, Clone)]
struct PaperOrder {
    spec: OrderSpec,
    state: OrderState,
    filled: Decimal,
    average_price: Option<Decimal>,
    fee: Decimal,
}

/// Injected faults, each counter is consumed one call at a time
#[derive(Debug, Default)]
struct Faults {
    failing_places: u32,
    rejected_places: u32,
    failing_cancels: u32,
    unconfirmed_cancels: bool,
    latency: Option<Duration>,
}

/// Simulated exchange filling against the prices on a `PriceBoard`.
///
/// Market orders fill in full at the taker price when placed. Limit orders
/// fill in full at their limit price once the book crosses it, checked when
/// their status is read.
pub struct PaperGateway {
    prices: Arc<PriceBoard>,
    taker_fee: Decimal,
    orders: Mutex<HashMap<String, PaperOrder>>,
    faults: Mutex<Faults>,
    next_id: AtomicU64,
    placed: AtomicU64,
}

impl PaperGateway {
    pub fn new(prices: Arc<PriceBoard>, taker_fee: Decimal) -> Self {
        Self {
            prices,
            taker_fee,
            orders: Mutex::new(HashMap::new()),
            faults: Mutex::new(Faults::default()),
            next_id: AtomicU64::new(1),
            placed: AtomicU64::new(0),
        }
    }

    /// Fail the next `n` placements with a transport error
    pub fn fail_next_places(&self, n: u32) {
        self.faults().failing_places = n;
    }

    /// Reject the next `n` placements
    pub fn reject_next_places(&self, n: u32) {
        self.faults().rejected_places = n;
    }

    /// Fail the next `n` cancellations with a transport error
    pub fn fail_next_cancels(&self, n: u32) {
        self.faults().failing_cancels = n;
    }

    /// Acknowledge cancellations without ever cancelling
    pub fn set_unconfirmed_cancels(&self, enabled: bool) {
        self.faults().unconfirmed_cancels = enabled;
    }

    /// Delay every call, used to exercise deadlines
    pub fn set_latency(&self, latency: Option<Duration>) {
        self.faults().latency = latency;
    }

    /// Orders accepted so far
    pub fn placed_count(&self) -> u64 {
        self.placed.load(Ordering::SeqCst)
    }

    pub fn open_order_count(&self) -> usize {
        self.orders()
            .values()
            .filter(|o| o.state == OrderState::Open)
            .count()
    }

    fn faults(&self) -> std::sync::MutexGuard<'_, Faults> {
        self.faults.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn orders(&self) -> std::sync::MutexGuard<'_, HashMap<String, PaperOrder>> {
        self.orders.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn simulate_latency(&self) {
        let latency = self.faults().latency;
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
    }

    fn fill(&self, order: &mut PaperOrder, price: Decimal) {
        order.state = OrderState::Filled;
        order.filled = order.spec.amount;
        order.average_price = Some(price);
        order.fee = price * order.spec.amount * self.taker_fee;
    }

    /// Fill a resting limit order if the book crossed its price
    fn try_fill_limit(&self, order: &mut PaperOrder) {
        if order.state != OrderState::Open {
            return;
        }
        let (Some(limit), Some(book)) = (order.spec.price, self.prices.latest(&order.spec.instrument))
        else {
            return;
        };
        let crossed = match order.spec.side {
            TradeSide::Buy => book.best_ask <= limit,
            TradeSide::Sell => book.best_bid >= limit,
        };
        if crossed {
            self.fill(order, limit);
        }
    }
}

#[async_trait]
impl ExchangeGateway for PaperGateway {
    async fn place_order(&self, spec: &OrderSpec) -> Result<OrderHandle, GatewayError> {
        self.simulate_latency().await;
        {
            let mut faults = self.faults();
            if faults.failing_places > 0 {
                faults.failing_places -= 1;
                return Err(GatewayError::Transport("simulated connection reset".to_string()));
            }
            if faults.rejected_places > 0 {
                faults.rejected_places -= 1;
                return Err(GatewayError::Rejected("simulated rejection".to_string()));
            }
        }

        if spec.amount <= Decimal::ZERO {
            return Err(GatewayError::Rejected(format!("invalid amount {}", spec.amount)));
        }

        let mut order = PaperOrder {
            spec: spec.clone(),
            state: OrderState::Open,
            filled: Decimal::ZERO,
            average_price: None,
            fee: Decimal::ZERO,
        };

        match spec.order_type {
            OrderType::Market => {
                let book = self.prices.latest(&spec.instrument).ok_or_else(|| {
                    GatewayError::Rejected(format!("no price for {}", spec.instrument))
                })?;
                self.fill(&mut order, book.taker_price(spec.side));
            }
            OrderType::Limit => {
                if spec.price.is_none() {
                    return Err(GatewayError::Rejected("limit order without price".to_string()));
                }
                self.try_fill_limit(&mut order);
            }
        }

        let order_id = format!("paper-{}", self.next_id.fetch_add(1, Ordering::SeqCst));
        tracing::debug!(
            order_id = %order_id,
            instrument = %spec.instrument,
            side = %spec.side,
            amount = %spec.amount,
            state = ?order.state,
            "Paper order placed"
        );
        self.orders().insert(order_id.clone(), order);
        self.placed.fetch_add(1, Ordering::SeqCst);

        Ok(OrderHandle {
            order_id,
            client_order_id: spec.client_order_id,
        })
    }

    async fn cancel_order(&self, handle: &OrderHandle) -> Result<bool, GatewayError> {
        self.simulate_latency().await;
        let unconfirmed = {
            let mut faults = self.faults();
            if faults.failing_cancels > 0 {
                faults.failing_cancels -= 1;
                return Err(GatewayError::Transport("simulated connection reset".to_string()));
            }
            faults.unconfirmed_cancels
        };

        let mut orders = self.orders();
        let order = orders
            .get_mut(&handle.order_id)
            .ok_or_else(|| GatewayError::Rejected(format!("unknown order {}", handle.order_id)))?;

        self.try_fill_limit(order);
        if order.state != OrderState::Open || unconfirmed {
            return Ok(false);
        }
        order.state = OrderState::Cancelled;
        Ok(true)
    }

    async fn order_status(&self, handle: &OrderHandle) -> Result<OrderUpdate, GatewayError> {
        self.simulate_latency().await;
        let mut orders = self.orders();
        let order = orders
            .get_mut(&handle.order_id)
            .ok_or_else(|| GatewayError::Rejected(format!("unknown order {}", handle.order_id)))?;

        self.try_fill_limit(order);
        Ok(OrderUpdate {
            state: order.state,
            filled_amount: order.filled,
            average_price: order.average_price,
            cumulative_fee: order.fee,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::MarketSnapshot;
    use chrono::{Duration as ChronoDuration, Utc};
    use rust_decimal_macros::dec;

    fn setup() -> (Arc<PriceBoard>, PaperGateway) {
        let board = Arc::new(PriceBoard::new());
        board.publish(MarketSnapshot::new("BTC-USDT", dec!(99), dec!(101), Utc::now()));
        let gateway = PaperGateway::new(board.clone(), dec!(0.001));
        (board, gateway)
    }

    #[tokio::test]
    async fn test_market_order_fills_at_taker_price() {
        let (_, gateway) = setup();
        let handle = gateway
            .place_order(&OrderSpec::market("BTC-USDT", TradeSide::Buy, dec!(2)))
            .await
            .unwrap();

        let update = gateway.order_status(&handle).await.unwrap();
        assert_eq!(update.state, OrderState::Filled);
        assert_eq!(update.average_price, Some(dec!(101)));
        assert_eq!(update.cumulative_fee, dec!(0.202));
    }

    #[tokio::test]
    async fn test_limit_order_fills_when_crossed() {
        let (board, gateway) = setup();
        let handle = gateway
            .place_order(&OrderSpec::limit("BTC-USDT", TradeSide::Buy, dec!(1), dec!(95)))
            .await
            .unwrap();
        assert_eq!(gateway.open_order_count(), 1);

        board.publish(MarketSnapshot::new(
            "BTC-USDT",
            dec!(93),
            dec!(94),
            Utc::now() + ChronoDuration::seconds(1),
        ));

        let update = gateway.order_status(&handle).await.unwrap();
        assert_eq!(update.state, OrderState::Filled);
        assert_eq!(update.average_price, Some(dec!(95)));
        assert_eq!(gateway.open_order_count(), 0);
    }

    #[tokio::test]
    async fn test_cancel_open_order() {
        let (_, gateway) = setup();
        let handle = gateway
            .place_order(&OrderSpec::limit("BTC-USDT", TradeSide::Sell, dec!(1), dec!(120)))
            .await
            .unwrap();

        assert!(gateway.cancel_order(&handle).await.unwrap());
        let update = gateway.order_status(&handle).await.unwrap();
        assert_eq!(update.state, OrderState::Cancelled);
        assert!(!gateway.cancel_order(&handle).await.unwrap());
    }

    #[tokio::test]
    async fn test_injected_faults() {
        let (_, gateway) = setup();
        gateway.fail_next_places(1);
        let spec = OrderSpec::market("BTC-USDT", TradeSide::Buy, dec!(1));

        assert!(matches!(
            gateway.place_order(&spec).await,
            Err(GatewayError::Transport(_))
        ));
        assert!(gateway.place_order(&spec).await.is_ok());
        assert_eq!(gateway.placed_count(), 1);
    }

    #[tokio::test]
    async fn test_market_order_without_price_is_rejected() {
        let (_, gateway) = setup();
        let result = gateway
            .place_order(&OrderSpec::market("ETH-USDT", TradeSide::Buy, dec!(1)))
            .await;
        assert!(matches!(result, Err(GatewayError::Rejected(_))));
    }
}
