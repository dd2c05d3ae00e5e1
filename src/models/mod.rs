use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Unique id of a running executor
pub type ExecutorId = Uuid;

/// Id of the controller (strategy instance) that owns an executor
pub type ControllerId = String;

/// Direction of an order or position
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TradeSide {
    Buy,
    Sell,
}

impl TradeSide {
    pub fn opposite(self) -> Self {
        match self {
            TradeSide::Buy => TradeSide::Sell,
            TradeSide::Sell => TradeSide::Buy,
        }
    }

    /// +1 for buys, -1 for sells
    pub fn sign(self) -> Decimal {
        match self {
            TradeSide::Buy => Decimal::ONE,
            TradeSide::Sell => Decimal::NEGATIVE_ONE,
        }
    }
}

impl fmt::Display for TradeSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TradeSide::Buy => write!(f, "BUY"),
            TradeSide::Sell => write!(f, "SELL"),
        }
    }
}

/// Top of book for one instrument at a point in time
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MarketSnapshot {
    pub instrument: String,
    pub best_bid: Decimal,
    pub best_ask: Decimal,
    pub mid: Decimal,
    pub timestamp: DateTime<Utc>,
}

impl MarketSnapshot {
    pub fn new(
        instrument: impl Into<String>,
        best_bid: Decimal,
        best_ask: Decimal,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            instrument: instrument.into(),
            best_bid,
            best_ask,
            mid: (best_bid + best_ask) / Decimal::TWO,
            timestamp,
        }
    }

    /// Snapshot with no spread, handy for simulations
    pub fn at_price(instrument: impl Into<String>, price: Decimal, timestamp: DateTime<Utc>) -> Self {
        Self::new(instrument, price, price, timestamp)
    }

    /// Price a taker pays to trade on `side` (ask for buys, bid for sells)
    pub fn taker_price(&self, side: TradeSide) -> Decimal {
        match side {
            TradeSide::Buy => self.best_ask,
            TradeSide::Sell => self.best_bid,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_snapshot_mid() {
        let snapshot = MarketSnapshot::new("BTC-USDT", dec!(99), dec!(101), Utc::now());
        assert_eq!(snapshot.mid, dec!(100));
        assert_eq!(snapshot.taker_price(TradeSide::Buy), dec!(101));
        assert_eq!(snapshot.taker_price(TradeSide::Sell), dec!(99));
    }

    #[test]
    fn test_side_helpers() {
        assert_eq!(TradeSide::Buy.opposite(), TradeSide::Sell);
        assert_eq!(TradeSide::Sell.sign(), dec!(-1));
        assert_eq!(TradeSide::Buy.to_string(), "BUY");
    }
}
