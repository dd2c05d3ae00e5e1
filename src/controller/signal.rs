use crate::models::{MarketSnapshot, TradeSide};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;

/// Directional view produced by a signal source
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Signal {
    Buy,
    Sell,
    #[default]
    Neutral,
}

impl Signal {
    pub fn side(self) -> Option<TradeSide> {
        match self {
            Signal::Buy => Some(TradeSide::Buy),
            Signal::Sell => Some(TradeSide::Sell),
            Signal::Neutral => None,
        }
    }
}

impl fmt::Display for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Signal::Buy => write!(f, "BUY"),
            Signal::Sell => write!(f, "SELL"),
            Signal::Neutral => write!(f, "NEUTRAL"),
        }
    }
}

pub trait SignalSource: Send {
    fn name(&self) -> &'static str;

    /// Feed one snapshot, get the signal as of that snapshot
    fn update(&mut self, snapshot: &MarketSnapshot) -> Signal;
}

/// Relative change of the mid price over the last `lookback` snapshots
#[derive(Debug, Clone)]
pub struct MidMomentum {
    lookback: usize,
    threshold: Decimal,
    window: VecDeque<Decimal>,
}

impl MidMomentum {
    /// `lookback` must be at least 1, `threshold` positive
    pub fn new(lookback: usize, threshold: Decimal) -> Option<Self> {
        if lookback == 0 || threshold <= Decimal::ZERO {
            return None;
        }
        Some(Self {
            lookback,
            threshold,
            window: VecDeque::with_capacity(lookback + 1),
        })
    }

    pub fn is_warm(&self) -> bool {
        self.window.len() > self.lookback
    }
}

impl SignalSource for MidMomentum {
    fn name(&self) -> &'static str {
        "mid_momentum"
    }

    fn update(&mut self, snapshot: &MarketSnapshot) -> Signal {
        self.window.push_back(snapshot.mid);
        while self.window.len() > self.lookback + 1 {
            self.window.pop_front();
        }
        if !self.is_warm() {
            return Signal::Neutral;
        }

        let (Some(&first), Some(&last)) = (self.window.front(), self.window.back()) else {
            return Signal::Neutral;
        };
        if first <= Decimal::ZERO {
            return Signal::Neutral;
        }

        let change = (last - first) / first;
        if change >= self.threshold {
            Signal::Buy
        } else if change <= -self.threshold {
            Signal::Sell
        } else {
            Signal::Neutral
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use rust_decimal_macros::dec;

    fn feed(source: &mut MidMomentum, mids: &[Decimal]) -> Vec<Signal> {
        mids.iter()
            .map(|mid| source.update(&MarketSnapshot::at_price("BTCUSDT", *mid, Utc::now())))
            .collect()
    }

    #[test]
    fn test_neutral_until_warm() {
        let mut source = MidMomentum::new(3, dec!(0.01)).unwrap();
        let signals = feed(&mut source, &[dec!(100), dec!(105), dec!(110)]);
        assert!(signals.iter().all(|s| *s == Signal::Neutral));
        assert!(!source.is_warm());
    }

    #[test]
    fn test_momentum_direction() {
        let mut source = MidMomentum::new(2, dec!(0.01)).unwrap();
        let signals = feed(&mut source, &[dec!(100), dec!(100.5), dec!(101), dec!(100.2), dec!(99.9)]);

        assert_eq!(signals[2], Signal::Buy);
        assert_eq!(signals[3], Signal::Neutral);
        assert_eq!(signals[4], Signal::Sell);
    }

    #[test]
    fn test_rejects_bad_params() {
        assert!(MidMomentum::new(0, dec!(0.01)).is_none());
        assert!(MidMomentum::new(5, Decimal::ZERO).is_none());
    }
}
