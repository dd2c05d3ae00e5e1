//! Market data boundary: snapshot lookups and per-instrument subscriptions
pub mod book_ticker;

pub use book_ticker::BookTickerFeed;

use crate::models::MarketSnapshot;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};
use thiserror::Error;
use tokio::sync::mpsc::{self, error::TrySendError};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum MarketDataError {
    #[error("No market data for {0}")]
    UnknownInstrument(String),

    #[error("Market data request failed: {0}")]
    Http(String),

    #[error("Malformed market data: {0}")]
    Parse(String),
}

#[async_trait]
pub trait MarketDataProvider: Send + Sync {
    /// Latest snapshot for `instrument`
    async fn get_snapshot(&self, instrument: &str) -> Result<MarketSnapshot, MarketDataError>;

    /// Bounded stream of snapshots for `instrument`
    async fn subscribe(
        &self,
        instrument: &str,
        capacity: usize,
    ) -> Result<Subscription, MarketDataError>;
}

/// Receiving end of a market data subscription. Dropping it unsubscribes.
pub struct Subscription {
    instrument: String,
    rx: mpsc::Receiver<MarketSnapshot>,
}

impl Subscription {
    pub fn instrument(&self) -> &str {
        &self.instrument
    }

    /// Wait for the next snapshot, None once the provider went away
    pub async fn recv(&mut self) -> Option<MarketSnapshot> {
        self.rx.recv().await
    }

    /// Drain everything buffered and keep only the newest snapshot
    pub fn latest(&mut self) -> Option<MarketSnapshot> {
        let mut newest = None;
        while let Ok(snapshot) = self.rx.try_recv() {
            newest = Some(snapshot);
        }
        newest
    }
}

/// In-memory latest-price board.
///
/// Holds the newest snapshot per instrument and fans updates out to
/// subscribers. A subscriber whose buffer is full misses that update, the
/// board itself always keeps the newest one.
#[derive(Default)]
pub struct PriceBoard {
    latest: RwLock<HashMap<String, MarketSnapshot>>,
    subscribers: RwLock<HashMap<String, Vec<mpsc::Sender<MarketSnapshot>>>>,
}

impl PriceBoard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store and broadcast a snapshot. Returns false when it is older than the
    /// one already held for the instrument.
    pub fn publish(&self, snapshot: MarketSnapshot) -> bool {
        {
            let mut latest = self.latest.write().unwrap_or_else(PoisonError::into_inner);
            if let Some(current) = latest.get(&snapshot.instrument) {
                if snapshot.timestamp < current.timestamp {
                    tracing::debug!(
                        instrument = %snapshot.instrument,
                        stale = %snapshot.timestamp,
                        current = %current.timestamp,
                        "Dropping out-of-order snapshot"
                    );
                    return false;
                }
            }
            latest.insert(snapshot.instrument.clone(), snapshot.clone());
        }

        let mut subscribers = self
            .subscribers
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(senders) = subscribers.get_mut(&snapshot.instrument) {
            senders.retain(|tx| match tx.try_send(snapshot.clone()) {
                Ok(()) | Err(TrySendError::Full(_)) => true,
                Err(TrySendError::Closed(_)) => false,
            });
        }

        true
    }

    /// Newest snapshot without going through the async trait
    pub fn latest(&self, instrument: &str) -> Option<MarketSnapshot> {
        self.latest
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(instrument)
            .cloned()
    }

    pub fn instruments(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .latest
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }

    fn add_subscriber(&self, instrument: &str, capacity: usize) -> Subscription {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        if let Some(current) = self.latest(instrument) {
            let _ = tx.try_send(current);
        }
        self.subscribers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(instrument.to_string())
            .or_default()
            .push(tx);

        Subscription {
            instrument: instrument.to_string(),
            rx,
        }
    }
}

#[async_trait]
impl MarketDataProvider for PriceBoard {
    async fn get_snapshot(&self, instrument: &str) -> Result<MarketSnapshot, MarketDataError> {
        self.latest(instrument)
            .ok_or_else(|| MarketDataError::UnknownInstrument(instrument.to_string()))
    }

    async fn subscribe(
        &self,
        instrument: &str,
        capacity: usize,
    ) -> Result<Subscription, MarketDataError> {
        Ok(self.add_subscriber(instrument, capacity))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};
    use rust_decimal_macros::dec;

    #[tokio::test]
    async fn test_publish_and_get() {
        let board = PriceBoard::new();
        assert!(board.get_snapshot("BTC-USDT").await.is_err());

        let now = Utc::now();
        assert!(board.publish(MarketSnapshot::at_price("BTC-USDT", dec!(100), now)));
        let snapshot = board.get_snapshot("BTC-USDT").await.unwrap();
        assert_eq!(snapshot.mid, dec!(100));
    }

    #[tokio::test]
    async fn test_drops_out_of_order_snapshots() {
        let board = PriceBoard::new();
        let now = Utc::now();
        board.publish(MarketSnapshot::at_price("BTC-USDT", dec!(100), now));

        let accepted = board.publish(MarketSnapshot::at_price(
            "BTC-USDT",
            dec!(90),
            now - Duration::seconds(1),
        ));

        assert!(!accepted);
        assert_eq!(board.latest("BTC-USDT").unwrap().mid, dec!(100));
    }

    #[tokio::test]
    async fn test_subscription_keeps_newest() {
        let board = PriceBoard::new();
        let mut sub = board.subscribe("ETH-USDT", 2).await.unwrap();
        let now = Utc::now();

        for i in 0..5 {
            board.publish(MarketSnapshot::at_price(
                "ETH-USDT",
                dec!(10) + rust_decimal::Decimal::from(i),
                now + Duration::seconds(i),
            ));
        }

        // Only the first two fit in the buffer, the board still has the newest
        let buffered = sub.latest().unwrap();
        assert_eq!(buffered.mid, dec!(11));
        assert_eq!(board.latest("ETH-USDT").unwrap().mid, dec!(14));
        assert!(sub.latest().is_none());
    }

    #[tokio::test]
    async fn test_dropped_subscription_is_pruned() {
        let board = PriceBoard::new();
        let sub = board.subscribe("SOL-USDT", 4).await.unwrap();
        drop(sub);

        board.publish(MarketSnapshot::at_price("SOL-USDT", dec!(150), Utc::now()));
        let subscribers = board.subscribers.read().unwrap();
        assert!(subscribers.get("SOL-USDT").unwrap().is_empty());
    }
}
