use super::{MarketDataError, PriceBoard};
use crate::models::MarketSnapshot;
use chrono::Utc;
use governor::{Quota, RateLimiter};
use reqwest::Client;
use rust_decimal::Decimal;
use serde::Deserialize;
use std::num::NonZeroU32;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

type FeedRateLimiter = RateLimiter<
    governor::state::direct::NotKeyed,
    governor::state::InMemoryState,
    governor::clock::DefaultClock,
>;

/// Response from /api/v3/ticker/bookTicker
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BookTicker {
    symbol: String,
    bid_price: String,
    ask_price: String,
}

/// Polls a book-ticker endpoint and publishes top of book into a `PriceBoard`
#[derive(Clone)]
pub struct BookTickerFeed {
    client: Client,
    base_url: String,
    board: Arc<PriceBoard>,
    rate_limiter: Arc<FeedRateLimiter>,
}

impl BookTickerFeed {
    pub fn new(
        base_url: impl Into<String>,
        requests_per_minute: u32,
        board: Arc<PriceBoard>,
    ) -> Result<Self, MarketDataError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| MarketDataError::Http(e.to_string()))?;

        let rpm = NonZeroU32::new(requests_per_minute).unwrap_or(NonZeroU32::MIN);
        let rate_limiter = Arc::new(RateLimiter::direct(Quota::per_minute(rpm)));

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            board,
            rate_limiter,
        })
    }

    /// Fetch the current top of book for one instrument
    pub async fn fetch(&self, instrument: &str) -> Result<MarketSnapshot, MarketDataError> {
        self.rate_limiter.until_ready().await;

        let url = format!("{}/api/v3/ticker/bookTicker", self.base_url);
        let response = self
            .client
            .get(&url)
            .query(&[("symbol", instrument)])
            .send()
            .await
            .map_err(|e| MarketDataError::Http(e.to_string()))?;

        if !response.status().is_success() {
            return Err(MarketDataError::Http(format!(
                "book ticker returned {}",
                response.status()
            )));
        }

        let ticker: BookTicker = response
            .json()
            .await
            .map_err(|e| MarketDataError::Parse(e.to_string()))?;

        let best_bid = parse_price(&ticker.bid_price)?;
        let best_ask = parse_price(&ticker.ask_price)?;
        if best_bid <= Decimal::ZERO || best_ask < best_bid {
            return Err(MarketDataError::Parse(format!(
                "crossed or empty book for {}: bid {} ask {}",
                ticker.symbol, best_bid, best_ask
            )));
        }

        Ok(MarketSnapshot::new(instrument, best_bid, best_ask, Utc::now()))
    }

    /// Fetch every instrument once and publish what came back. Returns how many
    /// snapshots were published.
    pub async fn poll_once(&self, instruments: &[String]) -> usize {
        let mut published = 0;
        for instrument in instruments {
            match self.fetch(instrument).await {
                Ok(snapshot) => {
                    tracing::debug!(
                        instrument = %instrument,
                        bid = %snapshot.best_bid,
                        ask = %snapshot.best_ask,
                        "Fetched book ticker"
                    );
                    if self.board.publish(snapshot) {
                        published += 1;
                    }
                }
                Err(e) => {
                    tracing::warn!(instrument = %instrument, error = %e, "Book ticker fetch failed");
                }
            }
        }
        published
    }

    /// Poll until `shutdown` flips to true
    pub async fn run(
        self,
        instruments: Vec<String>,
        poll_interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) {
        tracing::info!(
            instruments = ?instruments,
            interval_ms = poll_interval.as_millis() as u64,
            "Book ticker feed started"
        );
        let mut ticker = crate::scheduler::ticker(poll_interval);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.poll_once(&instruments).await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        tracing::info!("Book ticker feed stopped");
    }
}

fn parse_price(raw: &str) -> Result<Decimal, MarketDataError> {
    Decimal::from_str(raw).map_err(|e| MarketDataError::Parse(format!("price '{}': {}", raw, e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[tokio::test]
    async fn test_fetch_parses_book_ticker() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/api/v3/ticker/bookTicker")
            .match_query(mockito::Matcher::UrlEncoded(
                "symbol".into(),
                "BTCUSDT".into(),
            ))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                r#"{"symbol":"BTCUSDT","bidPrice":"99.50","bidQty":"1.0","askPrice":"100.50","askQty":"2.0"}"#,
            )
            .create_async()
            .await;

        let board = Arc::new(PriceBoard::new());
        let feed = BookTickerFeed::new(server.url(), 600, board.clone()).unwrap();

        let published = feed.poll_once(&["BTCUSDT".to_string()]).await;

        mock.assert_async().await;
        assert_eq!(published, 1);
        let snapshot = board.latest("BTCUSDT").unwrap();
        assert_eq!(snapshot.best_bid, dec!(99.50));
        assert_eq!(snapshot.mid, dec!(100));
    }

    #[tokio::test]
    async fn test_fetch_surfaces_http_errors() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("GET", "/api/v3/ticker/bookTicker")
            .match_query(mockito::Matcher::Any)
            .with_status(500)
            .create_async()
            .await;

        let board = Arc::new(PriceBoard::new());
        let feed = BookTickerFeed::new(server.url(), 600, board.clone()).unwrap();

        let result = feed.fetch("BTCUSDT").await;
        assert!(matches!(result, Err(MarketDataError::Http(_))));
        assert_eq!(feed.poll_once(&["BTCUSDT".to_string()]).await, 0);
        assert!(board.latest("BTCUSDT").is_none());
    }

    #[tokio::test]
    async fn test_rejects_malformed_prices() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("GET", "/api/v3/ticker/bookTicker")
            .match_query(mockito::Matcher::Any)
            .with_status(200)
            .with_body(r#"{"symbol":"BTCUSDT","bidPrice":"abc","askPrice":"100"}"#)
            .create_async()
            .await;

        let feed = BookTickerFeed::new(server.url(), 600, Arc::new(PriceBoard::new())).unwrap();
        assert!(matches!(
            feed.fetch("BTCUSDT").await,
            Err(MarketDataError::Parse(_))
        ));
    }
}
