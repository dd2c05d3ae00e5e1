//! Exchange gateway boundary consumed by executors
pub mod paper;

pub use paper::PaperGateway;

use crate::models::TradeSide;
use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum OrderType {
    Market,
    Limit,
}

/// Order request sent to the exchange
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OrderSpec {
    /// Client-side id, stable across retries of the same order
    pub client_order_id: Uuid,
    pub instrument: String,
    pub side: TradeSide,
    pub order_type: OrderType,
    pub amount: Decimal,
    /// Limit price, None for market orders
    pub price: Option<Decimal>,
}

impl OrderSpec {
    pub fn market(instrument: impl Into<String>, side: TradeSide, amount: Decimal) -> Self {
        Self {
            client_order_id: Uuid::new_v4(),
            instrument: instrument.into(),
            side,
            order_type: OrderType::Market,
            amount,
            price: None,
        }
    }

    pub fn limit(instrument: impl Into<String>, side: TradeSide, amount: Decimal, price: Decimal) -> Self {
        Self {
            client_order_id: Uuid::new_v4(),
            instrument: instrument.into(),
            side,
            order_type: OrderType::Limit,
            amount,
            price: Some(price),
        }
    }
}

/// Exchange-side reference to a placed order
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct OrderHandle {
    pub order_id: String,
    pub client_order_id: Uuid,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum OrderState {
    Open,
    Filled,
    Cancelled,
    Rejected,
}

impl OrderState {
    /// No more fills can happen
    pub fn is_final(self) -> bool {
        !matches!(self, OrderState::Open)
    }
}

/// Current state of an order, including partial fills
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OrderUpdate {
    pub state: OrderState,
    pub filled_amount: Decimal,
    pub average_price: Option<Decimal>,
    pub cumulative_fee: Decimal,
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum GatewayError {
    #[error("Gateway call timed out after {ms}ms")]
    Timeout { ms: u64 },

    #[error("Order rejected: {0}")]
    Rejected(String),

    #[error("Gateway transport error: {0}")]
    Transport(String),
}

#[async_trait]
pub trait ExchangeGateway: Send + Sync {
    async fn place_order(&self, spec: &OrderSpec) -> Result<OrderHandle, GatewayError>;

    /// True when the exchange confirmed the cancellation
    async fn cancel_order(&self, handle: &OrderHandle) -> Result<bool, GatewayError>;

    async fn order_status(&self, handle: &OrderHandle) -> Result<OrderUpdate, GatewayError>;
}

/// Run a gateway call under a deadline, expiry counts as a failed call
pub async fn with_deadline<T, F>(deadline: Duration, call: F) -> Result<T, GatewayError>
where
    F: Future<Output = Result<T, GatewayError>>,
{
    match tokio::time::timeout(deadline, call).await {
        Ok(result) => result,
        Err(_) => Err(GatewayError::Timeout {
            ms: deadline.as_millis() as u64,
        }),
    }
}
