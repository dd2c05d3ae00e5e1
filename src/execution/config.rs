use crate::error::OrchestratorError;
use crate::models::{ControllerId, TradeSide};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Risk barriers, all optional. Stop-loss and take-profit are fractions of the
/// entry price (0.005 = 0.5%).
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct TripleBarrierConfig {
    pub stop_loss: Option<Decimal>,
    pub take_profit: Option<Decimal>,
    pub time_limit_secs: Option<u64>,
}

/// One entry level of a DCA executor
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DcaLevel {
    pub price: Decimal,
    pub amount: Decimal,
}

/// Executor kinds. Each variant only decides which entry orders get placed;
/// barrier handling and closing are shared.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ExecutorKind {
    /// Single entry: market order when `entry_price` is None, limit otherwise
    Position {
        amount: Decimal,
        entry_price: Option<Decimal>,
    },
    /// Ladder of limit entries moving away from the market
    Dca { levels: Vec<DcaLevel> },
}

impl ExecutorKind {
    pub fn name(&self) -> &'static str {
        match self {
            ExecutorKind::Position { .. } => "position",
            ExecutorKind::Dca { .. } => "dca",
        }
    }

    /// Total amount the entries try to fill
    pub fn target_amount(&self) -> Decimal {
        match self {
            ExecutorKind::Position { amount, .. } => *amount,
            ExecutorKind::Dca { levels } => levels.iter().map(|l| l.amount).sum(),
        }
    }
}

/// Immutable description of what an executor should do. Built by a controller,
/// owned by the executor it spawns.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExecutorConfig {
    pub controller_id: ControllerId,
    pub instrument: String,
    pub side: TradeSide,
    pub kind: ExecutorKind,
    #[serde(default)]
    pub barriers: TripleBarrierConfig,
    /// Creation time, also the reference for the time limit
    pub timestamp: DateTime<Utc>,
    /// Take over the controller's held position on this instrument and side
    #[serde(default)]
    pub adopt_held_position: bool,
}

impl ExecutorConfig {
    pub fn position(
        controller_id: impl Into<ControllerId>,
        instrument: impl Into<String>,
        side: TradeSide,
        amount: Decimal,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            controller_id: controller_id.into(),
            instrument: instrument.into(),
            side,
            kind: ExecutorKind::Position {
                amount,
                entry_price: None,
            },
            barriers: TripleBarrierConfig::default(),
            timestamp,
            adopt_held_position: false,
        }
    }

    pub fn with_barriers(mut self, barriers: TripleBarrierConfig) -> Self {
        self.barriers = barriers;
        self
    }

    /// Same config apart from creation time
    pub fn is_equivalent(&self, other: &ExecutorConfig) -> bool {
        self.controller_id == other.controller_id
            && self.instrument == other.instrument
            && self.side == other.side
            && self.kind == other.kind
            && self.barriers == other.barriers
            && self.adopt_held_position == other.adopt_held_position
    }

    pub fn validate(&self) -> Result<(), OrchestratorError> {
        if self.instrument.trim().is_empty() {
            return Err(invalid("instrument is empty"));
        }

        match &self.kind {
            ExecutorKind::Position {
                amount,
                entry_price,
            } => {
                if *amount <= Decimal::ZERO {
                    return Err(invalid(format!("amount must be positive, got {}", amount)));
                }
                if let Some(price) = entry_price {
                    if *price <= Decimal::ZERO {
                        return Err(invalid(format!("entry price must be positive, got {}", price)));
                    }
                }
            }
            ExecutorKind::Dca { levels } => {
                if levels.is_empty() {
                    return Err(invalid("dca needs at least one level"));
                }
                for level in levels {
                    if level.amount <= Decimal::ZERO || level.price <= Decimal::ZERO {
                        return Err(invalid(format!(
                            "dca level {}@{} must have positive amount and price",
                            level.amount, level.price
                        )));
                    }
                }
                // Each level must sit further from the market than the previous one
                let well_ordered = levels.windows(2).all(|pair| match self.side {
                    TradeSide::Buy => pair[1].price < pair[0].price,
                    TradeSide::Sell => pair[1].price > pair[0].price,
                });
                if !well_ordered {
                    return Err(invalid("dca levels must move away from the market"));
                }
            }
        }

        let barriers = &self.barriers;
        if let Some(sl) = barriers.stop_loss {
            if sl <= Decimal::ZERO || sl >= Decimal::ONE {
                return Err(invalid(format!("stop loss must be in (0, 1), got {}", sl)));
            }
        }
        if let Some(tp) = barriers.take_profit {
            if tp <= Decimal::ZERO {
                return Err(invalid(format!("take profit must be positive, got {}", tp)));
            }
        }
        if barriers.time_limit_secs == Some(0) {
            return Err(invalid("time limit must be positive"));
        }

        Ok(())
    }
}

fn invalid(reason: impl Into<String>) -> OrchestratorError {
    OrchestratorError::InvalidConfig(reason.into())
}
