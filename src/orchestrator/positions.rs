use crate::models::{ControllerId, TradeSide};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

/// Market exposure kept after the executor that built it was stopped
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HeldPosition {
    pub controller_id: ControllerId,
    pub instrument: String,
    pub side: TradeSide,
    pub amount: Decimal,
    /// Volume-weighted entry price
    pub entry_price: Decimal,
    pub fees: Decimal,
    pub updated_at: DateTime<Utc>,
}

impl HeldPosition {
    pub fn notional(&self) -> Decimal {
        self.amount * self.entry_price
    }
}

/// Persisted form of the held book
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct HeldSnapshot {
    pub positions: Vec<HeldPosition>,
    /// PnL realized by netting, per controller
    #[serde(default)]
    pub realized: BTreeMap<ControllerId, Decimal>,
}

/// Held positions keyed by (controller, instrument).
///
/// Same-side positions merge at their volume-weighted price. Opposite-side
/// positions net down and realize PnL on the offset amount; a flat result
/// drops the entry.
#[derive(Debug, Default)]
pub struct PositionBook {
    positions: HashMap<(ControllerId, String), HeldPosition>,
    realized: HashMap<ControllerId, Decimal>,
}

impl PositionBook {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild from a persisted snapshot
    pub fn restore(snapshot: HeldSnapshot) -> Self {
        let mut book = Self::new();
        for position in snapshot.positions {
            book.apply(position);
        }
        book.realized.extend(snapshot.realized);
        book
    }

    pub fn snapshot(&self) -> HeldSnapshot {
        HeldSnapshot {
            positions: self.all(),
            realized: self
                .realized
                .iter()
                .map(|(cid, pnl)| (cid.clone(), *pnl))
                .collect(),
        }
    }

    /// Add a position to the book, returns the PnL realized by netting
    pub fn apply(&mut self, incoming: HeldPosition) -> Decimal {
        if incoming.amount <= Decimal::ZERO {
            return Decimal::ZERO;
        }
        let key = (incoming.controller_id.clone(), incoming.instrument.clone());

        let Some(existing) = self.positions.remove(&key) else {
            self.positions.insert(key, incoming);
            return Decimal::ZERO;
        };

        if existing.side == incoming.side {
            let amount = existing.amount + incoming.amount;
            let entry_price = (existing.notional() + incoming.notional()) / amount;
            self.positions.insert(
                key,
                HeldPosition {
                    amount,
                    entry_price,
                    fees: existing.fees + incoming.fees,
                    updated_at: incoming.updated_at,
                    ..existing
                },
            );
            return Decimal::ZERO;
        }

        let offset = existing.amount.min(incoming.amount);
        let pnl = (incoming.entry_price - existing.entry_price) * offset * existing.side.sign();
        *self
            .realized
            .entry(incoming.controller_id.clone())
            .or_insert(Decimal::ZERO) += pnl;

        tracing::debug!(
            controller_id = %existing.controller_id,
            instrument = %existing.instrument,
            offset = %offset,
            pnl = %pnl,
            "Netted held positions"
        );

        let fees = existing.fees + incoming.fees;
        if existing.amount > incoming.amount {
            self.positions.insert(
                key,
                HeldPosition {
                    amount: existing.amount - offset,
                    fees,
                    updated_at: incoming.updated_at,
                    ..existing
                },
            );
        } else if incoming.amount > existing.amount {
            self.positions.insert(
                key,
                HeldPosition {
                    amount: incoming.amount - offset,
                    fees,
                    ..incoming
                },
            );
        }
        pnl
    }

    /// Remove and return the held position for an adopting executor, only when
    /// it sits on the requested side
    pub fn take(&mut self, controller_id: &str, instrument: &str, side: TradeSide) -> Option<HeldPosition> {
        let key = (controller_id.to_string(), instrument.to_string());
        match self.positions.get(&key) {
            Some(position) if position.side == side => self.positions.remove(&key),
            _ => None,
        }
    }

    pub fn positions_for(&self, controller_id: &str) -> Vec<HeldPosition> {
        let mut positions: Vec<HeldPosition> = self
            .positions
            .values()
            .filter(|p| p.controller_id == controller_id)
            .cloned()
            .collect();
        positions.sort_by(|a, b| a.instrument.cmp(&b.instrument));
        positions
    }

    /// Every held position, for snapshots to the recorder
    pub fn all(&self) -> Vec<HeldPosition> {
        let mut positions: Vec<HeldPosition> = self.positions.values().cloned().collect();
        positions.sort_by(|a, b| {
            (&a.controller_id, &a.instrument).cmp(&(&b.controller_id, &b.instrument))
        });
        positions
    }

    pub fn realized_for(&self, controller_id: &str) -> Decimal {
        self.realized.get(controller_id).copied().unwrap_or(Decimal::ZERO)
    }

    pub fn controllers(&self) -> impl Iterator<Item = &ControllerId> {
        self.positions.keys().map(|(cid, _)| cid).chain(self.realized.keys())
    }

    pub fn len(&self) -> usize {
        self.positions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }
}
