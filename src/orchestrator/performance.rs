use crate::execution::{CloseType, ExecutorInfo, ExecutorStatus};
use crate::models::{ControllerId, TradeSide};
use crate::persistence::ClosedPositionRecord;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};

/// Aggregate performance of one controller. Derived, never persisted.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct PerformanceSnapshot {
    pub realized_pnl: Decimal,
    pub unrealized_pnl: Decimal,
    pub fees: Decimal,
    pub net_pnl: Decimal,
    pub volume_quote: Decimal,
    pub closed_count: usize,
    pub active_count: usize,
    pub win_count: usize,
    pub win_rate: Decimal,
    /// How many executors closed for each reason
    pub close_types: BTreeMap<CloseType, usize>,
    pub active_long: usize,
    pub active_short: usize,
}

/// Running totals of the executors a controller already stored
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ClosedTotals {
    pub realized_pnl: Decimal,
    pub fees: Decimal,
    pub volume_quote: Decimal,
    pub closed_count: usize,
    pub win_count: usize,
    pub close_types: BTreeMap<CloseType, usize>,
}

impl ClosedTotals {
    pub fn add(&mut self, record: &ClosedPositionRecord) {
        self.realized_pnl += record.realized_pnl;
        self.fees += record.fees;
        self.volume_quote += record.volume_quote;
        self.closed_count += 1;
        if record.realized_pnl - record.fees > Decimal::ZERO {
            self.win_count += 1;
        }
        if let Some(close_type) = record.close_type {
            *self.close_types.entry(close_type).or_insert(0) += 1;
        }
    }
}

impl PerformanceSnapshot {
    /// Aggregate one controller: totals of stored executors, the executors
    /// still in the active set, and `held_realized`, the PnL realized by
    /// netting held positions.
    pub fn compute<'a>(
        stored: Option<&ClosedTotals>,
        executors: impl IntoIterator<Item = &'a ExecutorInfo>,
        held_realized: Decimal,
    ) -> Self {
        let mut snapshot = PerformanceSnapshot {
            realized_pnl: held_realized,
            ..Default::default()
        };
        if let Some(stored) = stored {
            snapshot.realized_pnl += stored.realized_pnl;
            snapshot.fees += stored.fees;
            snapshot.volume_quote += stored.volume_quote;
            snapshot.closed_count += stored.closed_count;
            snapshot.win_count += stored.win_count;
            snapshot.close_types = stored.close_types.clone();
        }

        for info in executors {
            snapshot.realized_pnl += info.realized_pnl;
            snapshot.unrealized_pnl += info.unrealized_pnl;
            snapshot.fees += info.fees;
            snapshot.volume_quote += info.volume_quote;

            match info.status {
                ExecutorStatus::Active => {
                    snapshot.active_count += 1;
                    match info.side {
                        TradeSide::Buy => snapshot.active_long += 1,
                        TradeSide::Sell => snapshot.active_short += 1,
                    }
                }
                status if status.is_terminal() => {
                    snapshot.closed_count += 1;
                    if info.net_pnl() > Decimal::ZERO {
                        snapshot.win_count += 1;
                    }
                    if let Some(close_type) = info.close_type {
                        *snapshot.close_types.entry(close_type).or_insert(0) += 1;
                    }
                }
                _ => {}
            }
        }

        snapshot.net_pnl = snapshot.realized_pnl + snapshot.unrealized_pnl - snapshot.fees;
        if snapshot.closed_count > 0 {
            snapshot.win_rate =
                Decimal::from(snapshot.win_count as u64) / Decimal::from(snapshot.closed_count as u64);
        }
        snapshot
    }
}

/// Per-controller snapshots, recomputed only for controllers marked dirty
#[derive(Debug, Default)]
pub struct PerformanceCache {
    snapshots: HashMap<ControllerId, PerformanceSnapshot>,
    dirty: HashSet<ControllerId>,
}

impl PerformanceCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn invalidate(&mut self, controller_id: &str) {
        self.dirty.insert(controller_id.to_string());
    }

    pub fn is_dirty(&self, controller_id: &str) -> bool {
        self.dirty.contains(controller_id) || !self.snapshots.contains_key(controller_id)
    }

    /// Cached snapshot, recomputed with `compute` first when stale
    pub fn get_or_compute(
        &mut self,
        controller_id: &str,
        compute: impl FnOnce() -> PerformanceSnapshot,
    ) -> PerformanceSnapshot {
        if self.is_dirty(controller_id) {
            self.snapshots.insert(controller_id.to_string(), compute());
            self.dirty.remove(controller_id);
        }
        self.snapshots
            .get(controller_id)
            .cloned()
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use rust_decimal_macros::dec;
    use uuid::Uuid;

    fn info(status: ExecutorStatus, side: TradeSide, realized: Decimal, close_type: Option<CloseType>) -> ExecutorInfo {
        ExecutorInfo {
            id: Uuid::new_v4(),
            controller_id: "ctrl".to_string(),
            instrument: "BTC-USDT".to_string(),
            side,
            kind: "position".to_string(),
            status,
            close_type,
            created_at: Utc::now(),
            closed_at: None,
            open_amount: Decimal::ZERO,
            filled_amount: dec!(1),
            entry_price: Some(dec!(100)),
            exit_price: None,
            realized_pnl: realized,
            unrealized_pnl: Decimal::ZERO,
            fees: dec!(0.1),
            volume_quote: dec!(200),
            last_error: None,
        }
    }

    #[test]
    fn test_compute_aggregates() {
        let mut active = info(ExecutorStatus::Active, TradeSide::Sell, Decimal::ZERO, None);
        active.unrealized_pnl = dec!(0.5);
        let executors = vec![
            info(ExecutorStatus::Terminated, TradeSide::Buy, dec!(1), Some(CloseType::TakeProfit)),
            info(ExecutorStatus::ClosedBySl, TradeSide::Buy, dec!(-0.5), Some(CloseType::StopLoss)),
            info(ExecutorStatus::Terminated, TradeSide::Buy, dec!(2), Some(CloseType::TakeProfit)),
            active,
        ];

        let snapshot = PerformanceSnapshot::compute(None, &executors, dec!(0.25));

        assert_eq!(snapshot.realized_pnl, dec!(2.75));
        assert_eq!(snapshot.unrealized_pnl, dec!(0.5));
        assert_eq!(snapshot.fees, dec!(0.4));
        assert_eq!(snapshot.net_pnl, dec!(2.85));
        assert_eq!(snapshot.volume_quote, dec!(800));
        assert_eq!(snapshot.closed_count, 3);
        assert_eq!(snapshot.win_count, 2);
        assert_eq!(snapshot.active_short, 1);
        assert_eq!(snapshot.close_types.get(&CloseType::TakeProfit), Some(&2));
        assert_eq!(snapshot.win_rate.round_dp(4), dec!(0.6667));
    }

    #[test]
    fn test_stored_totals_match_live_executors() {
        let closed = vec![
            info(ExecutorStatus::ClosedByTp, TradeSide::Buy, dec!(1), Some(CloseType::TakeProfit)),
            info(ExecutorStatus::ClosedBySl, TradeSide::Buy, dec!(-0.5), Some(CloseType::StopLoss)),
        ];
        let mut totals = ClosedTotals::default();
        for executor in &closed {
            totals.add(&ClosedPositionRecord::from(executor));
        }

        let live = PerformanceSnapshot::compute(None, &closed, Decimal::ZERO);
        let stored = PerformanceSnapshot::compute(Some(&totals), &Vec::<ExecutorInfo>::new(), Decimal::ZERO);

        assert_eq!(stored, live);
    }

    #[test]
    fn test_cache_recomputes_only_when_dirty() {
        let mut cache = PerformanceCache::new();
        let mut calls = 0;

        cache.get_or_compute("ctrl", || {
            calls += 1;
            PerformanceSnapshot::default()
        });
        cache.get_or_compute("ctrl", || {
            calls += 1;
            PerformanceSnapshot::default()
        });
        assert_eq!(calls, 1);

        cache.invalidate("ctrl");
        cache.get_or_compute("ctrl", || {
            calls += 1;
            PerformanceSnapshot::default()
        });
        assert_eq!(calls, 2);
    }
}
