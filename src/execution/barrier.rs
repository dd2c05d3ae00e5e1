use super::config::TripleBarrierConfig;
use super::status::CloseType;
use rust_decimal::Decimal;

/// Inputs of one barrier check
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BarrierInput {
    /// Unrealized PnL as a fraction of entry, None while nothing is filled
    pub pnl_pct: Option<Decimal>,
    pub elapsed_secs: i64,
    pub cancel_requested: bool,
}

/// Check the barriers in fixed order: stop-loss, take-profit, time limit,
/// then an upstream cancel. The first hit wins.
pub fn evaluate(barriers: &TripleBarrierConfig, input: &BarrierInput) -> Option<CloseType> {
    if let (Some(sl), Some(pnl)) = (barriers.stop_loss, input.pnl_pct) {
        if pnl <= -sl {
            return Some(CloseType::StopLoss);
        }
    }

    if let (Some(tp), Some(pnl)) = (barriers.take_profit, input.pnl_pct) {
        if pnl >= tp {
            return Some(CloseType::TakeProfit);
        }
    }

    if let Some(limit) = barriers.time_limit_secs {
        if input.elapsed_secs >= i64::try_from(limit).unwrap_or(i64::MAX) {
            return Some(CloseType::TimeLimit);
        }
    }

    if input.cancel_requested {
        return Some(CloseType::EarlyStop);
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn barriers() -> TripleBarrierConfig {
        TripleBarrierConfig {
            stop_loss: Some(dec!(0.005)),
            take_profit: Some(dec!(0.01)),
            time_limit_secs: Some(60),
        }
    }

    fn input(pnl: Option<Decimal>, elapsed: i64, cancel: bool) -> BarrierInput {
        BarrierInput {
            pnl_pct: pnl,
            elapsed_secs: elapsed,
            cancel_requested: cancel,
        }
    }

    #[test]
    fn test_no_barrier_hit() {
        assert_eq!(evaluate(&barriers(), &input(Some(dec!(0.002)), 10, false)), None);
    }

    #[test]
    fn test_each_barrier() {
        let b = barriers();
        assert_eq!(
            evaluate(&b, &input(Some(dec!(0.01)), 10, false)),
            Some(CloseType::TakeProfit)
        );
        assert_eq!(
            evaluate(&b, &input(Some(dec!(-0.006)), 10, false)),
            Some(CloseType::StopLoss)
        );
        assert_eq!(evaluate(&b, &input(Some(dec!(0)), 60, false)), Some(CloseType::TimeLimit));
        assert_eq!(evaluate(&b, &input(None, 5, true)), Some(CloseType::EarlyStop));
    }

    #[test]
    fn test_stop_loss_beats_time_and_cancel() {
        assert_eq!(
            evaluate(&barriers(), &input(Some(dec!(-0.05)), 120, true)),
            Some(CloseType::StopLoss)
        );
    }

    #[test]
    fn test_huge_time_limit_never_expires() {
        let b = TripleBarrierConfig {
            time_limit_secs: Some(u64::MAX),
            ..barriers()
        };
        assert_eq!(evaluate(&b, &input(Some(dec!(0)), 10, false)), None);
        assert_eq!(evaluate(&b, &input(Some(dec!(0)), i64::MAX, false)), Some(CloseType::TimeLimit));
    }

    #[test]
    fn test_price_barriers_beat_time_and_cancel() {
        let b = barriers();
        assert_eq!(
            evaluate(&b, &input(Some(dec!(0.02)), 120, true)),
            Some(CloseType::TakeProfit)
        );
        assert_eq!(evaluate(&b, &input(Some(dec!(0)), 120, true)), Some(CloseType::TimeLimit));
    }

    #[test]
    fn test_price_barriers_need_fills() {
        let b = barriers();
        assert_eq!(evaluate(&b, &input(None, 10, false)), None);
    }
}
