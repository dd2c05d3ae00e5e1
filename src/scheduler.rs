use std::time::Duration;
use tokio::time::{interval, Interval, MissedTickBehavior};

/// Ticker firing every `period`, starting immediately.
///
/// Missed ticks are skipped rather than bursted: a slow iteration must never
/// make a control loop run several times back to back.
pub fn ticker(period: Duration) -> Interval {
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    ticker
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::Instant;

    #[tokio::test]
    async fn test_ticker_first_tick_is_immediate() {
        let mut ticker = ticker(Duration::from_secs(3600));
        let started = Instant::now();
        ticker.tick().await;
        assert!(started.elapsed() < Duration::from_secs(1));
    }
}
