use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::engine::{PollOutcome, SyncEngine};
use crate::log_throttle::PollFailureLog;

/// One poll tick. Failures are counted and logged through `failures`; the
/// caller keeps ticking either way.
pub async fn poll_once(engine: &SyncEngine, failures: &mut PollFailureLog) -> Option<PollOutcome> {
    let code = engine.context().event_code?;
    match engine.refresh().await {
        Ok(outcome) => {
            failures.success(&code);
            Some(outcome)
        }
        Err(err) => {
            failures.failure(&code, &err);
            None
        }
    }
}

/// Polls on a fixed schedule for as long as the task lives. A slow fetch
/// skips the ticks it overran instead of bunching them up afterwards.
pub fn spawn_poll_loop(engine: SyncEngine) -> JoinHandle<()> {
    let period = engine.settings().poll_interval.max(Duration::from_millis(1));
    let mut failures = PollFailureLog::new(engine.settings().failure_log_threshold);
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            poll_once(&engine, &mut failures).await;
        }
    })
}
