//! Periodic cleanup of dead peers and stale call records.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use crate::relay::RelayState;
use crate::switchboard::{ReapReport, deliver_all};

/// Spawns the reaper loop, running one sweep per `state.reaper_interval`.
///
/// The first sweep happens one full interval after startup.
pub fn spawn(state: Arc<RelayState>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(state.reaper_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        interval.tick().await;

        loop {
            interval.tick().await;
            sweep(&state);
        }
    })
}

/// Runs one sweep now.
pub fn sweep(state: &RelayState) -> ReapReport {
    sweep_at(state, Instant::now())
}

/// Runs one sweep as if the current time were `now`.
///
/// Notifications are queued before the switchboard lock is released; the
/// returned report still lists what was reclaimed.
pub fn sweep_at(state: &RelayState, now: Instant) -> ReapReport {
    let mut report = {
        let mut board = state.switchboard.lock();
        let mut report = board.reap(now, state.call_ttl);
        deliver_all(std::mem::take(&mut report.deliveries));
        report
    };

    if !report.is_empty() {
        tracing::info!(
            evicted_peers = report.evicted_peers.len(),
            expired_calls = report.expired_calls.len(),
            "reaper reclaimed state"
        );
    }
    report
}
