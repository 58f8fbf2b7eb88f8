//! Periodic TTL purge.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use super::Outbox;

/// Calls [`Outbox::purge_expired`] every `every` until cancelled.
/// `Duration::ZERO` disables the task.
pub(crate) async fn run_retention(outbox: Arc<Outbox>, every: Duration, cancel: CancellationToken) {
    if every.is_zero() {
        return;
    }
    let mut tick = tokio::time::interval(every);
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tick.tick() => {
                if let Err(e) = outbox.purge_expired(Utc::now()) {
                    tracing::warn!(error = %e, kind = e.as_label(), "retention purge failed");
                }
            }
        }
    }
}
