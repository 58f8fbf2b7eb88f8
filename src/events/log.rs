//! # LogWriter: runtime events as `tracing` records.
//!
//! Routine events log at `info`/`debug`, recoveries at `warn`, alerts at `error`.
//! Installed by the binary; library users add it through
//! `RelayBuilder::with_observer` when they want the same output.

use async_trait::async_trait;

use super::{EventKind, Observe, RelayEvent};

/// Observer that writes every event through `tracing`.
#[derive(Debug, Default)]
pub struct LogWriter;

impl LogWriter {
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Observe for LogWriter {
    async fn on_event(&self, e: &RelayEvent) {
        let subscriber = e.subscriber.as_deref().unwrap_or("-");
        let error = e.error.as_deref().unwrap_or("");
        let kind = e.kind.as_label();

        match e.kind {
            EventKind::Connected
            | EventKind::SubscriberAttached
            | EventKind::SubscriberDetached
            | EventKind::ShutdownRequested
            | EventKind::AllStoppedWithin => {
                tracing::info!(kind, subscriber, "relay event");
            }
            EventKind::ReconciliationStarted | EventKind::ReconciliationFinished => {
                tracing::info!(kind, reason = error, count = ?e.count, "reconciliation");
            }
            EventKind::BackoffScheduled => {
                tracing::debug!(
                    kind,
                    subscriber,
                    sequence = ?e.sequence,
                    attempt = ?e.attempt,
                    delay = ?e.delay,
                    "redelivery scheduled"
                );
            }
            EventKind::ConnectionLost
            | EventKind::ListenerOverflow
            | EventKind::SequenceGap
            | EventKind::PayloadRejected
            | EventKind::DeliveryFailed
            | EventKind::ObserverOverflow
            | EventKind::ObserverPanicked => {
                tracing::warn!(
                    kind,
                    subscriber,
                    sequence = ?e.sequence,
                    attempt = ?e.attempt,
                    count = ?e.count,
                    error,
                    "relay recovery"
                );
            }
            EventKind::ListenerUnavailable | EventKind::PurgedUnacked | EventKind::GraceExceeded => {
                tracing::error!(
                    kind,
                    subscriber,
                    sequence = ?e.sequence,
                    count = ?e.count,
                    error,
                    "relay alert"
                );
            }
        }
    }

    fn name(&self) -> &'static str {
        "log"
    }
}
