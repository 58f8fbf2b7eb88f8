//! Per-subscriber delivery loop.
//!
//! ```text
//! loop {
//!   next_for(id) ── none ──► wait for head change
//!       │
//!       ▼
//!   deliver(event)  (panics caught)
//!       ├─ Acked        ──► outbox.ack(id, seq)
//!       ├─ AwaitingAck  ──► wait cursor >= seq, bounded by ack_timeout
//!       └─ Err          ──► mark_failed, DeliveryFailed, BackoffScheduled, sleep
//! }
//! ```
//!
//! The loop exits on cancellation or when the subscriber's cursor disappears
//! (deregistered). It never skips an event: the same sequence is redelivered
//! until it is acknowledged.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use tokio_util::sync::CancellationToken;

use super::{Delivery, Subscriber};
use crate::config::DispatchConfig;
use crate::error::{DeliveryError, OutboxError};
use crate::events::{Bus, EventKind, RelayEvent, panic_message};
use crate::outbox::{OutboxEntry, Outbox};

enum Outcome {
    Done,
    Failed(DeliveryError),
    Store(OutboxError),
    Detached,
    Cancelled,
}

pub(crate) struct DeliveryLoop {
    subscriber: Arc<dyn Subscriber>,
    outbox: Arc<Outbox>,
    cfg: DispatchConfig,
    bus: Bus,
}

impl DeliveryLoop {
    pub(crate) fn new(
        subscriber: Arc<dyn Subscriber>,
        outbox: Arc<Outbox>,
        cfg: DispatchConfig,
        bus: Bus,
    ) -> Self {
        Self {
            subscriber,
            outbox,
            cfg,
            bus,
        }
    }

    pub(crate) async fn run(self, cancel: CancellationToken) {
        let id = self.subscriber.id().to_string();
        let mut head = self.outbox.watch_head();
        let mut failures: u32 = 0;

        loop {
            if cancel.is_cancelled() {
                break;
            }
            let entry = match self.outbox.next_for(&id) {
                Ok(Some(entry)) => entry,
                Ok(None) => {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        r = head.changed() => if r.is_err() { break },
                    }
                    continue;
                }
                Err(OutboxError::UnknownSubscriber { .. }) => break,
                Err(e) => {
                    if !self.store_failure(&id, e, &mut failures, &cancel).await {
                        break;
                    }
                    continue;
                }
            };

            match self.deliver(&id, &entry, &cancel).await {
                Outcome::Done => failures = 0,
                Outcome::Failed(err) => {
                    failures = failures.saturating_add(1);
                    if !self.delivery_failure(&id, &entry, err, failures, &cancel).await {
                        break;
                    }
                }
                Outcome::Store(e) => {
                    if !self.store_failure(&id, e, &mut failures, &cancel).await {
                        break;
                    }
                }
                Outcome::Detached | Outcome::Cancelled => break,
            }
        }
        tracing::debug!(subscriber = %id, "delivery loop stopped");
    }

    async fn deliver(&self, id: &str, entry: &OutboxEntry, cancel: &CancellationToken) -> Outcome {
        let seq = entry.sequence();
        let fut = AssertUnwindSafe(self.subscriber.deliver(&entry.event)).catch_unwind();
        let res = tokio::select! {
            _ = cancel.cancelled() => return Outcome::Cancelled,
            r = fut => r,
        };
        let delivery = match res {
            Ok(Ok(delivery)) => delivery,
            Ok(Err(e)) => return Outcome::Failed(e),
            Err(panic) => {
                return Outcome::Failed(DeliveryError::Panicked {
                    info: panic_message(panic.as_ref()),
                });
            }
        };

        match delivery {
            Delivery::Acked => match self.outbox.ack(id, seq) {
                Ok(_) => Outcome::Done,
                Err(OutboxError::OutOfOrderAck { expected, .. }) if expected > seq => Outcome::Done,
                Err(OutboxError::UnknownSubscriber { .. }) => Outcome::Detached,
                Err(e) => Outcome::Store(e),
            },
            Delivery::AwaitingAck => self.await_ack(id, seq, cancel).await,
        }
    }

    async fn await_ack(&self, id: &str, seq: u64, cancel: &CancellationToken) -> Outcome {
        let Some(mut cursor) = self.outbox.watch_cursor(id) else {
            return Outcome::Detached;
        };
        let acked = async {
            loop {
                let acked = *cursor.borrow_and_update() >= seq;
                if acked {
                    return true;
                }
                if cursor.changed().await.is_err() {
                    return false;
                }
            }
        };
        let waited = async {
            match self.cfg.ack_deadline() {
                Some(timeout) => tokio::time::timeout(timeout, acked)
                    .await
                    .map_err(|_| timeout),
                None => Ok(acked.await),
            }
        };

        tokio::select! {
            _ = cancel.cancelled() => Outcome::Cancelled,
            r = waited => match r {
                Ok(true) => Outcome::Done,
                Ok(false) => Outcome::Detached,
                Err(timeout) => Outcome::Failed(DeliveryError::AckTimeout { timeout }),
            },
        }
    }

    /// Records the failure and sleeps; `false` if cancelled meanwhile.
    async fn delivery_failure(
        &self,
        id: &str,
        entry: &OutboxEntry,
        err: DeliveryError,
        failures: u32,
        cancel: &CancellationToken,
    ) -> bool {
        let seq = entry.sequence();
        if let Err(e) = self.outbox.mark_failed(id, seq, failures) {
            tracing::warn!(subscriber = %id, sequence = seq, error = %e, "recording failed delivery");
        }
        let delay = self.cfg.backoff.next(failures - 1);
        tracing::warn!(
            subscriber = %id,
            sequence = seq,
            attempt = failures,
            kind = err.as_label(),
            error = %err,
            ?delay,
            "delivery failed"
        );
        self.bus.publish(
            RelayEvent::new(EventKind::DeliveryFailed)
                .with_subscriber(id)
                .with_sequence(seq)
                .with_attempt(failures)
                .with_error(err.to_string()),
        );
        self.bus.publish(
            RelayEvent::new(EventKind::BackoffScheduled)
                .with_subscriber(id)
                .with_sequence(seq)
                .with_attempt(failures)
                .with_delay(delay),
        );
        sleep_or_cancel(delay, cancel).await
    }

    async fn store_failure(
        &self,
        id: &str,
        err: OutboxError,
        failures: &mut u32,
        cancel: &CancellationToken,
    ) -> bool {
        let delay = self.cfg.backoff.next(*failures);
        *failures = failures.saturating_add(1);
        tracing::warn!(subscriber = %id, error = %err, ?delay, "outbox read failed");
        sleep_or_cancel(delay, cancel).await
    }
}

async fn sleep_or_cancel(delay: std::time::Duration, cancel: &CancellationToken) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(delay) => true,
    }
}
