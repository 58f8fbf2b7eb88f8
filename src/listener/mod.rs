//! # Notification listener.
//!
//! Keeps a connection to the notification channel open and hands payloads to
//! the gap detector through a bounded channel.
//!
//! ```text
//! connect ──► recv ──► try_send(Payload) ──► detector
//!   ▲           │           │ full: drop + count, Overflow{dropped} as soon as there is room
//!   │           ▼
//!   └─ backoff ◄ ConnectionLost marker
//! ```
//!
//! ## Rules
//! - Reconnects with the configured backoff until `max_retry_duration`
//!   elapses, then returns [`ListenerError::Unavailable`].
//! - Loss markers (`ConnectionLost`, `Overflow`) are never dropped. A pending
//!   `Overflow` goes out as soon as the channel has room, even if no further
//!   notification arrives, and always before the next payload.
//! - Payload ordinals restart at 1 on every connection.
//! - A closed downstream channel or cancellation ends the loop with `Ok(())`.

mod postgres;
mod source;

pub use postgres::PgNotificationSource;
pub use source::NotificationSource;

use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::ListenerConfig;
use crate::error::ListenerError;
use crate::events::{Bus, EventKind, RelayEvent};
use crate::model::RawPayload;

/// What the listener hands to the detector.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListenerMessage {
    /// A notification, not yet validated.
    Payload(RawPayload),
    /// The connection dropped; notifications may have been missed.
    ConnectionLost { reason: String },
    /// The hand-off channel was full and `dropped` payloads were discarded.
    Overflow { dropped: u64 },
}

impl ListenerMessage {
    /// True for markers that signal possible loss.
    pub fn is_loss_marker(&self) -> bool {
        !matches!(self, ListenerMessage::Payload(_))
    }
}

/// Drives a [`NotificationSource`].
pub struct Listener<S> {
    source: S,
    cfg: ListenerConfig,
    bus: Bus,
}

enum Flow {
    Continue,
    Stop,
}

impl<S: NotificationSource> Listener<S> {
    pub fn new(source: S, cfg: ListenerConfig, bus: Bus) -> Self {
        Self { source, cfg, bus }
    }

    /// Runs until cancelled, the receiver is dropped, or reconnecting fails for
    /// longer than the configured limit.
    pub async fn run(
        mut self,
        tx: mpsc::Sender<ListenerMessage>,
        cancel: CancellationToken,
    ) -> Result<(), ListenerError> {
        loop {
            if !self.connect(&cancel).await? {
                return Ok(());
            }
            match self.pump(&tx, &cancel).await {
                Flow::Continue => {}
                Flow::Stop => return Ok(()),
            }
        }
    }

    /// Returns `false` when cancelled.
    async fn connect(&mut self, cancel: &CancellationToken) -> Result<bool, ListenerError> {
        let started = Instant::now();
        let mut attempt: u32 = 0;
        loop {
            let res = tokio::select! {
                _ = cancel.cancelled() => return Ok(false),
                r = self.source.connect() => r,
            };
            let err = match res {
                Ok(()) => {
                    tracing::info!(channel = %self.cfg.channel, "listening");
                    self.bus.publish(RelayEvent::new(EventKind::Connected));
                    return Ok(true);
                }
                Err(e) => e,
            };

            let elapsed = started.elapsed();
            if let Some(limit) = self.cfg.retry_limit()
                && elapsed >= limit
            {
                let fatal = ListenerError::Unavailable {
                    after: elapsed,
                    last_error: err.to_string(),
                };
                tracing::error!(error = %fatal, "listener giving up");
                self.bus.publish(
                    RelayEvent::new(EventKind::ListenerUnavailable).with_error(fatal.to_string()),
                );
                return Err(fatal);
            }

            let delay = self.cfg.reconnect.next(attempt);
            attempt = attempt.saturating_add(1);
            tracing::warn!(attempt, ?delay, error = %err, "listener connect failed");
            tokio::select! {
                _ = cancel.cancelled() => return Ok(false),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    async fn pump(
        &mut self,
        tx: &mpsc::Sender<ListenerMessage>,
        cancel: &CancellationToken,
    ) -> Flow {
        let mut ordinal: u64 = 0;
        let mut dropped: u64 = 0;

        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Flow::Stop,
                permit = tx.reserve(), if dropped > 0 => match permit {
                    Ok(permit) => {
                        permit.send(ListenerMessage::Overflow { dropped });
                        self.overflow_reported(dropped);
                        dropped = 0;
                        continue;
                    }
                    Err(_) => return Flow::Stop,
                },
                r = self.source.recv() => r,
            };

            let text = match next {
                Ok(text) => text,
                Err(e) => {
                    tracing::warn!(error = %e, dropped, "listener connection lost");
                    self.bus
                        .publish(RelayEvent::new(EventKind::ConnectionLost).with_error(e.to_string()));
                    let marker = ListenerMessage::ConnectionLost {
                        reason: e.to_string(),
                    };
                    return tokio::select! {
                        _ = cancel.cancelled() => Flow::Stop,
                        r = tx.send(marker) => if r.is_ok() { Flow::Continue } else { Flow::Stop },
                    };
                }
            };
            ordinal += 1;

            if dropped > 0 {
                match tx.try_send(ListenerMessage::Overflow { dropped }) {
                    Ok(()) => {
                        self.overflow_reported(dropped);
                        dropped = 0;
                    }
                    Err(TrySendError::Full(_)) => {
                        dropped += 1;
                        continue;
                    }
                    Err(TrySendError::Closed(_)) => return Flow::Stop,
                }
            }

            match tx.try_send(ListenerMessage::Payload(RawPayload::from_notification(
                text, ordinal,
            ))) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    if dropped == 0 {
                        tracing::warn!("listener channel full, dropping notifications");
                    }
                    dropped += 1;
                }
                Err(TrySendError::Closed(_)) => return Flow::Stop,
            }
        }
    }

    fn overflow_reported(&self, dropped: u64) {
        tracing::warn!(dropped, "overflow marker sent");
        self.bus
            .publish(RelayEvent::new(EventKind::ListenerOverflow).with_count(dropped));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::time::Duration;

    use crate::policies::BackoffPolicy;

    /// Scripted source: each `connect` pops a result, each `recv` pops an item;
    /// an empty script blocks forever.
    struct Script {
        connects: VecDeque<Result<(), ListenerError>>,
        items: VecDeque<Result<String, ListenerError>>,
    }

    #[async_trait]
    impl NotificationSource for Script {
        async fn connect(&mut self) -> Result<(), ListenerError> {
            self.connects.pop_front().unwrap_or(Ok(()))
        }

        async fn recv(&mut self) -> Result<String, ListenerError> {
            match self.items.pop_front() {
                Some(item) => item,
                None => std::future::pending().await,
            }
        }
    }

    fn cfg(max_retry: Duration) -> ListenerConfig {
        ListenerConfig {
            reconnect: BackoffPolicy {
                first: Duration::from_millis(10),
                max: Duration::from_millis(10),
                ..BackoffPolicy::reconnect()
            }
            .without_jitter(),
            max_retry_duration: max_retry,
            buffer: 2,
            ..ListenerConfig::default()
        }
    }

    fn lost() -> ListenerError {
        ListenerError::ConnectionLost {
            reason: "eof".into(),
        }
    }

    #[tokio::test]
    async fn test_connection_lost_emits_marker_and_resets_ordinals() {
        let source = Script {
            connects: VecDeque::new(),
            items: VecDeque::from([Ok("a".into()), Err(lost()), Ok("b".into())]),
        };
        let (tx, mut rx) = mpsc::channel(8);
        let cancel = CancellationToken::new();
        let task = tokio::spawn(Listener::new(source, cfg(Duration::ZERO), Bus::new(8)).run(tx, cancel.clone()));

        let first = rx.recv().await.unwrap();
        assert!(matches!(first, ListenerMessage::Payload(ref p) if p.seq == 1));
        assert!(matches!(rx.recv().await.unwrap(), ListenerMessage::ConnectionLost { .. }));
        let again = rx.recv().await.unwrap();
        assert!(matches!(again, ListenerMessage::Payload(ref p) if p.seq == 1 && p.text == "b"));

        cancel.cancel();
        assert!(task.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_overflow_marker_precedes_next_payload() {
        let items = (1..=5).map(|i| Ok(format!("p{i}"))).collect();
        let source = Script {
            connects: VecDeque::new(),
            items,
        };
        let (tx, mut rx) = mpsc::channel(2);
        let cancel = CancellationToken::new();
        let task = tokio::spawn(Listener::new(source, cfg(Duration::ZERO), Bus::new(8)).run(tx, cancel.clone()));

        tokio::time::sleep(Duration::from_millis(50)).await;
        let mut got = Vec::new();
        while let Ok(msg) = rx.try_recv() {
            got.push(msg);
        }
        // p1 and p2 fit; p3..p5 are dropped while nobody reads.
        assert_eq!(got.len(), 2);
        cancel.cancel();
        let _ = task.await;

        let items = VecDeque::from([Ok("x".into()), Ok("y".into()), Ok("z".into())]);
        let (tx, mut rx) = mpsc::channel(1);
        let (gate_tx, gate_rx) = tokio::sync::oneshot::channel::<()>();
        struct Gated {
            items: VecDeque<Result<String, ListenerError>>,
            gate: Option<tokio::sync::oneshot::Receiver<()>>,
        }
        #[async_trait]
        impl NotificationSource for Gated {
            async fn connect(&mut self) -> Result<(), ListenerError> {
                Ok(())
            }
            async fn recv(&mut self) -> Result<String, ListenerError> {
                if self.items.len() == 1
                    && let Some(gate) = self.gate.take()
                {
                    let _ = gate.await;
                }
                match self.items.pop_front() {
                    Some(item) => item,
                    None => std::future::pending().await,
                }
            }
        }
        let cancel = CancellationToken::new();
        let task = tokio::spawn(
            Listener::new(
                Gated {
                    items,
                    gate: Some(gate_rx),
                },
                cfg(Duration::ZERO),
                Bus::new(8),
            )
            .run(tx, cancel.clone()),
        );
        // "x" fills the channel, "y" is dropped.
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(matches!(rx.recv().await.unwrap(), ListenerMessage::Payload(ref p) if p.text == "x"));
        gate_tx.send(()).unwrap();
        assert_eq!(
            rx.recv().await.unwrap(),
            ListenerMessage::Overflow { dropped: 1 }
        );
        cancel.cancel();
        let _ = task.await;
    }

    #[tokio::test]
    async fn test_overflow_is_signalled_without_further_notifications() {
        let source = Script {
            connects: VecDeque::new(),
            items: VecDeque::from([Ok("p1".into()), Ok("p2".into()), Ok("p3".into())]),
        };
        let bus = Bus::new(8);
        let mut events = bus.subscribe();
        let (tx, mut rx) = mpsc::channel(1);
        let cancel = CancellationToken::new();
        let task = tokio::spawn(Listener::new(source, cfg(Duration::ZERO), bus).run(tx, cancel.clone()));

        // p2 and p3 are dropped; the source then stays silent.
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(matches!(rx.recv().await.unwrap(), ListenerMessage::Payload(ref p) if p.text == "p1"));
        let marker = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("overflow marker not sent")
            .unwrap();
        assert_eq!(marker, ListenerMessage::Overflow { dropped: 2 });

        let overflow = tokio::time::timeout(Duration::from_secs(1), async {
            loop {
                let ev = events.recv().await.unwrap();
                if ev.kind == EventKind::ListenerOverflow {
                    return ev;
                }
            }
        })
        .await
        .expect("overflow event not published");
        assert_eq!(overflow.count, Some(2));

        cancel.cancel();
        assert!(task.await.unwrap().is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_gives_up_after_max_retry_duration() {
        let source = Script {
            connects: (0..1000).map(|_| Err(ListenerError::ConnectFailed { reason: "refused".into() })).collect(),
            items: VecDeque::new(),
        };
        let (tx, _rx) = mpsc::channel(1);
        let res = Listener::new(source, cfg(Duration::from_millis(100)), Bus::new(8))
            .run(tx, CancellationToken::new())
            .await;
        assert!(matches!(res, Err(ListenerError::Unavailable { .. })));
    }
}
