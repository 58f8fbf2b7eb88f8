//! # Observers of runtime events.
//!
//! [`Observe`] is the extension point for operational consumers (logging,
//! alerting). [`ObserverSet`] feeds each observer from its own bounded queue and
//! worker task:
//!
//! ```text
//! emit(event)
//!     ├──► [queue 1] ──► worker 1 ──► observer1.on_event()
//!     │                      └──────► panic → ObserverPanicked
//!     └──► [queue N] ──► worker N ──► observerN.on_event()
//! ```
//!
//! - `emit()` uses `try_send`; a full queue skips the event for that observer
//!   and publishes `ObserverOverflow`.
//! - Panics are caught per event; the worker moves on.
//! - Each observer sees events in bus order.

use std::sync::Arc;

use async_trait::async_trait;
use futures::FutureExt;
use tokio::{sync::mpsc, task::JoinHandle};

use super::{Bus, EventKind, RelayEvent};

/// Contract for runtime event observers.
#[async_trait]
pub trait Observe: Send + Sync + 'static {
    /// Handles one event.
    async fn on_event(&self, event: &RelayEvent);

    /// Name used in logs and overflow/panic events.
    fn name(&self) -> &'static str {
        std::any::type_name::<Self>()
    }

    /// Capacity of this observer's queue.
    fn queue_capacity(&self) -> usize {
        1024
    }
}

struct ObserverChannel {
    name: &'static str,
    sender: mpsc::Sender<Arc<RelayEvent>>,
}

/// Fan-out of bus events to observers, one worker each.
pub struct ObserverSet {
    channels: Vec<ObserverChannel>,
    workers: Vec<JoinHandle<()>>,
    bus: Bus,
}

impl ObserverSet {
    /// Spawns one worker per observer.
    #[must_use]
    pub fn new(observers: Vec<Arc<dyn Observe>>, bus: Bus) -> Self {
        let mut channels = Vec::with_capacity(observers.len());
        let mut workers = Vec::with_capacity(observers.len());

        for obs in observers {
            let name = obs.name();
            let (tx, mut rx) = mpsc::channel::<Arc<RelayEvent>>(obs.queue_capacity().max(1));
            let worker_bus = bus.clone();

            let handle = tokio::spawn(async move {
                while let Some(ev) = rx.recv().await {
                    let fut = obs.on_event(ev.as_ref());
                    if let Err(panic_err) = std::panic::AssertUnwindSafe(fut).catch_unwind().await {
                        worker_bus.publish(RelayEvent::observer_panicked(
                            name,
                            panic_message(panic_err.as_ref()),
                        ));
                    }
                }
            });
            channels.push(ObserverChannel { name, sender: tx });
            workers.push(handle);
        }
        Self {
            channels,
            workers,
            bus,
        }
    }

    /// Hands the event to every observer without waiting.
    pub fn emit(&self, event: RelayEvent) {
        let is_overflow = matches!(event.kind, EventKind::ObserverOverflow);
        let event = Arc::new(event);

        for channel in &self.channels {
            let reason = match channel.sender.try_send(Arc::clone(&event)) {
                Ok(()) => continue,
                Err(mpsc::error::TrySendError::Full(_)) => "full",
                Err(mpsc::error::TrySendError::Closed(_)) => "closed",
            };
            if !is_overflow {
                self.bus
                    .publish(RelayEvent::observer_overflow(channel.name, reason));
            }
        }
    }

    /// Closes all queues and waits for the workers to drain them.
    pub async fn shutdown(self) {
        drop(self.channels);
        for h in self.workers {
            let _ = h.await;
        }
    }
}

/// Extracts a readable message from a panic payload.
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&'static str>() {
        (*msg).to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct Counter(Arc<AtomicUsize>);

    #[async_trait]
    impl Observe for Counter {
        async fn on_event(&self, _event: &RelayEvent) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
        fn name(&self) -> &'static str {
            "counter"
        }
    }

    struct Panicky;

    #[async_trait]
    impl Observe for Panicky {
        async fn on_event(&self, _event: &RelayEvent) {
            panic!("observer boom");
        }
        fn name(&self) -> &'static str {
            "panicky"
        }
    }

    #[tokio::test]
    async fn test_panic_is_isolated() {
        let bus = Bus::new(16);
        let mut rx = bus.subscribe();
        let hits = Arc::new(AtomicUsize::new(0));
        let set = ObserverSet::new(
            vec![Arc::new(Panicky), Arc::new(Counter(Arc::clone(&hits)))],
            bus.clone(),
        );

        set.emit(RelayEvent::new(EventKind::Connected));
        set.emit(RelayEvent::new(EventKind::Connected));
        set.shutdown().await;

        assert_eq!(hits.load(Ordering::SeqCst), 2);
        let ev = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(ev.kind, EventKind::ObserverPanicked);
        assert_eq!(ev.error.as_deref(), Some("observer boom"));
    }
}
