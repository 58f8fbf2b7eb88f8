//! # Broadcast bus for runtime events.
//!
//! ```text
//!   Listener   ──┐
//!   Detector   ──┤
//!   Outbox     ──┼──► Bus ──► ObserverSet ──► LogWriter, user observers
//!   Dispatcher ──┤   (broadcast)   └────────► Relay::events() receivers
//!   Relay      ──┘
//! ```
//!
//! - `publish()` never blocks.
//! - Slow receivers get `RecvError::Lagged(n)` and skip the `n` oldest events.
//! - Events published with no receivers are lost.

use tokio::sync::broadcast;

use super::event::RelayEvent;

/// Broadcast channel for [`RelayEvent`]s. Cheap to clone.
#[derive(Clone, Debug)]
pub struct Bus {
    tx: broadcast::Sender<RelayEvent>,
}

impl Bus {
    /// Creates a bus; capacity is shared by all receivers and clamped to at least 1.
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Publishes an event to all current receivers.
    pub fn publish(&self, ev: RelayEvent) {
        let _ = self.tx.send(ev);
    }

    /// Creates a receiver that observes events sent from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<RelayEvent> {
        self.tx.subscribe()
    }
}

impl Default for Bus {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventKind;

    #[tokio::test]
    async fn test_receiver_sees_only_later_events() {
        let bus = Bus::new(8);
        bus.publish(RelayEvent::new(EventKind::Connected));
        let mut rx = bus.subscribe();
        bus.publish(RelayEvent::new(EventKind::ConnectionLost));
        let ev = rx.recv().await.unwrap();
        assert_eq!(ev.kind, EventKind::ConnectionLost);
    }

    #[tokio::test]
    async fn test_lagged_receiver() {
        let bus = Bus::new(1);
        let mut rx = bus.subscribe();
        bus.publish(RelayEvent::new(EventKind::Connected));
        bus.publish(RelayEvent::new(EventKind::ConnectionLost));
        assert!(matches!(
            rx.recv().await,
            Err(broadcast::error::RecvError::Lagged(1))
        ));
    }
}
