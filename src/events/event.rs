//! # Runtime events emitted by the relay's tasks.
//!
//! [`EventKind`] classifies what happened; [`RelayEvent`] carries it with a
//! timestamp and whatever metadata applies (subscriber id, outbox sequence,
//! attempt, backoff delay, error text, counts).
//!
//! ## Ordering guarantees
//! Each event has a process-wide sequence number (`seq`) that increases
//! monotonically. It is unrelated to `ChangeEvent::sequence`.
//!
//! ## Example
//! ```rust
//! use std::time::Duration;
//! use orders_relay::{EventKind, RelayEvent};
//!
//! let ev = RelayEvent::new(EventKind::DeliveryFailed)
//!     .with_subscriber("billing")
//!     .with_sequence(42)
//!     .with_attempt(3)
//!     .with_error("subscriber busy");
//!
//! assert_eq!(ev.kind, EventKind::DeliveryFailed);
//! assert_eq!(ev.subscriber.as_deref(), Some("billing"));
//! assert_eq!(ev.sequence, Some(42));
//! ```

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::time::{Duration, SystemTime};

static EVENT_SEQ: AtomicU64 = AtomicU64::new(0);

/// Classification of runtime events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    // === Listener ===
    /// Listener (re)connected and issued `LISTEN`.
    Connected,

    /// Listener lost its connection.
    ///
    /// Sets `error`.
    ConnectionLost,

    /// Listener → detector channel overflowed; published when the
    /// `Overflow` marker is handed over.
    ///
    /// Sets `count`: payloads dropped.
    ListenerOverflow,

    /// Listener gave up reconnecting; fatal.
    ///
    /// Sets `error`.
    ListenerUnavailable,

    // === Detector ===
    /// A payload arrived with a source sequence past `last_seen + 1`.
    ///
    /// Sets `sequence`: expected, `count`: payloads missed.
    SequenceGap,

    /// A reconciliation query is starting.
    ///
    /// Sets `error`: trigger reason.
    ReconciliationStarted,

    /// A reconciliation finished and its events were committed.
    ///
    /// Sets `count`: synthetic events emitted.
    ReconciliationFinished,

    /// A payload failed validation and went to the dead-letter log.
    ///
    /// Sets `error`.
    PayloadRejected,

    // === Outbox ===
    /// TTL purge removed entries a subscriber had not acked.
    ///
    /// Sets `subscriber`, `sequence`: new cursor, `count`: entries skipped.
    PurgedUnacked,

    // === Dispatcher ===
    /// A delivery loop started for a subscriber.
    SubscriberAttached,

    /// A delivery loop stopped for a subscriber.
    SubscriberDetached,

    /// A delivery attempt failed.
    ///
    /// Sets `subscriber`, `sequence`, `attempt`, `error`.
    DeliveryFailed,

    /// Next delivery attempt scheduled.
    ///
    /// Sets `subscriber`, `sequence`, `attempt`, `delay`.
    BackoffScheduled,

    // === Observers ===
    /// An observer panicked while handling an event.
    ///
    /// Sets `subscriber`: observer name, `error`: panic info.
    ObserverPanicked,

    /// An observer's queue was full; the event was skipped for it.
    ObserverOverflow,

    // === Shutdown ===
    /// Shutdown requested (OS signal or API call).
    ShutdownRequested,

    /// All tasks stopped within the grace period.
    AllStoppedWithin,

    /// Grace period exceeded; some tasks were aborted.
    ///
    /// Sets `error`: stuck task names.
    GraceExceeded,
}

impl EventKind {
    /// Short stable label for logs/metrics.
    pub fn as_label(&self) -> &'static str {
        match self {
            EventKind::Connected => "connected",
            EventKind::ConnectionLost => "connection_lost",
            EventKind::ListenerOverflow => "listener_overflow",
            EventKind::ListenerUnavailable => "listener_unavailable",
            EventKind::SequenceGap => "sequence_gap",
            EventKind::ReconciliationStarted => "reconciliation_started",
            EventKind::ReconciliationFinished => "reconciliation_finished",
            EventKind::PayloadRejected => "payload_rejected",
            EventKind::PurgedUnacked => "purged_unacked",
            EventKind::SubscriberAttached => "subscriber_attached",
            EventKind::SubscriberDetached => "subscriber_detached",
            EventKind::DeliveryFailed => "delivery_failed",
            EventKind::BackoffScheduled => "backoff_scheduled",
            EventKind::ObserverPanicked => "observer_panicked",
            EventKind::ObserverOverflow => "observer_overflow",
            EventKind::ShutdownRequested => "shutdown_requested",
            EventKind::AllStoppedWithin => "all_stopped_within",
            EventKind::GraceExceeded => "grace_exceeded",
        }
    }
}

/// Runtime event with optional metadata.
#[derive(Debug, Clone)]
pub struct RelayEvent {
    /// Process-wide, monotonically increasing sequence number.
    pub seq: u64,
    /// Wall-clock timestamp.
    pub at: SystemTime,
    /// Event classification.
    pub kind: EventKind,
    /// Subscriber (or observer) id, if applicable.
    pub subscriber: Option<Arc<str>>,
    /// Outbox or source sequence, if applicable.
    pub sequence: Option<u64>,
    /// Attempt count (starting from 1).
    pub attempt: Option<u32>,
    /// Backoff delay before the next attempt.
    pub delay: Option<Duration>,
    /// Human-readable error or reason.
    pub error: Option<Arc<str>>,
    /// Number of items involved (dropped payloads, synthetic events, ...).
    pub count: Option<u64>,
}

impl RelayEvent {
    /// Creates an event of the given kind with current timestamp and next sequence number.
    pub fn new(kind: EventKind) -> Self {
        Self {
            seq: EVENT_SEQ.fetch_add(1, AtomicOrdering::Relaxed),
            at: SystemTime::now(),
            kind,
            subscriber: None,
            sequence: None,
            attempt: None,
            delay: None,
            error: None,
            count: None,
        }
    }

    #[inline]
    pub fn with_subscriber(mut self, id: impl Into<Arc<str>>) -> Self {
        self.subscriber = Some(id.into());
        self
    }

    #[inline]
    pub fn with_sequence(mut self, sequence: u64) -> Self {
        self.sequence = Some(sequence);
        self
    }

    #[inline]
    pub fn with_attempt(mut self, n: u32) -> Self {
        self.attempt = Some(n);
        self
    }

    #[inline]
    pub fn with_delay(mut self, d: Duration) -> Self {
        self.delay = Some(d);
        self
    }

    #[inline]
    pub fn with_error(mut self, error: impl Into<Arc<str>>) -> Self {
        self.error = Some(error.into());
        self
    }

    #[inline]
    pub fn with_count(mut self, n: u64) -> Self {
        self.count = Some(n);
        self
    }

    /// Creates an observer panic event.
    pub fn observer_panicked(observer: &'static str, info: String) -> Self {
        RelayEvent::new(EventKind::ObserverPanicked)
            .with_subscriber(observer)
            .with_error(info)
    }

    /// Creates an observer overflow event.
    pub fn observer_overflow(observer: &'static str, reason: &'static str) -> Self {
        RelayEvent::new(EventKind::ObserverOverflow)
            .with_subscriber(observer)
            .with_error(reason)
    }

    /// True for events an operator must look at.
    pub fn is_alert(&self) -> bool {
        matches!(
            self.kind,
            EventKind::ListenerUnavailable | EventKind::PurgedUnacked | EventKind::GraceExceeded
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seq_is_monotonic() {
        let a = RelayEvent::new(EventKind::Connected);
        let b = RelayEvent::new(EventKind::Connected);
        assert!(b.seq > a.seq);
    }

    #[test]
    fn test_alerts() {
        assert!(RelayEvent::new(EventKind::PurgedUnacked).is_alert());
        assert!(!RelayEvent::new(EventKind::DeliveryFailed).is_alert());
        assert_eq!(EventKind::SequenceGap.as_label(), "sequence_gap");
    }
}
