//! Records stored in the outbox database.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::MalformedPayloadError;
use crate::model::{ChangeEvent, RawPayload};

/// Per-subscriber delivery progress of one entry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeliveryState {
    #[default]
    Pending,
    Delivered,
    /// Failed attempts so far.
    Failed(u32),
}

/// One event held by the outbox.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboxEntry {
    pub event: ChangeEvent,
    pub inserted_at: DateTime<Utc>,
    /// Subscribers without a key are `Pending`.
    #[serde(default)]
    pub delivery_state: BTreeMap<String, DeliveryState>,
}

impl OutboxEntry {
    pub fn new(event: ChangeEvent, inserted_at: DateTime<Utc>) -> Self {
        Self {
            event,
            inserted_at,
            delivery_state: BTreeMap::new(),
        }
    }

    #[inline]
    pub fn sequence(&self) -> u64 {
        self.event.sequence
    }

    pub fn state_for(&self, subscriber: &str) -> DeliveryState {
        self.delivery_state
            .get(subscriber)
            .copied()
            .unwrap_or_default()
    }
}

/// Persisted position of one subscriber.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriberCursor {
    pub subscriber_id: String,
    pub last_acked_sequence: u64,
    pub registered_at: DateTime<Utc>,
}

/// Where a newly registered subscriber starts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum StartPosition {
    /// Only events appended after registration.
    #[default]
    Now,
    /// Everything still retained.
    Beginning,
}

/// Lag report for one subscriber.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriberLag {
    pub subscriber_id: String,
    pub last_acked_sequence: u64,
    /// `head - last_acked_sequence`.
    pub lag: u64,
}

/// A payload the normalizer rejected.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeadLetterRecord {
    pub id: u64,
    /// Payload text as received.
    pub payload: String,
    pub source_seq: u64,
    /// Stable label, see [`MalformedPayloadError::as_label`].
    pub error_kind: String,
    pub error_message: String,
    pub received_at: DateTime<Utc>,
}

impl DeadLetterRecord {
    pub(crate) fn new(id: u64, raw: &RawPayload, err: &MalformedPayloadError) -> Self {
        Self {
            id,
            payload: raw.text.clone(),
            source_seq: raw.seq,
            error_kind: err.as_label().to_string(),
            error_message: err.to_string(),
            received_at: raw.received_at,
        }
    }
}

/// Kind of operational log entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OpsKind {
    /// Reconciliation synthesized an event.
    ReconciledTransition,
    /// The source sequence jumped.
    GapDetected,
    /// TTL purge removed entries a subscriber had not acked.
    PurgedUnacked,
    /// A subscriber cursor was moved past purged entries.
    RetentionSkip,
    /// Shutdown left work undone.
    IncompleteShutdown,
}

/// Operational log entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpsRecord {
    pub id: u64,
    pub at: DateTime<Utc>,
    pub kind: OpsKind,
    pub detail: String,
    #[serde(default)]
    pub sequence: Option<u64>,
    #[serde(default)]
    pub subscriber: Option<String>,
}

/// An ops record before the store assigns its id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpsDraft {
    pub kind: OpsKind,
    pub detail: String,
    pub sequence: Option<u64>,
    pub subscriber: Option<String>,
}

impl OpsDraft {
    pub fn new(kind: OpsKind, detail: impl Into<String>) -> Self {
        Self {
            kind,
            detail: detail.into(),
            sequence: None,
            subscriber: None,
        }
    }

    pub fn with_sequence(mut self, sequence: u64) -> Self {
        self.sequence = Some(sequence);
        self
    }

    pub fn with_subscriber(mut self, id: impl Into<String>) -> Self {
        self.subscriber = Some(id.into());
        self
    }
}
