//! Raw notification payloads as handed from the listener to the gap detector.

use chrono::{DateTime, Utc};
use serde::Deserialize;

/// How the payload's ordering number was obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeqOrigin {
    /// The trigger stamped a source-side change counter (`"seq"` field).
    Source,
    /// The listener numbered the payload in receive order, per connection.
    Ordinal,
}

/// One notification, not yet validated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawPayload {
    /// Notification text exactly as received.
    pub text: String,
    /// Ordering number used for gap detection.
    pub seq: u64,
    pub seq_origin: SeqOrigin,
    pub received_at: DateTime<Utc>,
}

#[derive(Deserialize)]
struct Envelope {
    seq: Option<u64>,
}

impl RawPayload {
    /// Wraps a notification, preferring the trigger's `"seq"` over `ordinal`.
    ///
    /// Only the envelope is inspected here; invalid JSON still produces a
    /// payload so that the normalizer can dead-letter it.
    pub fn from_notification(text: String, ordinal: u64) -> Self {
        let source_seq = serde_json::from_str::<Envelope>(&text)
            .ok()
            .and_then(|e| e.seq);
        let (seq, seq_origin) = match source_seq {
            Some(s) => (s, SeqOrigin::Source),
            None => (ordinal, SeqOrigin::Ordinal),
        };
        Self {
            text,
            seq,
            seq_origin,
            received_at: Utc::now(),
        }
    }
}
