//! Error types used by the relay runtime and its pipeline stages.
//!
//! | Condition                   | Type                                   | Handling                               |
//! |-----------------------------|----------------------------------------|----------------------------------------|
//! | connection lost             | [`ListenerError::ConnectionLost`]      | reconnect + reconciliation             |
//! | listener gives up           | [`ListenerError::Unavailable`]         | fatal, surfaced to the supervisor      |
//! | malformed payload           | [`MalformedPayloadError`]              | dead-letter log, never fatal           |
//! | reconciliation query failed | [`ReconcileError`]                     | retried with backoff                   |
//! | out-of-order ack            | [`OutboxError::OutOfOrderAck`]         | rejected, returned to the subscriber   |
//! | delivery failed             | [`DeliveryError`]                      | retried with backoff, never dropped    |
//! | shutdown exceeded grace     | [`RuntimeError::GraceExceeded`]        | logged for manual recovery             |
//!
//! Every enum provides `as_label()`, a short stable snake_case label for logs/metrics.

use std::time::Duration;
use thiserror::Error;

/// # Errors raised by the notification listener.
#[non_exhaustive]
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ListenerError {
    /// A connection attempt failed.
    #[error("connect failed: {reason}")]
    ConnectFailed {
        /// Driver error message.
        reason: String,
    },

    /// An established connection dropped.
    #[error("connection lost: {reason}")]
    ConnectionLost {
        /// Driver error message.
        reason: String,
    },

    /// Reconnection kept failing for longer than the configured maximum.
    #[error("listener unavailable after {after:?}: {last_error}")]
    Unavailable {
        /// Time spent retrying.
        after: Duration,
        /// Last connect error.
        last_error: String,
    },
}

impl ListenerError {
    /// Returns a short stable label (snake_case) for use in logs/metrics.
    pub fn as_label(&self) -> &'static str {
        match self {
            ListenerError::ConnectFailed { .. } => "listener_connect_failed",
            ListenerError::ConnectionLost { .. } => "connection_lost",
            ListenerError::Unavailable { .. } => "listener_unavailable",
        }
    }

    /// `false` only for [`ListenerError::Unavailable`].
    pub fn is_retryable(&self) -> bool {
        !matches!(self, ListenerError::Unavailable { .. })
    }
}

/// # A notification payload that cannot become a `ChangeEvent`.
///
/// Rejected payloads go to the dead-letter log; they never stop the relay.
#[non_exhaustive]
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MalformedPayloadError {
    /// Payload is not a JSON object.
    #[error("invalid json: {reason}")]
    InvalidJson {
        /// Parser message.
        reason: String,
    },

    /// `operation` is missing or not one of `INSERT`, `UPDATE`, `DELETE`.
    #[error("unknown operation {operation:?}")]
    UnknownOperation {
        /// The value found (empty when absent).
        operation: String,
    },

    /// A required key or column is absent or null.
    #[error("missing field {field}")]
    MissingField {
        /// Dotted path, e.g. `new_data.status`.
        field: String,
    },

    /// A column has the wrong type or cannot be coerced.
    #[error("invalid value for {field}: {reason}")]
    InvalidValue {
        /// Dotted path of the column.
        field: String,
        /// What went wrong.
        reason: String,
    },

    /// `status` is outside `pending | shipped | delivered`.
    #[error("unknown status {value:?} in {field}")]
    UnknownStatus {
        /// Dotted path of the column.
        field: String,
        /// The value found.
        value: String,
    },
}

impl MalformedPayloadError {
    /// Returns a short stable label (snake_case) for use in logs/metrics.
    pub fn as_label(&self) -> &'static str {
        match self {
            MalformedPayloadError::InvalidJson { .. } => "invalid_json",
            MalformedPayloadError::UnknownOperation { .. } => "unknown_operation",
            MalformedPayloadError::MissingField { .. } => "missing_field",
            MalformedPayloadError::InvalidValue { .. } => "invalid_value",
            MalformedPayloadError::UnknownStatus { .. } => "unknown_status",
        }
    }
}

/// # Errors raised while reading the source table for reconciliation.
#[non_exhaustive]
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ReconcileError {
    /// Could not open a query connection.
    #[error("reconciliation connect failed: {reason}")]
    Connect {
        /// Driver error message.
        reason: String,
    },

    /// The snapshot query failed.
    #[error("reconciliation query failed: {reason}")]
    Query {
        /// Driver error message.
        reason: String,
    },

    /// A row in the table does not satisfy the row contract.
    #[error("source row rejected: {source}")]
    InvalidRow {
        /// Why the row was rejected.
        #[source]
        source: MalformedPayloadError,
    },

    /// Table name is not a plain identifier.
    #[error("invalid table name {name:?}")]
    InvalidTable {
        /// The rejected name.
        name: String,
    },

    /// Shutdown began before the reconciliation committed.
    #[error("reconciliation interrupted by shutdown")]
    Interrupted,
}

impl ReconcileError {
    /// Returns a short stable label (snake_case) for use in logs/metrics.
    pub fn as_label(&self) -> &'static str {
        match self {
            ReconcileError::Connect { .. } => "reconcile_connect_failed",
            ReconcileError::Query { .. } => "reconcile_query_failed",
            ReconcileError::InvalidRow { .. } => "reconcile_invalid_row",
            ReconcileError::InvalidTable { .. } => "reconcile_invalid_table",
            ReconcileError::Interrupted => "reconcile_interrupted",
        }
    }
}

/// # Errors raised by the durable outbox.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum OutboxError {
    /// Opening the database failed.
    #[error("outbox database error: {0}")]
    Database(#[from] redb::DatabaseError),

    /// Starting a transaction failed.
    #[error("outbox transaction error: {0}")]
    Transaction(Box<redb::TransactionError>),

    /// Opening a table failed.
    #[error("outbox table error: {0}")]
    Table(#[from] redb::TableError),

    /// Reading or writing a table failed.
    #[error("outbox storage error: {0}")]
    Storage(#[from] redb::StorageError),

    /// Committing a transaction failed.
    #[error("outbox commit error: {0}")]
    Commit(#[from] redb::CommitError),

    /// Stored record could not be (de)serialized.
    #[error("outbox codec error: {0}")]
    Codec(#[from] serde_json::Error),

    /// The outbox holds `capacity` unpurged entries.
    #[error("outbox full ({capacity} entries)")]
    Full {
        /// Configured maximum.
        capacity: u64,
    },

    /// Ack for anything but the subscriber's next expected sequence.
    #[error("out-of-order ack from {subscriber}: expected {expected}, got {received}")]
    OutOfOrderAck {
        /// Acking subscriber.
        subscriber: String,
        /// `last_acked_sequence + 1`.
        expected: u64,
        /// Sequence in the request.
        received: u64,
    },

    /// No cursor is registered for this subscriber.
    #[error("unknown subscriber {subscriber}")]
    UnknownSubscriber {
        /// The requested id.
        subscriber: String,
    },

    /// The sequence was never appended or has been purged.
    #[error("unknown sequence {sequence}")]
    UnknownSequence {
        /// The requested sequence.
        sequence: u64,
    },

    /// Append of an event that has no sequence assigned.
    #[error("event has no sequence assigned")]
    Unsequenced,

    /// Append would leave a hole in the sequence.
    #[error("non-contiguous append: expected {expected}, got {received}")]
    NonContiguous {
        /// `head + 1`.
        expected: u64,
        /// Sequence of the event.
        received: u64,
    },
}

impl From<redb::TransactionError> for OutboxError {
    fn from(e: redb::TransactionError) -> Self {
        OutboxError::Transaction(Box::new(e))
    }
}

impl OutboxError {
    /// Returns a short stable label (snake_case) for use in logs/metrics.
    pub fn as_label(&self) -> &'static str {
        match self {
            OutboxError::Database(_) => "outbox_database",
            OutboxError::Transaction(_) => "outbox_transaction",
            OutboxError::Table(_) => "outbox_table",
            OutboxError::Storage(_) => "outbox_storage",
            OutboxError::Commit(_) => "outbox_commit",
            OutboxError::Codec(_) => "outbox_codec",
            OutboxError::Full { .. } => "outbox_full",
            OutboxError::OutOfOrderAck { .. } => "out_of_order_ack",
            OutboxError::UnknownSubscriber { .. } => "unknown_subscriber",
            OutboxError::UnknownSequence { .. } => "unknown_sequence",
            OutboxError::Unsequenced => "unsequenced_event",
            OutboxError::NonContiguous { .. } => "non_contiguous_append",
        }
    }

    /// Request errors (bad ack, unknown ids) are the caller's to fix; the rest
    /// may clear up on retry.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            OutboxError::OutOfOrderAck { .. }
                | OutboxError::UnknownSubscriber { .. }
                | OutboxError::UnknownSequence { .. }
                | OutboxError::Unsequenced
                | OutboxError::NonContiguous { .. }
        )
    }
}

/// # A subscriber failed to take an event.
///
/// Always recovered by redelivery with backoff; the event is never dropped.
#[non_exhaustive]
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DeliveryError {
    /// The subscriber refused the event.
    #[error("delivery rejected: {reason}")]
    Rejected {
        /// Subscriber-provided reason.
        reason: String,
    },

    /// The subscriber's consumer went away.
    #[error("subscriber disconnected")]
    Disconnected,

    /// The subscriber cannot take another event right now.
    #[error("subscriber busy")]
    Busy,

    /// The event was handed over but never acknowledged.
    #[error("no acknowledgment within {timeout:?}")]
    AckTimeout {
        /// Configured ack timeout.
        timeout: Duration,
    },

    /// The subscriber panicked while handling the event.
    #[error("subscriber panicked: {info}")]
    Panicked {
        /// Panic message.
        info: String,
    },
}

impl DeliveryError {
    /// Returns a short stable label (snake_case) for use in logs/metrics.
    pub fn as_label(&self) -> &'static str {
        match self {
            DeliveryError::Rejected { .. } => "delivery_rejected",
            DeliveryError::Disconnected => "subscriber_disconnected",
            DeliveryError::Busy => "subscriber_busy",
            DeliveryError::AckTimeout { .. } => "ack_timeout",
            DeliveryError::Panicked { .. } => "subscriber_panicked",
        }
    }
}

/// # Errors returned by the relay's public API.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum RelayError {
    /// Fatal listener failure.
    #[error(transparent)]
    Listener(#[from] ListenerError),

    /// Outbox failure (includes rejected acks).
    #[error(transparent)]
    Outbox(#[from] OutboxError),

    /// Source table failure outside the retry loop.
    #[error(transparent)]
    Reconcile(#[from] ReconcileError),

    /// `start` was called twice.
    #[error("relay already started")]
    AlreadyStarted,

    /// The relay's pipeline is not running.
    #[error("relay not running")]
    NotRunning,

    /// Configuration is incomplete or invalid.
    #[error("invalid configuration: {reason}")]
    Config {
        /// What is wrong.
        reason: String,
    },

    /// OS-level failure (signal registration, data dir).
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Shutdown did not complete cleanly.
    #[error(transparent)]
    Runtime(#[from] RuntimeError),
}

impl RelayError {
    /// Returns a short stable label (snake_case) for use in logs/metrics.
    pub fn as_label(&self) -> &'static str {
        match self {
            RelayError::Listener(e) => e.as_label(),
            RelayError::Outbox(e) => e.as_label(),
            RelayError::Reconcile(e) => e.as_label(),
            RelayError::AlreadyStarted => "relay_already_started",
            RelayError::NotRunning => "relay_not_running",
            RelayError::Config { .. } => "relay_config",
            RelayError::Io(_) => "relay_io",
            RelayError::Runtime(e) => e.as_label(),
        }
    }

    /// True for [`OutboxError::OutOfOrderAck`] wrapped in this error.
    pub fn is_out_of_order_ack(&self) -> bool {
        matches!(self, RelayError::Outbox(OutboxError::OutOfOrderAck { .. }))
    }
}

/// # Errors produced while stopping the relay.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum RuntimeError {
    /// Shutdown grace period was exceeded; remaining tasks were aborted.
    #[error("shutdown timeout {grace:?} exceeded; stuck: {stuck:?}; forcing termination")]
    GraceExceeded {
        /// The configured grace duration.
        grace: Duration,
        /// Tasks that did not stop in time.
        stuck: Vec<String>,
    },
}

impl RuntimeError {
    /// Returns a short stable label (snake_case) for use in logs/metrics.
    ///
    /// # Example
    /// ```
    /// use orders_relay::RuntimeError;
    /// use std::time::Duration;
    ///
    /// let err = RuntimeError::GraceExceeded { grace: Duration::from_secs(5), stuck: vec![] };
    /// assert_eq!(err.as_label(), "runtime_grace_exceeded");
    /// ```
    pub fn as_label(&self) -> &'static str {
        match self {
            RuntimeError::GraceExceeded { .. } => "runtime_grace_exceeded",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_listener_unavailable_is_fatal() {
        let fatal = ListenerError::Unavailable {
            after: Duration::from_secs(300),
            last_error: "refused".into(),
        };
        assert!(!fatal.is_retryable());
        assert_eq!(fatal.as_label(), "listener_unavailable");
        assert!(ListenerError::ConnectionLost { reason: "eof".into() }.is_retryable());
    }

    #[test]
    fn test_ack_errors_are_not_retryable() {
        let e = OutboxError::OutOfOrderAck {
            subscriber: "s".into(),
            expected: 2,
            received: 3,
        };
        assert!(!e.is_retryable());
        assert!(OutboxError::Full { capacity: 1 }.is_retryable());
        assert!(RelayError::from(e).is_out_of_order_ack());
    }
}
