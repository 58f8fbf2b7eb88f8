//! Durable outbox buffer.
//!
//! Holds sequenced [`ChangeEvent`](crate::ChangeEvent)s until every registered
//! subscriber has acknowledged them, together with the state needed to resume
//! after a restart: subscriber cursors, the table cursor, the dead-letter log
//! and the ops log.
//!
//! ## Contents
//! - [`Outbox`] redb-backed store
//! - [`OutboxReader`] lazy iterator returned by [`Outbox::read_from`]
//! - [`OutboxEntry`], [`DeliveryState`], [`SubscriberCursor`], [`StartPosition`]
//! - [`DeadLetterRecord`], [`OpsRecord`], [`OpsKind`]

mod entry;
mod retention;
mod store;

pub use entry::{
    DeadLetterRecord, DeliveryState, OpsDraft, OpsKind, OpsRecord, OutboxEntry, StartPosition,
    SubscriberCursor, SubscriberLag,
};
pub use store::{Outbox, OutboxReader, PurgeReport};

pub(crate) use retention::run_retention;
