//! # orders-relay
//!
//! **orders-relay** is a change-data-capture relay for an `orders` table whose
//! triggers publish row changes on a `NOTIFY` channel.
//!
//! Trigger notifications are best-effort: they are lost when nobody listens,
//! when the connection drops, or when the receiver falls behind. The relay
//! turns them into an ordered, durable, at-least-once event stream and fans it
//! out to independent subscribers.
//!
//! ## Architecture
//! ```text
//!   orders table ── trigger ──► NOTIFY order_changes
//!                                     │
//!                                     ▼
//!   ┌──────────────────────────────────────────────────────────────┐
//!   │ Listener        reconnect + backoff, loss markers             │
//!   └──────────────────────────────┬───────────────────────────────┘
//!                                  ▼ mpsc (bounded)
//!   ┌──────────────────────────────────────────────────────────────┐
//!   │ GapDetector     seq check ─► Normalizer ─► continuity         │
//!   │                 gap / loss ─► reconcile (SourceTable query)   │
//!   └──────────────────────────────┬───────────────────────────────┘
//!                                  ▼ one transaction: events + TableCursor + row images
//!   ┌──────────────────────────────────────────────────────────────┐
//!   │ Outbox (redb)   entries, subscriber cursors, dead letters,    │
//!   │                 ops log, TTL retention                        │
//!   └──────┬──────────────────────┬───────────────────────┬────────┘
//!          ▼                      ▼                       ▼
//!    DeliveryLoop S1        DeliveryLoop S2   ...   DeliveryLoop SN
//!          ▼                      ▼                       ▼
//!     Subscriber            Subscription (Stream)    Subscriber
//!
//!   every stage ── RelayEvent ──► Bus ──► ObserverSet ──► LogWriter
//! ```
//!
//! ## Guarantees
//! - Sequences are assigned by the relay, strictly increasing and gap-free.
//! - Missed changes are recovered by querying the table; intermediate states
//!   may be collapsed into one synthetic event (`Origin::Reconciled`).
//! - A subscriber's cursor only advances by acknowledging exactly the next
//!   sequence; after a restart delivery resumes at `last_acked_sequence + 1`.
//!
//! ## Contents
//! | Area            | Description                                         | Key types                                   |
//! |-----------------|-----------------------------------------------------|---------------------------------------------|
//! | **Runtime**     | Assembly, lifecycle, subscriber and admin API       | [`Relay`], [`RelayBuilder`]                 |
//! | **Model**       | Canonical change events                             | [`ChangeEvent`], [`RowSnapshot`]            |
//! | **Outbox**      | Durable ordered buffer                              | [`Outbox`], [`OutboxEntry`]                 |
//! | **Dispatch**    | Push and pull subscribers                           | [`Subscriber`], [`Subscription`]            |
//! | **Sources**     | Notification channel and table access               | [`NotificationSource`], [`SourceTable`]     |
//! | **Events**      | Runtime events for observability                    | [`RelayEvent`], [`Observe`]                 |
//! | **Config**      | Plain structs with defaults                         | [`RelayConfig`], [`BackoffPolicy`]          |
//! | **Errors**      | Typed errors with stable labels                     | [`RelayError`], [`RuntimeError`]            |
//!
//! ## Optional features
//! - `logging` (default): [`LogWriter`] observer and the `orders-relay` binary.
//!
//! ## Example
//! ```rust
//! use futures::StreamExt;
//! use orders_relay::{EventKind, MemoryDatabase, Relay, RelayConfig, StartPosition};
//!
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let db = MemoryDatabase::new();
//!     let relay = Relay::builder(RelayConfig::default())
//!         .with_memory_database(&db)
//!         .with_in_memory_outbox()
//!         .build()?;
//!
//!     let mut orders = relay.subscribe("billing", StartPosition::Beginning).await?;
//!     let mut events = relay.events();
//!     relay.start().await?;
//!     while events.recv().await?.kind != EventKind::Connected {}
//!
//!     let row = db.insert("Ann", "Lamp");
//!     let event = orders.next().await.expect("stream open");
//!     assert_eq!(event.row_id(), Some(row.id));
//!     relay.acknowledge("billing", event.sequence)?;
//!
//!     relay.shutdown().await?;
//!     Ok(())
//! }
//! ```

mod config;
mod core;
mod dispatch;
mod error;
mod events;
mod listener;
mod memory;
mod model;
mod normalizer;
mod outbox;
mod policies;
mod reconcile;

// ---- Public re-exports ----

pub use config::{
    DEFAULT_CHANNEL, DEFAULT_TABLE, DispatchConfig, InitialSync, ListenerConfig, OutboxConfig,
    ReconcileConfig, RelayConfig,
};
pub use core::{Relay, RelayBuilder, wait_for_shutdown_signal};
pub use dispatch::{ChannelSubscriber, Delivery, Dispatcher, LogSubscriber, Subscriber, Subscription};
pub use error::{
    DeliveryError, ListenerError, MalformedPayloadError, OutboxError, ReconcileError, RelayError,
    RuntimeError,
};
pub use events::{Bus, EventKind, Observe, ObserverSet, RelayEvent};
pub use listener::{Listener, ListenerMessage, NotificationSource, PgNotificationSource};
pub use memory::{MemoryDatabase, MemoryNotifications};
pub use model::{ChangeEvent, Operation, OrderStatus, Origin, RawPayload, RowSnapshot, SeqOrigin, Value};
pub use normalizer::{Normalizer, parse_row};
pub use outbox::{
    DeadLetterRecord, DeliveryState, OpsDraft, OpsKind, OpsRecord, Outbox, OutboxEntry,
    OutboxReader, PurgeReport, StartPosition, SubscriberCursor, SubscriberLag,
};
pub use policies::{BackoffPolicy, JitterPolicy};
pub use reconcile::{
    DetectorHandle, GapDetector, PgSourceTable, RowCache, RowChanges, RowImage, SourceTable,
    TableCursor, TableSnapshot, Trigger,
};

#[cfg(feature = "logging")]
pub use events::LogWriter;
