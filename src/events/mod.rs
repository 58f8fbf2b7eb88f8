//! Runtime events: types, broadcast bus and observers.
//!
//! ## Contents
//! - [`EventKind`], [`RelayEvent`] classification and metadata
//! - [`Bus`] thin wrapper over `tokio::sync::broadcast`
//! - [`Observe`], [`ObserverSet`] per-observer queues with panic isolation
//! - [`LogWriter`] observer that maps events to `tracing` (feature `logging`)
//!
//! Publishers: listener, detector, outbox retention, delivery loops, relay.
//! Consumers: the relay's observer pump and `Relay::events()` receivers.

mod bus;
mod event;
#[cfg(feature = "logging")]
mod log;
mod observer;

pub use bus::Bus;
pub use event::{EventKind, RelayEvent};
#[cfg(feature = "logging")]
pub use log::LogWriter;
pub use observer::{Observe, ObserverSet};

pub(crate) use observer::panic_message;
