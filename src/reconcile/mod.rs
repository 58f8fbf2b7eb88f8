//! # Gap detection and reconciliation.
//!
//! - [`TableCursor`] is the per-table replication header (sequence counter,
//!   watermark); [`RowImage`]s hold the last known state of each row. Both are
//!   persisted with the outbox, and [`RowCache`] keeps the images in memory.
//! - [`SourceTable`] gives the detector direct query access to the table;
//!   [`PgSourceTable`] is the PostgreSQL implementation.
//! - [`GapDetector`] turns listener messages into a gap-free, sequenced event
//!   stream, reconciling whenever notifications may have been lost.

mod cursor;
mod detector;
mod diff;
mod postgres;
mod source;

pub use cursor::{RowCache, RowChanges, RowImage, TableCursor};
pub use detector::{DetectorHandle, GapDetector, Trigger};
pub use postgres::PgSourceTable;
pub use source::{SourceTable, TableSnapshot};

pub(crate) use detector::Control;
