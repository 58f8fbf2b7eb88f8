//! Data model shared by every pipeline stage.
//!
//! - [`RawPayload`] listener output, unvalidated notification text
//! - [`ChangeEvent`] normalized, sequenced change (outbox and subscribers)
//! - [`RowSnapshot`] typed image of an `orders` row

mod change;
mod payload;
mod row;

pub use change::{ChangeEvent, Operation, Origin};
pub use payload::{RawPayload, SeqOrigin};
pub use row::{OrderStatus, RowSnapshot, Value};
