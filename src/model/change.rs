//! `ChangeEvent`: the canonical, sequenced row-change record.
//!
//! Every event that reaches the outbox has:
//! - a relay-assigned `sequence`, strictly increasing and gap-free per table;
//! - images matching its operation (`after` only for Insert, `before` and
//!   `after` for Update, `before` only for Delete).
//!
//! Events built through [`ChangeEvent::insert`], [`ChangeEvent::update`] and
//! [`ChangeEvent::delete`] satisfy the image rule by construction; the
//! sequence is `0` (unassigned) until the gap detector commits them.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::row::RowSnapshot;

/// Kind of row change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Operation {
    Insert,
    Update,
    Delete,
}

impl Operation {
    /// Returns the trigger's spelling (`INSERT`, `UPDATE`, `DELETE`).
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Insert => "INSERT",
            Operation::Update => "UPDATE",
            Operation::Delete => "DELETE",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where an event came from.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Origin {
    /// Parsed from a notification.
    #[default]
    Live,
    /// Synthesized by reconciliation; may collapse several missed changes.
    Reconciled,
}

/// A normalized row change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeEvent {
    /// Relay-assigned position in the table's stream (`0` = not yet assigned).
    pub sequence: u64,
    pub operation: Operation,
    pub table: String,
    pub before: Option<RowSnapshot>,
    pub after: Option<RowSnapshot>,
    /// When the relay observed (or synthesized) the change.
    pub observed_at: DateTime<Utc>,
    #[serde(default)]
    pub origin: Origin,
}

impl ChangeEvent {
    pub fn insert(table: impl Into<String>, after: RowSnapshot, observed_at: DateTime<Utc>) -> Self {
        Self::build(Operation::Insert, table.into(), None, Some(after), observed_at)
    }

    pub fn update(
        table: impl Into<String>,
        before: RowSnapshot,
        after: RowSnapshot,
        observed_at: DateTime<Utc>,
    ) -> Self {
        Self::build(
            Operation::Update,
            table.into(),
            Some(before),
            Some(after),
            observed_at,
        )
    }

    pub fn delete(table: impl Into<String>, before: RowSnapshot, observed_at: DateTime<Utc>) -> Self {
        Self::build(Operation::Delete, table.into(), Some(before), None, observed_at)
    }

    fn build(
        operation: Operation,
        table: String,
        before: Option<RowSnapshot>,
        after: Option<RowSnapshot>,
        observed_at: DateTime<Utc>,
    ) -> Self {
        Self {
            sequence: 0,
            operation,
            table,
            before,
            after,
            observed_at,
            origin: Origin::Live,
        }
    }

    /// Sets the stream position.
    pub fn with_sequence(mut self, sequence: u64) -> Self {
        self.sequence = sequence;
        self
    }

    /// Marks the event as synthesized by reconciliation.
    pub fn reconciled(mut self) -> Self {
        self.origin = Origin::Reconciled;
        self
    }

    /// Primary key of the affected row.
    pub fn row_id(&self) -> Option<i64> {
        self.after.as_ref().or(self.before.as_ref()).map(|r| r.id)
    }

    /// Row image after the change, if the row still exists.
    pub fn post_image(&self) -> Option<&RowSnapshot> {
        self.after.as_ref()
    }

    /// Row image before the change, if the row existed.
    pub fn pre_image(&self) -> Option<&RowSnapshot> {
        self.before.as_ref()
    }

    /// Checks the before/after presence rule for the operation.
    pub fn is_well_formed(&self) -> bool {
        match self.operation {
            Operation::Insert => self.before.is_none() && self.after.is_some(),
            Operation::Update => self.before.is_some() && self.after.is_some(),
            Operation::Delete => self.before.is_some() && self.after.is_none(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::OrderStatus;

    fn row(status: OrderStatus) -> RowSnapshot {
        RowSnapshot {
            id: 1,
            customer_name: "A".into(),
            product_name: "Widget".into(),
            status,
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn test_constructors_are_well_formed() {
        let now = Utc::now();
        let ins = ChangeEvent::insert("orders", row(OrderStatus::Pending), now);
        let upd = ChangeEvent::update(
            "orders",
            row(OrderStatus::Pending),
            row(OrderStatus::Shipped),
            now,
        );
        let del = ChangeEvent::delete("orders", row(OrderStatus::Shipped), now);
        assert!(ins.is_well_formed() && upd.is_well_formed() && del.is_well_formed());
        assert_eq!(ins.sequence, 0);
        assert_eq!(del.row_id(), Some(1));
    }

    #[test]
    fn test_mismatched_images_detected() {
        let mut ev = ChangeEvent::insert("orders", row(OrderStatus::Pending), Utc::now());
        ev.before = Some(row(OrderStatus::Pending));
        assert!(!ev.is_well_formed());
    }

    #[test]
    fn test_origin_defaults_to_live_when_missing() {
        let ev = ChangeEvent::insert("orders", row(OrderStatus::Pending), Utc::now())
            .with_sequence(3)
            .reconciled();
        let mut json = serde_json::to_value(&ev).unwrap();
        json.as_object_mut().unwrap().remove("origin");
        let back: ChangeEvent = serde_json::from_value(json).unwrap();
        assert_eq!(back.origin, Origin::Live);
        assert_eq!(back.sequence, 3);
    }
}
