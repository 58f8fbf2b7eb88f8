//! Per-table replication state.
//!
//! Two parts, persisted in the outbox store next to the events they account
//! for:
//! - [`TableCursor`]: a small header (sequence counter, watermark, trigger
//!   sequence), rewritten on every commit;
//! - [`RowImage`]s keyed by row id, of which a commit writes only the ids it
//!   touched ([`RowChanges`]). [`RowCache`] is their in-memory copy.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::model::{ChangeEvent, Operation, RowSnapshot};

/// Where the relay stands for one source table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableCursor {
    pub table: String,
    /// Last trigger-stamped sequence consumed (`None` when the trigger sends none).
    pub last_source_seq: Option<u64>,
    /// Sequence the next committed event gets.
    pub next_sequence: u64,
    /// Highest `updated_at` seen in any committed image.
    pub watermark: Option<DateTime<Utc>>,
}

/// Last known state of one row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "lowercase")]
pub enum RowImage {
    Live(RowSnapshot),
    /// Row deleted; `at` is the `updated_at` of its last image.
    Deleted { at: DateTime<Utc> },
}

/// Row images written by one commit; `None` forgets the id.
pub type RowChanges = BTreeMap<i64, Option<RowImage>>;

impl TableCursor {
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            last_source_seq: None,
            next_sequence: 1,
            watermark: None,
        }
    }

    /// Stamps the next sequence on `event` and stages its row image in `changes`.
    pub fn commit(&mut self, event: ChangeEvent, changes: &mut RowChanges) -> ChangeEvent {
        let event = event.with_sequence(self.next_sequence);
        self.next_sequence += 1;
        match event.operation {
            Operation::Insert | Operation::Update => {
                if let Some(after) = &event.after {
                    self.observe(after.updated_at);
                    changes.insert(after.id, Some(RowImage::Live(after.clone())));
                }
            }
            Operation::Delete => {
                if let Some(before) = &event.before {
                    self.observe(before.updated_at);
                    let at = before.updated_at;
                    changes.insert(before.id, Some(RowImage::Deleted { at }));
                }
            }
        }
        event
    }

    /// Stages a row without emitting anything (initial seeding).
    pub fn seed(&mut self, row: RowSnapshot, changes: &mut RowChanges) {
        self.observe(row.updated_at);
        changes.insert(row.id, Some(RowImage::Live(row)));
    }

    /// Sequence of the last committed event (`0` if none).
    pub fn last_sequence(&self) -> u64 {
        self.next_sequence.saturating_sub(1)
    }

    fn observe(&mut self, at: DateTime<Utc>) {
        if self.watermark.is_none_or(|w| at > w) {
            self.watermark = Some(at);
        }
    }
}

/// In-memory copy of a table's row images.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RowCache {
    rows: BTreeMap<i64, RowSnapshot>,
    tombstones: BTreeMap<i64, DateTime<Utc>>,
}

impl RowCache {
    pub fn row(&self, id: i64) -> Option<&RowSnapshot> {
        self.rows.get(&id)
    }

    /// `updated_at` of the deleted row's last image.
    pub fn tombstone(&self, id: i64) -> Option<DateTime<Utc>> {
        self.tombstones.get(&id).copied()
    }

    /// Every live row by id.
    pub fn rows(&self) -> &BTreeMap<i64, RowSnapshot> {
        &self.rows
    }

    /// Number of live rows.
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Replaces the image of `id`.
    pub fn insert(&mut self, id: i64, image: Option<RowImage>) {
        self.rows.remove(&id);
        self.tombstones.remove(&id);
        match image {
            Some(RowImage::Live(row)) => {
                self.rows.insert(id, row);
            }
            Some(RowImage::Deleted { at }) => {
                self.tombstones.insert(id, at);
            }
            None => {}
        }
    }

    /// Applies a committed set of changes.
    pub fn apply(&mut self, changes: RowChanges) {
        for (id, image) in changes {
            self.insert(id, image);
        }
    }

    /// Deleted ids whose last image is older than `before`.
    pub fn expired_tombstones(&self, before: DateTime<Utc>) -> impl Iterator<Item = i64> + '_ {
        self.tombstones
            .iter()
            .filter(move |(_, at)| **at < before)
            .map(|(id, _)| *id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::OrderStatus;

    fn row(id: i64, status: OrderStatus, secs: i64) -> RowSnapshot {
        RowSnapshot {
            id,
            customer_name: "A".into(),
            product_name: "B".into(),
            status,
            updated_at: DateTime::from_timestamp(secs, 0).unwrap_or_default(),
        }
    }

    #[test]
    fn test_commit_assigns_contiguous_sequences() {
        let mut c = TableCursor::new("orders");
        let mut changes = RowChanges::new();
        let a = c.commit(
            ChangeEvent::insert("orders", row(1, OrderStatus::Pending, 10), Utc::now()),
            &mut changes,
        );
        let b = c.commit(
            ChangeEvent::update(
                "orders",
                row(1, OrderStatus::Pending, 10),
                row(1, OrderStatus::Shipped, 20),
                Utc::now(),
            ),
            &mut changes,
        );
        assert_eq!((a.sequence, b.sequence), (1, 2));
        assert_eq!(c.last_sequence(), 2);
        assert_eq!(c.watermark, DateTime::from_timestamp(20, 0));
        assert_eq!(changes.len(), 1);

        let mut cache = RowCache::default();
        cache.apply(changes);
        assert_eq!(cache.row(1).map(|r| r.status), Some(OrderStatus::Shipped));
    }

    #[test]
    fn test_delete_removes_row_and_keeps_watermark() {
        let mut c = TableCursor::new("orders");
        let mut cache = RowCache::default();
        let mut seeded = RowChanges::new();
        c.seed(row(1, OrderStatus::Pending, 50), &mut seeded);
        cache.apply(seeded);

        let mut changes = RowChanges::new();
        c.commit(
            ChangeEvent::delete("orders", row(1, OrderStatus::Pending, 40), Utc::now()),
            &mut changes,
        );
        cache.apply(changes);
        assert!(cache.row(1).is_none());
        assert!(cache.is_empty());
        assert_eq!(c.watermark, DateTime::from_timestamp(50, 0));
        assert_eq!(cache.tombstone(1), DateTime::from_timestamp(40, 0));

        let cutoff = DateTime::from_timestamp(41, 0).unwrap_or_default();
        let expired: Vec<i64> = cache.expired_tombstones(cutoff).collect();
        assert_eq!(expired, vec![1]);
        cache.insert(1, None);
        assert_eq!(cache.tombstone(1), None);
    }

    #[test]
    fn test_row_image_serde() {
        let live = RowImage::Live(row(12, OrderStatus::Delivered, 5));
        let json = serde_json::to_value(&live).unwrap();
        assert_eq!(json["state"], "live");
        assert_eq!(json["id"], 12);
        assert_eq!(serde_json::from_value::<RowImage>(json).unwrap(), live);

        let gone = RowImage::Deleted {
            at: DateTime::from_timestamp(5, 0).unwrap_or_default(),
        };
        let back: RowImage = serde_json::from_slice(&serde_json::to_vec(&gone).unwrap()).unwrap();
        assert_eq!(back, gone);
    }

    #[test]
    fn test_header_ignores_legacy_row_fields() {
        let json = r#"{"table":"orders","last_source_seq":null,"next_sequence":3,
            "watermark":null,"rows":{"1":{}},"tombstones":{}}"#;
        let c: TableCursor = serde_json::from_str(json).unwrap();
        assert_eq!(c.last_sequence(), 2);
    }
}
