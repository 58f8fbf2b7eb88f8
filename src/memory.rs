//! # In-memory `orders` table with a lossy notification channel.
//!
//! [`MemoryDatabase`] stands in for PostgreSQL in tests and demos. Writes go
//! to a row map and fire trigger-shaped notifications to every connected
//! [`MemoryNotifications`]; nothing is queued for listeners that are not
//! connected, just like `NOTIFY`.
//!
//! Fault injection:
//! - [`drop_next`](MemoryDatabase::drop_next) loses the next N notifications;
//! - [`disconnect`](MemoryDatabase::disconnect) breaks every live listener;
//! - [`fail_connects`](MemoryDatabase::fail_connects) /
//!   [`fail_snapshots`](MemoryDatabase::fail_snapshots) make the next N
//!   connects / queries fail.
//!
//! `updated_at` comes from a logical clock that advances one second per write,
//! starting at 2024-01-01T00:00:00Z.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use serde_json::json;
use tokio::sync::mpsc;

use crate::error::{ListenerError, ReconcileError};
use crate::listener::NotificationSource;
use crate::model::{OrderStatus, RowSnapshot};
use crate::reconcile::{SourceTable, TableSnapshot};

const EPOCH_SECS: i64 = 1_704_067_200;

enum Note {
    Payload(String),
    Disconnect,
}

struct State {
    rows: BTreeMap<i64, RowSnapshot>,
    next_id: i64,
    clock: i64,
    seq: u64,
    stamp_seq: bool,
    listeners: Vec<mpsc::UnboundedSender<Note>>,
    drop_next: usize,
    dropped: u64,
    fail_connects: usize,
    fail_snapshots: usize,
}

/// Shared handle to the fake database.
#[derive(Clone)]
pub struct MemoryDatabase {
    state: Arc<Mutex<State>>,
}

impl Default for MemoryDatabase {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryDatabase {
    /// Empty table whose trigger sends no `"seq"`.
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(State {
                rows: BTreeMap::new(),
                next_id: 1,
                clock: 0,
                seq: 0,
                stamp_seq: false,
                listeners: Vec::new(),
                drop_next: 0,
                dropped: 0,
                fail_connects: 0,
                fail_snapshots: 0,
            })),
        }
    }

    /// Makes the trigger stamp a change counter (`"seq"`) on every payload.
    pub fn with_source_seq(self) -> Self {
        self.lock().stamp_seq = true;
        self
    }

    /// A notification source bound to this database.
    pub fn notifications(&self) -> MemoryNotifications {
        MemoryNotifications {
            state: Arc::clone(&self.state),
            rx: None,
        }
    }

    /// Inserts a `pending` order and returns it.
    pub fn insert(&self, customer: &str, product: &str) -> RowSnapshot {
        let mut st = self.lock();
        let id = st.next_id;
        st.next_id += 1;
        let row = RowSnapshot {
            id,
            customer_name: customer.to_string(),
            product_name: product.to_string(),
            status: OrderStatus::Pending,
            updated_at: st.tick(),
        };
        st.rows.insert(id, row.clone());
        st.fire(json!({ "operation": "INSERT", "data": row }));
        row
    }

    /// Changes an order's status; `None` if the row does not exist.
    pub fn update_status(&self, id: i64, status: OrderStatus) -> Option<RowSnapshot> {
        let mut st = self.lock();
        let before = st.rows.get(&id)?.clone();
        let after = RowSnapshot {
            status,
            updated_at: st.tick(),
            ..before.clone()
        };
        st.rows.insert(id, after.clone());
        st.fire(json!({ "operation": "UPDATE", "old_data": before, "new_data": after }));
        Some(after)
    }

    /// Deletes an order; `None` if the row does not exist.
    pub fn delete(&self, id: i64) -> Option<RowSnapshot> {
        let mut st = self.lock();
        let before = st.rows.remove(&id)?;
        st.tick();
        st.fire(json!({ "operation": "DELETE", "data": before }));
        Some(before)
    }

    /// Sends arbitrary text on the channel, bypassing the table.
    pub fn notify_raw(&self, text: impl Into<String>) {
        self.lock().send(text.into());
    }

    pub fn drop_next(&self, n: usize) {
        self.lock().drop_next += n;
    }

    /// Breaks every connected listener.
    pub fn disconnect(&self) {
        let mut st = self.lock();
        for tx in st.listeners.drain(..) {
            let _ = tx.send(Note::Disconnect);
        }
    }

    pub fn fail_connects(&self, n: usize) {
        self.lock().fail_connects = n;
    }

    pub fn fail_snapshots(&self, n: usize) {
        self.lock().fail_snapshots = n;
    }

    /// Current table contents ordered by id.
    pub fn rows(&self) -> Vec<RowSnapshot> {
        self.lock().rows.values().cloned().collect()
    }

    pub fn row(&self, id: i64) -> Option<RowSnapshot> {
        self.lock().rows.get(&id).cloned()
    }

    /// Notifications lost so far through [`drop_next`](Self::drop_next).
    pub fn dropped(&self) -> u64 {
        self.lock().dropped
    }

    /// Number of listeners currently connected.
    pub fn listener_count(&self) -> usize {
        let mut st = self.lock();
        st.listeners.retain(|tx| !tx.is_closed());
        st.listeners.len()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl State {
    fn tick(&mut self) -> DateTime<Utc> {
        self.clock += 1;
        DateTime::from_timestamp(EPOCH_SECS, 0).unwrap_or_default() + TimeDelta::seconds(self.clock)
    }

    fn fire(&mut self, mut payload: serde_json::Value) {
        self.seq += 1;
        if self.stamp_seq
            && let Some(obj) = payload.as_object_mut()
        {
            obj.insert("seq".into(), json!(self.seq));
        }
        if self.drop_next > 0 {
            self.drop_next -= 1;
            self.dropped += 1;
            return;
        }
        self.send(payload.to_string());
    }

    fn send(&mut self, text: String) {
        self.listeners
            .retain(|tx| tx.send(Note::Payload(text.clone())).is_ok());
    }
}

#[async_trait]
impl SourceTable for MemoryDatabase {
    async fn snapshot(&self, since: Option<DateTime<Utc>>) -> Result<TableSnapshot, ReconcileError> {
        let mut st = self.lock();
        if st.fail_snapshots > 0 {
            st.fail_snapshots -= 1;
            return Err(ReconcileError::Query {
                reason: "injected query failure".into(),
            });
        }
        let mut rows: Vec<RowSnapshot> = st
            .rows
            .values()
            .filter(|r| since.is_none_or(|s| r.updated_at > s))
            .cloned()
            .collect();
        rows.sort_by_key(|r| (r.updated_at, r.id));
        let ids = st.rows.keys().copied().collect();
        Ok(TableSnapshot { rows, ids })
    }
}

/// Listener end of a [`MemoryDatabase`] channel.
pub struct MemoryNotifications {
    state: Arc<Mutex<State>>,
    rx: Option<mpsc::UnboundedReceiver<Note>>,
}

#[async_trait]
impl NotificationSource for MemoryNotifications {
    async fn connect(&mut self) -> Result<(), ListenerError> {
        let mut st = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if st.fail_connects > 0 {
            st.fail_connects -= 1;
            return Err(ListenerError::ConnectFailed {
                reason: "injected connect failure".into(),
            });
        }
        let (tx, rx) = mpsc::unbounded_channel();
        st.listeners.push(tx);
        self.rx = Some(rx);
        Ok(())
    }

    async fn recv(&mut self) -> Result<String, ListenerError> {
        let lost = |reason: &str| ListenerError::ConnectionLost {
            reason: reason.to_string(),
        };
        let Some(rx) = self.rx.as_mut() else {
            return Err(lost("not connected"));
        };
        match rx.recv().await {
            Some(Note::Payload(text)) => Ok(text),
            Some(Note::Disconnect) | None => {
                self.rx = None;
                Err(lost("connection reset"))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_writes_notify_connected_listeners_only() {
        let db = MemoryDatabase::new().with_source_seq();
        db.insert("Ann", "Lamp");

        let mut n = db.notifications();
        n.connect().await.unwrap();
        let row = db.update_status(1, OrderStatus::Shipped).unwrap();
        let text = n.recv().await.unwrap();
        let doc: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(doc["operation"], "UPDATE");
        assert_eq!(doc["seq"], 2);
        assert_eq!(doc["new_data"]["status"], "shipped");
        assert!(row.updated_at > doc["old_data"]["updated_at"].as_str().unwrap().parse::<DateTime<Utc>>().unwrap());
    }

    #[tokio::test]
    async fn test_drop_and_disconnect() {
        let db = MemoryDatabase::new();
        let mut n = db.notifications();
        n.connect().await.unwrap();
        db.drop_next(1);
        db.insert("Ann", "Lamp");
        db.insert("Bob", "Desk");
        assert!(n.recv().await.unwrap().contains("Bob"));
        assert_eq!(db.dropped(), 1);

        db.disconnect();
        assert!(matches!(n.recv().await, Err(ListenerError::ConnectionLost { .. })));
        assert_eq!(db.listener_count(), 0);
    }

    #[tokio::test]
    async fn test_snapshot_filters() {
        let db = MemoryDatabase::new();
        let a = db.insert("Ann", "Lamp");
        let b = db.insert("Bob", "Desk");
        let all = db.snapshot(None).await.unwrap();
        assert_eq!(all.rows.len(), 2);

        let recent = db.snapshot(Some(a.updated_at)).await.unwrap();
        assert_eq!(recent.rows, vec![b.clone()]);
        assert_eq!(recent.ids.iter().copied().collect::<Vec<_>>(), vec![a.id, b.id]);

        db.delete(a.id);
        let after_delete = db.snapshot(Some(b.updated_at)).await.unwrap();
        assert!(after_delete.rows.is_empty());
        assert_eq!(after_delete.ids.iter().copied().collect::<Vec<_>>(), vec![b.id]);

        db.fail_snapshots(1);
        assert!(db.snapshot(None).await.is_err());
        assert!(db.snapshot(None).await.is_ok());
    }
}
