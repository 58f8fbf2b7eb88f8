//! redb-backed outbox store.
//!
//! ## Tables
//! ```text
//! outbox_entries      u64  → OutboxEntry (JSON)
//! subscriber_cursors  &str → SubscriberCursor (JSON)
//! table_cursors       &str → TableCursor (JSON)
//! row_images          (&str, i64) → RowImage (JSON), keyed by table and row id
//! dead_letters        u64  → DeadLetterRecord (JSON)
//! ops_log             u64  → OpsRecord (JSON)
//! meta                &str → u64 ("head": last appended sequence)
//! ```
//!
//! ## Rules
//! - Each public method is one write transaction or one read snapshot.
//! - Retained entries are always the contiguous range `first..=head`.
//! - An entry is purged once every registered subscriber has acked it, or
//!   when it outlives the TTL; with no subscribers only the TTL applies.
//! - `head` and cursor changes are published on `watch` channels after commit.

use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::{Arc, PoisonError, RwLock};

use chrono::{DateTime, TimeDelta, Utc};
use redb::{Database, ReadableDatabase, ReadableTable, Table, TableDefinition};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::watch;

use super::entry::{
    DeadLetterRecord, DeliveryState, OpsDraft, OpsKind, OpsRecord, OutboxEntry, StartPosition,
    SubscriberCursor, SubscriberLag,
};
use crate::config::OutboxConfig;
use crate::error::{MalformedPayloadError, OutboxError};
use crate::events::{Bus, EventKind, RelayEvent};
use crate::model::{ChangeEvent, RawPayload};
use crate::reconcile::{RowCache, RowChanges, TableCursor};

const ENTRIES: TableDefinition<'_, u64, &[u8]> = TableDefinition::new("outbox_entries");
const CURSORS: TableDefinition<'_, &str, &[u8]> = TableDefinition::new("subscriber_cursors");
const TABLE_CURSORS: TableDefinition<'_, &str, &[u8]> = TableDefinition::new("table_cursors");
const ROW_IMAGES: TableDefinition<'_, (&str, i64), &[u8]> = TableDefinition::new("row_images");
const DEAD_LETTERS: TableDefinition<'_, u64, &[u8]> = TableDefinition::new("dead_letters");
const OPS_LOG: TableDefinition<'_, u64, &[u8]> = TableDefinition::new("ops_log");
const META: TableDefinition<'_, &str, u64> = TableDefinition::new("meta");

const HEAD_KEY: &str = "head";

/// Result of a TTL purge.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PurgeReport {
    /// Entries removed.
    pub purged: u64,
    /// Subscribers moved past unacked entries: `(id, first skipped, last skipped)`.
    pub skipped: Vec<(String, u64, u64)>,
}

/// Durable, ordered store of change events and subscriber cursors.
pub struct Outbox {
    db: Arc<Database>,
    cfg: OutboxConfig,
    bus: Bus,
    head: watch::Sender<u64>,
    cursors: RwLock<HashMap<String, watch::Sender<u64>>>,
}

impl Outbox {
    /// Opens (or creates) the store at `path`.
    pub fn open(path: impl AsRef<Path>, cfg: OutboxConfig, bus: Bus) -> Result<Self, OutboxError> {
        let db = Database::create(path.as_ref())?;
        Self::from_database(db, cfg, bus)
    }

    /// Store that lives only as long as the process.
    pub fn in_memory(cfg: OutboxConfig, bus: Bus) -> Result<Self, OutboxError> {
        let db = Database::builder().create_with_backend(redb::backends::InMemoryBackend::new())?;
        Self::from_database(db, cfg, bus)
    }

    fn from_database(db: Database, cfg: OutboxConfig, bus: Bus) -> Result<Self, OutboxError> {
        let txn = db.begin_write()?;
        {
            let _ = txn.open_table(ENTRIES)?;
            let _ = txn.open_table(CURSORS)?;
            let _ = txn.open_table(TABLE_CURSORS)?;
            let _ = txn.open_table(ROW_IMAGES)?;
            let _ = txn.open_table(DEAD_LETTERS)?;
            let _ = txn.open_table(OPS_LOG)?;
            let _ = txn.open_table(META)?;
        }
        txn.commit()?;

        let (head, cursors) = {
            let txn = db.begin_read()?;
            let head = read_head(&txn.open_table(META)?)?;
            let cursors = all_cursors(&txn.open_table(CURSORS)?)?;
            (head, cursors)
        };
        let cursors = cursors
            .into_iter()
            .map(|c| (c.subscriber_id, watch::channel(c.last_acked_sequence).0))
            .collect();

        Ok(Self {
            db: Arc::new(db),
            cfg,
            bus,
            head: watch::channel(head).0,
            cursors: RwLock::new(cursors),
        })
    }

    /// Last appended sequence (`0` when nothing was ever appended).
    pub fn head(&self) -> u64 {
        *self.head.borrow()
    }

    /// Receiver that observes `head` after every committed append.
    pub fn watch_head(&self) -> watch::Receiver<u64> {
        self.head.subscribe()
    }

    /// Receiver that observes the subscriber's `last_acked_sequence`.
    ///
    /// Closed once the subscriber is deregistered.
    pub fn watch_cursor(&self, subscriber: &str) -> Option<watch::Receiver<u64>> {
        self.cursors
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(subscriber)
            .map(watch::Sender::subscribe)
    }

    /// Appends one event; re-appending a stored sequence returns the stored entry.
    pub fn append(&self, event: ChangeEvent) -> Result<OutboxEntry, OutboxError> {
        let mut stored = self.append_batch(std::slice::from_ref(&event), None)?;
        Ok(stored
            .pop()
            .unwrap_or_else(|| OutboxEntry::new(event, Utc::now())))
    }

    /// Appends events and stores `table_cursor` in the same transaction.
    pub fn append_batch(
        &self,
        events: &[ChangeEvent],
        table_cursor: Option<&TableCursor>,
    ) -> Result<Vec<OutboxEntry>, OutboxError> {
        self.commit_batch(events, table_cursor, &RowChanges::new(), &[])
    }

    /// [`append_batch`](Self::append_batch) plus row image changes and ops log
    /// records, atomically.
    ///
    /// `rows` is written under `table_cursor`'s table and ignored without one.
    pub fn commit_batch(
        &self,
        events: &[ChangeEvent],
        table_cursor: Option<&TableCursor>,
        rows: &RowChanges,
        ops: &[OpsDraft],
    ) -> Result<Vec<OutboxEntry>, OutboxError> {
        let now = Utc::now();
        let mut stored = Vec::with_capacity(events.len());
        let txn = self.db.begin_write()?;
        let head = {
            let mut meta = txn.open_table(META)?;
            let mut entries = txn.open_table(ENTRIES)?;
            let mut head = read_head(&meta)?;
            let mut retained = retained_len(&entries, head)?;

            for event in events {
                if event.sequence == 0 {
                    return Err(OutboxError::Unsequenced);
                }
                if event.sequence <= head {
                    if let Some(existing) = entries.get(event.sequence)? {
                        stored.push(decode::<OutboxEntry>(existing.value())?);
                    }
                    continue;
                }
                if event.sequence != head + 1 {
                    return Err(OutboxError::NonContiguous {
                        expected: head + 1,
                        received: event.sequence,
                    });
                }
                if let Some(capacity) = self.cfg.capacity()
                    && retained >= capacity
                {
                    return Err(OutboxError::Full { capacity });
                }
                let entry = OutboxEntry::new(event.clone(), now);
                entries.insert(event.sequence, encode(&entry)?.as_slice())?;
                head = event.sequence;
                retained += 1;
                stored.push(entry);
            }
            meta.insert(HEAD_KEY, head)?;

            if let Some(cursor) = table_cursor {
                let mut cursors = txn.open_table(TABLE_CURSORS)?;
                cursors.insert(cursor.table.as_str(), encode(cursor)?.as_slice())?;
                if !rows.is_empty() {
                    let mut images = txn.open_table(ROW_IMAGES)?;
                    for (id, image) in rows {
                        let key = (cursor.table.as_str(), *id);
                        match image {
                            Some(image) => {
                                images.insert(key, encode(image)?.as_slice())?;
                            }
                            None => {
                                images.remove(key)?;
                            }
                        }
                    }
                }
            }
            if !ops.is_empty() {
                let mut log = txn.open_table(OPS_LOG)?;
                write_ops(&mut log, ops, now)?;
            }
            head
        };
        txn.commit()?;
        self.head.send_replace(head);
        Ok(stored)
    }

    /// Reads up to `limit` entries starting at `from`.
    pub fn read_range(&self, from: u64, limit: usize) -> Result<Vec<OutboxEntry>, OutboxError> {
        read_range(&self.db, from, limit)
    }

    /// Lazily iterates the subscriber's backlog, oldest first.
    pub fn read_from(&self, subscriber: &str) -> Result<OutboxReader, OutboxError> {
        let cursor = self.require_cursor(subscriber)?;
        Ok(OutboxReader {
            db: Arc::clone(&self.db),
            next: cursor.last_acked_sequence + 1,
            page: VecDeque::new(),
            page_size: self.cfg.page_size.max(1),
            done: false,
        })
    }

    /// First retained entry after the subscriber's cursor.
    pub fn next_for(&self, subscriber: &str) -> Result<Option<OutboxEntry>, OutboxError> {
        let cursor = self.require_cursor(subscriber)?;
        Ok(self
            .read_range(cursor.last_acked_sequence + 1, 1)?
            .into_iter()
            .next())
    }

    /// Acknowledges `sequence` for `subscriber`.
    ///
    /// Only `last_acked_sequence + 1` is accepted; anything else is rejected with
    /// [`OutboxError::OutOfOrderAck`] and leaves the cursor untouched.
    pub fn ack(&self, subscriber: &str, sequence: u64) -> Result<SubscriberCursor, OutboxError> {
        let txn = self.db.begin_write()?;
        let cursor = {
            let mut cursors = txn.open_table(CURSORS)?;
            let mut cursor = read_cursor(&cursors, subscriber)?.ok_or_else(|| {
                OutboxError::UnknownSubscriber {
                    subscriber: subscriber.to_string(),
                }
            })?;
            let expected = cursor.last_acked_sequence + 1;
            if sequence != expected {
                return Err(OutboxError::OutOfOrderAck {
                    subscriber: subscriber.to_string(),
                    expected,
                    received: sequence,
                });
            }

            let mut entries = txn.open_table(ENTRIES)?;
            let mut entry = read_entry(&entries, sequence)?
                .ok_or(OutboxError::UnknownSequence { sequence })?;
            entry
                .delivery_state
                .insert(subscriber.to_string(), DeliveryState::Delivered);
            entries.insert(sequence, encode(&entry)?.as_slice())?;

            cursor.last_acked_sequence = sequence;
            cursors.insert(subscriber, encode(&cursor)?.as_slice())?;

            if let Some(floor) = min_cursor(&cursors)? {
                remove_through(&mut entries, floor)?;
            }
            cursor
        };
        txn.commit()?;
        self.notify_cursor(subscriber, sequence);
        Ok(cursor)
    }

    /// Records a failed delivery attempt. Missing (purged) entries are ignored.
    pub fn mark_failed(
        &self,
        subscriber: &str,
        sequence: u64,
        retry_count: u32,
    ) -> Result<(), OutboxError> {
        let txn = self.db.begin_write()?;
        {
            let mut entries = txn.open_table(ENTRIES)?;
            if let Some(mut entry) = read_entry(&entries, sequence)? {
                entry
                    .delivery_state
                    .insert(subscriber.to_string(), DeliveryState::Failed(retry_count));
                entries.insert(sequence, encode(&entry)?.as_slice())?;
            }
        }
        txn.commit()?;
        Ok(())
    }

    /// Registers a subscriber; an existing registration is returned unchanged.
    pub fn register(
        &self,
        subscriber: &str,
        start: StartPosition,
    ) -> Result<SubscriberCursor, OutboxError> {
        let txn = self.db.begin_write()?;
        let cursor = {
            let mut cursors = txn.open_table(CURSORS)?;
            match read_cursor(&cursors, subscriber)? {
                Some(existing) => existing,
                None => {
                    let head = read_head(&txn.open_table(META)?)?;
                    let last_acked_sequence = match start {
                        StartPosition::Now => head,
                        StartPosition::Beginning => first_key(&txn.open_table(ENTRIES)?)?
                            .map_or(head, |first| first - 1),
                    };
                    let cursor = SubscriberCursor {
                        subscriber_id: subscriber.to_string(),
                        last_acked_sequence,
                        registered_at: Utc::now(),
                    };
                    cursors.insert(subscriber, encode(&cursor)?.as_slice())?;
                    cursor
                }
            }
        };
        txn.commit()?;

        self.cursors
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(subscriber.to_string())
            .or_insert_with(|| watch::channel(cursor.last_acked_sequence).0);
        Ok(cursor)
    }

    /// Removes a subscriber's cursor. Returns `false` if it was not registered.
    pub fn deregister(&self, subscriber: &str) -> Result<bool, OutboxError> {
        let txn = self.db.begin_write()?;
        let existed = {
            let mut cursors = txn.open_table(CURSORS)?;
            let existed = cursors.remove(subscriber)?.is_some();
            if existed && let Some(floor) = min_cursor(&cursors)? {
                remove_through(&mut txn.open_table(ENTRIES)?, floor)?;
            }
            existed
        };
        txn.commit()?;

        self.cursors
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(subscriber);
        Ok(existed)
    }

    pub fn cursor(&self, subscriber: &str) -> Result<Option<SubscriberCursor>, OutboxError> {
        let txn = self.db.begin_read()?;
        read_cursor(&txn.open_table(CURSORS)?, subscriber)
    }

    /// All registered subscribers' cursors.
    pub fn cursors(&self) -> Result<Vec<SubscriberCursor>, OutboxError> {
        let txn = self.db.begin_read()?;
        all_cursors(&txn.open_table(CURSORS)?)
    }

    /// Per-subscriber lag against the current head.
    pub fn lag(&self) -> Result<Vec<SubscriberLag>, OutboxError> {
        let txn = self.db.begin_read()?;
        let head = read_head(&txn.open_table(META)?)?;
        Ok(all_cursors(&txn.open_table(CURSORS)?)?
            .into_iter()
            .map(|c| SubscriberLag {
                lag: head.saturating_sub(c.last_acked_sequence),
                last_acked_sequence: c.last_acked_sequence,
                subscriber_id: c.subscriber_id,
            })
            .collect())
    }

    /// Number of retained entries.
    pub fn len(&self) -> Result<u64, OutboxError> {
        let txn = self.db.begin_read()?;
        let head = read_head(&txn.open_table(META)?)?;
        retained_len(&txn.open_table(ENTRIES)?, head)
    }

    pub fn is_empty(&self) -> Result<bool, OutboxError> {
        Ok(self.len()? == 0)
    }

    /// Removes entries older than the TTL.
    ///
    /// Subscribers whose cursor is behind the purged range are moved past it;
    /// each skip is recorded in the ops log and published as an alert.
    pub fn purge_expired(&self, now: DateTime<Utc>) -> Result<PurgeReport, OutboxError> {
        let Some(ttl) = self.cfg.retention_ttl() else {
            return Ok(PurgeReport::default());
        };
        let Some(cutoff) = now.checked_sub_signed(TimeDelta::from_std(ttl).unwrap_or(TimeDelta::MAX))
        else {
            return Ok(PurgeReport::default());
        };

        let mut report = PurgeReport::default();
        let txn = self.db.begin_write()?;
        {
            let mut entries = txn.open_table(ENTRIES)?;
            let mut upto = None;
            for item in entries.iter()? {
                let (key, value) = item?;
                let entry: OutboxEntry = decode(value.value())?;
                if entry.inserted_at > cutoff {
                    break;
                }
                upto = Some(key.value());
            }
            let Some(upto) = upto else {
                return Ok(report);
            };
            let first = first_key(&entries)?.unwrap_or(upto);

            let mut cursors = txn.open_table(CURSORS)?;
            let mut ops = Vec::new();
            for mut cursor in all_cursors(&cursors)? {
                if cursor.last_acked_sequence >= upto {
                    continue;
                }
                let from = (cursor.last_acked_sequence + 1).max(first);
                ops.push(
                    OpsDraft::new(
                        OpsKind::PurgedUnacked,
                        format!("entries {from}..={upto} expired before acknowledgment"),
                    )
                    .with_sequence(upto)
                    .with_subscriber(cursor.subscriber_id.as_str()),
                );
                ops.push(
                    OpsDraft::new(
                        OpsKind::RetentionSkip,
                        format!("cursor moved from {} to {upto}", cursor.last_acked_sequence),
                    )
                    .with_sequence(upto)
                    .with_subscriber(cursor.subscriber_id.as_str()),
                );
                cursor.last_acked_sequence = upto;
                cursors.insert(cursor.subscriber_id.as_str(), encode(&cursor)?.as_slice())?;
                report.skipped.push((cursor.subscriber_id, from, upto));
            }
            report.purged = remove_through(&mut entries, upto)?;
            if !ops.is_empty() {
                write_ops(&mut txn.open_table(OPS_LOG)?, &ops, now)?;
            }
        }
        txn.commit()?;

        for (subscriber, from, to) in &report.skipped {
            self.notify_cursor(subscriber, *to);
            tracing::error!(
                subscriber = %subscriber,
                from,
                to,
                "retention purged unacknowledged entries"
            );
            self.bus.publish(
                RelayEvent::new(EventKind::PurgedUnacked)
                    .with_subscriber(subscriber.as_str())
                    .with_sequence(*to)
                    .with_count(to - from + 1),
            );
        }
        if report.purged > 0 {
            tracing::debug!(purged = report.purged, "retention purge");
        }
        Ok(report)
    }

    pub fn load_table_cursor(&self, table: &str) -> Result<Option<TableCursor>, OutboxError> {
        let txn = self.db.begin_read()?;
        let cursors = txn.open_table(TABLE_CURSORS)?;
        let cursor = match cursors.get(table)? {
            Some(guard) => Some(decode(guard.value())?),
            None => None,
        };
        Ok(cursor)
    }

    /// Loads every stored row image of `table`.
    pub fn load_row_images(&self, table: &str) -> Result<RowCache, OutboxError> {
        let txn = self.db.begin_read()?;
        let images = txn.open_table(ROW_IMAGES)?;
        let mut cache = RowCache::default();
        for item in images.range((table, i64::MIN)..=(table, i64::MAX))? {
            let (key, value) = item?;
            let (_, id) = key.value();
            cache.insert(id, Some(decode(value.value())?));
        }
        Ok(cache)
    }

    /// Stores a rejected payload.
    pub fn record_dead_letter(
        &self,
        raw: &RawPayload,
        err: &MalformedPayloadError,
    ) -> Result<DeadLetterRecord, OutboxError> {
        let txn = self.db.begin_write()?;
        let record = {
            let mut table = txn.open_table(DEAD_LETTERS)?;
            let record = DeadLetterRecord::new(next_id(&table)?, raw, err);
            table.insert(record.id, encode(&record)?.as_slice())?;
            record
        };
        txn.commit()?;
        Ok(record)
    }

    pub fn dead_letters(&self) -> Result<Vec<DeadLetterRecord>, OutboxError> {
        let txn = self.db.begin_read()?;
        read_all(&txn.open_table(DEAD_LETTERS)?)
    }

    /// Appends one ops log record.
    pub fn record_ops(&self, draft: OpsDraft) -> Result<OpsRecord, OutboxError> {
        let txn = self.db.begin_write()?;
        let record = {
            let mut table = txn.open_table(OPS_LOG)?;
            let id = next_id(&table)?;
            write_op(&mut table, id, &draft, Utc::now())?
        };
        txn.commit()?;
        Ok(record)
    }

    pub fn ops_log(&self) -> Result<Vec<OpsRecord>, OutboxError> {
        let txn = self.db.begin_read()?;
        read_all(&txn.open_table(OPS_LOG)?)
    }

    fn require_cursor(&self, subscriber: &str) -> Result<SubscriberCursor, OutboxError> {
        self.cursor(subscriber)?
            .ok_or_else(|| OutboxError::UnknownSubscriber {
                subscriber: subscriber.to_string(),
            })
    }

    fn notify_cursor(&self, subscriber: &str, sequence: u64) {
        if let Some(tx) = self
            .cursors
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(subscriber)
        {
            tx.send_replace(sequence);
        }
    }
}

/// Lazy, paged iterator over outbox entries.
///
/// Each page is one read snapshot; entries appended while iterating are picked
/// up by later pages.
pub struct OutboxReader {
    db: Arc<Database>,
    next: u64,
    page: VecDeque<OutboxEntry>,
    page_size: usize,
    done: bool,
}

impl Iterator for OutboxReader {
    type Item = Result<OutboxEntry, OutboxError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.page.is_empty() && !self.done {
            match read_range(&self.db, self.next, self.page_size) {
                Ok(page) if page.is_empty() => self.done = true,
                Ok(page) => {
                    if let Some(last) = page.last() {
                        self.next = last.sequence() + 1;
                    }
                    self.page = page.into();
                }
                Err(e) => {
                    self.done = true;
                    return Some(Err(e));
                }
            }
        }
        self.page.pop_front().map(Ok)
    }
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, OutboxError> {
    Ok(serde_json::to_vec(value)?)
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, OutboxError> {
    Ok(serde_json::from_slice(bytes)?)
}

fn read_range(db: &Database, from: u64, limit: usize) -> Result<Vec<OutboxEntry>, OutboxError> {
    let txn = db.begin_read()?;
    let entries = txn.open_table(ENTRIES)?;
    let mut out = Vec::with_capacity(limit.min(1024));
    for item in entries.range(from..)?.take(limit) {
        let (_, value) = item?;
        out.push(decode(value.value())?);
    }
    Ok(out)
}

fn read_head<T: ReadableTable<&'static str, u64>>(meta: &T) -> Result<u64, OutboxError> {
    Ok(meta.get(HEAD_KEY)?.map_or(0, |g| g.value()))
}

fn first_key<T: ReadableTable<u64, &'static [u8]>>(table: &T) -> Result<Option<u64>, OutboxError> {
    Ok(table.first()?.map(|(k, _)| k.value()))
}

fn next_id<T: ReadableTable<u64, &'static [u8]>>(table: &T) -> Result<u64, OutboxError> {
    Ok(table.last()?.map_or(1, |(k, _)| k.value() + 1))
}

fn retained_len<T: ReadableTable<u64, &'static [u8]>>(
    entries: &T,
    head: u64,
) -> Result<u64, OutboxError> {
    Ok(first_key(entries)?.map_or(0, |first| head.saturating_sub(first) + 1))
}

fn read_entry<T: ReadableTable<u64, &'static [u8]>>(
    entries: &T,
    sequence: u64,
) -> Result<Option<OutboxEntry>, OutboxError> {
    match entries.get(sequence)? {
        Some(guard) => Ok(Some(decode(guard.value())?)),
        None => Ok(None),
    }
}

fn read_cursor<T: ReadableTable<&'static str, &'static [u8]>>(
    cursors: &T,
    subscriber: &str,
) -> Result<Option<SubscriberCursor>, OutboxError> {
    match cursors.get(subscriber)? {
        Some(guard) => Ok(Some(decode(guard.value())?)),
        None => Ok(None),
    }
}

fn all_cursors<T: ReadableTable<&'static str, &'static [u8]>>(
    cursors: &T,
) -> Result<Vec<SubscriberCursor>, OutboxError> {
    let mut out = Vec::new();
    for item in cursors.iter()? {
        let (_, value) = item?;
        out.push(decode(value.value())?);
    }
    Ok(out)
}

fn min_cursor<T: ReadableTable<&'static str, &'static [u8]>>(
    cursors: &T,
) -> Result<Option<u64>, OutboxError> {
    Ok(all_cursors(cursors)?
        .iter()
        .map(|c| c.last_acked_sequence)
        .min())
}

fn read_all<R, T>(table: &T) -> Result<Vec<R>, OutboxError>
where
    R: DeserializeOwned,
    T: ReadableTable<u64, &'static [u8]>,
{
    let mut out = Vec::new();
    for item in table.iter()? {
        let (_, value) = item?;
        out.push(decode(value.value())?);
    }
    Ok(out)
}

fn remove_through(entries: &mut Table<'_, u64, &'static [u8]>, upto: u64) -> Result<u64, OutboxError> {
    let mut keys = Vec::new();
    for item in entries.range(..=upto)? {
        let (key, _) = item?;
        keys.push(key.value());
    }
    for key in &keys {
        entries.remove(*key)?;
    }
    Ok(keys.len() as u64)
}

fn write_ops(
    log: &mut Table<'_, u64, &'static [u8]>,
    drafts: &[OpsDraft],
    at: DateTime<Utc>,
) -> Result<(), OutboxError> {
    let first = next_id(log)?;
    for (id, draft) in (first..).zip(drafts) {
        write_op(log, id, draft, at)?;
    }
    Ok(())
}

fn write_op(
    log: &mut Table<'_, u64, &'static [u8]>,
    id: u64,
    draft: &OpsDraft,
    at: DateTime<Utc>,
) -> Result<OpsRecord, OutboxError> {
    let record = OpsRecord {
        id,
        at,
        kind: draft.kind,
        detail: draft.detail.clone(),
        sequence: draft.sequence,
        subscriber: draft.subscriber.clone(),
    };
    log.insert(id, encode(&record)?.as_slice())?;
    Ok(record)
}
