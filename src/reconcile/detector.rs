//! # Gap detector & reconciler.
//!
//! Single task between the listener and the outbox. For every message:
//!
//! ```text
//! Payload ──► seq check ──► duplicate ─► discard
//!                 │   └───► gap ───────► reconcile, then the payload
//!                 ▼
//!             normalize ──► rejected ──► dead-letter log
//!                 ▼
//!             continuity vs. row cache ──► [bridge] + live ──► commit
//!
//! ConnectionLost / Overflow ──► reconcile
//! ```
//!
//! Reconciliation queries the source table while buffering incoming messages
//! (up to `held_limit`), diffs the result against the row cache and commits the
//! synthetic events. Buffered live events are processed afterwards; those the
//! snapshot already covers are discarded by the continuity check. A sequence
//! jump is only accepted without a new reconciliation when the payload was
//! received before the last successful snapshot query was issued.
//!
//! Every commit stamps sequences from the table cursor and stores the events
//! with the cursor and the changed row images in one outbox transaction; the
//! in-memory state only moves after the commit succeeded.

use std::collections::VecDeque;
use std::sync::Arc;

use chrono::{DateTime, TimeDelta, Utc};
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Instant, Interval};
use tokio_util::sync::CancellationToken;

use super::diff::{Continuity, continuity, describe, net_effect};
use super::{RowCache, RowChanges, SourceTable, TableCursor, TableSnapshot};
use crate::config::{InitialSync, ReconcileConfig};
use crate::error::{ReconcileError, RelayError};
use crate::events::{Bus, EventKind, RelayEvent};
use crate::listener::ListenerMessage;
use crate::model::{ChangeEvent, Origin, RawPayload, RowSnapshot, SeqOrigin};
use crate::normalizer::Normalizer;
use crate::outbox::{OpsDraft, OpsKind, Outbox};

/// Why a reconciliation runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    /// No table cursor persisted yet.
    InitialSync,
    /// Resuming from a persisted cursor.
    Startup,
    Gap,
    ConnectionLost,
    Overflow,
    Manual,
    Periodic,
}

impl Trigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            Trigger::InitialSync => "initial_sync",
            Trigger::Startup => "startup",
            Trigger::Gap => "sequence_gap",
            Trigger::ConnectionLost => "connection_lost",
            Trigger::Overflow => "listener_overflow",
            Trigger::Manual => "manual",
            Trigger::Periodic => "periodic",
        }
    }
}

pub(crate) enum Control {
    Reconcile(oneshot::Sender<Result<usize, ReconcileError>>),
}

/// Sends commands to a running detector.
#[derive(Clone, Debug)]
pub struct DetectorHandle {
    tx: mpsc::Sender<Control>,
}

impl DetectorHandle {
    /// Creates a handle and the receiver the detector is run with.
    pub(crate) fn channel() -> (Self, mpsc::Receiver<Control>) {
        let (tx, rx) = mpsc::channel(8);
        (Self { tx }, rx)
    }

    /// Runs a reconciliation now; returns the number of synthetic events committed.
    pub async fn reconcile_now(&self) -> Result<usize, RelayError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Control::Reconcile(reply))
            .await
            .map_err(|_| RelayError::NotRunning)?;
        Ok(rx.await.map_err(|_| RelayError::NotRunning)??)
    }
}

enum SeqCheck {
    InOrder,
    Duplicate,
    Gap { expected: u64 },
}

#[derive(Default)]
struct Draft {
    events: Vec<ChangeEvent>,
    seeds: Vec<RowSnapshot>,
    ops: Vec<OpsDraft>,
    source_seq: Option<u64>,
    force: bool,
}

impl Draft {
    fn is_empty(&self) -> bool {
        !self.force
            && self.events.is_empty()
            && self.seeds.is_empty()
            && self.ops.is_empty()
            && self.source_seq.is_none()
    }
}

/// The detector task state.
pub struct GapDetector {
    source: Arc<dyn SourceTable>,
    outbox: Arc<Outbox>,
    normalizer: Normalizer,
    cfg: ReconcileConfig,
    bus: Bus,
    cursor: TableCursor,
    cache: RowCache,
    last_seen: Option<(SeqOrigin, u64)>,
    /// Issue time of the last committed snapshot query.
    covered_until: Option<DateTime<Utc>>,
    backlog: VecDeque<ListenerMessage>,
}

impl GapDetector {
    pub fn new(
        source: Arc<dyn SourceTable>,
        outbox: Arc<Outbox>,
        normalizer: Normalizer,
        cfg: ReconcileConfig,
        bus: Bus,
    ) -> Self {
        let cursor = TableCursor::new(normalizer.table());
        Self {
            source,
            outbox,
            normalizer,
            cfg,
            bus,
            cursor,
            cache: RowCache::default(),
            last_seen: None,
            covered_until: None,
            backlog: VecDeque::new(),
        }
    }

    /// Runs until cancelled or the listener channel closes, then drains
    /// whatever the listener already handed over.
    pub(crate) async fn run(
        mut self,
        mut rx: mpsc::Receiver<ListenerMessage>,
        mut control: mpsc::Receiver<Control>,
        cancel: CancellationToken,
    ) {
        if self.startup(&mut rx, &cancel).await {
            let mut ticker = self
                .cfg
                .interval()
                .map(|d| tokio::time::interval_at(Instant::now() + d, d));

            loop {
                if cancel.is_cancelled() {
                    break;
                }
                if let Some(msg) = self.backlog.pop_front() {
                    self.on_message(msg, &mut rx, &cancel).await;
                    continue;
                }
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    Some(Control::Reconcile(reply)) = control.recv() => {
                        let res = self.reconcile(Trigger::Manual, &mut rx, &cancel).await;
                        let _ = reply.send(res);
                    }
                    msg = rx.recv() => match msg {
                        Some(msg) => self.on_message(msg, &mut rx, &cancel).await,
                        None => break,
                    },
                    _ = next_tick(&mut ticker) => {
                        let _ = self.reconcile(Trigger::Periodic, &mut rx, &cancel).await;
                    }
                }
            }
        }
        self.drain(&mut rx).await;
    }

    /// Loads the table cursor and row images, then runs the startup reconciliation.
    async fn startup(
        &mut self,
        rx: &mut mpsc::Receiver<ListenerMessage>,
        cancel: &CancellationToken,
    ) -> bool {
        let table = self.normalizer.table().to_string();
        let mut attempt = 0;
        let stored = loop {
            let loaded = self.outbox.load_table_cursor(&table).and_then(|c| match c {
                Some(c) => Ok(Some((c, self.outbox.load_row_images(&table)?))),
                None => Ok(None),
            });
            match loaded {
                Ok(stored) => break stored,
                Err(e) => {
                    tracing::warn!(error = %e, attempt, "loading table cursor failed");
                    if !self.pause(attempt, cancel).await {
                        return false;
                    }
                    attempt += 1;
                }
            }
        };

        let trigger = match stored {
            Some((cursor, cache)) => {
                tracing::info!(
                    table = %table,
                    next_sequence = cursor.next_sequence,
                    rows = cache.len(),
                    "resuming from table cursor"
                );
                self.last_seen = cursor.last_source_seq.map(|s| (SeqOrigin::Source, s));
                self.cursor = cursor;
                self.cache = cache;
                Trigger::Startup
            }
            None => Trigger::InitialSync,
        };
        self.reconcile(trigger, rx, cancel).await.is_ok()
    }

    async fn on_message(
        &mut self,
        msg: ListenerMessage,
        rx: &mut mpsc::Receiver<ListenerMessage>,
        cancel: &CancellationToken,
    ) {
        match msg {
            ListenerMessage::Payload(raw) => match self.check_seq(&raw) {
                SeqCheck::Duplicate => {
                    tracing::debug!(seq = raw.seq, "duplicate payload discarded");
                }
                SeqCheck::Gap { expected } => {
                    let missed = raw.seq - expected;
                    tracing::warn!(expected, received = raw.seq, missed, "sequence gap");
                    self.bus.publish(
                        RelayEvent::new(EventKind::SequenceGap)
                            .with_sequence(expected)
                            .with_count(missed),
                    );
                    let op = OpsDraft::new(
                        OpsKind::GapDetected,
                        format!("expected {expected}, received {}", raw.seq),
                    )
                    .with_sequence(raw.seq);
                    if let Err(e) = self.outbox.record_ops(op) {
                        tracing::error!(error = %e, "recording gap failed");
                    }
                    self.backlog.push_front(ListenerMessage::Payload(raw));
                    let _ = self.reconcile(Trigger::Gap, rx, cancel).await;
                }
                SeqCheck::InOrder => self.ingest(raw, cancel).await,
            },
            ListenerMessage::ConnectionLost { reason } => {
                tracing::warn!(reason = %reason, "reconciling after connection loss");
                if matches!(self.last_seen, Some((SeqOrigin::Ordinal, _))) {
                    self.last_seen = None;
                }
                let _ = self.reconcile(Trigger::ConnectionLost, rx, cancel).await;
            }
            ListenerMessage::Overflow { dropped } => {
                tracing::warn!(dropped, "reconciling after listener overflow");
                let _ = self.reconcile(Trigger::Overflow, rx, cancel).await;
            }
        }
    }

    fn check_seq(&self, raw: &RawPayload) -> SeqCheck {
        match self.last_seen {
            Some((origin, last)) if origin == raw.seq_origin => {
                if raw.seq <= last {
                    SeqCheck::Duplicate
                } else if raw.seq == last + 1 || self.covered(raw) {
                    SeqCheck::InOrder
                } else {
                    SeqCheck::Gap { expected: last + 1 }
                }
            }
            _ => SeqCheck::InOrder,
        }
    }

    /// Whether a snapshot query issued after `raw` arrived has been committed.
    fn covered(&self, raw: &RawPayload) -> bool {
        self.covered_until.is_some_and(|at| raw.received_at < at)
    }

    /// Normalizes one in-order payload and commits it.
    async fn ingest(&mut self, raw: RawPayload, cancel: &CancellationToken) {
        self.last_seen = Some((raw.seq_origin, raw.seq));
        let mut draft = Draft {
            source_seq: (raw.seq_origin == SeqOrigin::Source).then_some(raw.seq),
            ..Draft::default()
        };

        match self.normalizer.normalize(&raw) {
            Err(e) => {
                tracing::warn!(seq = raw.seq, kind = e.as_label(), error = %e, "payload rejected");
                self.bus.publish(
                    RelayEvent::new(EventKind::PayloadRejected)
                        .with_sequence(raw.seq)
                        .with_error(e.to_string()),
                );
                if let Err(err) = self.outbox.record_dead_letter(&raw, &e) {
                    tracing::error!(error = %err, "dead-letter write failed");
                }
            }
            Ok(event) => {
                let id = event.row_id().unwrap_or_default();
                match continuity(self.cache.row(id), self.cache.tombstone(id), &event) {
                    Continuity::Apply => draft.events.push(event),
                    Continuity::Bridge(synthetic) => {
                        draft.events.push(synthetic);
                        draft.events.push(event);
                    }
                    Continuity::Duplicate | Continuity::Stale => {
                        tracing::debug!(
                            seq = raw.seq,
                            row = ?event.row_id(),
                            "live event already reflected"
                        );
                    }
                }
            }
        }
        self.commit(draft, cancel).await;
    }

    /// Queries the table, commits the net-effect diff and returns its size.
    async fn reconcile(
        &mut self,
        trigger: Trigger,
        rx: &mut mpsc::Receiver<ListenerMessage>,
        cancel: &CancellationToken,
    ) -> Result<usize, ReconcileError> {
        tracing::info!(reason = trigger.as_str(), "reconciliation started");
        self.bus.publish(
            RelayEvent::new(EventKind::ReconciliationStarted).with_error(trigger.as_str()),
        );

        let Some((snapshot, issued)) = self.snapshot_draining(rx, cancel).await else {
            return Err(ReconcileError::Interrupted);
        };

        let mut draft = Draft {
            force: trigger == Trigger::InitialSync,
            ..Draft::default()
        };
        if trigger == Trigger::InitialSync && self.cfg.initial_sync == InitialSync::SeedOnly {
            draft.seeds = snapshot.rows;
        } else {
            draft.events = net_effect(
                self.normalizer.table(),
                self.cache.rows(),
                &snapshot.rows,
                &snapshot.ids,
                Utc::now(),
            );
        }

        let count = draft.events.len();
        if !self.commit(draft, cancel).await {
            return Err(ReconcileError::Interrupted);
        }
        self.covered_until = Some(issued);

        tracing::info!(reason = trigger.as_str(), synthesized = count, "reconciliation finished");
        self.bus.publish(
            RelayEvent::new(EventKind::ReconciliationFinished)
                .with_error(trigger.as_str())
                .with_count(count as u64),
        );
        Ok(count)
    }

    /// Runs the snapshot query, retrying failures, while moving incoming
    /// messages into the backlog. Returns the snapshot with the time its query
    /// was issued; `None` when cancelled.
    async fn snapshot_draining(
        &mut self,
        rx: &mut mpsc::Receiver<ListenerMessage>,
        cancel: &CancellationToken,
    ) -> Option<(TableSnapshot, DateTime<Utc>)> {
        let mut attempt: u32 = 0;
        loop {
            let since = query_since(&self.cursor, &self.cfg);
            let source = Arc::clone(&self.source);
            let issued = Utc::now();
            let query = source.snapshot(since);
            tokio::pin!(query);

            let result = loop {
                let room = self.backlog.len() < self.cfg.held_limit;
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return None,
                    r = &mut query => break r,
                    Some(msg) = rx.recv(), if room => self.backlog.push_back(msg),
                }
            };

            let err = match result {
                Ok(snapshot) => return Some((snapshot, issued)),
                Err(e) => e,
            };
            let delay = self.cfg.retry.next(attempt);
            attempt = attempt.saturating_add(1);
            tracing::warn!(error = %err, kind = err.as_label(), attempt, ?delay, "reconciliation query failed");

            let sleep = tokio::time::sleep(delay);
            tokio::pin!(sleep);
            loop {
                let room = self.backlog.len() < self.cfg.held_limit;
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return None,
                    _ = &mut sleep => break,
                    Some(msg) = rx.recv(), if room => self.backlog.push_back(msg),
                }
            }
        }
    }

    /// Stamps sequences and commits; returns `false` if given up at shutdown.
    async fn commit(&mut self, draft: Draft, cancel: &CancellationToken) -> bool {
        if draft.is_empty() {
            return true;
        }
        let mut next = self.cursor.clone();
        let mut rows = RowChanges::new();
        for row in draft.seeds {
            next.seed(row, &mut rows);
        }
        if let Some(seq) = draft.source_seq {
            next.last_source_seq = Some(seq);
        }
        let events: Vec<ChangeEvent> = draft
            .events
            .into_iter()
            .map(|e| next.commit(e, &mut rows))
            .collect();
        if let Some(since) = query_since(&next, &self.cfg) {
            for id in self.cache.expired_tombstones(since) {
                rows.entry(id).or_insert(None);
            }
        }

        let mut ops = draft.ops;
        for ev in events.iter().filter(|e| e.origin == Origin::Reconciled) {
            let detail = describe(ev);
            tracing::warn!(sequence = ev.sequence, detail = %detail, "reconciled transition");
            ops.push(OpsDraft::new(OpsKind::ReconciledTransition, detail).with_sequence(ev.sequence));
        }

        let mut attempt: u32 = 0;
        loop {
            let err = match self.outbox.commit_batch(&events, Some(&next), &rows, &ops) {
                Ok(_) => {
                    self.cursor = next;
                    self.cache.apply(rows);
                    return true;
                }
                Err(e) => e,
            };
            if cancel.is_cancelled() {
                tracing::error!(error = %err, pending = events.len(), "commit abandoned at shutdown");
                let op = OpsDraft::new(
                    OpsKind::IncompleteShutdown,
                    format!("{} events not committed: {err}", events.len()),
                );
                if let Err(e) = self.outbox.record_ops(op) {
                    tracing::error!(error = %e, "recording incomplete shutdown failed");
                }
                return false;
            }
            tracing::warn!(error = %err, kind = err.as_label(), attempt, "outbox commit failed; retrying");
            self.pause(attempt, cancel).await;
            attempt = attempt.saturating_add(1);
        }
    }

    /// Backoff sleep; `false` if cancelled meanwhile.
    async fn pause(&self, attempt: u32, cancel: &CancellationToken) -> bool {
        tokio::select! {
            _ = cancel.cancelled() => false,
            _ = tokio::time::sleep(self.cfg.retry.next(attempt)) => true,
        }
    }

    /// Processes everything already received without reconciling.
    async fn drain(&mut self, rx: &mut mpsc::Receiver<ListenerMessage>) {
        rx.close();
        while let Ok(msg) = rx.try_recv() {
            self.backlog.push_back(msg);
        }
        let stop = CancellationToken::new();
        stop.cancel();

        let mut deferred = 0u64;
        let mut processed = 0u64;
        while let Some(msg) = self.backlog.pop_front() {
            match msg {
                ListenerMessage::Payload(raw) => {
                    if let SeqCheck::Duplicate = self.check_seq(&raw) {
                        continue;
                    }
                    self.ingest(raw, &stop).await;
                    processed += 1;
                }
                _ => deferred += 1,
            }
        }
        tracing::info!(processed, deferred, "detector drained");
    }
}

/// Lower bound of the incremental snapshot query: watermark minus lag.
fn query_since(cursor: &TableCursor, cfg: &ReconcileConfig) -> Option<DateTime<Utc>> {
    let lag = TimeDelta::from_std(cfg.watermark_lag).unwrap_or(TimeDelta::MAX);
    cursor.watermark.and_then(|w| w.checked_sub_signed(lag))
}

async fn next_tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(t) => {
            t.tick().await;
        }
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::sync::broadcast;
    use tokio::task::JoinHandle;

    use super::*;
    use crate::listener::NotificationSource;
    use crate::memory::{MemoryDatabase, MemoryNotifications};
    use crate::model::{Operation, OrderStatus};
    use crate::policies::BackoffPolicy;

    struct Harness {
        outbox: Arc<Outbox>,
        tx: mpsc::Sender<ListenerMessage>,
        handle: DetectorHandle,
        events: broadcast::Receiver<RelayEvent>,
        cancel: CancellationToken,
        task: JoinHandle<()>,
        ordinal: u64,
    }

    impl Harness {
        async fn start(db: &MemoryDatabase, cfg: ReconcileConfig) -> Self {
            let bus = Bus::new(256);
            let mut events = bus.subscribe();
            let outbox = Arc::new(Outbox::in_memory(Default::default(), bus.clone()).unwrap());
            let detector = GapDetector::new(
                Arc::new(db.clone()),
                Arc::clone(&outbox),
                Normalizer::new("orders"),
                cfg,
                bus,
            );
            let (handle, control) = DetectorHandle::channel();
            let (tx, rx) = mpsc::channel(64);
            let cancel = CancellationToken::new();
            let task = tokio::spawn(detector.run(rx, control, cancel.clone()));
            wait_for(&mut events, EventKind::ReconciliationFinished).await;
            Self {
                outbox,
                tx,
                handle,
                events,
                cancel,
                task,
                ordinal: 0,
            }
        }

        async fn forward(&mut self, n: &mut MemoryNotifications) {
            let text = n.recv().await.unwrap();
            self.ordinal += 1;
            let raw = RawPayload::from_notification(text, self.ordinal);
            self.tx.send(ListenerMessage::Payload(raw)).await.unwrap();
        }

        async fn wait_head(&self, at_least: u64) {
            let mut head = self.outbox.watch_head();
            tokio::time::timeout(Duration::from_secs(5), head.wait_for(|h| *h >= at_least))
                .await
                .expect("outbox head did not advance")
                .unwrap();
        }

        fn entries(&self) -> Vec<ChangeEvent> {
            self.outbox
                .read_range(1, 100)
                .unwrap()
                .into_iter()
                .map(|e| e.event)
                .collect()
        }

        async fn stop(self) {
            self.cancel.cancel();
            self.task.await.unwrap();
        }
    }

    async fn wait_for(rx: &mut broadcast::Receiver<RelayEvent>, kind: EventKind) -> RelayEvent {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let ev = rx.recv().await.unwrap();
                if ev.kind == kind {
                    return ev;
                }
            }
        })
        .await
        .expect("event not published")
    }

    fn fast() -> ReconcileConfig {
        ReconcileConfig {
            retry: BackoffPolicy::reconnect().without_jitter(),
            ..ReconcileConfig::default()
        }
    }

    #[tokio::test]
    async fn test_gap_collapses_missed_update() {
        let db = MemoryDatabase::new().with_source_seq();
        let mut n = db.notifications();
        n.connect().await.unwrap();
        let mut h = Harness::start(&db, fast()).await;

        db.insert("Ann", "Lamp");
        h.forward(&mut n).await;
        h.wait_head(1).await;

        db.update_status(1, OrderStatus::Shipped);
        let _lost = n.recv().await.unwrap();
        db.update_status(1, OrderStatus::Delivered);
        h.forward(&mut n).await;

        let gap = wait_for(&mut h.events, EventKind::SequenceGap).await;
        assert_eq!((gap.sequence, gap.count), (Some(2), Some(1)));
        h.wait_head(2).await;

        let events = h.entries();
        assert_eq!(events.len(), 2);
        let collapsed = &events[1];
        assert_eq!(collapsed.operation, Operation::Update);
        assert_eq!(collapsed.origin, Origin::Reconciled);
        assert_eq!(collapsed.before.as_ref().unwrap().status, OrderStatus::Pending);
        assert_eq!(collapsed.after.as_ref().unwrap().status, OrderStatus::Delivered);

        let ops = h.outbox.ops_log().unwrap();
        assert!(ops.iter().any(|o| o.kind == OpsKind::GapDetected));
        assert!(ops.iter().any(|o| o.kind == OpsKind::ReconciledTransition
            && o.detail.contains("pending -> delivered")));
        h.stop().await;
    }

    #[tokio::test]
    async fn test_gap_after_reconciliation_is_detected() {
        let db = MemoryDatabase::new().with_source_seq();
        let mut n = db.notifications();
        n.connect().await.unwrap();
        let mut h = Harness::start(&db, fast()).await;

        db.insert("Ann", "Lamp");
        h.forward(&mut n).await;
        h.wait_head(1).await;
        assert_eq!(h.handle.reconcile_now().await.unwrap(), 0);

        // Lost after the reconciliation: nothing covers it yet.
        db.insert("Bob", "Desk");
        let _lost = n.recv().await.unwrap();
        db.insert("Cid", "Sofa");
        h.forward(&mut n).await;

        let gap = wait_for(&mut h.events, EventKind::SequenceGap).await;
        assert_eq!((gap.sequence, gap.count), (Some(2), Some(1)));
        h.wait_head(3).await;

        let ids: Vec<i64> = h.entries().iter().filter_map(ChangeEvent::row_id).collect();
        assert_eq!(ids, vec![1, 2, 3]);
        let ops = h.outbox.ops_log().unwrap();
        assert!(ops.iter().any(|o| o.kind == OpsKind::GapDetected));
        h.stop().await;
    }

    #[tokio::test]
    async fn test_malformed_payload_is_dead_lettered() {
        let db = MemoryDatabase::new();
        let mut n = db.notifications();
        n.connect().await.unwrap();
        let mut h = Harness::start(&db, fast()).await;

        db.notify_raw("not json");
        h.forward(&mut n).await;
        wait_for(&mut h.events, EventKind::PayloadRejected).await;

        let dead = h.outbox.dead_letters().unwrap();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].payload, "not json");
        assert_eq!(h.outbox.head(), 0);

        db.insert("Ann", "Lamp");
        h.forward(&mut n).await;
        h.wait_head(1).await;
        h.stop().await;
    }

    #[tokio::test]
    async fn test_seed_only_initial_sync() {
        let db = MemoryDatabase::new();
        db.insert("Ann", "Lamp");
        db.insert("Bob", "Desk");
        let mut n = db.notifications();
        n.connect().await.unwrap();

        let cfg = ReconcileConfig {
            initial_sync: InitialSync::SeedOnly,
            ..fast()
        };
        let mut h = Harness::start(&db, cfg).await;
        assert_eq!(h.outbox.head(), 0);
        let cursor = h.outbox.load_table_cursor("orders").unwrap().unwrap();
        assert_eq!(cursor.next_sequence, 1);
        assert_eq!(h.outbox.load_row_images("orders").unwrap().len(), 2);

        db.update_status(2, OrderStatus::Shipped);
        h.forward(&mut n).await;
        h.wait_head(1).await;
        let events = h.entries();
        assert_eq!(events[0].operation, Operation::Update);
        assert_eq!(events[0].origin, Origin::Live);
        h.stop().await;
    }

    #[tokio::test]
    async fn test_snapshot_initial_sync_and_manual_reconcile() {
        let db = MemoryDatabase::new();
        db.insert("Ann", "Lamp");
        let h = Harness::start(&db, fast()).await;
        h.wait_head(1).await;
        assert_eq!(h.entries()[0].origin, Origin::Reconciled);

        // Nobody is listening: the change only shows up through reconciliation.
        db.insert("Bob", "Desk");
        db.delete(1);
        assert_eq!(h.handle.reconcile_now().await.unwrap(), 2);
        assert_eq!(h.handle.reconcile_now().await.unwrap(), 0);

        let ops: Vec<Operation> = h.entries().iter().map(|e| e.operation).collect();
        // Ordered by the row image's updated_at: Ann's last image predates Bob.
        assert_eq!(ops, vec![Operation::Insert, Operation::Delete, Operation::Insert]);
        h.stop().await;
    }

    #[tokio::test]
    async fn test_connection_lost_reconciles_and_skips_stale_backlog() {
        let db = MemoryDatabase::new();
        let mut n = db.notifications();
        n.connect().await.unwrap();
        let mut h = Harness::start(&db, fast()).await;

        db.insert("Ann", "Lamp");
        let late = n.recv().await.unwrap();
        h.tx
            .send(ListenerMessage::ConnectionLost {
                reason: "reset".into(),
            })
            .await
            .unwrap();
        h.wait_head(1).await;

        // The insert arrives after the reconciliation already emitted it.
        h.tx
            .send(ListenerMessage::Payload(RawPayload::from_notification(late, 1)))
            .await
            .unwrap();
        db.update_status(1, OrderStatus::Shipped);
        h.ordinal = 1;
        h.forward(&mut n).await;
        h.wait_head(2).await;

        let events = h.entries();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].origin, Origin::Reconciled);
        assert_eq!(events[1].operation, Operation::Update);
        assert_eq!(events[1].origin, Origin::Live);
        h.stop().await;
    }

    #[tokio::test]
    async fn test_failed_query_is_retried() {
        let db = MemoryDatabase::new();
        db.insert("Ann", "Lamp");
        db.fail_snapshots(2);
        let cfg = ReconcileConfig {
            retry: BackoffPolicy {
                first: Duration::from_millis(5),
                max: Duration::from_millis(10),
                ..BackoffPolicy::reconnect().without_jitter()
            },
            ..ReconcileConfig::default()
        };
        let h = Harness::start(&db, cfg).await;
        h.wait_head(1).await;
        h.stop().await;
    }
}
