//! # Relay: owns the pipeline tasks and the subscriber API.
//!
//! ```text
//! start():
//!   Listener ──mpsc(buffer)──► GapDetector ──commit──► Outbox ◄── retention
//!                                                        │ watch(head, cursors)
//!                                        ┌───────────────┼───────────────┐
//!                                        ▼               ▼               ▼
//!                                   DeliveryLoop    DeliveryLoop    DeliveryLoop
//!
//!   Bus ──► observer pump ──► ObserverSet (LogWriter, ...)
//!
//! shutdown():
//!   ShutdownRequested ──► runtime_token.cancel()
//!     ├─ listener stops, detector drains what it already received
//!     ├─ delivery loops stop
//!     └─ wait up to `grace`:
//!          ├─ all joined ──► AllStoppedWithin
//!          └─ timeout    ──► abort, IncompleteShutdown op, GraceExceeded
//! ```
//!
//! Subscribers can be attached before or after `start`; delivery only needs
//! the outbox.

use std::collections::BTreeSet;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex as StdMutex, PoisonError};

use futures::FutureExt;
use tokio::sync::{Mutex, broadcast, mpsc};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::builder::RelayBuilder;
use super::shutdown;
use crate::config::RelayConfig;
use crate::dispatch::{ChannelSubscriber, Dispatcher, Subscriber, Subscription};
use crate::error::{ListenerError, RelayError, RuntimeError};
use crate::events::{Bus, EventKind, Observe, ObserverSet, RelayEvent, panic_message};
use crate::listener::{Listener, ListenerMessage, NotificationSource};
use crate::outbox::{
    DeadLetterRecord, OpsDraft, OpsKind, OpsRecord, Outbox, StartPosition, SubscriberCursor,
    SubscriberLag, run_retention,
};
use crate::reconcile::{Control, DetectorHandle, GapDetector};

/// First fatal pipeline error; cancels `token` when set.
#[derive(Default)]
pub(crate) struct Fatal {
    token: CancellationToken,
    error: StdMutex<Option<ListenerError>>,
}

impl Fatal {
    fn fail(&self, err: ListenerError) {
        self.error
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get_or_insert(err);
        self.token.cancel();
    }

    fn take(&self) -> Option<ListenerError> {
        self.error
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }
}

/// Pipeline pieces built but not yet running.
pub(crate) struct Parts {
    pub(crate) notifications: Box<dyn NotificationSource>,
    pub(crate) detector: GapDetector,
    pub(crate) control: mpsc::Receiver<Control>,
    pub(crate) observers: Vec<Arc<dyn Observe>>,
}

struct Running {
    tasks: JoinSet<&'static str>,
    alive: BTreeSet<&'static str>,
    pump: JoinHandle<()>,
    pump_token: CancellationToken,
}

enum Stage {
    Ready(Box<Parts>),
    Running(Running),
    Stopped,
}

/// CDC relay for one source table.
pub struct Relay {
    cfg: RelayConfig,
    bus: Bus,
    outbox: Arc<Outbox>,
    dispatcher: Dispatcher,
    detector: DetectorHandle,
    runtime_token: CancellationToken,
    fatal: Arc<Fatal>,
    stage: Mutex<Stage>,
}

impl Relay {
    pub fn builder(cfg: RelayConfig) -> RelayBuilder {
        RelayBuilder::new(cfg)
    }

    /// Relay over PostgreSQL at `cfg.database_url`.
    pub fn connect(cfg: RelayConfig) -> Result<Self, RelayError> {
        RelayBuilder::new(cfg).build()
    }

    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new_internal(
        cfg: RelayConfig,
        bus: Bus,
        outbox: Arc<Outbox>,
        dispatcher: Dispatcher,
        detector: DetectorHandle,
        runtime_token: CancellationToken,
        fatal: Arc<Fatal>,
        parts: Parts,
    ) -> Self {
        Self {
            cfg,
            bus,
            outbox,
            dispatcher,
            detector,
            runtime_token,
            fatal,
            stage: Mutex::new(Stage::Ready(Box::new(parts))),
        }
    }

    /// Spawns the listener, detector, retention and observer tasks.
    pub async fn start(&self) -> Result<(), RelayError> {
        let mut stage = self.stage.lock().await;
        let parts = match std::mem::replace(&mut *stage, Stage::Stopped) {
            Stage::Ready(parts) => *parts,
            other => {
                *stage = other;
                return Err(RelayError::AlreadyStarted);
            }
        };

        let pump_token = CancellationToken::new();
        let observers = ObserverSet::new(parts.observers, self.bus.clone());
        let pump = tokio::spawn(observer_pump(
            observers,
            self.bus.subscribe(),
            pump_token.clone(),
        ));

        let (tx, rx) = mpsc::channel::<ListenerMessage>(self.cfg.listener.buffer.max(1));
        let mut tasks = JoinSet::new();
        let mut alive = BTreeSet::new();

        let listener = Listener::new(parts.notifications, self.cfg.listener.clone(), self.bus.clone());
        let token = self.runtime_token.child_token();
        let fatal = Arc::clone(&self.fatal);
        spawn_named(&mut tasks, &mut alive, "listener", async move {
            if let Err(e) = listener.run(tx, token).await {
                fatal.fail(e);
            }
        });
        spawn_named(
            &mut tasks,
            &mut alive,
            "detector",
            parts
                .detector
                .run(rx, parts.control, self.runtime_token.child_token()),
        );
        spawn_named(
            &mut tasks,
            &mut alive,
            "retention",
            run_retention(
                Arc::clone(&self.outbox),
                self.cfg.outbox.purge_interval,
                self.runtime_token.child_token(),
            ),
        );

        *stage = Stage::Running(Running {
            tasks,
            alive,
            pump,
            pump_token,
        });
        tracing::info!(
            table = %self.cfg.table,
            channel = %self.cfg.listener.channel,
            head = self.outbox.head(),
            "relay started"
        );
        Ok(())
    }

    /// Starts if needed, then runs until a termination signal or a fatal
    /// listener error, and shuts down.
    pub async fn run(&self) -> Result<(), RelayError> {
        match self.start().await {
            Ok(()) | Err(RelayError::AlreadyStarted) => {}
            Err(e) => return Err(e),
        }

        let outcome: Result<(), RelayError> = tokio::select! {
            signal = shutdown::wait_for_shutdown_signal() => match signal {
                Ok(name) => {
                    tracing::info!(signal = name, "shutdown signal received");
                    Ok(())
                }
                Err(e) => Err(e.into()),
            },
            _ = self.fatal.token.cancelled() => match self.fatal.take() {
                Some(e) => Err(e.into()),
                None => Ok(()),
            },
        };

        self.shutdown().await?;
        outcome
    }

    /// Stops every task within `grace`. Calling it again is a no-op.
    pub async fn shutdown(&self) -> Result<(), RuntimeError> {
        let mut stage = self.stage.lock().await;
        let Running {
            mut tasks,
            mut alive,
            pump,
            pump_token,
        } = match std::mem::replace(&mut *stage, Stage::Stopped) {
            Stage::Running(running) => running,
            _ => {
                self.runtime_token.cancel();
                return Ok(());
            }
        };

        self.bus.publish(RelayEvent::new(EventKind::ShutdownRequested));
        self.runtime_token.cancel();

        let grace = self.cfg.grace;
        let deadline = Instant::now() + grace;
        let joined = tokio::time::timeout_at(deadline, async {
            while let Some(res) = tasks.join_next().await {
                if let Ok(name) = res {
                    alive.remove(name);
                }
            }
        })
        .await;

        let mut stuck: Vec<String> = Vec::new();
        if joined.is_err() {
            tasks.abort_all();
            stuck.extend(alive.iter().map(|n| n.to_string()));
        }
        let remaining = deadline.saturating_duration_since(Instant::now());
        stuck.extend(self.dispatcher.stop_all(remaining).await);

        let result = if stuck.is_empty() {
            self.bus.publish(RelayEvent::new(EventKind::AllStoppedWithin));
            tracing::info!("relay stopped");
            Ok(())
        } else {
            let err = RuntimeError::GraceExceeded {
                grace,
                stuck: stuck.clone(),
            };
            tracing::error!(error = %err, "relay shutdown incomplete");
            let op = OpsDraft::new(OpsKind::IncompleteShutdown, err.to_string());
            if let Err(e) = self.outbox.record_ops(op) {
                tracing::error!(error = %e, "recording incomplete shutdown failed");
            }
            self.bus.publish(
                RelayEvent::new(EventKind::GraceExceeded).with_error(stuck.join(",")),
            );
            Err(err)
        };

        pump_token.cancel();
        if let Err(e) = pump.await {
            tracing::warn!(error = %e, "observer pump ended abnormally");
        }
        result
    }

    /// Pull subscription; the consumer acknowledges with [`acknowledge`](Self::acknowledge).
    ///
    /// Subscribing again with the same id replaces the previous subscription
    /// and resumes after the last acknowledged sequence.
    pub async fn subscribe(
        &self,
        subscriber_id: &str,
        start: StartPosition,
    ) -> Result<Subscription, RelayError> {
        let (sub, subscription) =
            ChannelSubscriber::pair(subscriber_id, self.cfg.dispatch.subscription_buffer);
        self.dispatcher.attach(Arc::new(sub), start).await?;
        Ok(subscription)
    }

    /// Acknowledges `sequence`; it must be exactly the next one expected.
    pub fn acknowledge(&self, subscriber_id: &str, sequence: u64) -> Result<(), RelayError> {
        self.outbox.ack(subscriber_id, sequence)?;
        Ok(())
    }

    /// Push subscription.
    pub async fn register(
        &self,
        subscriber: Arc<dyn Subscriber>,
        start: StartPosition,
    ) -> Result<SubscriberCursor, RelayError> {
        Ok(self.dispatcher.attach(subscriber, start).await?)
    }

    /// Stops delivery and forgets the subscriber's cursor.
    pub async fn deregister(&self, subscriber_id: &str) -> Result<bool, RelayError> {
        Ok(self.dispatcher.deregister(subscriber_id).await?)
    }

    /// Stops delivery but keeps the cursor for a later `subscribe`/`register`.
    pub async fn detach(&self, subscriber_id: &str) -> bool {
        self.dispatcher.detach(subscriber_id).await
    }

    /// `head - last_acked_sequence` for every registered subscriber.
    pub fn lag(&self) -> Result<Vec<SubscriberLag>, RelayError> {
        Ok(self.outbox.lag()?)
    }

    /// Reconciles now; returns the number of synthetic events committed.
    pub async fn reconcile_now(&self) -> Result<usize, RelayError> {
        if !self.is_running().await {
            return Err(RelayError::NotRunning);
        }
        self.detector.reconcile_now().await
    }

    pub fn dead_letters(&self) -> Result<Vec<DeadLetterRecord>, RelayError> {
        Ok(self.outbox.dead_letters()?)
    }

    pub fn ops_log(&self) -> Result<Vec<OpsRecord>, RelayError> {
        Ok(self.outbox.ops_log()?)
    }

    /// New receiver of runtime events.
    pub fn events(&self) -> broadcast::Receiver<RelayEvent> {
        self.bus.subscribe()
    }

    /// Last committed sequence.
    pub fn outbox_head(&self) -> u64 {
        self.outbox.head()
    }

    pub fn outbox(&self) -> &Arc<Outbox> {
        &self.outbox
    }

    pub fn config(&self) -> &RelayConfig {
        &self.cfg
    }

    pub async fn is_running(&self) -> bool {
        matches!(*self.stage.lock().await, Stage::Running(_))
    }
}

/// Spawns `fut` into `tasks`; the task yields `name` even if `fut` panics.
fn spawn_named<F>(
    tasks: &mut JoinSet<&'static str>,
    alive: &mut BTreeSet<&'static str>,
    name: &'static str,
    fut: F,
) where
    F: Future<Output = ()> + Send + 'static,
{
    alive.insert(name);
    tasks.spawn(async move {
        if let Err(panic) = AssertUnwindSafe(fut).catch_unwind().await {
            tracing::error!(task = name, panic = %panic_message(panic.as_ref()), "task panicked");
        }
        name
    });
}

/// Forwards bus events to the observers; on cancel, flushes what is queued.
async fn observer_pump(
    observers: ObserverSet,
    mut rx: broadcast::Receiver<RelayEvent>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            biased;
            msg = rx.recv() => match msg {
                Ok(ev) => observers.emit(ev),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!(skipped = n, "observer pump lagged");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            _ = cancel.cancelled() => break,
        }
    }
    while let Ok(ev) = rx.try_recv() {
        observers.emit(ev);
    }
    observers.shutdown().await;
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::time::Duration;

    use async_trait::async_trait;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    use super::*;
    use crate::dispatch::Delivery;
    use crate::error::DeliveryError;
    use crate::memory::MemoryDatabase;
    use crate::model::{ChangeEvent, Operation, OrderStatus, Origin, RowSnapshot};
    use crate::policies::BackoffPolicy;

    const WAIT: Duration = Duration::from_secs(5);

    fn quick() -> BackoffPolicy {
        BackoffPolicy {
            first: Duration::from_millis(5),
            max: Duration::from_millis(20),
            ..BackoffPolicy::reconnect().without_jitter()
        }
    }

    fn test_config() -> RelayConfig {
        let mut cfg = RelayConfig::default();
        cfg.grace = WAIT;
        cfg.listener.reconnect = quick();
        cfg.reconcile.retry = quick();
        cfg.dispatch.backoff = quick();
        cfg.dispatch.ack_timeout = WAIT;
        cfg
    }

    fn memory_relay(db: &MemoryDatabase) -> Relay {
        Relay::builder(test_config())
            .with_memory_database(db)
            .with_in_memory_outbox()
            .build()
            .unwrap()
    }

    /// Starts the relay and waits until it listens and the startup sync is done.
    async fn start(relay: &Relay) {
        let mut events = relay.events();
        relay.start().await.unwrap();
        let (mut connected, mut synced) = (false, false);
        tokio::time::timeout(WAIT, async {
            while !(connected && synced) {
                match events.recv().await.unwrap().kind {
                    EventKind::Connected => connected = true,
                    EventKind::ReconciliationFinished => synced = true,
                    _ => {}
                }
            }
        })
        .await
        .expect("relay did not become ready");
    }

    async fn next(sub: &mut Subscription) -> ChangeEvent {
        tokio::time::timeout(WAIT, sub.recv())
            .await
            .expect("no event delivered")
            .expect("subscription closed")
    }

    /// Receives and acknowledges `n` events.
    async fn take(relay: &Relay, sub: &mut Subscription, n: usize) -> Vec<ChangeEvent> {
        let mut out = Vec::with_capacity(n);
        for _ in 0..n {
            let ev = next(sub).await;
            relay.acknowledge(sub.id(), ev.sequence).unwrap();
            out.push(ev);
        }
        out
    }

    #[tokio::test]
    async fn test_insert_update_delete_flow() {
        let db = MemoryDatabase::new();
        let relay = memory_relay(&db);
        let mut sub = relay.subscribe("billing", StartPosition::Beginning).await.unwrap();
        start(&relay).await;

        let row = db.insert("Ann", "Lamp");
        db.update_status(row.id, OrderStatus::Shipped);
        db.delete(row.id);

        let events = take(&relay, &mut sub, 3).await;
        let ops: Vec<Operation> = events.iter().map(|e| e.operation).collect();
        assert_eq!(ops, vec![Operation::Insert, Operation::Update, Operation::Delete]);
        let seqs: Vec<u64> = events.iter().map(|e| e.sequence).collect();
        assert_eq!(seqs, vec![1, 2, 3]);

        let update = &events[1];
        assert_eq!(update.before.as_ref().unwrap().status, OrderStatus::Pending);
        assert_eq!(update.after.as_ref().unwrap().status, OrderStatus::Shipped);
        assert_eq!(events[2].before.as_ref().unwrap().status, OrderStatus::Shipped);

        let lag = relay.lag().unwrap();
        assert_eq!(lag.len(), 1);
        assert_eq!(lag[0].lag, 0);
        relay.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_dropped_notification_is_reconciled() {
        let db = MemoryDatabase::new().with_source_seq();
        let relay = memory_relay(&db);
        let mut sub = relay.subscribe("billing", StartPosition::Beginning).await.unwrap();
        start(&relay).await;

        let row = db.insert("Ann", "Lamp");
        db.drop_next(1);
        db.update_status(row.id, OrderStatus::Shipped);
        db.update_status(row.id, OrderStatus::Delivered);

        let events = take(&relay, &mut sub, 2).await;
        assert_eq!(events[0].operation, Operation::Insert);
        let collapsed = &events[1];
        assert_eq!(collapsed.operation, Operation::Update);
        assert_eq!(collapsed.origin, Origin::Reconciled);
        assert_eq!(collapsed.before.as_ref().unwrap().status, OrderStatus::Pending);
        assert_eq!(collapsed.after.as_ref().unwrap().status, OrderStatus::Delivered);

        let ops = relay.ops_log().unwrap();
        assert!(ops.iter().any(|o| o.kind == OpsKind::GapDetected));
        assert!(ops.iter().any(|o| o.kind == OpsKind::ReconciledTransition
            && o.detail == "UPDATE id=1 pending -> delivered"
            && o.sequence == Some(2)));
        relay.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_random_loss_converges() {
        let db = MemoryDatabase::new();
        let relay = memory_relay(&db);
        start(&relay).await;

        let mut rng = StdRng::seed_from_u64(7);
        for step in 0..300 {
            let live: Vec<i64> = db.rows().iter().map(|r| r.id).collect();
            match rng.random_range(0..100) {
                0..35 => {
                    db.insert(&format!("customer-{step}"), "Widget");
                }
                35..70 if !live.is_empty() => {
                    let id = live[rng.random_range(0..live.len())];
                    let status = match rng.random_range(0..3) {
                        0 => OrderStatus::Pending,
                        1 => OrderStatus::Shipped,
                        _ => OrderStatus::Delivered,
                    };
                    db.update_status(id, status);
                }
                70..85 if !live.is_empty() => {
                    db.delete(live[rng.random_range(0..live.len())]);
                }
                85..95 => db.drop_next(rng.random_range(1..4)),
                95..100 => db.disconnect(),
                _ => {}
            }
            if step % 10 == 0 {
                tokio::time::sleep(Duration::from_millis(1)).await;
            } else {
                tokio::task::yield_now().await;
            }
        }
        relay.reconcile_now().await.unwrap();

        let mut sub = relay.subscribe("audit", StartPosition::Beginning).await.unwrap();
        let head = relay.outbox_head();
        let events = take(&relay, &mut sub, head as usize).await;

        let mut state: BTreeMap<i64, RowSnapshot> = BTreeMap::new();
        for (i, ev) in events.iter().enumerate() {
            assert_eq!(ev.sequence, i as u64 + 1);
            let id = ev.row_id().unwrap();
            match ev.operation {
                Operation::Insert => {
                    assert!(!state.contains_key(&id), "insert of existing row {id}");
                    state.insert(id, ev.after.clone().unwrap());
                }
                Operation::Update => {
                    assert_eq!(state.get(&id), ev.before.as_ref());
                    state.insert(id, ev.after.clone().unwrap());
                }
                Operation::Delete => {
                    assert_eq!(state.remove(&id).as_ref(), ev.before.as_ref());
                }
            }
        }
        assert_eq!(state.into_values().collect::<Vec<_>>(), db.rows());
        relay.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_restart_resumes_after_last_ack() {
        let dir = tempfile::tempdir().unwrap();
        let db = MemoryDatabase::new();
        for name in ["Ann", "Bob", "Cid"] {
            db.insert(name, "Lamp");
        }
        let build = || {
            let mut cfg = test_config();
            cfg.data_dir = dir.path().to_path_buf();
            Relay::builder(cfg).with_memory_database(&db).build().unwrap()
        };

        let first = build();
        let mut sub = first.subscribe("billing", StartPosition::Beginning).await.unwrap();
        start(&first).await;
        let seen = take(&first, &mut sub, 2).await;
        assert!(seen.iter().all(|e| e.origin == Origin::Reconciled));
        first.shutdown().await.unwrap();
        drop(sub);
        drop(first);

        let second = build();
        let mut sub = second.subscribe("billing", StartPosition::Beginning).await.unwrap();
        start(&second).await;
        assert_eq!(second.outbox_head(), 3);
        assert_eq!(next(&mut sub).await.sequence, 3);
        second.acknowledge("billing", 3).unwrap();

        let row = db.insert("Dee", "Desk");
        let ev = next(&mut sub).await;
        assert_eq!((ev.sequence, ev.row_id(), ev.origin), (4, Some(row.id), Origin::Live));
        second.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_out_of_order_ack_is_rejected() {
        let db = MemoryDatabase::new();
        db.insert("Ann", "Lamp");
        db.insert("Bob", "Desk");
        let relay = memory_relay(&db);
        let _sub = relay.subscribe("billing", StartPosition::Beginning).await.unwrap();
        start(&relay).await;

        let err = relay.acknowledge("billing", 2).unwrap_err();
        assert!(err.is_out_of_order_ack());
        assert_eq!(relay.lag().unwrap()[0].last_acked_sequence, 0);

        relay.acknowledge("billing", 1).unwrap();
        relay.acknowledge("billing", 2).unwrap();
        assert_eq!(relay.lag().unwrap()[0].lag, 0);
        relay.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_malformed_payload_goes_to_dead_letters() {
        let db = MemoryDatabase::new();
        let relay = memory_relay(&db);
        let mut events = relay.events();
        start(&relay).await;

        db.notify_raw(r#"{"operation":"TRUNCATE"}"#);
        tokio::time::timeout(WAIT, async {
            while events.recv().await.unwrap().kind != EventKind::PayloadRejected {}
        })
        .await
        .unwrap();

        let dead = relay.dead_letters().unwrap();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].payload, r#"{"operation":"TRUNCATE"}"#);
        assert_eq!(relay.outbox_head(), 0);
        relay.shutdown().await.unwrap();
    }

    struct Collector {
        seen: Arc<StdMutex<Vec<u64>>>,
    }

    #[async_trait]
    impl Subscriber for Collector {
        fn id(&self) -> &str {
            "collector"
        }

        async fn deliver(&self, event: &ChangeEvent) -> Result<Delivery, DeliveryError> {
            self.seen.lock().unwrap().push(event.sequence);
            Ok(Delivery::Acked)
        }
    }

    #[tokio::test]
    async fn test_push_subscriber_and_deregister() {
        let db = MemoryDatabase::new();
        let relay = memory_relay(&db);
        let seen = Arc::new(StdMutex::new(Vec::new()));
        let cursor = relay
            .register(Arc::new(Collector { seen: Arc::clone(&seen) }), StartPosition::Now)
            .await
            .unwrap();
        assert_eq!(cursor.last_acked_sequence, 0);
        start(&relay).await;

        db.insert("Ann", "Lamp");
        db.insert("Bob", "Desk");
        let mut acked = relay.outbox().watch_cursor("collector").unwrap();
        tokio::time::timeout(WAIT, acked.wait_for(|s| *s >= 2))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(*seen.lock().unwrap(), vec![1, 2]);

        assert!(relay.deregister("collector").await.unwrap());
        assert!(relay.lag().unwrap().is_empty());
        relay.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_lifecycle_errors() {
        let db = MemoryDatabase::new();
        let relay = memory_relay(&db);
        assert!(matches!(relay.reconcile_now().await, Err(RelayError::NotRunning)));

        start(&relay).await;
        assert!(relay.is_running().await);
        assert!(matches!(relay.start().await, Err(RelayError::AlreadyStarted)));
        assert_eq!(relay.reconcile_now().await.unwrap(), 0);

        relay.shutdown().await.unwrap();
        relay.shutdown().await.unwrap();
        assert!(!relay.is_running().await);
        assert!(matches!(relay.reconcile_now().await, Err(RelayError::NotRunning)));
    }

    #[tokio::test]
    async fn test_listener_unavailable_is_fatal() {
        let db = MemoryDatabase::new();
        db.fail_connects(usize::MAX);
        let mut cfg = test_config();
        cfg.listener.max_retry_duration = Duration::from_millis(50);
        let relay = Relay::builder(cfg)
            .with_memory_database(&db)
            .with_in_memory_outbox()
            .build()
            .unwrap();

        let res = tokio::time::timeout(WAIT, relay.run()).await.expect("run did not return");
        assert!(matches!(res, Err(RelayError::Listener(ListenerError::Unavailable { .. }))));
        assert!(!relay.is_running().await);
    }
}
