use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use super::relay::{Fatal, Parts, Relay};
use crate::config::RelayConfig;
use crate::dispatch::Dispatcher;
use crate::error::RelayError;
use crate::events::{Bus, Observe};
use crate::listener::{NotificationSource, PgNotificationSource};
use crate::memory::MemoryDatabase;
use crate::normalizer::Normalizer;
use crate::outbox::Outbox;
use crate::reconcile::{DetectorHandle, GapDetector, PgSourceTable, SourceTable};

/// Builder for a [`Relay`].
///
/// Without explicit sources the relay connects to `database_url` for both the
/// notification channel and reconciliation queries. The outbox lives in
/// `data_dir` unless [`with_in_memory_outbox`](Self::with_in_memory_outbox) is
/// used.
pub struct RelayBuilder {
    cfg: RelayConfig,
    notifications: Option<Box<dyn NotificationSource>>,
    table: Option<Arc<dyn SourceTable>>,
    observers: Vec<Arc<dyn Observe>>,
    in_memory_outbox: bool,
}

impl RelayBuilder {
    pub fn new(cfg: RelayConfig) -> Self {
        Self {
            cfg,
            notifications: None,
            table: None,
            observers: Vec::new(),
            in_memory_outbox: false,
        }
    }

    /// Uses `source` instead of a PostgreSQL `LISTEN` connection.
    pub fn with_source(mut self, source: impl NotificationSource) -> Self {
        self.notifications = Some(Box::new(source));
        self
    }

    /// Uses `table` for reconciliation queries.
    pub fn with_table(mut self, table: Arc<dyn SourceTable>) -> Self {
        self.table = Some(table);
        self
    }

    /// Wires both ends to an in-memory database.
    pub fn with_memory_database(self, db: &MemoryDatabase) -> Self {
        self.with_source(db.notifications())
            .with_table(Arc::new(db.clone()))
    }

    /// Adds a runtime event observer.
    pub fn with_observer(mut self, observer: Arc<dyn Observe>) -> Self {
        self.observers.push(observer);
        self
    }

    /// Keeps the outbox in memory; nothing survives the process.
    pub fn with_in_memory_outbox(mut self) -> Self {
        self.in_memory_outbox = true;
        self
    }

    /// Opens the outbox and assembles the pipeline; nothing runs until
    /// [`Relay::start`].
    pub fn build(self) -> Result<Relay, RelayError> {
        let cfg = self.cfg;
        cfg.validate()?;
        let needs_url = self.notifications.is_none() || self.table.is_none();
        if needs_url && cfg.database_url.trim().is_empty() {
            return Err(RelayError::Config {
                reason: "database_url is required without explicit sources".into(),
            });
        }

        let notifications = match self.notifications {
            Some(source) => source,
            None => Box::new(PgNotificationSource::new(
                cfg.database_url.clone(),
                cfg.listener.channel.clone(),
            )),
        };
        let table = match self.table {
            Some(table) => table,
            None => Arc::new(PgSourceTable::new(cfg.database_url.clone(), &cfg.table)?),
        };

        let bus = Bus::new(cfg.bus_capacity_clamped());
        let outbox = if self.in_memory_outbox {
            Outbox::in_memory(cfg.outbox.clone(), bus.clone())?
        } else {
            std::fs::create_dir_all(&cfg.data_dir)?;
            Outbox::open(cfg.outbox_path(), cfg.outbox.clone(), bus.clone())?
        };
        let outbox = Arc::new(outbox);

        let detector = GapDetector::new(
            table,
            Arc::clone(&outbox),
            Normalizer::new(cfg.table.clone()),
            cfg.reconcile.clone(),
            bus.clone(),
        );
        let (handle, control) = DetectorHandle::channel();

        let runtime_token = CancellationToken::new();
        let dispatcher = Dispatcher::new(
            Arc::clone(&outbox),
            cfg.dispatch.clone(),
            bus.clone(),
            runtime_token.clone(),
        );

        let parts = Parts {
            notifications,
            detector,
            control,
            observers: self.observers,
        };
        Ok(Relay::new_internal(
            cfg,
            bus,
            outbox,
            dispatcher,
            handle,
            runtime_token,
            Arc::new(Fatal::default()),
            parts,
        ))
    }
}
