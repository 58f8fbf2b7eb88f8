//! # Fan-out dispatcher.
//!
//! Keeps one delivery loop per attached subscriber. Loops share nothing but
//! the outbox, so a slow or failing subscriber never holds back another one.
//!
//! ```text
//! attach(sub, start) ──► outbox.register ──► spawn DeliveryLoop(child token)
//! detach(id)         ──► cancel ──► join            (cursor kept)
//! deregister(id)     ──► detach ──► outbox.deregister (cursor dropped)
//! ```
//!
//! ## Rules
//! - Attaching an id that already has a loop replaces that loop; the new one
//!   resumes at `last_acked_sequence + 1`.
//! - Loops are children of the relay's runtime token.

mod channel;
mod subscriber;
mod worker;

pub use channel::{ChannelSubscriber, Subscription};
pub use subscriber::{Delivery, LogSubscriber, Subscriber};

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::DispatchConfig;
use crate::error::OutboxError;
use crate::events::{Bus, EventKind, RelayEvent};
use crate::outbox::{Outbox, StartPosition, SubscriberCursor};
use worker::DeliveryLoop;

struct Handle {
    join: JoinHandle<()>,
    cancel: CancellationToken,
}

/// Registry of delivery loops.
pub struct Dispatcher {
    loops: RwLock<HashMap<String, Handle>>,
    outbox: Arc<Outbox>,
    cfg: DispatchConfig,
    bus: Bus,
    runtime_token: CancellationToken,
}

impl Dispatcher {
    pub fn new(
        outbox: Arc<Outbox>,
        cfg: DispatchConfig,
        bus: Bus,
        runtime_token: CancellationToken,
    ) -> Self {
        Self {
            loops: RwLock::new(HashMap::new()),
            outbox,
            cfg,
            bus,
            runtime_token,
        }
    }

    /// Registers the subscriber (idempotent) and starts its delivery loop.
    pub async fn attach(
        &self,
        subscriber: Arc<dyn Subscriber>,
        start: StartPosition,
    ) -> Result<SubscriberCursor, OutboxError> {
        let id = subscriber.id().to_string();
        let cursor = self.outbox.register(&id, start)?;
        self.detach(&id).await;

        let cancel = self.runtime_token.child_token();
        let worker = DeliveryLoop::new(
            subscriber,
            Arc::clone(&self.outbox),
            self.cfg.clone(),
            self.bus.clone(),
        );
        let join = tokio::spawn(worker.run(cancel.clone()));
        self.loops
            .write()
            .await
            .insert(id.clone(), Handle { join, cancel });

        tracing::info!(
            subscriber = %id,
            last_acked = cursor.last_acked_sequence,
            "subscriber attached"
        );
        self.bus.publish(
            RelayEvent::new(EventKind::SubscriberAttached)
                .with_subscriber(id.as_str())
                .with_sequence(cursor.last_acked_sequence),
        );
        Ok(cursor)
    }

    /// Stops the subscriber's loop, keeping its cursor. Returns `false` if no
    /// loop was running.
    pub async fn detach(&self, id: &str) -> bool {
        let handle = self.loops.write().await.remove(id);
        match handle {
            Some(h) => {
                h.cancel.cancel();
                if let Err(e) = h.join.await {
                    tracing::warn!(subscriber = %id, error = %e, "delivery loop ended abnormally");
                }
                true
            }
            None => false,
        }
    }

    /// Stops the loop and forgets the subscriber.
    pub async fn deregister(&self, id: &str) -> Result<bool, OutboxError> {
        self.detach(id).await;
        let existed = self.outbox.deregister(id)?;
        if existed {
            tracing::info!(subscriber = %id, "subscriber deregistered");
            self.bus
                .publish(RelayEvent::new(EventKind::SubscriberDetached).with_subscriber(id));
        }
        Ok(existed)
    }

    /// Ids with a running loop, sorted.
    pub async fn attached(&self) -> Vec<String> {
        let loops = self.loops.read().await;
        let mut ids: Vec<String> = loops.keys().cloned().collect();
        ids.sort_unstable();
        ids
    }

    /// Cancels every loop and waits up to `grace` for them; returns the ids
    /// that had to be aborted.
    pub async fn stop_all(&self, grace: Duration) -> Vec<String> {
        let handles: Vec<(String, Handle)> = self.loops.write().await.drain().collect();
        for (_, h) in &handles {
            h.cancel.cancel();
        }

        let deadline = tokio::time::Instant::now() + grace;
        let mut stuck = Vec::new();
        for (id, mut h) in handles {
            if tokio::time::timeout_at(deadline, &mut h.join).await.is_err() {
                h.join.abort();
                stuck.push(format!("subscriber:{id}"));
            }
        }
        stuck
    }
}
