//! # Demo: lossy_channel
//!
//! Runs the relay against the in-memory database, loses a notification on
//! purpose and shows the reconciled event that replaces it.
//!
//! Shows how to:
//! - Implement the [`Observe`] trait to watch runtime events.
//! - Consume a pull [`Subscription`] as a `Stream` and acknowledge it.
//! - Read the ops log after reconciliation.
//!
//! ## Flow
//! ```text
//! insert ──► NOTIFY seq=1 ──► Insert (live)
//! update ──► NOTIFY seq=2 ──X  (dropped)
//! update ──► NOTIFY seq=3 ──► gap ──► reconcile ──► Update pending -> delivered (reconciled)
//! ```
//!
//! ## Run
//! ```bash
//! cargo run --example lossy_channel
//! ```

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use orders_relay::{
    EventKind, MemoryDatabase, Observe, OrderStatus, Relay, RelayConfig, RelayEvent,
    StartPosition,
};

/// Prints detector events.
struct Console;

#[async_trait::async_trait]
impl Observe for Console {
    async fn on_event(&self, ev: &RelayEvent) {
        match ev.kind {
            EventKind::SequenceGap => println!(
                "[obs] gap: expected={} missed={}",
                ev.sequence.unwrap_or_default(),
                ev.count.unwrap_or_default()
            ),
            EventKind::ReconciliationFinished => println!(
                "[obs] reconciled: reason={} synthesized={}",
                ev.error.as_deref().unwrap_or("-"),
                ev.count.unwrap_or_default()
            ),
            _ => {}
        }
    }

    fn name(&self) -> &'static str {
        "console"
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let db = MemoryDatabase::new().with_source_seq();
    let mut cfg = RelayConfig::default();
    cfg.grace = Duration::from_secs(5);

    let relay = Relay::builder(cfg)
        .with_memory_database(&db)
        .with_in_memory_outbox()
        .with_observer(Arc::new(Console))
        .build()?;

    let mut orders = relay.subscribe("shipping", StartPosition::Beginning).await?;
    let mut events = relay.events();
    relay.start().await?;
    while events.recv().await?.kind != EventKind::Connected {}

    let row = db.insert("Ann", "Lamp");
    db.drop_next(1);
    db.update_status(row.id, OrderStatus::Shipped);
    db.update_status(row.id, OrderStatus::Delivered);

    for _ in 0..2 {
        let Some(ev) = orders.next().await else { break };
        let before = ev.before.as_ref().map(|r| r.status.as_str()).unwrap_or("-");
        let after = ev.after.as_ref().map(|r| r.status.as_str()).unwrap_or("-");
        println!(
            "[sub] #{} {} {before} -> {after} ({:?})",
            ev.sequence, ev.operation, ev.origin
        );
        relay.acknowledge("shipping", ev.sequence)?;
    }

    for op in relay.ops_log()? {
        println!("[ops] {:?}: {}", op.kind, op.detail);
    }
    relay.shutdown().await?;
    Ok(())
}
