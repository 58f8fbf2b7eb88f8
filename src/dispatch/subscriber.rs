//! Push-style subscriber contract.

use async_trait::async_trait;

use crate::error::DeliveryError;
use crate::model::ChangeEvent;

/// What happened to a delivered event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Processed; the dispatcher acknowledges it.
    Acked,
    /// Handed over; an external `acknowledge` call will follow.
    AwaitingAck,
}

/// A consumer of the change stream.
///
/// Each subscriber gets its own delivery loop; events arrive one at a time in
/// sequence order and the next one is only sent after the previous one was
/// acknowledged. A failed or panicking `deliver` is retried with backoff.
#[async_trait]
pub trait Subscriber: Send + Sync + 'static {
    /// Stable identifier; keys the persisted cursor.
    fn id(&self) -> &str;

    async fn deliver(&self, event: &ChangeEvent) -> Result<Delivery, DeliveryError>;
}

/// Subscriber that writes each event through `tracing` and acknowledges it.
#[derive(Debug, Clone)]
pub struct LogSubscriber {
    id: String,
}

impl LogSubscriber {
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into() }
    }
}

#[async_trait]
impl Subscriber for LogSubscriber {
    fn id(&self) -> &str {
        &self.id
    }

    async fn deliver(&self, event: &ChangeEvent) -> Result<Delivery, DeliveryError> {
        let row = event.post_image().or(event.pre_image());
        tracing::info!(
            subscriber = %self.id,
            sequence = event.sequence,
            operation = %event.operation,
            id = ?event.row_id(),
            status = ?row.map(|r| r.status),
            origin = ?event.origin,
            "change"
        );
        Ok(Delivery::Acked)
    }
}
