//! Pull-style subscriptions.
//!
//! [`ChannelSubscriber`] is the dispatcher side, [`Subscription`] the consumer
//! side of one bounded channel. The consumer acknowledges through the relay;
//! until then the delivery loop holds the next event back.

use std::pin::Pin;
use std::task::{Context, Poll};

use async_trait::async_trait;
use futures::Stream;
use tokio::sync::mpsc::{self, error::TrySendError};

use super::{Delivery, Subscriber};
use crate::error::DeliveryError;
use crate::model::ChangeEvent;

/// Dispatcher half of a pull subscription.
#[derive(Debug)]
pub struct ChannelSubscriber {
    id: String,
    tx: mpsc::Sender<ChangeEvent>,
}

impl ChannelSubscriber {
    /// Creates both halves; `buffer` is clamped to at least 1.
    pub fn pair(id: impl Into<String>, buffer: usize) -> (Self, Subscription) {
        let id = id.into();
        let (tx, rx) = mpsc::channel(buffer.max(1));
        (
            Self { id: id.clone(), tx },
            Subscription { id, rx },
        )
    }
}

#[async_trait]
impl Subscriber for ChannelSubscriber {
    fn id(&self) -> &str {
        &self.id
    }

    async fn deliver(&self, event: &ChangeEvent) -> Result<Delivery, DeliveryError> {
        match self.tx.try_send(event.clone()) {
            Ok(()) => Ok(Delivery::AwaitingAck),
            Err(TrySendError::Full(_)) => Err(DeliveryError::Busy),
            Err(TrySendError::Closed(_)) => Err(DeliveryError::Disconnected),
        }
    }
}

/// Stream of change events for one subscriber.
///
/// Each event must be acknowledged (`Relay::acknowledge`) before the next one
/// is sent. Unacknowledged events are redelivered after the ack timeout, so a
/// consumer may see an event more than once.
#[derive(Debug)]
pub struct Subscription {
    id: String,
    rx: mpsc::Receiver<ChangeEvent>,
}

impl Subscription {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Waits for the next event; `None` once the subscription was detached.
    pub async fn recv(&mut self) -> Option<ChangeEvent> {
        self.rx.recv().await
    }
}

impl Stream for Subscription {
    type Item = ChangeEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{OrderStatus, RowSnapshot};
    use chrono::Utc;
    use futures::StreamExt;

    fn event(seq: u64) -> ChangeEvent {
        let row = RowSnapshot {
            id: 1,
            customer_name: "Ann".into(),
            product_name: "Lamp".into(),
            status: OrderStatus::Pending,
            updated_at: Utc::now(),
        };
        ChangeEvent::insert("orders", row, Utc::now()).with_sequence(seq)
    }

    #[tokio::test]
    async fn test_delivery_reaches_stream() {
        let (sub, mut stream) = ChannelSubscriber::pair("s", 4);
        assert_eq!(sub.deliver(&event(1)).await, Ok(Delivery::AwaitingAck));
        assert_eq!(stream.next().await.map(|e| e.sequence), Some(1));
        assert_eq!(stream.id(), "s");
    }

    #[tokio::test]
    async fn test_full_and_closed() {
        let (sub, stream) = ChannelSubscriber::pair("s", 1);
        sub.deliver(&event(1)).await.unwrap();
        assert_eq!(sub.deliver(&event(2)).await, Err(DeliveryError::Busy));
        drop(stream);
        assert_eq!(sub.deliver(&event(3)).await, Err(DeliveryError::Disconnected));
    }
}
