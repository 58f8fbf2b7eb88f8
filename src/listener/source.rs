//! Abstraction over the database notification channel.

use async_trait::async_trait;

use crate::error::ListenerError;

/// A connection to a `LISTEN`-style notification channel.
///
/// The listener calls [`connect`](Self::connect) until it succeeds, then
/// [`recv`](Self::recv) until it fails; a failed `recv` means the connection is
/// gone and everything sent in the meantime may be lost.
#[async_trait]
pub trait NotificationSource: Send + 'static {
    /// Opens a fresh connection and subscribes to the channel.
    async fn connect(&mut self) -> Result<(), ListenerError>;

    /// Waits for the next notification payload.
    ///
    /// Must be cancel-safe: the listener drops a pending `recv` to hand over
    /// loss markers.
    async fn recv(&mut self) -> Result<String, ListenerError>;
}

#[async_trait]
impl<S: NotificationSource + ?Sized> NotificationSource for Box<S> {
    async fn connect(&mut self) -> Result<(), ListenerError> {
        (**self).connect().await
    }

    async fn recv(&mut self) -> Result<String, ListenerError> {
        (**self).recv().await
    }
}
