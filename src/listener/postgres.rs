//! `LISTEN` over tokio-postgres.

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_postgres::{AsyncMessage, Client, NoTls};

use super::NotificationSource;
use crate::error::ListenerError;

/// Notification source backed by a dedicated PostgreSQL connection.
///
/// The connection driver runs in its own task and forwards notification
/// payloads; a driver error or EOF surfaces as `ConnectionLost` from `recv`.
pub struct PgNotificationSource {
    url: String,
    channel: String,
    conn: Option<PgConn>,
}

struct PgConn {
    client: Client,
    rx: mpsc::UnboundedReceiver<Result<String, String>>,
    driver: JoinHandle<()>,
}

impl Drop for PgConn {
    fn drop(&mut self) {
        self.driver.abort();
    }
}

impl PgNotificationSource {
    /// `channel` must be a plain identifier (checked by `RelayConfig::validate`).
    pub fn new(url: impl Into<String>, channel: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            channel: channel.into(),
            conn: None,
        }
    }
}

#[async_trait]
impl NotificationSource for PgNotificationSource {
    async fn connect(&mut self) -> Result<(), ListenerError> {
        self.conn = None;
        let (client, mut connection) = tokio_postgres::connect(&self.url, NoTls)
            .await
            .map_err(|e| ListenerError::ConnectFailed {
                reason: e.to_string(),
            })?;

        let (tx, rx) = mpsc::unbounded_channel();
        let driver = tokio::spawn(async move {
            loop {
                let msg = futures::future::poll_fn(|cx| connection.poll_message(cx)).await;
                let forwarded = match msg {
                    Some(Ok(AsyncMessage::Notification(n))) => tx.send(Ok(n.payload().to_string())),
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => {
                        let _ = tx.send(Err(e.to_string()));
                        break;
                    }
                    None => {
                        let _ = tx.send(Err("connection closed".to_string()));
                        break;
                    }
                };
                if forwarded.is_err() {
                    break;
                }
            }
        });

        let conn = PgConn {
            client,
            rx,
            driver,
        };
        conn.client
            .batch_execute(&format!("LISTEN \"{}\"", self.channel))
            .await
            .map_err(|e| ListenerError::ConnectFailed {
                reason: e.to_string(),
            })?;
        self.conn = Some(conn);
        Ok(())
    }

    async fn recv(&mut self) -> Result<String, ListenerError> {
        let Some(conn) = self.conn.as_mut() else {
            return Err(ListenerError::ConnectionLost {
                reason: "not connected".into(),
            });
        };
        let reason = match conn.rx.recv().await {
            Some(Ok(payload)) => return Ok(payload),
            Some(Err(reason)) => reason,
            None => "connection driver stopped".to_string(),
        };
        self.conn = None;
        Err(ListenerError::ConnectionLost { reason })
    }
}
