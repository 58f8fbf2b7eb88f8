//! Reconciliation queries over tokio-postgres.

use std::collections::BTreeSet;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use tokio::sync::Mutex;
use tokio_postgres::{Client, IsolationLevel, NoTls};

use super::{SourceTable, TableSnapshot};
use crate::config::is_identifier;
use crate::error::ReconcileError;
use crate::normalizer::parse_row;

/// Source table read through a lazily (re)opened PostgreSQL connection.
///
/// Rows are fetched as `row_to_json` text and parsed with the same rules as
/// notification payloads, so both paths agree on the row contract. The changed
/// rows and the id list are read in one read-only `REPEATABLE READ` transaction.
pub struct PgSourceTable {
    url: String,
    rows_sql: String,
    ids_sql: String,
    client: Mutex<Option<Client>>,
}

impl PgSourceTable {
    pub fn new(url: impl Into<String>, table: &str) -> Result<Self, ReconcileError> {
        if !is_identifier(table) {
            return Err(ReconcileError::InvalidTable {
                name: table.to_string(),
            });
        }
        let rows_sql = format!(
            "SELECT row_to_json(t)::text FROM \"{table}\" t \
             WHERE $1::text IS NULL OR t.updated_at > $1::text::timestamptz \
             ORDER BY t.updated_at, t.id"
        );
        let ids_sql = format!("SELECT t.id::bigint FROM \"{table}\" t");
        Ok(Self {
            url: url.into(),
            rows_sql,
            ids_sql,
            client: Mutex::new(None),
        })
    }

    async fn connect(&self) -> Result<Client, ReconcileError> {
        let (client, connection) = tokio_postgres::connect(&self.url, NoTls)
            .await
            .map_err(|e| ReconcileError::Connect {
                reason: e.to_string(),
            })?;
        tokio::spawn(async move {
            if let Err(e) = connection.await {
                tracing::debug!(error = %e, "reconciliation connection closed");
            }
        });
        client
            .batch_execute("SET TIME ZONE 'UTC'")
            .await
            .map_err(|e| ReconcileError::Connect {
                reason: e.to_string(),
            })?;
        Ok(client)
    }
}

#[async_trait]
impl SourceTable for PgSourceTable {
    async fn snapshot(&self, since: Option<DateTime<Utc>>) -> Result<TableSnapshot, ReconcileError> {
        let mut guard = self.client.lock().await;
        let mut client = match guard.take() {
            Some(c) if !c.is_closed() => c,
            _ => self.connect().await?,
        };

        let since = since.map(|t| t.to_rfc3339_opts(SecondsFormat::Micros, true));
        let query_err = |e: tokio_postgres::Error| ReconcileError::Query {
            reason: e.to_string(),
        };
        let (rows, id_rows) = {
            let txn = client
                .build_transaction()
                .isolation_level(IsolationLevel::RepeatableRead)
                .read_only(true)
                .start()
                .await
                .map_err(query_err)?;
            let rows = txn.query(&self.rows_sql, &[&since]).await.map_err(query_err)?;
            let id_rows = txn.query(&self.ids_sql, &[]).await.map_err(query_err)?;
            txn.commit().await.map_err(query_err)?;
            (rows, id_rows)
        };
        *guard = Some(client);

        let mut ids = BTreeSet::new();
        for row in id_rows {
            ids.insert(row.try_get::<_, i64>(0).map_err(query_err)?);
        }
        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let text: String = row.try_get(0).map_err(|e| ReconcileError::Query {
                reason: e.to_string(),
            })?;
            let json: serde_json::Value =
                serde_json::from_str(&text).map_err(|e| ReconcileError::Query {
                    reason: e.to_string(),
                })?;
            out.push(parse_row(&json, "").map_err(|source| ReconcileError::InvalidRow { source })?);
        }
        Ok(TableSnapshot { rows: out, ids })
    }
}
