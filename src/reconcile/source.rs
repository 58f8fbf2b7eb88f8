//! Read access to the source table.

use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::ReconcileError;
use crate::model::RowSnapshot;

/// Result of a reconciliation query, read from one consistent table state.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TableSnapshot {
    /// Current image of every row changed after `since`, by `updated_at`, then id.
    pub rows: Vec<RowSnapshot>,
    /// Id of every row in the table. A cached id missing here was deleted.
    pub ids: BTreeSet<i64>,
}

/// Direct query access to the table whose changes are relayed.
#[async_trait]
pub trait SourceTable: Send + Sync + 'static {
    /// Returns rows with `updated_at > since` (all rows when `since` is `None`)
    /// and the ids of all rows, both from the same table state.
    async fn snapshot(&self, since: Option<DateTime<Utc>>) -> Result<TableSnapshot, ReconcileError>;
}

#[async_trait]
impl<T: SourceTable + ?Sized> SourceTable for Arc<T> {
    async fn snapshot(&self, since: Option<DateTime<Utc>>) -> Result<TableSnapshot, ReconcileError> {
        (**self).snapshot(since).await
    }
}
