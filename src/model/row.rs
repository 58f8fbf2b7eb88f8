//! Typed image of one `orders` row.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle state of an order. Any other value makes a payload malformed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderStatus {
    /// Order accepted, not yet shipped.
    Pending,
    /// Order handed to the carrier.
    Shipped,
    /// Order received by the customer.
    Delivered,
}

impl OrderStatus {
    /// Returns the database spelling of the status.
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Pending => "pending",
            OrderStatus::Shipped => "shipped",
            OrderStatus::Delivered => "delivered",
        }
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OrderStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(OrderStatus::Pending),
            "shipped" => Ok(OrderStatus::Shipped),
            "delivered" => Ok(OrderStatus::Delivered),
            other => Err(other.to_string()),
        }
    }
}

/// A single typed column value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    /// Integer column (`id`).
    Int(i64),
    /// Text column (`customer_name`, `product_name`).
    Text(String),
    /// Enumerated `status` column.
    Status(OrderStatus),
    /// Timestamp column (`updated_at`), normalized to UTC.
    Timestamp(DateTime<Utc>),
}

/// Snapshot of an `orders` row at one point in time.
///
/// Field order matches the table's column order; [`RowSnapshot::columns`]
/// exposes the same data as an ordered `column → value` mapping.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RowSnapshot {
    pub id: i64,
    pub customer_name: String,
    pub product_name: String,
    pub status: OrderStatus,
    pub updated_at: DateTime<Utc>,
}

impl RowSnapshot {
    /// Column names in table order. All of them are required in a payload.
    pub const COLUMNS: [&'static str; 5] =
        ["id", "customer_name", "product_name", "status", "updated_at"];

    /// Returns the row as an ordered list of `(column, value)` pairs.
    pub fn columns(&self) -> Vec<(&'static str, Value)> {
        vec![
            ("id", Value::Int(self.id)),
            ("customer_name", Value::Text(self.customer_name.clone())),
            ("product_name", Value::Text(self.product_name.clone())),
            ("status", Value::Status(self.status)),
            ("updated_at", Value::Timestamp(self.updated_at)),
        ]
    }

    /// Looks up a single column by name.
    pub fn get(&self, column: &str) -> Option<Value> {
        self.columns()
            .into_iter()
            .find(|(name, _)| *name == column)
            .map(|(_, v)| v)
    }
}
