//! # Event normalizer.
//!
//! Turns a trigger payload into a [`ChangeEvent`]:
//!
//! ```text
//! {"operation": "INSERT", "data": {..row..}}                       → Insert(after)
//! {"operation": "UPDATE", "old_data": {..}, "new_data": {..}}      → Update(before, after)
//! {"operation": "DELETE", "data": {..row..}}                       → Delete(before)
//! ```
//!
//! Every `orders` column is required; extra keys are ignored. `updated_at`
//! accepts RFC 3339 or the zone-less `YYYY-MM-DDTHH:MM:SS[.ffffff]` form that
//! `row_to_json` emits for `timestamp` columns (read as UTC).
//!
//! Normalization is pure: no I/O, no clock (the payload's `received_at` becomes
//! `observed_at`).

use chrono::{DateTime, NaiveDateTime, Utc};
use serde_json::{Map, Value as Json};

use crate::error::MalformedPayloadError;
use crate::model::{ChangeEvent, OrderStatus, RawPayload, RowSnapshot};

/// Parser for one source table's payloads.
#[derive(Debug, Clone)]
pub struct Normalizer {
    table: String,
}

impl Normalizer {
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
        }
    }

    /// Table name stamped on produced events.
    pub fn table(&self) -> &str {
        &self.table
    }

    /// Validates and converts one payload. The sequence is left unassigned.
    pub fn normalize(&self, raw: &RawPayload) -> Result<ChangeEvent, MalformedPayloadError> {
        let doc: Json =
            serde_json::from_str(&raw.text).map_err(|e| MalformedPayloadError::InvalidJson {
                reason: e.to_string(),
            })?;
        let obj = doc
            .as_object()
            .ok_or_else(|| MalformedPayloadError::InvalidJson {
                reason: "payload is not an object".into(),
            })?;

        let operation = obj
            .get("operation")
            .and_then(Json::as_str)
            .unwrap_or_default();
        let at = raw.received_at;

        match operation {
            "INSERT" => {
                let after = row_at(obj, "data")?;
                Ok(ChangeEvent::insert(self.table.as_str(), after, at))
            }
            "UPDATE" => {
                let before = row_at(obj, "old_data")?;
                let after = row_at(obj, "new_data")?;
                if before.id != after.id {
                    return Err(MalformedPayloadError::InvalidValue {
                        field: "new_data.id".into(),
                        reason: format!("primary key changed from {} to {}", before.id, after.id),
                    });
                }
                Ok(ChangeEvent::update(self.table.as_str(), before, after, at))
            }
            "DELETE" => {
                let before = row_at(obj, "data")?;
                Ok(ChangeEvent::delete(self.table.as_str(), before, at))
            }
            other => Err(MalformedPayloadError::UnknownOperation {
                operation: other.to_string(),
            }),
        }
    }
}

fn row_at(obj: &Map<String, Json>, key: &str) -> Result<RowSnapshot, MalformedPayloadError> {
    match obj.get(key) {
        None | Some(Json::Null) => Err(MalformedPayloadError::MissingField { field: key.into() }),
        Some(v) => parse_row(v, key),
    }
}

/// Parses a row image (`row_to_json` output or a payload section).
///
/// `path` prefixes field names in errors, e.g. `new_data.status`.
pub fn parse_row(value: &Json, path: &str) -> Result<RowSnapshot, MalformedPayloadError> {
    let obj = value
        .as_object()
        .ok_or_else(|| MalformedPayloadError::InvalidValue {
            field: path.to_string(),
            reason: "row image is not an object".into(),
        })?;
    let id = coerce_id(field(obj, path, "id")?).ok_or_else(|| MalformedPayloadError::InvalidValue {
        field: dotted(path, "id"),
        reason: "expected an integer".into(),
    })?;
    let customer_name = text(obj, path, "customer_name")?;
    let product_name = text(obj, path, "product_name")?;
    let status_text = text(obj, path, "status")?;
    let status = status_text
        .parse::<OrderStatus>()
        .map_err(|value| MalformedPayloadError::UnknownStatus {
            field: dotted(path, "status"),
            value,
        })?;
    let stamp = text(obj, path, "updated_at")?;
    let updated_at = parse_timestamp(&stamp).ok_or_else(|| MalformedPayloadError::InvalidValue {
        field: dotted(path, "updated_at"),
        reason: format!("unrecognized timestamp {stamp:?}"),
    })?;

    Ok(RowSnapshot {
        id,
        customer_name,
        product_name,
        status,
        updated_at,
    })
}

fn field<'a>(
    obj: &'a Map<String, Json>,
    path: &str,
    name: &str,
) -> Result<&'a Json, MalformedPayloadError> {
    match obj.get(name) {
        None | Some(Json::Null) => Err(MalformedPayloadError::MissingField {
            field: dotted(path, name),
        }),
        Some(v) => Ok(v),
    }
}

fn text(obj: &Map<String, Json>, path: &str, name: &str) -> Result<String, MalformedPayloadError> {
    field(obj, path, name)?
        .as_str()
        .map(str::to_string)
        .ok_or_else(|| MalformedPayloadError::InvalidValue {
            field: dotted(path, name),
            reason: "expected a string".into(),
        })
}

fn coerce_id(v: &Json) -> Option<i64> {
    match v {
        Json::Number(n) => n.as_i64(),
        Json::String(s) => s.parse().ok(),
        _ => None,
    }
}

/// RFC 3339 first, then the zone-less forms read as UTC.
pub(crate) fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(s, fmt).ok())
        .map(|naive| naive.and_utc())
}

fn dotted(path: &str, name: &str) -> String {
    if path.is_empty() {
        name.to_string()
    } else {
        format!("{path}.{name}")
    }
}
