//! Net-effect diff and live-event continuity.
//!
//! Both functions compare the relay's last known row images against newer
//! information and produce the synthetic events (origin `Reconciled`) that
//! carry subscribers from one to the other. Missed intermediate states are
//! collapsed: a row that went pending → shipped → delivered while the relay
//! was blind yields one Update pending → delivered.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use chrono::{DateTime, Utc};

use crate::model::{ChangeEvent, Operation, RowSnapshot};

/// Synthetic events turning `cache` into the table state described by
/// `changed` (rows modified since the last query) and `existing` (every id
/// still in the table).
///
/// A cached id in neither was deleted. Output is ordered by the row's
/// `updated_at`, then id.
pub(crate) fn net_effect(
    table: &str,
    cache: &BTreeMap<i64, RowSnapshot>,
    changed: &[RowSnapshot],
    existing: &BTreeSet<i64>,
    observed_at: DateTime<Utc>,
) -> Vec<ChangeEvent> {
    let current: HashMap<i64, &RowSnapshot> = changed.iter().map(|r| (r.id, r)).collect();
    let mut out = Vec::new();

    for row in changed {
        match cache.get(&row.id) {
            None => out.push(ChangeEvent::insert(table, row.clone(), observed_at)),
            Some(cached) if cached != row => out.push(ChangeEvent::update(
                table,
                cached.clone(),
                row.clone(),
                observed_at,
            )),
            Some(_) => {}
        }
    }
    for (id, cached) in cache {
        if !current.contains_key(id) && !existing.contains(id) {
            out.push(ChangeEvent::delete(table, cached.clone(), observed_at));
        }
    }

    out.sort_by_key(|ev| {
        let image = ev.after.as_ref().or(ev.before.as_ref());
        (image.map(|r| r.updated_at), ev.row_id())
    });
    out.into_iter().map(ChangeEvent::reconciled).collect()
}

/// How a live event relates to the last known image of its row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Continuity {
    /// Event follows directly from the known image.
    Apply,
    /// The known image already equals the event's result.
    Duplicate,
    /// The known image is newer than the event's result.
    Stale,
    /// The event's pre-image differs from the known one; emit this synthetic
    /// event first, then the live one.
    Bridge(ChangeEvent),
}

/// Checks `event` against `cached`, the last known image of its row, and
/// `deleted_at`, the last image's `updated_at` if the row is known deleted.
pub(crate) fn continuity(
    cached: Option<&RowSnapshot>,
    deleted_at: Option<DateTime<Utc>>,
    event: &ChangeEvent,
) -> Continuity {
    let table = event.table.as_str();
    let at = event.observed_at;
    let bridge = |ev: ChangeEvent| Continuity::Bridge(ev.reconciled());

    if cached.is_none()
        && let (Some(after), Some(deleted)) = (&event.after, deleted_at)
        && after.updated_at <= deleted
    {
        return Continuity::Stale;
    }

    match (event.operation, &event.before, &event.after, cached) {
        (Operation::Insert, _, Some(_), None) => Continuity::Apply,
        (Operation::Insert, _, Some(after), Some(c)) => {
            if c == after {
                Continuity::Duplicate
            } else if c.updated_at > after.updated_at {
                Continuity::Stale
            } else {
                bridge(ChangeEvent::delete(table, c.clone(), at))
            }
        }
        (Operation::Update, Some(before), Some(after), Some(c)) => {
            if c == after {
                Continuity::Duplicate
            } else if c.updated_at > after.updated_at {
                Continuity::Stale
            } else if c == before {
                Continuity::Apply
            } else {
                bridge(ChangeEvent::update(table, c.clone(), before.clone(), at))
            }
        }
        (Operation::Update, Some(before), Some(_), None) => {
            bridge(ChangeEvent::insert(table, before.clone(), at))
        }
        (Operation::Delete, Some(_), None, None) => Continuity::Duplicate,
        (Operation::Delete, Some(before), None, Some(c)) => {
            if c == before {
                Continuity::Apply
            } else if c.updated_at > before.updated_at {
                Continuity::Stale
            } else {
                bridge(ChangeEvent::update(table, c.clone(), before.clone(), at))
            }
        }
        // Images not matching the operation never get past the normalizer.
        _ => Continuity::Stale,
    }
}

/// One-line summary for logs and the ops log.
pub(crate) fn describe(event: &ChangeEvent) -> String {
    let id = event.row_id().unwrap_or_default();
    match (&event.before, &event.after) {
        (Some(b), Some(a)) => format!("{} id={id} {} -> {}", event.operation, b.status, a.status),
        (None, Some(a)) => format!("{} id={id} -> {}", event.operation, a.status),
        (Some(b), None) => format!("{} id={id} {} ->", event.operation, b.status),
        (None, None) => format!("{} id={id}", event.operation),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{OrderStatus, Origin};

    fn row(id: i64, status: OrderStatus, secs: i64) -> RowSnapshot {
        RowSnapshot {
            id,
            customer_name: "Ann".into(),
            product_name: "Lamp".into(),
            status,
            updated_at: DateTime::from_timestamp(secs, 0).unwrap_or_default(),
        }
    }

    fn cache(rows: &[RowSnapshot]) -> BTreeMap<i64, RowSnapshot> {
        rows.iter().map(|r| (r.id, r.clone())).collect()
    }

    fn ids(ids: &[i64]) -> BTreeSet<i64> {
        ids.iter().copied().collect()
    }

    #[test]
    fn test_collapsed_update() {
        let known = cache(&[row(1, OrderStatus::Pending, 10)]);
        let now = [row(1, OrderStatus::Delivered, 30)];
        let events = net_effect("orders", &known, &now, &ids(&[1]), Utc::now());
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].operation, Operation::Update);
        assert_eq!(events[0].origin, Origin::Reconciled);
        assert_eq!(events[0].before.as_ref().unwrap().status, OrderStatus::Pending);
        assert_eq!(events[0].after.as_ref().unwrap().status, OrderStatus::Delivered);
        assert_eq!(describe(&events[0]), "UPDATE id=1 pending -> delivered");
    }

    #[test]
    fn test_insert_delete_and_order() {
        let known = cache(&[row(1, OrderStatus::Pending, 5), row(2, OrderStatus::Shipped, 6)]);
        let now = [row(3, OrderStatus::Pending, 1)];
        let events = net_effect("orders", &known, &now, &ids(&[2, 3]), Utc::now());
        let ops: Vec<_> = events.iter().map(|e| (e.operation, e.row_id())).collect();
        assert_eq!(
            ops,
            vec![(Operation::Insert, Some(3)), (Operation::Delete, Some(1))]
        );
    }

    #[test]
    fn test_unchanged_rows_produce_nothing() {
        let rows = [row(1, OrderStatus::Pending, 5), row(2, OrderStatus::Shipped, 9)];
        assert!(net_effect("orders", &cache(&rows), &rows, &ids(&[1, 2]), Utc::now()).is_empty());
    }

    #[test]
    fn test_unchanged_rows_outside_the_window_are_kept() {
        let known = cache(&[row(1, OrderStatus::Pending, 5), row(2, OrderStatus::Shipped, 9)]);
        let events = net_effect("orders", &known, &[], &ids(&[1]), Utc::now());
        assert_eq!(events.len(), 1);
        assert_eq!((events[0].operation, events[0].row_id()), (Operation::Delete, Some(2)));
        assert!(net_effect("orders", &known, &[], &ids(&[1, 2]), Utc::now()).is_empty());
    }

    #[test]
    fn test_continuity_rules() {
        let p = row(1, OrderStatus::Pending, 10);
        let s = row(1, OrderStatus::Shipped, 20);
        let d = row(1, OrderStatus::Delivered, 30);
        let at = Utc::now();

        let upd = ChangeEvent::update("orders", s.clone(), d.clone(), at);
        assert_eq!(continuity(Some(&s), None, &upd), Continuity::Apply);
        assert_eq!(continuity(Some(&d), None, &upd), Continuity::Duplicate);
        match continuity(Some(&p), None, &upd) {
            Continuity::Bridge(ev) => {
                assert_eq!(ev.before.as_ref(), Some(&p));
                assert_eq!(ev.after.as_ref(), Some(&s));
                assert_eq!(ev.origin, Origin::Reconciled);
            }
            other => panic!("expected bridge, got {other:?}"),
        }

        let late = ChangeEvent::update("orders", p.clone(), s.clone(), at);
        assert_eq!(continuity(Some(&d), None, &late), Continuity::Stale);

        let ins = ChangeEvent::insert("orders", p.clone(), at);
        assert_eq!(continuity(None, None, &ins), Continuity::Apply);
        assert_eq!(continuity(Some(&p), None, &ins), Continuity::Duplicate);

        let del = ChangeEvent::delete("orders", d.clone(), at);
        assert_eq!(continuity(None, None, &del), Continuity::Duplicate);
        assert_eq!(continuity(Some(&d), None, &del), Continuity::Apply);
        assert!(matches!(continuity(Some(&s), None, &del), Continuity::Bridge(_)));
    }

    #[test]
    fn test_deleted_row_is_not_resurrected() {
        let p = row(1, OrderStatus::Pending, 10);
        let s = row(1, OrderStatus::Shipped, 20);
        let at = Utc::now();
        let deleted = Some(s.updated_at);

        let old_insert = ChangeEvent::insert("orders", p.clone(), at);
        assert_eq!(continuity(None, deleted, &old_insert), Continuity::Stale);
        let old_update = ChangeEvent::update("orders", p.clone(), s.clone(), at);
        assert_eq!(continuity(None, deleted, &old_update), Continuity::Stale);
        assert_eq!(continuity(None, None, &old_insert), Continuity::Apply);
    }
}
