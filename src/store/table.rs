//! Table semantics shared by every backend: natural keys, serial ids,
//! column defaults, and the insert/upsert/update/delete/select operations
//! over a plain vector of JSON rows.

use chrono::{DateTime, Utc};
use serde_json::{json, Map, Value};
use std::cmp::Ordering;

use super::{cell_text, ChangeEvent, Filter, Query, StoreError, StoreResult};
use crate::types::{RowId, Table};

/// Columns that identify a row for upserts
pub fn key_columns(table: Table) -> &'static [&'static str] {
    match table {
        Table::Members => &["room_id", "username"],
        Table::Messages => &["id"],
        Table::Timers | Table::RolesState | Table::TopicState => &["room_id"],
    }
}

/// Tables whose rows carry a store-assigned numeric `id`
pub fn has_serial_id(table: Table) -> bool {
    matches!(table, Table::Members | Table::Messages)
}

/// Column defaults applied when a row is first created
pub fn defaults(table: Table, now: DateTime<Utc>) -> Map<String, Value> {
    let now = json!(now);
    let value = match table {
        Table::Members => json!({"score": 0, "role": "未定", "updated_at": now}),
        Table::Messages => json!({"created_at": now}),
        Table::Timers => json!({
            "label": "Timer",
            "running": false,
            "ends_at": null,
            "remaining_ms": 0,
        }),
        Table::RolesState => json!({"revealed": false}),
        Table::TopicState => json!({"level": "normal", "word": null}),
    };
    match value {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}

fn into_object(row: Value) -> StoreResult<Map<String, Value>> {
    match row {
        Value::Object(map) => Ok(map),
        other => Err(StoreError::Decode(format!("expected an object, got {}", other))),
    }
}

fn same_key(table: Table, a: &Value, b: &Map<String, Value>) -> bool {
    key_columns(table).iter().all(|column| {
        let left = a.get(*column).and_then(cell_text);
        let right = b.get(*column).and_then(cell_text);
        left.is_some() && left == right
    })
}

fn require_keys(table: Table, row: &Map<String, Value>) -> StoreResult<()> {
    for &column in key_columns(table) {
        if row.get(column).and_then(cell_text).is_none() {
            return Err(StoreError::MissingKey { table, column });
        }
    }
    Ok(())
}

fn overlay(target: &mut Value, patch: &Map<String, Value>) {
    if let Value::Object(map) = target {
        for (column, value) in patch {
            map.insert(column.clone(), value.clone());
        }
    }
}

/// Append a new row. Fails if a row with the same natural key exists.
pub fn insert(
    rows: &mut Vec<Value>,
    table: Table,
    row: Value,
    next_id: &mut dyn FnMut() -> RowId,
    now: DateTime<Utc>,
) -> StoreResult<Value> {
    let mut fields = into_object(row)?;
    if has_serial_id(table) && !fields.contains_key("id") {
        fields.insert("id".to_string(), json!(next_id()));
    }
    require_keys(table, &fields)?;
    if rows.iter().any(|existing| same_key(table, existing, &fields)) {
        return Err(StoreError::Conflict(table));
    }

    let mut full = Value::Object(defaults(table, now));
    overlay(&mut full, &fields);
    rows.push(full.clone());
    Ok(full)
}

/// Insert, or shallow-merge into the row with the same natural key
pub fn upsert(
    rows: &mut Vec<Value>,
    table: Table,
    row: Value,
    next_id: &mut dyn FnMut() -> RowId,
    now: DateTime<Utc>,
) -> StoreResult<ChangeEvent> {
    let fields = into_object(row)?;
    let keyed_by_serial = matches!(key_columns(table), ["id"]);
    if keyed_by_serial && !fields.contains_key("id") {
        return insert(rows, table, Value::Object(fields), next_id, now).map(ChangeEvent::insert);
    }
    require_keys(table, &fields)?;

    if let Some(existing) = rows.iter_mut().find(|r| same_key(table, r, &fields)) {
        let old = existing.clone();
        let mut patch = fields;
        // the serial id of an existing row never changes
        patch.remove("id");
        overlay(existing, &patch);
        return Ok(ChangeEvent::update(old, existing.clone()));
    }

    insert(rows, table, Value::Object(fields), next_id, now).map(ChangeEvent::insert)
}

/// Merge `patch` into every row matching `filter`
pub fn update(rows: &mut [Value], filter: &Filter, patch: Value) -> StoreResult<Vec<ChangeEvent>> {
    let mut patch = into_object(patch)?;
    patch.remove("id");
    let mut changes = Vec::new();
    for row in rows.iter_mut().filter(|r| filter.matches(r)) {
        let old = row.clone();
        overlay(row, &patch);
        changes.push(ChangeEvent::update(old, row.clone()));
    }
    Ok(changes)
}

/// Remove every row matching `filter`
pub fn delete(rows: &mut Vec<Value>, filter: &Filter) -> Vec<ChangeEvent> {
    let mut removed = Vec::new();
    rows.retain(|row| {
        if filter.matches(row) {
            removed.push(ChangeEvent::delete(row.clone()));
            false
        } else {
            true
        }
    });
    removed
}

/// Filter, order and limit
pub fn select(rows: &[Value], query: &Query) -> Vec<Value> {
    let mut selected: Vec<Value> = rows
        .iter()
        .filter(|row| query.filter.matches(row))
        .cloned()
        .collect();
    if let Some(order) = &query.order {
        selected.sort_by(|a, b| {
            let ord = compare_cells(a.get(&order.column), b.get(&order.column));
            if order.ascending {
                ord
            } else {
                ord.reverse()
            }
        });
    }
    if let Some(limit) = query.limit {
        selected.truncate(limit);
    }
    selected
}

/// Order cells: numbers numerically, timestamps as instants, other text
/// lexically, missing values first
pub fn compare_cells(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    match (a, b) {
        (Some(Value::Number(x)), Some(Value::Number(y))) => {
            let x = x.as_f64().unwrap_or(0.0);
            let y = y.as_f64().unwrap_or(0.0);
            x.partial_cmp(&y).unwrap_or(Ordering::Equal)
        }
        (Some(Value::String(x)), Some(Value::String(y))) => {
            match (
                DateTime::parse_from_rfc3339(x),
                DateTime::parse_from_rfc3339(y),
            ) {
                (Ok(x), Ok(y)) => x.cmp(&y),
                _ => x.cmp(y),
            }
        }
        (None | Some(Value::Null), None | Some(Value::Null)) => Ordering::Equal,
        (None | Some(Value::Null), _) => Ordering::Less,
        (_, None | Some(Value::Null)) => Ordering::Greater,
        (Some(x), Some(y)) => x.to_string().cmp(&y.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::EventType;

    fn counter() -> impl FnMut() -> RowId {
        let mut id = 0;
        move || {
            id += 1;
            id
        }
    }

    #[test]
    fn test_member_upsert_keeps_score_and_id() {
        let mut rows = Vec::new();
        let mut next_id = counter();
        let now = Utc::now();

        let first = upsert(
            &mut rows,
            Table::Members,
            json!({"room_id": "room1", "username": "alice"}),
            &mut next_id,
            now,
        )
        .unwrap();
        assert_eq!(first.event_type, EventType::Insert);
        let created = first.new.unwrap();
        assert_eq!(created["score"], 0);
        assert_eq!(created["role"], "未定");
        assert_eq!(created["id"], 1);

        update(
            &mut rows,
            &Filter::room("room1").eq("username", "alice"),
            json!({"score": 4}),
        )
        .unwrap();

        let second = upsert(
            &mut rows,
            Table::Members,
            json!({"room_id": "room1", "username": "alice", "updated_at": now}),
            &mut next_id,
            now,
        )
        .unwrap();
        assert_eq!(second.event_type, EventType::Update);
        let merged = second.new.unwrap();
        assert_eq!(merged["score"], 4);
        assert_eq!(merged["id"], 1);
        assert_eq!(rows.len(), 1);
    }

    #[test]
    fn test_upsert_requires_natural_key() {
        let mut rows = Vec::new();
        let result = upsert(
            &mut rows,
            Table::Timers,
            json!({"running": true}),
            &mut counter(),
            Utc::now(),
        );
        assert!(matches!(
            result,
            Err(StoreError::MissingKey {
                column: "room_id",
                ..
            })
        ));
        assert!(upsert(&mut rows, Table::Timers, json!(3), &mut counter(), Utc::now()).is_err());
    }

    #[test]
    fn test_message_insert_assigns_ids() {
        let mut rows = Vec::new();
        let mut next_id = counter();
        let now = Utc::now();
        for body in ["a", "b"] {
            upsert(
                &mut rows,
                Table::Messages,
                json!({"room_id": "room1", "username": "alice", "body": body}),
                &mut next_id,
                now,
            )
            .unwrap();
        }
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[1]["id"], 2);
        assert!(rows[0]["created_at"].is_string());

        let dup = insert(&mut rows, Table::Messages, json!({"id": 1}), &mut next_id, now);
        assert!(matches!(dup, Err(StoreError::Conflict(Table::Messages))));
    }

    #[test]
    fn test_select_orders_timestamps_as_instants() {
        let rows = vec![
            json!({"room_id": "r", "created_at": "2024-01-01T00:00:01Z"}),
            json!({"room_id": "r", "created_at": "2024-01-01T00:00:00.500Z"}),
            json!({"room_id": "x", "created_at": "2024-01-01T00:00:00Z"}),
        ];
        let query = Query::new(Filter::room("r")).order_by("created_at", true);
        let selected = select(&rows, &query);
        assert_eq!(selected.len(), 2);
        assert_eq!(selected[0]["created_at"], "2024-01-01T00:00:00.500Z");

        let newest = select(&rows, &Query::new(Filter::room("r")).order_by("created_at", false).limit(1));
        assert_eq!(newest[0]["created_at"], "2024-01-01T00:00:01Z");
    }

    #[test]
    fn test_delete_returns_removed_rows() {
        let mut rows = vec![
            json!({"room_id": "r", "username": "a"}),
            json!({"room_id": "r", "username": "b"}),
        ];
        let removed = delete(&mut rows, &Filter::room("r").eq("username", "a"));
        assert_eq!(removed.len(), 1);
        assert_eq!(removed[0].event_type, EventType::Delete);
        assert_eq!(rows.len(), 1);
    }
}
