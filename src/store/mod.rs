//! Row store contract shared by the hosted store, its HTTP client and the
//! local mirror.
//!
//! Rows cross this seam as untyped JSON objects. Typed rows are produced at
//! the edges (see [`crate::sync`]), where anything that fails to decode is
//! dropped rather than trusted.

mod memory;
mod remote;
pub mod table;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::sync::Mutex;
use tokio::sync::mpsc;

use crate::types::Table;

pub use memory::MemoryStore;
pub use remote::RemoteStore;

/// Result type for row store operations
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors that can occur while talking to a row store
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("request failed: {0}")]
    Transport(String),

    #[error("store responded with {status}: {body}")]
    Status { status: u16, body: String },

    #[error("malformed row: {0}")]
    Decode(String),

    #[error("row for {table} is missing key column {column}")]
    MissingKey { table: Table, column: &'static str },

    #[error("row already exists in {0}")]
    Conflict(Table),

    #[error("unknown table: {0}")]
    UnknownTable(String),

    #[error("invalid filter: {0}")]
    InvalidFilter(String),

    #[error("realtime channel failed: {0}")]
    Realtime(String),

    #[error("local storage failed: {0}")]
    Storage(String),
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Op {
    Eq,
    Neq,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Condition {
    pub column: String,
    pub op: Op,
    pub value: String,
}

impl Condition {
    fn matches(&self, row: &Value) -> bool {
        let cell = row.get(&self.column).and_then(cell_text);
        match self.op {
            Op::Eq => cell.as_deref() == Some(self.value.as_str()),
            Op::Neq => cell.as_deref() != Some(self.value.as_str()),
        }
    }
}

/// Conjunction of column conditions, written `room_id=eq.room3,username=eq.alice`
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Filter {
    conditions: Vec<Condition>,
}

impl Filter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rows of one room
    pub fn room(room_id: &str) -> Self {
        Self::new().eq("room_id", room_id)
    }

    pub fn eq(mut self, column: &str, value: impl ToString) -> Self {
        self.conditions.push(Condition {
            column: column.to_string(),
            op: Op::Eq,
            value: value.to_string(),
        });
        self
    }

    pub fn neq(mut self, column: &str, value: impl ToString) -> Self {
        self.conditions.push(Condition {
            column: column.to_string(),
            op: Op::Neq,
            value: value.to_string(),
        });
        self
    }

    pub fn conditions(&self) -> &[Condition] {
        &self.conditions
    }

    pub fn matches(&self, row: &Value) -> bool {
        self.conditions.iter().all(|c| c.matches(row))
    }

    /// Whether `row` carries every column this filter tests. Partial rows
    /// (changed columns only, or just the key) cannot be judged.
    pub fn covers(&self, row: &Value) -> bool {
        self.conditions.iter().all(|c| row.get(&c.column).is_some())
    }

    /// Parse a single `eq.value` / `neq.value` expression for `column`
    pub fn push_expr(&mut self, column: &str, expr: &str) -> StoreResult<()> {
        let (op, value) = if let Some(v) = expr.strip_prefix("eq.") {
            (Op::Eq, v)
        } else if let Some(v) = expr.strip_prefix("neq.") {
            (Op::Neq, v)
        } else {
            return Err(StoreError::InvalidFilter(format!("{}={}", column, expr)));
        };
        self.conditions.push(Condition {
            column: column.to_string(),
            op,
            value: value.to_string(),
        });
        Ok(())
    }

    /// Parse the text form written by `Display`. Commas and backslashes
    /// inside values arrive escaped with a backslash.
    pub fn parse(text: &str) -> StoreResult<Self> {
        let mut filter = Self::new();
        for part in split_unescaped(text).iter().filter(|p| !p.trim().is_empty()) {
            let (column, expr) = part
                .split_once('=')
                .ok_or_else(|| StoreError::InvalidFilter(part.to_string()))?;
            filter.push_expr(column.trim(), expr)?;
        }
        Ok(filter)
    }

    /// Query parameter form, one pair per condition
    pub fn to_params(&self) -> Vec<(String, String)> {
        self.conditions
            .iter()
            .map(|c| {
                let op = match c.op {
                    Op::Eq => "eq",
                    Op::Neq => "neq",
                };
                (c.column.clone(), format!("{}.{}", op, c.value))
            })
            .collect()
    }
}

fn split_unescaped(text: &str) -> Vec<String> {
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut chars = text.chars();
    while let Some(c) = chars.next() {
        match c {
            '\\' => current.extend(chars.next()),
            ',' => parts.push(std::mem::take(&mut current)),
            _ => current.push(c),
        }
    }
    parts.push(current);
    parts
}

impl fmt::Display for Filter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self
            .to_params()
            .into_iter()
            .map(|(column, expr)| {
                let expr = expr.replace('\\', "\\\\").replace(',', "\\,");
                format!("{}={}", column, expr)
            })
            .collect();
        f.write_str(&parts.join(","))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Order {
    pub column: String,
    pub ascending: bool,
}

impl Order {
    /// Parse `column.asc` / `column.desc` (direction defaults to ascending)
    pub fn parse(text: &str) -> Self {
        match text.rsplit_once('.') {
            Some((column, "desc")) => Self {
                column: column.to_string(),
                ascending: false,
            },
            Some((column, "asc")) => Self {
                column: column.to_string(),
                ascending: true,
            },
            _ => Self {
                column: text.to_string(),
                ascending: true,
            },
        }
    }
}

impl fmt::Display for Order {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let dir = if self.ascending { "asc" } else { "desc" };
        write!(f, "{}.{}", self.column, dir)
    }
}

/// Filtered, optionally ordered and limited read
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Query {
    pub filter: Filter,
    pub order: Option<Order>,
    pub limit: Option<usize>,
}

impl Query {
    pub fn new(filter: Filter) -> Self {
        Self {
            filter,
            order: None,
            limit: None,
        }
    }

    pub fn order_by(mut self, column: &str, ascending: bool) -> Self {
        self.order = Some(Order {
            column: column.to_string(),
            ascending,
        });
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum EventType {
    Insert,
    Update,
    Delete,
}

/// A row change delivered to subscribers
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChangeEvent {
    pub event_type: EventType,
    #[serde(default)]
    pub new: Option<Value>,
    #[serde(default)]
    pub old: Option<Value>,
}

impl ChangeEvent {
    pub fn insert(new: Value) -> Self {
        Self {
            event_type: EventType::Insert,
            new: Some(new),
            old: None,
        }
    }

    pub fn update(old: Value, new: Value) -> Self {
        Self {
            event_type: EventType::Update,
            new: Some(new),
            old: Some(old),
        }
    }

    pub fn delete(old: Value) -> Self {
        Self {
            event_type: EventType::Delete,
            new: None,
            old: Some(old),
        }
    }

    /// The row a subscription filter is evaluated against
    pub fn subject(&self) -> Option<&Value> {
        match self.event_type {
            EventType::Delete => self.old.as_ref(),
            _ => self.new.as_ref(),
        }
    }
}

/// Releases a change channel exactly once, explicitly or on drop
pub struct ChannelGuard {
    release: Mutex<Option<Box<dyn FnOnce() + Send>>>,
}

impl ChannelGuard {
    pub fn new(release: impl FnOnce() + Send + 'static) -> Self {
        Self {
            release: Mutex::new(Some(Box::new(release))),
        }
    }

    pub fn release(&self) {
        let release = match self.release.lock() {
            Ok(mut slot) => slot.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(release) = release {
            release();
        }
    }

    pub fn is_released(&self) -> bool {
        match self.release.lock() {
            Ok(slot) => slot.is_none(),
            Err(poisoned) => poisoned.into_inner().is_none(),
        }
    }
}

impl Drop for ChannelGuard {
    fn drop(&mut self) {
        self.release();
    }
}

/// An open change channel: a stream of events plus the handle that closes it
pub struct Subscription {
    events: mpsc::UnboundedReceiver<ChangeEvent>,
    guard: ChannelGuard,
}

impl Subscription {
    pub fn new(events: mpsc::UnboundedReceiver<ChangeEvent>, guard: ChannelGuard) -> Self {
        Self { events, guard }
    }

    pub async fn next(&mut self) -> Option<ChangeEvent> {
        self.events.recv().await
    }

    pub fn into_parts(self) -> (mpsc::UnboundedReceiver<ChangeEvent>, ChannelGuard) {
        (self.events, self.guard)
    }
}

/// Trait every row store backend implements
#[async_trait]
pub trait RowStore: Send + Sync {
    /// Read the rows of `table` selected by `query`
    async fn select(&self, table: Table, query: &Query) -> StoreResult<Vec<Value>>;

    /// Append a row, filling column defaults
    async fn insert(&self, table: Table, row: Value) -> StoreResult<Value>;

    /// Insert or shallow-merge by the table's natural key (last write wins)
    async fn upsert(&self, table: Table, row: Value) -> StoreResult<Value>;

    /// Merge `patch` into every row matching `filter`, returning the new rows
    async fn update(&self, table: Table, filter: &Filter, patch: Value) -> StoreResult<Vec<Value>>;

    /// Remove every row matching `filter`, returning the removed rows
    async fn delete(&self, table: Table, filter: &Filter) -> StoreResult<Vec<Value>>;

    /// Open a change channel for rows of `table` matching `filter`
    async fn subscribe(&self, table: Table, filter: Filter) -> StoreResult<Subscription>;
}

/// Text form of a cell, as filters compare it
pub fn cell_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_filter_text_form() {
        let filter = Filter::room("room3").eq("username", "alice");
        assert_eq!(filter.to_string(), "room_id=eq.room3,username=eq.alice");
        assert_eq!(Filter::parse(&filter.to_string()).unwrap(), filter);
        assert_eq!(Filter::parse("").unwrap(), Filter::new());

        let odd = Filter::room("room1").eq("username", r"a,b\c");
        assert_eq!(odd.to_string(), r"room_id=eq.room1,username=eq.a\,b\\c");
        assert_eq!(Filter::parse(&odd.to_string()).unwrap(), odd);
        assert!(Filter::parse("room_id=like.room%").is_err());
        assert!(Filter::parse("room_id").is_err());
    }

    #[test]
    fn test_filter_matching() {
        let row = json!({"room_id": "room3", "username": "bob", "id": 7});
        assert!(Filter::room("room3").matches(&row));
        assert!(!Filter::room("room4").matches(&row));
        assert!(Filter::new().eq("id", 7).matches(&row));
        assert!(Filter::room("room3")
            .neq("username", "alice")
            .neq("username", "carol")
            .matches(&row));
        assert!(!Filter::room("room3").neq("username", "bob").matches(&row));
        assert!(Filter::room("room3").covers(&row));
        assert!(!Filter::room("room3").covers(&json!({"id": 7, "score": 2})));
    }

    #[test]
    fn test_order_parse() {
        let order = Order::parse("created_at.desc");
        assert_eq!(order.column, "created_at");
        assert!(!order.ascending);
        assert!(Order::parse("username").ascending);
        assert_eq!(order.to_string(), "created_at.desc");
    }

    #[test]
    fn test_channel_guard_releases_once() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        use std::sync::Arc;

        let count = Arc::new(AtomicUsize::new(0));
        let counter = count.clone();
        let guard = ChannelGuard::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        guard.release();
        guard.release();
        assert!(guard.is_released());
        drop(guard);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
