use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, RwLock};

use super::{table, ChangeEvent, ChannelGuard, Filter, Query, RowStore, StoreResult, Subscription};
use crate::types::{RowId, Table};

struct Subscriber {
    table: Table,
    filter: Filter,
    tx: mpsc::UnboundedSender<ChangeEvent>,
}

#[derive(Default)]
struct Inner {
    tables: RwLock<HashMap<Table, Vec<Value>>>,
    next_id: AtomicI64,
    next_channel: AtomicU64,
    subscribers: Mutex<HashMap<u64, Subscriber>>,
}

/// In-process realtime row store.
///
/// This is what the `partyroom` server hosts; tests use it directly.
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of change channels currently open
    pub fn open_channels(&self) -> usize {
        match self.inner.subscribers.lock() {
            Ok(subscribers) => subscribers.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        }
    }

    fn next_id(&self) -> RowId {
        self.inner.next_id.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Fan changes out to every matching channel. Called with the table
    /// lock held so subscribers observe writes in commit order.
    fn publish(&self, table: Table, changes: &[ChangeEvent]) {
        let subscribers = match self.inner.subscribers.lock() {
            Ok(subscribers) => subscribers,
            Err(poisoned) => poisoned.into_inner(),
        };
        for change in changes {
            let Some(subject) = change.subject() else {
                continue;
            };
            for subscriber in subscribers.values() {
                if subscriber.table == table && subscriber.filter.matches(subject) {
                    // a closed receiver is released by its guard shortly
                    let _ = subscriber.tx.send(change.clone());
                }
            }
        }
    }
}

#[async_trait]
impl RowStore for MemoryStore {
    async fn select(&self, table: Table, query: &Query) -> StoreResult<Vec<Value>> {
        let tables = self.inner.tables.read().await;
        Ok(tables
            .get(&table)
            .map(|rows| table::select(rows, query))
            .unwrap_or_default())
    }

    async fn insert(&self, table: Table, row: Value) -> StoreResult<Value> {
        let mut tables = self.inner.tables.write().await;
        let rows = tables.entry(table).or_default();
        let created = table::insert(rows, table, row, &mut || self.next_id(), chrono::Utc::now())?;
        self.publish(table, &[ChangeEvent::insert(created.clone())]);
        Ok(created)
    }

    async fn upsert(&self, table: Table, row: Value) -> StoreResult<Value> {
        let mut tables = self.inner.tables.write().await;
        let rows = tables.entry(table).or_default();
        let change = table::upsert(rows, table, row, &mut || self.next_id(), chrono::Utc::now())?;
        self.publish(table, std::slice::from_ref(&change));
        Ok(change.new.unwrap_or(Value::Null))
    }

    async fn update(&self, table: Table, filter: &Filter, patch: Value) -> StoreResult<Vec<Value>> {
        let mut tables = self.inner.tables.write().await;
        let rows = tables.entry(table).or_default();
        let changes = table::update(rows, filter, patch)?;
        self.publish(table, &changes);
        Ok(changes.into_iter().filter_map(|c| c.new).collect())
    }

    async fn delete(&self, table: Table, filter: &Filter) -> StoreResult<Vec<Value>> {
        let mut tables = self.inner.tables.write().await;
        let rows = tables.entry(table).or_default();
        let changes = table::delete(rows, filter);
        self.publish(table, &changes);
        Ok(changes.into_iter().filter_map(|c| c.old).collect())
    }

    async fn subscribe(&self, table: Table, filter: Filter) -> StoreResult<Subscription> {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.inner.next_channel.fetch_add(1, Ordering::SeqCst);

        tracing::debug!("Opening channel {} on {} ({})", id, table, filter);
        match self.inner.subscribers.lock() {
            Ok(mut subscribers) => subscribers.insert(id, Subscriber { table, filter, tx }),
            Err(poisoned) => poisoned
                .into_inner()
                .insert(id, Subscriber { table, filter, tx }),
        };

        let inner = Arc::downgrade(&self.inner);
        let guard = ChannelGuard::new(move || {
            if let Some(inner) = inner.upgrade() {
                let removed = match inner.subscribers.lock() {
                    Ok(mut subscribers) => subscribers.remove(&id),
                    Err(poisoned) => poisoned.into_inner().remove(&id),
                };
                if removed.is_some() {
                    tracing::debug!("Released channel {}", id);
                }
            }
        });

        Ok(Subscription::new(rx, guard))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::EventType;
    use serde_json::json;

    #[tokio::test]
    async fn test_subscription_receives_filtered_changes() {
        let store = MemoryStore::new();
        let mut sub = store
            .subscribe(Table::Members, Filter::room("room1"))
            .await
            .unwrap();

        store
            .upsert(Table::Members, json!({"room_id": "room2", "username": "x"}))
            .await
            .unwrap();
        store
            .upsert(Table::Members, json!({"room_id": "room1", "username": "alice"}))
            .await
            .unwrap();
        store
            .update(
                Table::Members,
                &Filter::room("room1").eq("username", "alice"),
                json!({"score": 2}),
            )
            .await
            .unwrap();

        let first = sub.next().await.unwrap();
        assert_eq!(first.event_type, EventType::Insert);
        assert_eq!(first.new.unwrap()["username"], "alice");

        let second = sub.next().await.unwrap();
        assert_eq!(second.event_type, EventType::Update);
        assert_eq!(second.new.unwrap()["score"], 2);
        assert_eq!(second.old.unwrap()["score"], 0);
    }

    #[tokio::test]
    async fn test_dropping_subscription_releases_channel() {
        let store = MemoryStore::new();
        let sub = store
            .subscribe(Table::Messages, Filter::room("room1"))
            .await
            .unwrap();
        assert_eq!(store.open_channels(), 1);

        let (_events, guard) = sub.into_parts();
        guard.release();
        assert_eq!(store.open_channels(), 0);
        drop(guard);
        assert_eq!(store.open_channels(), 0);
    }

    #[tokio::test]
    async fn test_delete_event_carries_old_row() {
        let store = MemoryStore::new();
        store
            .upsert(Table::Members, json!({"room_id": "room1", "username": "bob"}))
            .await
            .unwrap();
        let mut sub = store
            .subscribe(Table::Members, Filter::room("room1"))
            .await
            .unwrap();

        let removed = store
            .delete(Table::Members, &Filter::room("room1").eq("username", "bob"))
            .await
            .unwrap();
        assert_eq!(removed.len(), 1);

        let event = sub.next().await.unwrap();
        assert_eq!(event.event_type, EventType::Delete);
        assert_eq!(event.old.unwrap()["username"], "bob");
        assert!(store
            .select(Table::Members, &Query::new(Filter::room("room1")))
            .await
            .unwrap()
            .is_empty());
    }
}
