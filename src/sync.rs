//! One synchronized collection per panel: initial load, filtered change
//! channel, freshness poll, and the local-mirror equivalent of all three.

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::ops::Deref;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::mirror::LocalMirror;
use crate::store::{cell_text, ChangeEvent, ChannelGuard, EventType, Filter, Query, RowStore, StoreResult};
use crate::types::{Member, Message, RolesState, Table, TimerState, TopicState, MESSAGE_RETENTION};

/// A typed row of one table
pub trait SyncRow: Clone + Serialize + DeserializeOwned + Send + Sync + 'static {
    const TABLE: Table;

    /// Column identifying a row within a collection
    const KEY: &'static str;

    fn key(&self) -> String;

    /// Put rows into display order, dropping any beyond retention
    fn arrange(_rows: &mut Vec<Self>) {}
}

impl SyncRow for Member {
    const TABLE: Table = Table::Members;
    const KEY: &'static str = "id";

    fn key(&self) -> String {
        self.id.to_string()
    }

    fn arrange(rows: &mut Vec<Self>) {
        rows.sort_by(|a, b| a.username.cmp(&b.username));
    }
}

impl SyncRow for Message {
    const TABLE: Table = Table::Messages;
    const KEY: &'static str = "id";

    fn key(&self) -> String {
        self.id.to_string()
    }

    fn arrange(rows: &mut Vec<Self>) {
        rows.sort_by_key(|m| m.created_at);
        if rows.len() > MESSAGE_RETENTION {
            rows.drain(..rows.len() - MESSAGE_RETENTION);
        }
    }
}

impl SyncRow for TimerState {
    const TABLE: Table = Table::Timers;
    const KEY: &'static str = "room_id";

    fn key(&self) -> String {
        self.room_id.clone()
    }
}

impl SyncRow for RolesState {
    const TABLE: Table = Table::RolesState;
    const KEY: &'static str = "room_id";

    fn key(&self) -> String {
        self.room_id.clone()
    }
}

impl SyncRow for TopicState {
    const TABLE: Table = Table::TopicState;
    const KEY: &'static str = "room_id";

    fn key(&self) -> String {
        self.room_id.clone()
    }
}

/// Decode raw rows, dropping any that do not validate, then arrange
pub fn decode_rows<R: SyncRow>(raw: Vec<Value>) -> Vec<R> {
    let mut rows: Vec<R> = raw
        .into_iter()
        .filter_map(|value| match serde_json::from_value(value) {
            Ok(row) => Some(row),
            Err(e) => {
                tracing::debug!("Dropping malformed {} row: {}", R::TABLE, e);
                None
            }
        })
        .collect();
    R::arrange(&mut rows);
    rows
}

fn value_key<R: SyncRow>(value: &Value) -> Option<String> {
    value.get(R::KEY).and_then(cell_text)
}

/// Merge one change into `rows`. Returns whether anything changed.
///
/// Unseen keys are appended, known keys are shallow-merged with the changed
/// columns, deletes remove by key. Rows that do not decode are ignored.
pub fn apply_change<R: SyncRow>(rows: &mut Vec<R>, event: &ChangeEvent) -> bool {
    let changed = match event.event_type {
        EventType::Delete => {
            let Some(key) = event.old.as_ref().and_then(value_key::<R>) else {
                return false;
            };
            let before = rows.len();
            rows.retain(|row| row.key() != key);
            rows.len() != before
        }
        EventType::Insert | EventType::Update => {
            let Some(new) = event.new.as_ref() else {
                return false;
            };
            let Some(key) = value_key::<R>(new) else {
                return false;
            };
            match rows.iter().position(|row| row.key() == key) {
                Some(index) => match merge_row(&rows[index], new) {
                    Some(merged) => {
                        rows[index] = merged;
                        true
                    }
                    None => false,
                },
                None => match serde_json::from_value::<R>(new.clone()) {
                    Ok(row) => {
                        rows.push(row);
                        true
                    }
                    Err(e) => {
                        tracing::debug!("Ignoring malformed {} change: {}", R::TABLE, e);
                        false
                    }
                },
            }
        }
    };
    if changed {
        R::arrange(rows);
    }
    changed
}

fn merge_row<R: SyncRow>(existing: &R, patch: &Value) -> Option<R> {
    let mut merged = serde_json::to_value(existing).ok()?;
    if let (Value::Object(target), Value::Object(columns)) = (&mut merged, patch) {
        for (column, value) in columns {
            target.insert(column.clone(), value.clone());
        }
    }
    serde_json::from_value(merged).ok()
}

/// Where a room's rows live: the hosted store, or this device's mirror
#[derive(Clone)]
pub enum Backend {
    Remote(Arc<dyn RowStore>),
    Local(LocalMirror),
}

impl Backend {
    pub fn is_remote(&self) -> bool {
        matches!(self, Backend::Remote(_))
    }

    pub async fn select(&self, table: Table, query: &Query) -> StoreResult<Vec<Value>> {
        match self {
            Backend::Remote(store) => store.select(table, query).await,
            Backend::Local(mirror) => Ok(mirror.select_now(table, query)),
        }
    }

    pub async fn insert(&self, table: Table, row: Value) -> StoreResult<Value> {
        match self {
            Backend::Remote(store) => store.insert(table, row).await,
            Backend::Local(mirror) => mirror.insert_now(table, row),
        }
    }

    pub async fn upsert(&self, table: Table, row: Value) -> StoreResult<Value> {
        match self {
            Backend::Remote(store) => store.upsert(table, row).await,
            Backend::Local(mirror) => mirror.upsert_now(table, row),
        }
    }

    pub async fn update(&self, table: Table, filter: &Filter, patch: Value) -> StoreResult<Vec<Value>> {
        match self {
            Backend::Remote(store) => store.update(table, filter, patch).await,
            Backend::Local(mirror) => mirror.update_now(table, filter, patch),
        }
    }

    pub async fn delete(&self, table: Table, filter: &Filter) -> StoreResult<Vec<Value>> {
        match self {
            Backend::Remote(store) => store.delete(table, filter).await,
            Backend::Local(mirror) => mirror.delete_now(table, filter),
        }
    }
}

struct Shared<R> {
    backend: Backend,
    query: Query,
    view: watch::Sender<Vec<R>>,
}

/// Cloneable access to a collection's view and write helpers
pub struct CollectionHandle<R> {
    shared: Arc<Shared<R>>,
}

impl<R> Clone for CollectionHandle<R> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<R: SyncRow> CollectionHandle<R> {
    fn new(backend: Backend, query: Query) -> Self {
        let (view, _) = watch::channel(Vec::new());
        Self {
            shared: Arc::new(Shared { backend, query, view }),
        }
    }

    /// Current view
    pub fn rows(&self) -> Vec<R> {
        self.shared.view.borrow().clone()
    }

    pub fn watch(&self) -> watch::Receiver<Vec<R>> {
        self.shared.view.subscribe()
    }

    /// Replace the view with a fresh load
    pub async fn refresh(&self) -> StoreResult<()> {
        let raw = self.shared.backend.select(R::TABLE, &self.shared.query).await?;
        let rows = decode_rows::<R>(raw);
        self.shared.view.send_replace(rows);
        Ok(())
    }

    /// Merge changes into the view.
    ///
    /// Full rows are checked against the collection filter; an update that
    /// moves a known row outside it removes the row. Partial rows carrying
    /// only the key and changed columns go straight to the key lookup.
    pub fn absorb(&self, events: &[ChangeEvent]) {
        let filter = &self.shared.query.filter;
        self.shared.view.send_if_modified(|rows| {
            let mut modified = false;
            for event in events {
                let Some(subject) = event.subject() else {
                    continue;
                };
                if !filter.covers(subject) || filter.matches(subject) {
                    modified |= apply_change(rows, event);
                } else if event.event_type == EventType::Update {
                    modified |= apply_change(rows, &ChangeEvent::delete(subject.clone()));
                }
            }
            modified
        });
    }

    pub async fn insert(&self, row: Value) -> StoreResult<()> {
        let saved = self.shared.backend.insert(R::TABLE, row).await?;
        self.absorb(&[ChangeEvent::insert(saved)]);
        Ok(())
    }

    pub async fn upsert(&self, row: Value) -> StoreResult<()> {
        let saved = self.shared.backend.upsert(R::TABLE, row).await?;
        self.absorb(&[ChangeEvent {
            event_type: EventType::Update,
            new: Some(saved),
            old: None,
        }]);
        Ok(())
    }

    pub async fn update_where(&self, filter: &Filter, patch: Value) -> StoreResult<()> {
        let saved = self.shared.backend.update(R::TABLE, filter, patch).await?;
        let events: Vec<ChangeEvent> = saved
            .into_iter()
            .map(|new| ChangeEvent {
                event_type: EventType::Update,
                new: Some(new),
                old: None,
            })
            .collect();
        self.absorb(&events);
        Ok(())
    }

    pub async fn delete_where(&self, filter: &Filter) -> StoreResult<()> {
        let removed = self.shared.backend.delete(R::TABLE, filter).await?;
        let events: Vec<ChangeEvent> = removed.into_iter().map(ChangeEvent::delete).collect();
        self.absorb(&events);
        Ok(())
    }
}

/// A live collection. Dropping it stops its tasks and releases its channel.
pub struct SyncedCollection<R> {
    handle: CollectionHandle<R>,
    channel: Option<ChannelGuard>,
    tasks: Vec<JoinHandle<()>>,
}

impl<R: SyncRow> SyncedCollection<R> {
    /// Load and start following `query` on `backend`.
    ///
    /// Failures to load or subscribe are logged; the poll (remote) or the
    /// next storage event (local) fills the view in later.
    pub async fn open(backend: Backend, query: Query, poll_interval: Duration) -> Self {
        let handle = CollectionHandle::<R>::new(backend.clone(), query.clone());
        let mut channel = None;
        let mut tasks = Vec::new();

        match backend {
            Backend::Remote(store) => {
                // subscribe before loading so changes in between are not missed
                let subscription = match store.subscribe(R::TABLE, query.filter.clone()).await {
                    Ok(subscription) => Some(subscription.into_parts()),
                    Err(e) => {
                        tracing::warn!("Could not subscribe to {}: {}", R::TABLE, e);
                        None
                    }
                };
                if let Err(e) = handle.refresh().await {
                    tracing::warn!("Initial load of {} failed: {}", R::TABLE, e);
                }

                if let Some((mut events, guard)) = subscription {
                    channel = Some(guard);
                    let follower = handle.clone();
                    tasks.push(tokio::spawn(async move {
                        while let Some(event) = events.recv().await {
                            follower.absorb(std::slice::from_ref(&event));
                        }
                        tracing::debug!("Change channel for {} closed", R::TABLE);
                    }));
                }

                // backstop for changes the channel missed
                let poller = handle.clone();
                tasks.push(tokio::spawn(async move {
                    let mut ticker = tokio::time::interval(poll_interval);
                    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                    ticker.tick().await;
                    loop {
                        ticker.tick().await;
                        if let Err(e) = poller.refresh().await {
                            tracing::debug!("Poll of {} failed: {}", R::TABLE, e);
                        }
                    }
                }));
            }
            Backend::Local(mirror) => {
                let mut events = mirror.events();
                let slot = mirror.slot_key(R::TABLE);
                if let Err(e) = handle.refresh().await {
                    tracing::warn!("Initial load of {} failed: {}", R::TABLE, e);
                }

                // another tab wrote this slot, or we lagged and must reload everything
                let listener = handle.clone();
                tasks.push(tokio::spawn(async move {
                    while let Some(event) = events.recv().await {
                        if event.key.as_deref().map_or(true, |key| key == slot) {
                            if let Err(e) = listener.refresh().await {
                                tracing::debug!("Reload of {} failed: {}", slot, e);
                            }
                        }
                    }
                }));
            }
        }

        Self {
            handle,
            channel,
            tasks,
        }
    }

    pub fn handle(&self) -> CollectionHandle<R> {
        self.handle.clone()
    }
}

impl<R> SyncedCollection<R> {
    /// Stop following. Safe to call more than once.
    pub fn close(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
        if let Some(channel) = self.channel.take() {
            channel.release();
        }
    }
}

impl<R> Deref for SyncedCollection<R> {
    type Target = CollectionHandle<R>;

    fn deref(&self) -> &Self::Target {
        &self.handle
    }
}

impl<R> Drop for SyncedCollection<R> {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mirror::DeviceStorage;
    use crate::store::MemoryStore;
    use chrono::Utc;
    use serde_json::json;

    fn message(id: i64, secs: i64) -> Value {
        json!({
            "id": id,
            "room_id": "room1",
            "username": "alice",
            "body": format!("m{}", id),
            "created_at": chrono::DateTime::<Utc>::from_timestamp(secs, 0).unwrap(),
        })
    }

    #[test]
    fn test_changes_converge_with_reload() {
        let mut store_rows: Vec<Value> = Vec::new();
        let mut view: Vec<Member> = Vec::new();
        let now = Utc::now();

        let mut next = 0;
        let mut next_id = || {
            next += 1;
            next
        };
        let mut events = Vec::new();
        for name in ["bob", "alice", "carol"] {
            events.push(
                crate::store::table::upsert(
                    &mut store_rows,
                    Table::Members,
                    json!({"room_id": "room1", "username": name, "updated_at": now}),
                    &mut next_id,
                    now,
                )
                .unwrap(),
            );
        }
        events.extend(
            crate::store::table::update(
                &mut store_rows,
                &Filter::room("room1").eq("username", "bob"),
                json!({"score": 3}),
            )
            .unwrap(),
        );
        events.extend(crate::store::table::delete(
            &mut store_rows,
            &Filter::room("room1").eq("username", "carol"),
        ));

        for event in &events {
            apply_change(&mut view, event);
        }
        let reloaded: Vec<Member> = decode_rows(store_rows);
        assert_eq!(view, reloaded);
        assert_eq!(view[1].username, "bob");
        assert_eq!(view[1].score, 3);
    }

    #[test]
    fn test_partial_update_merges_known_row() {
        let mut view: Vec<Member> = decode_rows(vec![json!({
            "id": 1, "room_id": "room1", "username": "alice",
            "score": 2, "role": "未定", "updated_at": "2024-01-01T00:00:00Z"
        })]);
        let changed = apply_change(
            &mut view,
            &ChangeEvent {
                event_type: EventType::Update,
                new: Some(json!({"id": 1, "role": "マスター"})),
                old: None,
            },
        );
        assert!(changed);
        assert_eq!(view[0].role, crate::types::Role::Master);
        assert_eq!(view[0].score, 2);

        // a partial row with an unseen key cannot be decoded and is ignored
        let ignored = apply_change(
            &mut view,
            &ChangeEvent::insert(json!({"id": 9, "role": "庶民"})),
        );
        assert!(!ignored);
        assert_eq!(view.len(), 1);
    }

    #[test]
    fn test_message_retention_keeps_most_recent() {
        let raw: Vec<Value> = (0..(MESSAGE_RETENTION as i64 + 5))
            .rev()
            .map(|i| message(i, 1_700_000_000 + i))
            .collect();
        let rows: Vec<Message> = decode_rows(raw);
        assert_eq!(rows.len(), MESSAGE_RETENTION);
        assert_eq!(rows[0].id, 5);
        assert_eq!(rows.last().unwrap().id, MESSAGE_RETENTION as i64 + 4);
    }

    #[tokio::test]
    async fn test_remote_collection_follows_changes_and_releases_channel() {
        let store = MemoryStore::new();
        let backend = Backend::Remote(Arc::new(store.clone()));
        let collection = SyncedCollection::<Message>::open(
            backend,
            Query::new(Filter::room("room1")),
            Duration::from_secs(60),
        )
        .await;
        assert_eq!(store.open_channels(), 1);

        let mut view = collection.watch();
        store
            .insert(Table::Messages, json!({"room_id": "room2", "username": "x", "body": "elsewhere"}))
            .await
            .unwrap();
        store
            .insert(Table::Messages, json!({"room_id": "room1", "username": "bob", "body": "hi"}))
            .await
            .unwrap();

        let rows = view.wait_for(|rows| !rows.is_empty()).await.unwrap().clone();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].body, "hi");

        drop(collection);
        assert_eq!(store.open_channels(), 0);
    }

    #[tokio::test]
    async fn test_absorb_merges_partial_changes_by_key() {
        let store = MemoryStore::new();
        let alice = store
            .upsert(Table::Members, json!({"room_id": "room1", "username": "alice"}))
            .await
            .unwrap();
        let bob = store
            .upsert(Table::Members, json!({"room_id": "room1", "username": "bob"}))
            .await
            .unwrap();
        let members = SyncedCollection::<Member>::open(
            Backend::Remote(Arc::new(store)),
            Query::new(Filter::room("room1")),
            Duration::from_secs(60),
        )
        .await;
        assert_eq!(members.rows().len(), 2);

        // changed columns only, no room_id
        members.absorb(&[ChangeEvent {
            event_type: EventType::Update,
            new: Some(json!({"id": alice["id"], "role": "マスター"})),
            old: None,
        }]);
        let rows = members.rows();
        assert_eq!(rows[0].role, crate::types::Role::Master);
        assert_eq!(rows[0].username, "alice");

        // key-only delete
        members.absorb(&[ChangeEvent::delete(json!({"id": alice["id"]}))]);
        assert_eq!(members.rows().len(), 1);

        // a full row moved to another room leaves the view
        let mut moved = bob.clone();
        moved["room_id"] = json!("room2");
        members.absorb(&[ChangeEvent::update(bob, moved)]);
        assert!(members.rows().is_empty());
    }

    #[tokio::test]
    async fn test_local_collection_sees_own_writes_and_other_tabs() {
        let storage = DeviceStorage::in_memory();
        let first = Backend::Local(LocalMirror::new(storage.tab(), "room1"));
        let second = Backend::Local(LocalMirror::new(storage.tab(), "room1"));
        let query = Query::new(Filter::room("room1"));

        let mine = SyncedCollection::<Message>::open(first, query.clone(), Duration::from_secs(1)).await;
        let theirs = SyncedCollection::<Message>::open(second, query, Duration::from_secs(1)).await;

        mine.insert(json!({"room_id": "room1", "username": "alice", "body": "hello"}))
            .await
            .unwrap();
        assert_eq!(mine.rows().len(), 1);

        let mut view = theirs.watch();
        let rows = view.wait_for(|rows| rows.len() == 1).await.unwrap().clone();
        assert_eq!(rows[0].body, "hello");
    }
}
