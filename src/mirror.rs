//! Same-device fallback used when no hosted store is configured.
//!
//! [`DeviceStorage`] plays the part of browser storage: named string slots
//! shared by every [`Tab`] on the device, optionally persisted to disk, with
//! change notifications delivered to every tab except the writer.
//! [`LocalMirror`] keeps one JSON array per room and table in those slots and
//! applies the same table semantics as the hosted store.

use chrono::Utc;
use serde_json::Value;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, Weak};
use tokio::sync::{broadcast, watch};
use ulid::Ulid;

use crate::store::{table, Filter, Query, StoreError, StoreResult};
use crate::types::{RoomId, RowId, Table};

pub type TabId = Ulid;

const STORAGE_FILE: &str = "storage.json";
const EVENT_CAPACITY: usize = 256;

/// Notification that a slot changed in another tab.
/// `key` is `None` when notifications were missed and every slot may differ.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageEvent {
    pub key: Option<String>,
    pub origin: TabId,
}

struct Inner {
    slots: Mutex<HashMap<String, String>>,
    file: Option<PathBuf>,
    // bumped on every change; the writer task follows it
    dirty: watch::Sender<u64>,
    writing: tokio::sync::Mutex<()>,
    events: broadcast::Sender<StorageEvent>,
}

fn lock_slots(slots: &Mutex<HashMap<String, String>>) -> std::sync::MutexGuard<'_, HashMap<String, String>> {
    match slots.lock() {
        Ok(slots) => slots,
        Err(poisoned) => poisoned.into_inner(),
    }
}

impl Inner {
    /// Write the current slots to disk. Writes are serialized, and each one
    /// snapshots under the write lock, so the file never goes backwards.
    async fn write_snapshot(&self) -> StoreResult<()> {
        let Some(file) = self.file.clone() else {
            return Ok(());
        };
        let _writing = self.writing.lock().await;
        let raw = serde_json::to_string(&*lock_slots(&self.slots))
            .map_err(|e| StoreError::Storage(e.to_string()))?;
        tokio::task::spawn_blocking(move || {
            let tmp = file.with_extension("json.tmp");
            std::fs::write(&tmp, raw).and_then(|_| std::fs::rename(&tmp, &file))
        })
        .await
        .map_err(|e| StoreError::Storage(e.to_string()))?
        .map_err(|e| StoreError::Storage(e.to_string()))
    }
}

/// Persist changes in the background, coalescing bursts into one write
async fn write_behind(inner: Weak<Inner>, mut dirty: watch::Receiver<u64>) {
    while dirty.changed().await.is_ok() {
        let Some(inner) = inner.upgrade() else {
            break;
        };
        if let Err(e) = inner.write_snapshot().await {
            tracing::warn!("Failed to persist device storage: {}", e);
        }
    }
}

/// Device-wide key/value slots
#[derive(Clone)]
pub struct DeviceStorage {
    inner: Arc<Inner>,
}

impl DeviceStorage {
    pub fn in_memory() -> Self {
        Self::with_slots(HashMap::new(), None)
    }

    /// Open storage persisted under `dir`, creating it if needed.
    /// An unreadable storage file starts the device empty.
    ///
    /// Changes are written behind by a task on the current tokio runtime;
    /// call [`DeviceStorage::flush`] before exiting.
    pub fn open(dir: impl AsRef<Path>) -> StoreResult<Self> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| StoreError::Storage(e.to_string()))?;
        let dir = dir.as_ref();
        std::fs::create_dir_all(dir).map_err(|e| StoreError::Storage(e.to_string()))?;
        let file = dir.join(STORAGE_FILE);

        let slots = match std::fs::read_to_string(&file) {
            Ok(raw) => serde_json::from_str(&raw).unwrap_or_else(|e| {
                tracing::warn!("Ignoring unreadable {}: {}", file.display(), e);
                HashMap::new()
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
            Err(e) => return Err(StoreError::Storage(e.to_string())),
        };

        tracing::debug!("Device storage at {}", file.display());
        let storage = Self::with_slots(slots, Some(file));
        runtime.spawn(write_behind(
            Arc::downgrade(&storage.inner),
            storage.inner.dirty.subscribe(),
        ));
        Ok(storage)
    }

    fn with_slots(slots: HashMap<String, String>, file: Option<PathBuf>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let (dirty, _) = watch::channel(0);
        Self {
            inner: Arc::new(Inner {
                slots: Mutex::new(slots),
                file,
                dirty,
                writing: tokio::sync::Mutex::new(()),
                events,
            }),
        }
    }

    /// Write pending changes now
    pub async fn flush(&self) -> StoreResult<()> {
        self.inner.write_snapshot().await
    }

    /// Open a new tab with its own identity
    pub fn tab(&self) -> Tab {
        Tab {
            id: Ulid::new(),
            storage: self.clone(),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, String>> {
        lock_slots(&self.inner.slots)
    }

    fn persist(&self) {
        if self.inner.file.is_some() {
            self.inner.dirty.send_modify(|version| *version = version.wrapping_add(1));
        }
    }

    fn notify(&self, key: &str, origin: TabId) {
        // no other tab listening is fine
        let _ = self.inner.events.send(StorageEvent {
            key: Some(key.to_string()),
            origin,
        });
    }
}

/// One tab's view of device storage
#[derive(Clone)]
pub struct Tab {
    id: TabId,
    storage: DeviceStorage,
}

impl Tab {
    pub fn id(&self) -> TabId {
        self.id
    }

    pub fn get_item(&self, key: &str) -> Option<String> {
        self.storage.lock().get(key).cloned()
    }

    pub fn set_item(&self, key: &str, value: &str) {
        let mut slots = self.storage.lock();
        slots.insert(key.to_string(), value.to_string());
        drop(slots);
        self.storage.persist();
        self.storage.notify(key, self.id);
    }

    pub fn remove_item(&self, key: &str) {
        let mut slots = self.storage.lock();
        if slots.remove(key).is_some() {
            drop(slots);
            self.storage.persist();
            self.storage.notify(key, self.id);
        }
    }

    /// Read-modify-write a slot atomically with respect to other tabs.
    /// Nothing is written when `f` fails.
    pub fn update_item<T>(
        &self,
        key: &str,
        f: impl FnOnce(Option<&str>) -> StoreResult<(String, T)>,
    ) -> StoreResult<T> {
        let mut slots = self.storage.lock();
        let (next, out) = f(slots.get(key).map(String::as_str))?;
        slots.insert(key.to_string(), next);
        drop(slots);
        self.storage.persist();
        self.storage.notify(key, self.id);
        Ok(out)
    }

    /// Changes made by other tabs from now on
    pub fn events(&self) -> TabEvents {
        TabEvents {
            id: self.id,
            rx: self.storage.inner.events.subscribe(),
        }
    }
}

pub struct TabEvents {
    id: TabId,
    rx: broadcast::Receiver<StorageEvent>,
}

impl TabEvents {
    /// Next change from another tab; `None` once storage is gone
    pub async fn recv(&mut self) -> Option<StorageEvent> {
        loop {
            match self.rx.recv().await {
                Ok(event) if event.origin == self.id => continue,
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    tracing::debug!("Tab {} missed {} storage events", self.id, missed);
                    return Some(StorageEvent {
                        key: None,
                        origin: self.id,
                    });
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

/// Per-room mirror of the five tables in device storage
#[derive(Clone)]
pub struct LocalMirror {
    tab: Tab,
    room_id: RoomId,
}

impl LocalMirror {
    pub fn new(tab: Tab, room_id: &str) -> Self {
        Self {
            tab,
            room_id: room_id.to_string(),
        }
    }

    pub fn room_id(&self) -> &str {
        &self.room_id
    }

    pub fn tab(&self) -> &Tab {
        &self.tab
    }

    pub fn events(&self) -> TabEvents {
        self.tab.events()
    }

    /// Storage slot holding `table` for this room
    pub fn slot_key(&self, table: Table) -> String {
        format!("party-chat-{}:{}", table, self.room_id)
    }

    fn read_raw(&self, table: Table) -> Vec<Value> {
        parse_slot(self.tab.get_item(&self.slot_key(table)).as_deref())
    }

    /// Apply `op` to the slot contents and write the result back
    fn modify<T>(
        &self,
        table: Table,
        op: impl FnOnce(&mut Vec<Value>) -> StoreResult<T>,
    ) -> StoreResult<T> {
        self.tab.update_item(&self.slot_key(table), |current| {
            let mut rows = parse_slot(current);
            let out = op(&mut rows)?;
            let raw = serde_json::to_string(&rows).map_err(|e| StoreError::Storage(e.to_string()))?;
            Ok((raw, out))
        })
    }

    pub fn select_now(&self, table: Table, query: &Query) -> Vec<Value> {
        table::select(&self.read_raw(table), query)
    }

    pub fn insert_now(&self, table: Table, row: Value) -> StoreResult<Value> {
        self.modify(table, |rows| {
            let mut next_id = id_sequence(rows);
            table::insert(rows, table, row, &mut next_id, Utc::now())
        })
    }

    pub fn upsert_now(&self, table: Table, row: Value) -> StoreResult<Value> {
        self.modify(table, |rows| {
            let mut next_id = id_sequence(rows);
            let change = table::upsert(rows, table, row, &mut next_id, Utc::now())?;
            Ok(change.new.unwrap_or(Value::Null))
        })
    }

    pub fn update_now(&self, table: Table, filter: &Filter, patch: Value) -> StoreResult<Vec<Value>> {
        self.modify(table, |rows| {
            let changes = table::update(rows, filter, patch)?;
            Ok(changes.into_iter().filter_map(|c| c.new).collect())
        })
    }

    pub fn delete_now(&self, table: Table, filter: &Filter) -> StoreResult<Vec<Value>> {
        self.modify(table, |rows| {
            let changes = table::delete(rows, filter);
            Ok(changes.into_iter().filter_map(|c| c.old).collect())
        })
    }
}

/// Slot contents as rows; anything that is not an array of objects reads as
/// nothing
fn parse_slot(raw: Option<&str>) -> Vec<Value> {
    let Some(raw) = raw else {
        return Vec::new();
    };
    match serde_json::from_str::<Value>(raw) {
        Ok(Value::Array(items)) => items.into_iter().filter(Value::is_object).collect(),
        Ok(_) => Vec::new(),
        Err(e) => {
            tracing::debug!("Discarding malformed mirror slot: {}", e);
            Vec::new()
        }
    }
}

/// Ids are millisecond timestamps, bumped past anything already stored
fn id_sequence(rows: &[Value]) -> impl FnMut() -> RowId {
    let highest = rows
        .iter()
        .filter_map(|r| r.get("id").and_then(Value::as_i64))
        .max()
        .unwrap_or(0);
    let mut next = Utc::now().timestamp_millis().max(highest.saturating_add(1));
    move || {
        let id = next;
        next = next.saturating_add(1);
        id
    }
}
