use chrono::{DateTime, Utc};
use serde_json::json;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use super::{RoomContext, RoomResult};
use crate::store::{Filter, Query};
use crate::sync::{CollectionHandle, SyncedCollection};
use crate::types::{Member, RoomId};

/// Membership list with a heartbeat for the local user
pub struct PresencePanel {
    room_id: RoomId,
    username: String,
    remote: bool,
    members: SyncedCollection<Member>,
    heartbeat: Option<JoinHandle<()>>,
}

async fn beat(members: &CollectionHandle<Member>, room_id: &str, username: &str) {
    let row = json!({
        "room_id": room_id,
        "username": username,
        "updated_at": Utc::now(),
    });
    if let Err(e) = members.upsert(row).await {
        tracing::warn!("Heartbeat for {} in {} failed: {}", username, room_id, e);
    }
}

impl PresencePanel {
    /// Upsert our row now and keep it fresh every heartbeat
    pub async fn join(context: &RoomContext) -> Self {
        let query = Query::new(Filter::room(&context.room_id)).order_by("username", true);
        let members =
            SyncedCollection::<Member>::open(context.backend.clone(), query, context.timings.poll).await;

        beat(&members, &context.room_id, &context.username).await;

        let handle = members.handle();
        let room_id = context.room_id.clone();
        let username = context.username.clone();
        let period = context.timings.heartbeat;
        let heartbeat = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                beat(&handle, &room_id, &username).await;
            }
        });

        Self {
            room_id: context.room_id.clone(),
            username: context.username.clone(),
            remote: context.backend.is_remote(),
            members,
            heartbeat: Some(heartbeat),
        }
    }

    /// Members ordered by name
    pub fn members(&self) -> Vec<Member> {
        self.members.rows()
    }

    pub fn watch(&self) -> watch::Receiver<Vec<Member>> {
        self.members.watch()
    }

    pub fn online_members(&self, now: DateTime<Utc>) -> Vec<Member> {
        self.members
            .rows()
            .into_iter()
            .filter(|m| m.is_online_at(now))
            .collect()
    }

    /// Add `delta` to a member's score.
    ///
    /// Reads the score from the current view and writes the sum, so two
    /// clients adjusting at once can lose one of the updates.
    pub async fn adjust(&self, username: &str, delta: i64) -> RoomResult<()> {
        let Some(member) = self.members.rows().into_iter().find(|m| m.username == username) else {
            tracing::debug!("No member {} in {} to adjust", username, self.room_id);
            return Ok(());
        };
        let filter = Filter::room(&self.room_id).eq("id", member.id);
        self.members
            .update_where(&filter, json!({ "score": member.score + delta }))
            .await?;
        Ok(())
    }

    /// Stop the heartbeat and mark ourselves gone.
    ///
    /// With a hosted store the row is kept but dated to the epoch so it reads
    /// offline; in the local mirror the row is removed. Failures are logged.
    pub async fn leave(mut self) {
        if let Some(heartbeat) = self.heartbeat.take() {
            heartbeat.abort();
        }
        let me = Filter::room(&self.room_id).eq("username", &self.username);
        let result = if self.remote {
            self.members
                .update_where(&me, json!({ "updated_at": DateTime::<Utc>::UNIX_EPOCH }))
                .await
        } else {
            self.members.delete_where(&me).await
        };
        if let Err(e) = result {
            tracing::warn!("Could not mark {} as gone from {}: {}", self.username, self.room_id, e);
        }
        self.members.close();
    }
}

impl Drop for PresencePanel {
    fn drop(&mut self) {
        if let Some(heartbeat) = self.heartbeat.take() {
            heartbeat.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Timings;
    use crate::mirror::{DeviceStorage, LocalMirror};
    use crate::store::{MemoryStore, RowStore};
    use crate::sync::Backend;
    use crate::types::Table;
    use std::sync::Arc;

    fn context(backend: Backend, username: &str) -> RoomContext {
        RoomContext {
            room_id: "room1".to_string(),
            username: username.to_string(),
            backend,
            timings: Timings::default(),
        }
    }

    #[tokio::test]
    async fn test_join_adjust_and_leave_remote() {
        let store = MemoryStore::new();
        let backend = Backend::Remote(Arc::new(store.clone()));
        let panel = PresencePanel::join(&context(backend, "alice")).await;

        let members = panel.members();
        assert_eq!(members.len(), 1);
        assert!(members[0].is_online_at(Utc::now()));

        panel.adjust("alice", 1).await.unwrap();
        panel.adjust("alice", 1).await.unwrap();
        panel.adjust("alice", -1).await.unwrap();
        panel.adjust("nobody", 1).await.unwrap();
        assert_eq!(panel.members()[0].score, 1);

        panel.leave().await;
        let rows = store
            .select(Table::Members, &Query::new(Filter::room("room1")))
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["score"], 1);
        let member: Member = serde_json::from_value(rows[0].clone()).unwrap();
        assert!(!member.is_online_at(Utc::now()));
        assert_eq!(store.open_channels(), 0);
    }

    async fn stored_updated_at(store: &MemoryStore) -> DateTime<Utc> {
        let rows = store
            .select(Table::Members, &Query::new(Filter::room("room1")))
            .await
            .unwrap();
        let member: Member = serde_json::from_value(rows[0].clone()).unwrap();
        member.updated_at
    }

    #[tokio::test]
    async fn test_heartbeat_keeps_row_fresh_until_dropped() {
        let store = MemoryStore::new();
        let mut context = context(Backend::Remote(Arc::new(store.clone())), "alice");
        context.timings.heartbeat = std::time::Duration::from_millis(50);
        context.timings.poll = std::time::Duration::from_secs(60);
        let panel = PresencePanel::join(&context).await;

        let joined = stored_updated_at(&store).await;
        tokio::time::sleep(std::time::Duration::from_millis(180)).await;
        let beaten = stored_updated_at(&store).await;
        assert!(beaten > joined, "heartbeat did not advance updated_at");

        drop(panel);
        let stopped = stored_updated_at(&store).await;
        tokio::time::sleep(std::time::Duration::from_millis(180)).await;
        assert_eq!(stored_updated_at(&store).await, stopped);
    }

    #[tokio::test]
    async fn test_local_leave_removes_own_row() {
        let storage = DeviceStorage::in_memory();
        let alice = PresencePanel::join(&context(
            Backend::Local(LocalMirror::new(storage.tab(), "room1")),
            "alice",
        ))
        .await;
        let bob = PresencePanel::join(&context(
            Backend::Local(LocalMirror::new(storage.tab(), "room1")),
            "bob",
        ))
        .await;
        assert_eq!(bob.members().len(), 2);

        let mut view = alice.watch();
        view.wait_for(|rows| rows.len() == 2).await.unwrap();

        bob.leave().await;
        let rows = view.wait_for(|rows| rows.len() == 1).await.unwrap().clone();
        assert_eq!(rows[0].username, "alice");
    }
}
