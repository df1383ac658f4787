use serde_json::json;
use tokio::sync::watch;

use super::{RoomContext, RoomResult};
use crate::store::{Filter, Query};
use crate::sync::SyncedCollection;
use crate::types::{Message, RoomId, MESSAGE_RETENTION};

pub struct ChatPanel {
    room_id: RoomId,
    username: String,
    messages: SyncedCollection<Message>,
}

impl ChatPanel {
    pub async fn open(context: &RoomContext) -> Self {
        // newest first so the limit keeps the most recent; the view re-sorts
        let query = Query::new(Filter::room(&context.room_id))
            .order_by("created_at", false)
            .limit(MESSAGE_RETENTION);
        let messages =
            SyncedCollection::<Message>::open(context.backend.clone(), query, context.timings.poll).await;
        Self {
            room_id: context.room_id.clone(),
            username: context.username.clone(),
            messages,
        }
    }

    /// Messages oldest first
    pub fn messages(&self) -> Vec<Message> {
        self.messages.rows()
    }

    pub fn watch(&self) -> watch::Receiver<Vec<Message>> {
        self.messages.watch()
    }

    /// Post a trimmed message. Returns false for a blank body, which is
    /// not sent.
    pub async fn send(&self, body: &str) -> RoomResult<bool> {
        let body = body.trim();
        if body.is_empty() {
            return Ok(false);
        }
        self.messages
            .insert(json!({
                "room_id": self.room_id,
                "username": self.username,
                "body": body,
            }))
            .await?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Timings;
    use crate::store::{MemoryStore, RowStore};
    use crate::sync::Backend;
    use crate::types::Table;
    use std::sync::Arc;

    fn context(store: &MemoryStore, username: &str) -> RoomContext {
        RoomContext {
            room_id: "room1".to_string(),
            username: username.to_string(),
            backend: Backend::Remote(Arc::new(store.clone())),
            timings: Timings::default(),
        }
    }

    #[tokio::test]
    async fn test_send_trims_and_skips_blank() {
        let store = MemoryStore::new();
        let chat = ChatPanel::open(&context(&store, "alice")).await;

        assert!(!chat.send("   ").await.unwrap());
        assert!(chat.send("  hello  ").await.unwrap());

        let messages = chat.messages();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].body, "hello");
        assert_eq!(messages[0].username, "alice");
    }

    #[tokio::test]
    async fn test_other_users_messages_arrive_in_order() {
        let store = MemoryStore::new();
        let alice = ChatPanel::open(&context(&store, "alice")).await;
        let bob = ChatPanel::open(&context(&store, "bob")).await;

        alice.send("first").await.unwrap();
        bob.send("second").await.unwrap();

        let mut view = alice.watch();
        let rows = view.wait_for(|rows| rows.len() == 2).await.unwrap().clone();
        assert_eq!(rows[0].body, "first");
        assert_eq!(rows[1].body, "second");
    }

    #[tokio::test]
    async fn test_load_keeps_most_recent_messages() {
        let store = MemoryStore::new();
        let base = chrono::Utc::now() - chrono::Duration::hours(1);
        for i in 0..(MESSAGE_RETENTION + 10) {
            store
                .insert(
                    Table::Messages,
                    json!({
                        "room_id": "room1",
                        "username": "alice",
                        "body": format!("m{}", i),
                        "created_at": base + chrono::Duration::seconds(i as i64),
                    }),
                )
                .await
                .unwrap();
        }

        let chat = ChatPanel::open(&context(&store, "bob")).await;
        let messages = chat.messages();
        assert_eq!(messages.len(), MESSAGE_RETENTION);
        assert_eq!(messages[0].body, "m10");
        assert_eq!(messages.last().unwrap().body, format!("m{}", MESSAGE_RETENTION + 9));
    }
}
