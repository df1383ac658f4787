use serde_json::json;
use std::sync::Arc;

use super::{RoomContext, RoomResult};
use crate::store::{Filter, Query};
use crate::sync::SyncedCollection;
use crate::types::{Level, Role, RoomId, TopicState};
use crate::words::{pick_word, WordSource};

/// Shown to everyone who may not see the word
pub const HIDDEN_TOPIC: &str = "お題はインサイダー/マスターのみ表示";

/// Shown to insider and master before any word is picked
pub const NO_TOPIC: &str = "（未選択）";

/// Topic line for `role`. Only insider and master ever get the word,
/// whatever the reveal flag says.
pub fn render_topic(role: Role, state: Option<&TopicState>) -> String {
    if !role.sees_topic() {
        return HIDDEN_TOPIC.to_string();
    }
    state
        .and_then(|state| state.word.as_deref())
        .filter(|word| !word.is_empty())
        .unwrap_or(NO_TOPIC)
        .to_string()
}

/// Full topic line with the level, as shown under the topic buttons
pub fn render_topic_line(role: Role, state: Option<&TopicState>) -> String {
    if !role.sees_topic() {
        return HIDDEN_TOPIC.to_string();
    }
    let level = state.map(|state| state.level).unwrap_or_default();
    format!("現在のお題：{}（{}）", render_topic(role, state), level)
}

pub struct TopicPanel {
    room_id: RoomId,
    topic: SyncedCollection<TopicState>,
    words: Arc<dyn WordSource>,
}

impl TopicPanel {
    pub async fn open(context: &RoomContext, words: Arc<dyn WordSource>) -> Self {
        let topic = SyncedCollection::<TopicState>::open(
            context.backend.clone(),
            Query::new(Filter::room(&context.room_id)),
            context.timings.poll,
        )
        .await;
        Self {
            room_id: context.room_id.clone(),
            topic,
            words,
        }
    }

    pub fn state(&self) -> Option<TopicState> {
        self.topic.rows().into_iter().next()
    }

    /// Draw a word of `level` and publish it. An empty list changes nothing.
    pub async fn pick(&self, level: Level) -> RoomResult<Option<String>> {
        let words = self.words.fetch(level).await?;
        let Some(word) = pick_word(&words) else {
            tracing::warn!("Word list for {} is empty", level);
            return Ok(None);
        };
        self.topic
            .upsert(json!({ "room_id": self.room_id, "level": level, "word": word }))
            .await?;
        Ok(Some(word))
    }
}
