//! A room page: presence, timer, roles, topic and chat panels over one
//! backend.
//!
//! Each panel owns its synchronized collections and background tasks; there
//! is no coordination between panels beyond the caller's role feeding topic
//! visibility.

mod chat;
mod presence;
mod roles;
mod timer;
mod topic;

pub use chat::ChatPanel;
pub use presence::PresencePanel;
pub use roles::{draw_pair, AssignOutcome, RolesPanel};
pub use timer::{format_remaining, Chime, SilentChime, TimerInputs, TimerPanel, ZeroCrossing, PRESET_MINUTES};
pub use topic::{render_topic, render_topic_line, TopicPanel, HIDDEN_TOPIC, NO_TOPIC};

use std::sync::Arc;

use crate::config::Timings;
use crate::store::StoreError;
use crate::sync::Backend;
use crate::types::{Role, RoomId};
use crate::words::{WordSource, WordsError};

pub type RoomResult<T> = Result<T, RoomError>;

#[derive(Debug, thiserror::Error)]
pub enum RoomError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Words(#[from] WordsError),
}

/// Everything a panel needs to know about where it is mounted
#[derive(Clone)]
pub struct RoomContext {
    pub room_id: RoomId,
    pub username: String,
    pub backend: Backend,
    pub timings: Timings,
}

/// All panels of one room for one user
pub struct RoomSession {
    context: RoomContext,
    pub presence: PresencePanel,
    pub timer: TimerPanel,
    pub roles: RolesPanel,
    pub topic: TopicPanel,
    pub chat: ChatPanel,
}

impl RoomSession {
    pub async fn join(
        context: RoomContext,
        words: Arc<dyn WordSource>,
        chime: Arc<dyn Chime>,
    ) -> Self {
        tracing::info!(
            "{} joining {} ({})",
            context.username,
            context.room_id,
            if context.backend.is_remote() { "hosted" } else { "local" }
        );

        let presence = PresencePanel::join(&context).await;
        let timer = TimerPanel::open(&context, chime).await;
        let roles = RolesPanel::open(&context).await;
        let topic = TopicPanel::open(&context, words).await;
        let chat = ChatPanel::open(&context).await;

        Self {
            context,
            presence,
            timer,
            roles,
            topic,
            chat,
        }
    }

    pub fn room_id(&self) -> &str {
        &self.context.room_id
    }

    pub fn username(&self) -> &str {
        &self.context.username
    }

    pub fn my_role(&self) -> Role {
        self.roles.my_role()
    }

    /// Topic line as this user is allowed to see it
    pub fn topic_text(&self) -> String {
        render_topic(self.my_role(), self.topic.state().as_ref())
    }

    /// Topic text together with its level
    pub fn topic_line(&self) -> String {
        render_topic_line(self.my_role(), self.topic.state().as_ref())
    }

    /// Leave the room and stop every panel
    pub async fn leave(self) {
        let Self {
            context,
            presence,
            timer,
            roles,
            topic,
            chat,
        } = self;
        presence.leave().await;
        drop((timer, roles, topic, chat));
        tracing::info!("{} left {}", context.username, context.room_id);
    }
}
