use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Opaque ID types
pub type RoomId = String;
pub type RowId = i64;

/// How long after its last heartbeat a member still counts as online
pub const ONLINE_WINDOW_MS: i64 = 10_000;

/// Chat keeps at most this many of the most recent messages
pub const MESSAGE_RETENTION: usize = 300;

/// The five logical tables of the shared row store
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Table {
    Members,
    Messages,
    Timers,
    RolesState,
    TopicState,
}

impl Table {
    pub const ALL: [Table; 5] = [
        Table::Members,
        Table::Messages,
        Table::Timers,
        Table::RolesState,
        Table::TopicState,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Table::Members => "members",
            Table::Messages => "messages",
            Table::Timers => "timers",
            Table::RolesState => "roles_state",
            Table::TopicState => "topic_state",
        }
    }

    pub fn parse(name: &str) -> Option<Table> {
        Table::ALL.into_iter().find(|t| t.as_str() == name)
    }
}

impl fmt::Display for Table {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Secret role of a member for the current round
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum Role {
    #[default]
    #[serde(rename = "未定", alias = "")]
    Undecided,
    #[serde(rename = "庶民")]
    Commoner,
    #[serde(rename = "インサイダー")]
    Insider,
    #[serde(rename = "マスター")]
    Master,
}

impl Role {
    pub fn label(&self) -> &'static str {
        match self {
            Role::Undecided => "未定",
            Role::Commoner => "庶民",
            Role::Insider => "インサイダー",
            Role::Master => "マスター",
        }
    }

    /// Insider and master are the only roles allowed to see the topic word
    pub fn sees_topic(&self) -> bool {
        matches!(self, Role::Insider | Role::Master)
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Difficulty tier of the topic word lists
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum Level {
    #[default]
    Normal,
    Hard,
    Expert,
}

impl Level {
    pub const ALL: [Level; 3] = [Level::Normal, Level::Hard, Level::Expert];

    pub fn as_str(&self) -> &'static str {
        match self {
            Level::Normal => "normal",
            Level::Hard => "hard",
            Level::Expert => "expert",
        }
    }

    /// Relative path of the static word list for this tier
    pub fn word_list_path(&self) -> &'static str {
        match self {
            Level::Normal => "/normal.json",
            Level::Hard => "/hard.json",
            Level::Expert => "/expert.json",
        }
    }

    pub fn parse(name: &str) -> Option<Level> {
        Level::ALL.into_iter().find(|l| l.as_str() == name)
    }
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A user present (or recently present) in a room
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Member {
    pub id: RowId,
    pub room_id: RoomId,
    pub username: String,
    pub score: i64,
    #[serde(default)]
    pub role: Role,
    pub updated_at: DateTime<Utc>,
}

impl Member {
    /// Online is derived from the heartbeat, never stored
    pub fn is_online_at(&self, now: DateTime<Utc>) -> bool {
        (now - self.updated_at).num_milliseconds() < ONLINE_WINDOW_MS
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Message {
    pub id: RowId,
    pub room_id: RoomId,
    pub username: String,
    pub body: String,
    pub created_at: DateTime<Utc>,
}

/// Shared countdown, one row per room.
///
/// While running, `ends_at` is authoritative and `remaining_ms` holds the
/// duration at start. While paused, `ends_at` is null and `remaining_ms`
/// holds the frozen remainder.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TimerState {
    pub room_id: RoomId,
    pub label: String,
    pub running: bool,
    pub ends_at: Option<DateTime<Utc>>,
    pub remaining_ms: i64,
}

impl TimerState {
    pub const LABEL: &'static str = "Timer";

    pub fn idle(room_id: &str) -> Self {
        Self {
            room_id: room_id.to_string(),
            label: Self::LABEL.to_string(),
            running: false,
            ends_at: None,
            remaining_ms: 0,
        }
    }

    /// State after starting a countdown of `total_seconds` at `now`
    pub fn started(room_id: &str, total_seconds: u64, now: DateTime<Utc>) -> Self {
        if total_seconds == 0 {
            return Self::idle(room_id);
        }
        let ms = (total_seconds as i64).saturating_mul(1000);
        Self {
            room_id: room_id.to_string(),
            label: Self::LABEL.to_string(),
            running: true,
            ends_at: Some(now + chrono::Duration::milliseconds(ms)),
            remaining_ms: ms,
        }
    }

    /// State after pausing at `now`, freezing whatever is left
    pub fn paused(&self, now: DateTime<Utc>) -> Self {
        let remainder = match (self.running, self.ends_at) {
            (true, Some(ends_at)) => (ends_at - now).num_milliseconds().max(0),
            _ => self.remaining_ms,
        };
        Self {
            room_id: self.room_id.clone(),
            label: self.label.clone(),
            running: false,
            ends_at: None,
            remaining_ms: remainder,
        }
    }

    /// Remaining time every client displays for this row at `now`
    pub fn remaining_ms_at(&self, now: DateTime<Utc>) -> i64 {
        match (self.running, self.ends_at) {
            (true, Some(ends_at)) => (ends_at - now).num_milliseconds().max(0),
            _ => self.remaining_ms.max(0),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RolesState {
    pub room_id: RoomId,
    pub revealed: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TopicState {
    pub room_id: RoomId,
    #[serde(default)]
    pub level: Level,
    pub word: Option<String>,
}
