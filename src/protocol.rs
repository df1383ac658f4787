use crate::store::ChangeEvent;
use crate::types::Table;
use serde::{Deserialize, Serialize};

/// Table endpoints live under this prefix: `/rest/v1/{table}`
pub const REST_PREFIX: &str = "/rest/v1";

/// Realtime WebSocket endpoint
pub const REALTIME_PATH: &str = "/realtime/v1/websocket";

/// Header (or query parameter) carrying the public API key
pub const API_KEY_HEADER: &str = "apikey";

/// `Prefer` value that turns a POST into an upsert on the natural key
pub const PREFER_MERGE_DUPLICATES: &str = "resolution=merge-duplicates";

/// Messages sent by realtime clients
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "t", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Open a change channel; `filter` uses the `col=eq.value,...` form
    Subscribe {
        topic: String,
        table: Table,
        #[serde(default)]
        filter: String,
    },
    Unsubscribe {
        topic: String,
    },
}

/// Messages sent by the realtime endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "t", rename_all = "snake_case")]
pub enum ServerMessage {
    Subscribed {
        topic: String,
    },
    Unsubscribed {
        topic: String,
    },
    Change {
        topic: String,
        event: ChangeEvent,
    },
    Error {
        code: String,
        msg: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::EventType;
    use serde_json::json;

    #[test]
    fn test_client_message_wire_format() {
        let msg: ClientMessage = serde_json::from_value(json!({
            "t": "subscribe",
            "topic": "realtime:members",
            "table": "members",
            "filter": "room_id=eq.room1"
        }))
        .unwrap();
        match msg {
            ClientMessage::Subscribe { table, filter, .. } => {
                assert_eq!(table, Table::Members);
                assert_eq!(filter, "room_id=eq.room1");
            }
            _ => panic!("Expected Subscribe"),
        }
    }

    #[test]
    fn test_change_message_wire_format() {
        let msg = ServerMessage::Change {
            topic: "t1".to_string(),
            event: ChangeEvent::insert(json!({"id": 1})),
        };
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["t"], "change");
        assert_eq!(value["event"]["event_type"], "insert");

        let parsed: ServerMessage = serde_json::from_value(value).unwrap();
        match parsed {
            ServerMessage::Change { event, .. } => assert_eq!(event.event_type, EventType::Insert),
            _ => panic!("Expected Change"),
        }
    }
}
