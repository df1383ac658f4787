//! Realtime endpoint: one WebSocket carries any number of change channels,
//! each a filtered subscription on the in-process store.

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
};
use futures::{sink::SinkExt, stream::StreamExt};
use std::collections::HashMap;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::protocol::{ClientMessage, ServerMessage};
use crate::store::{Filter, MemoryStore, RowStore};

/// WebSocket upgrade handler
pub async fn realtime_handler(
    ws: WebSocketUpgrade,
    State(store): State<MemoryStore>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, store))
}

/// Open channels of one connection, by topic
#[derive(Default)]
struct Channels {
    forwarders: HashMap<String, JoinHandle<()>>,
}

impl Channels {
    async fn join(
        &mut self,
        store: &MemoryStore,
        topic: String,
        table: crate::types::Table,
        filter: &str,
        out: &mpsc::UnboundedSender<ServerMessage>,
    ) -> ServerMessage {
        let filter = match Filter::parse(filter) {
            Ok(filter) => filter,
            Err(e) => {
                return ServerMessage::Error {
                    code: "INVALID_FILTER".to_string(),
                    msg: e.to_string(),
                }
            }
        };
        let mut subscription = match store.subscribe(table, filter).await {
            Ok(subscription) => subscription,
            Err(e) => {
                return ServerMessage::Error {
                    code: "SUBSCRIBE_FAILED".to_string(),
                    msg: e.to_string(),
                }
            }
        };

        let out = out.clone();
        let forward_topic = topic.clone();
        // the subscription lives in the task; aborting it releases the channel
        let forwarder = tokio::spawn(async move {
            while let Some(event) = subscription.next().await {
                let change = ServerMessage::Change {
                    topic: forward_topic.clone(),
                    event,
                };
                if out.send(change).is_err() {
                    break;
                }
            }
        });

        if let Some(previous) = self.forwarders.insert(topic.clone(), forwarder) {
            previous.abort();
        }
        tracing::debug!("Channel {} joined on {}", topic, table);
        ServerMessage::Subscribed { topic }
    }

    fn leave(&mut self, topic: String) -> ServerMessage {
        if let Some(forwarder) = self.forwarders.remove(&topic) {
            forwarder.abort();
            tracing::debug!("Channel {} left", topic);
        }
        ServerMessage::Unsubscribed { topic }
    }

    fn close_all(&mut self) {
        for (_, forwarder) in self.forwarders.drain() {
            forwarder.abort();
        }
    }
}

async fn send_json(
    sender: &mut futures::stream::SplitSink<WebSocket, Message>,
    msg: &ServerMessage,
) -> bool {
    match serde_json::to_string(msg) {
        Ok(json) => sender.send(Message::Text(json.into())).await.is_ok(),
        Err(e) => {
            tracing::error!("Failed to encode realtime message: {}", e);
            true
        }
    }
}

/// Handle individual WebSocket connection
async fn handle_socket(socket: WebSocket, store: MemoryStore) {
    let (mut sender, mut receiver) = socket.split();
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<ServerMessage>();
    let mut channels = Channels::default();

    tracing::info!("Realtime client connected");

    loop {
        tokio::select! {
            // Changes from this connection's channels
            Some(change) = out_rx.recv() => {
                if !send_json(&mut sender, &change).await {
                    break;
                }
            }

            // Handle client messages
            ws_msg = receiver.next() => {
                match ws_msg {
                    Some(Ok(Message::Text(text))) => {
                        let reply = match serde_json::from_str::<ClientMessage>(&text) {
                            Ok(ClientMessage::Subscribe { topic, table, filter }) => {
                                channels.join(&store, topic, table, &filter, &out_tx).await
                            }
                            Ok(ClientMessage::Unsubscribe { topic }) => channels.leave(topic),
                            Err(e) => {
                                tracing::warn!("Failed to parse realtime message: {}", e);
                                ServerMessage::Error {
                                    code: "PARSE_ERROR".to_string(),
                                    msg: format!("Invalid message format: {}", e),
                                }
                            }
                        };
                        if !send_json(&mut sender, &reply).await {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) => break,
                    Some(Ok(Message::Ping(data))) => {
                        if sender.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        tracing::warn!("Realtime socket error: {}", e);
                        break;
                    }
                    None => break,
                }
            }
        }
    }

    channels.close_all();
    tracing::info!("Realtime client disconnected");
}
