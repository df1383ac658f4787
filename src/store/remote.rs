use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use reqwest::{Method, RequestBuilder, Url};
use serde_json::Value;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;

use super::{ChannelGuard, Filter, Query, RowStore, StoreError, StoreResult, Subscription};
use crate::protocol::{
    ClientMessage, ServerMessage, API_KEY_HEADER, PREFER_MERGE_DUPLICATES, REALTIME_PATH,
    REST_PREFIX,
};
use crate::types::Table;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
const SUBSCRIBE_TIMEOUT: Duration = Duration::from_secs(10);

/// Client of a hosted row store: REST for reads and writes, one WebSocket
/// per change subscription.
pub struct RemoteStore {
    base_url: String,
    anon_key: String,
    client: reqwest::Client,
}

impl RemoteStore {
    pub fn new(base_url: &str, anon_key: &str) -> StoreResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| StoreError::Transport(e.to_string()))?;

        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            anon_key: anon_key.to_string(),
            client,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn request(&self, method: Method, table: Table) -> RequestBuilder {
        let url = format!("{}{}/{}", self.base_url, REST_PREFIX, table);
        self.client
            .request(method, url)
            .header(API_KEY_HEADER, &self.anon_key)
            .bearer_auth(&self.anon_key)
    }

    fn realtime_url(&self) -> StoreResult<Url> {
        let mut url =
            Url::parse(&self.base_url).map_err(|e| StoreError::Realtime(e.to_string()))?;
        let scheme = if url.scheme() == "https" { "wss" } else { "ws" };
        url.set_scheme(scheme)
            .map_err(|_| StoreError::Realtime(format!("cannot use {} for realtime", scheme)))?;
        url.set_path(REALTIME_PATH);
        url.query_pairs_mut()
            .append_pair(API_KEY_HEADER, &self.anon_key);
        Ok(url)
    }

    async fn send_for_rows(builder: RequestBuilder) -> StoreResult<Vec<Value>> {
        let response = builder
            .send()
            .await
            .map_err(|e| StoreError::Transport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(StoreError::Status {
                status: status.as_u16(),
                body,
            });
        }

        response
            .json::<Vec<Value>>()
            .await
            .map_err(|e| StoreError::Decode(e.to_string()))
    }

    fn first_row(rows: Vec<Value>) -> StoreResult<Value> {
        rows.into_iter()
            .next()
            .ok_or_else(|| StoreError::Decode("store returned no representation".to_string()))
    }
}

#[async_trait]
impl RowStore for RemoteStore {
    async fn select(&self, table: Table, query: &Query) -> StoreResult<Vec<Value>> {
        let mut params = query.filter.to_params();
        // PostgREST wants an explicit column list
        params.push(("select".to_string(), "*".to_string()));
        if let Some(order) = &query.order {
            params.push(("order".to_string(), order.to_string()));
        }
        if let Some(limit) = query.limit {
            params.push(("limit".to_string(), limit.to_string()));
        }

        Self::send_for_rows(self.request(Method::GET, table).query(&params)).await
    }

    async fn insert(&self, table: Table, row: Value) -> StoreResult<Value> {
        let builder = self
            .request(Method::POST, table)
            .header("Prefer", "return=representation")
            .json(&row);
        Self::first_row(Self::send_for_rows(builder).await?)
    }

    async fn upsert(&self, table: Table, row: Value) -> StoreResult<Value> {
        let builder = self
            .request(Method::POST, table)
            .header(
                "Prefer",
                format!("{},return=representation", PREFER_MERGE_DUPLICATES),
            )
            .json(&row);
        Self::first_row(Self::send_for_rows(builder).await?)
    }

    async fn update(&self, table: Table, filter: &Filter, patch: Value) -> StoreResult<Vec<Value>> {
        let builder = self
            .request(Method::PATCH, table)
            .header("Prefer", "return=representation")
            .query(&filter.to_params())
            .json(&patch);
        Self::send_for_rows(builder).await
    }

    async fn delete(&self, table: Table, filter: &Filter) -> StoreResult<Vec<Value>> {
        let builder = self
            .request(Method::DELETE, table)
            .header("Prefer", "return=representation")
            .query(&filter.to_params());
        Self::send_for_rows(builder).await
    }

    async fn subscribe(&self, table: Table, filter: Filter) -> StoreResult<Subscription> {
        let url = self.realtime_url()?;
        let (socket, _response) = tokio_tungstenite::connect_async(url.as_str())
            .await
            .map_err(|e| StoreError::Realtime(e.to_string()))?;
        let (mut write, mut read) = socket.split();

        let topic = format!("realtime:{}:{}", table, ulid::Ulid::new());
        let join = ClientMessage::Subscribe {
            topic: topic.clone(),
            table,
            filter: filter.to_string(),
        };
        let payload =
            serde_json::to_string(&join).map_err(|e| StoreError::Realtime(e.to_string()))?;
        write
            .send(Message::Text(payload.into()))
            .await
            .map_err(|e| StoreError::Realtime(e.to_string()))?;

        // no subscription is handed out until the server confirms the join
        let ack = tokio::time::timeout(SUBSCRIBE_TIMEOUT, async {
            while let Some(frame) = read.next().await {
                match frame {
                    Ok(Message::Text(text)) => {
                        match serde_json::from_str::<ServerMessage>(text.as_str()) {
                            Ok(ServerMessage::Subscribed { .. }) => return Ok(()),
                            Ok(ServerMessage::Error { code, msg }) => {
                                return Err(StoreError::Realtime(format!("{}: {}", code, msg)))
                            }
                            _ => continue,
                        }
                    }
                    Ok(Message::Close(_)) => break,
                    Ok(_) => continue,
                    Err(e) => return Err(StoreError::Realtime(e.to_string())),
                }
            }
            Err(StoreError::Realtime("channel closed before join".to_string()))
        })
        .await;
        match ack {
            Ok(result) => result?,
            Err(_) => {
                return Err(StoreError::Realtime(format!(
                    "no join reply within {:?}",
                    SUBSCRIBE_TIMEOUT
                )))
            }
        }

        tracing::debug!("Joined {} ({})", topic, filter);

        let (tx, rx) = mpsc::unbounded_channel();
        let reader = tokio::spawn(async move {
            // the sink lives as long as the reader so the socket stays open
            let _write = write;
            while let Some(frame) = read.next().await {
                match frame {
                    Ok(Message::Text(text)) => {
                        match serde_json::from_str::<ServerMessage>(text.as_str()) {
                            Ok(ServerMessage::Change { event, .. }) => {
                                if tx.send(event).is_err() {
                                    break;
                                }
                            }
                            Ok(other) => tracing::debug!("Ignoring realtime message: {:?}", other),
                            Err(e) => tracing::debug!("Dropping malformed realtime frame: {}", e),
                        }
                    }
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(e) => {
                        tracing::warn!("Realtime channel {} failed: {}", topic, e);
                        break;
                    }
                }
            }
        });

        Ok(Subscription::new(rx, ChannelGuard::new(move || reader.abort())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_realtime_url_switches_scheme_and_carries_key() {
        let store = RemoteStore::new("http://127.0.0.1:6574/", "anon").unwrap();
        assert_eq!(store.base_url(), "http://127.0.0.1:6574");
        let url = store.realtime_url().unwrap();
        assert_eq!(url.scheme(), "ws");
        assert_eq!(url.path(), REALTIME_PATH);
        assert_eq!(url.query(), Some("apikey=anon"));

        let secure = RemoteStore::new("https://rooms.example", "k").unwrap();
        assert_eq!(secure.realtime_url().unwrap().scheme(), "wss");
    }
}
