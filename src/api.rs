//! REST endpoints of the hosted store.
//!
//! `GET|POST|PATCH|DELETE /rest/v1/{table}` with PostgREST-style query
//! parameters: `col=eq.value` / `col=neq.value` filters, `order=col.desc`,
//! `limit=N`. A POST carrying `Prefer: resolution=merge-duplicates` is an
//! upsert. Every write answers with the affected rows.

use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    middleware,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde_json::{json, Value};
use std::sync::Arc;

use crate::auth::{api_key_middleware, ApiKeyConfig};
use crate::protocol::{PREFER_MERGE_DUPLICATES, REALTIME_PATH, REST_PREFIX};
use crate::store::{self, Filter, MemoryStore, Order, RowStore, StoreError};
use crate::types::Table;
use crate::ws;

/// Store error rendered as an HTTP response
#[derive(Debug)]
pub struct ApiError(StoreError);

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            StoreError::UnknownTable(_) => StatusCode::NOT_FOUND,
            StoreError::Conflict(_) => StatusCode::CONFLICT,
            StoreError::MissingKey { .. } | StoreError::Decode(_) | StoreError::InvalidFilter(_) => {
                StatusCode::BAD_REQUEST
            }
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            tracing::error!("Store request failed: {}", self.0);
        }
        (status, Json(json!({ "message": self.0.to_string() }))).into_response()
    }
}

type Params = Query<Vec<(String, String)>>;

fn table(name: &str) -> Result<Table, ApiError> {
    Table::parse(name).ok_or_else(|| ApiError(StoreError::UnknownTable(name.to_string())))
}

/// Split query parameters into a row query
fn parse_query(params: &[(String, String)]) -> Result<store::Query, ApiError> {
    let mut query = store::Query::default();
    for (key, value) in params {
        match key.as_str() {
            // every column is always returned
            "select" => {}
            "order" => query.order = Some(Order::parse(value)),
            "limit" => {
                let limit = value
                    .parse()
                    .map_err(|_| StoreError::InvalidFilter(format!("limit={}", value)))?;
                query.limit = Some(limit);
            }
            column => query.filter.push_expr(column, value)?,
        }
    }
    Ok(query)
}

fn parse_filter(params: &[(String, String)]) -> Result<Filter, ApiError> {
    Ok(parse_query(params)?.filter)
}

fn wants_upsert(headers: &HeaderMap) -> bool {
    headers
        .get_all("prefer")
        .iter()
        .filter_map(|v| v.to_str().ok())
        .any(|v| v.contains(PREFER_MERGE_DUPLICATES))
}

/// GET /rest/v1/{table}
pub async fn select_rows(
    State(store): State<MemoryStore>,
    Path(name): Path<String>,
    Query(params): Params,
) -> Result<Json<Vec<Value>>, ApiError> {
    let table = table(&name)?;
    let query = parse_query(&params)?;
    Ok(Json(store.select(table, &query).await?))
}

/// POST /rest/v1/{table}: insert, or upsert with the merge preference.
/// Accepts one row or an array of rows.
pub async fn insert_rows(
    State(store): State<MemoryStore>,
    Path(name): Path<String>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Result<(StatusCode, Json<Vec<Value>>), ApiError> {
    let table = table(&name)?;
    let rows = match body {
        Value::Array(rows) => rows,
        row => vec![row],
    };
    let upsert = wants_upsert(&headers);

    // rows apply in order; the first failure stops the rest
    let mut saved = Vec::with_capacity(rows.len());
    for row in rows {
        let row = if upsert {
            store.upsert(table, row).await?
        } else {
            store.insert(table, row).await?
        };
        saved.push(row);
    }
    Ok((StatusCode::CREATED, Json(saved)))
}

/// PATCH /rest/v1/{table}
pub async fn update_rows(
    State(store): State<MemoryStore>,
    Path(name): Path<String>,
    Query(params): Params,
    Json(patch): Json<Value>,
) -> Result<Json<Vec<Value>>, ApiError> {
    let table = table(&name)?;
    let filter = parse_filter(&params)?;
    Ok(Json(store.update(table, &filter, patch).await?))
}

/// DELETE /rest/v1/{table}
pub async fn delete_rows(
    State(store): State<MemoryStore>,
    Path(name): Path<String>,
    Query(params): Params,
) -> Result<Json<Vec<Value>>, ApiError> {
    let table = table(&name)?;
    let filter = parse_filter(&params)?;
    Ok(Json(store.delete(table, &filter).await?))
}

/// REST and realtime routes behind the API key check
pub fn router(store: MemoryStore, api_key: Arc<ApiKeyConfig>) -> Router {
    Router::new()
        .route(
            &format!("{}/{{table}}", REST_PREFIX),
            get(select_rows)
                .post(insert_rows)
                .patch(update_rows)
                .delete(delete_rows),
        )
        .route(REALTIME_PATH, get(ws::realtime_handler))
        // browsers cannot set headers on a WebSocket, so the key may come as a query param
        .layer(middleware::from_fn_with_state(api_key, api_key_middleware))
        .with_state(store)
}
