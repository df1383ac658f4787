//! Public API key check for the store endpoints

use axum::{
    body::Body,
    extract::{Query, State},
    http::{header, Request, Response, StatusCode},
    middleware::Next,
};
use std::collections::HashMap;
use std::sync::Arc;

use crate::config::env_value;
use crate::protocol::API_KEY_HEADER;

/// Key clients must present (None = check disabled)
#[derive(Debug, Clone)]
pub struct ApiKeyConfig {
    pub key: Option<String>,
}

impl ApiKeyConfig {
    /// PARTYROOM_STORE_ANON_KEY, the same value clients are configured with
    pub fn from_env() -> Self {
        let key = env_value("PARTYROOM_STORE_ANON_KEY");
        if key.is_some() {
            tracing::info!("API key check enabled");
        } else {
            tracing::warn!("API key check DISABLED - anyone can read and write every room!");
        }
        Self { key }
    }

    pub fn is_enabled(&self) -> bool {
        self.key.is_some()
    }

    pub fn validate(&self, candidate: &str) -> bool {
        match &self.key {
            // Use constant-time comparison to prevent timing attacks
            Some(key) => constant_time_eq(key.as_bytes(), candidate.as_bytes()),
            None => true,
        }
    }
}

/// Constant-time byte comparison
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut result = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        result |= x ^ y;
    }
    result == 0
}

/// Keys offered by a request: `apikey` header, bearer token, `apikey` query
/// parameter (WebSocket clients in browsers cannot set headers)
fn offered_keys(request: &Request<Body>) -> Vec<String> {
    let mut keys = Vec::new();
    let headers = request.headers();
    if let Some(value) = headers.get(API_KEY_HEADER).and_then(|v| v.to_str().ok()) {
        keys.push(value.to_string());
    }
    if let Some(token) = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
    {
        keys.push(token.to_string());
    }
    if let Ok(Query(params)) = Query::<HashMap<String, String>>::try_from_uri(request.uri()) {
        if let Some(value) = params.get(API_KEY_HEADER) {
            keys.push(value.clone());
        }
    }
    keys
}

/// Middleware rejecting store requests without the configured key
pub async fn api_key_middleware(
    State(config): State<Arc<ApiKeyConfig>>,
    request: Request<Body>,
    next: Next,
) -> Response<Body> {
    if !config.is_enabled() {
        return next.run(request).await;
    }

    if offered_keys(&request).iter().any(|key| config.validate(key)) {
        return next.run(request).await;
    }

    tracing::debug!("Rejected {} {} without a valid key", request.method(), request.uri().path());
    let mut response = Response::new(Body::from(r#"{"message":"invalid api key"}"#));
    *response.status_mut() = StatusCode::UNAUTHORIZED;
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        header::HeaderValue::from_static("application/json"),
    );
    response
}
