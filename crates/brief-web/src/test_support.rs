//! Router harness over in-process fakes.

use std::sync::Arc;

use axum::body::{to_bytes, Body};
use axum::http::{header, HeaderMap, Request, StatusCode};
use brief_core::testing::{FakeBroker, ScriptedModel};
use serde_json::Value;
use tower::ServiceExt;

use crate::config::ServerConfig;
use crate::state::AppState;

pub fn state_with(model: &ScriptedModel, broker: &FakeBroker) -> AppState {
    let mut config = ServerConfig::default();
    config.composio.api_key = Some("ck-shared".to_string());

    AppState::with_parts(config, Arc::new(model.clone()), Arc::new(broker.clone())).unwrap()
}

async fn send(state: AppState, request: Request<Body>) -> (StatusCode, HeaderMap, Value) {
    let response = crate::app(state).oneshot(request).await.unwrap();
    let status = response.status();
    let headers = response.headers().clone();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, headers, body)
}

pub async fn get(state: AppState, uri: &str, cookie: Option<&str>) -> (StatusCode, HeaderMap, Value) {
    let mut builder = Request::get(uri);
    if let Some(cookie) = cookie {
        builder = builder.header(header::COOKIE, cookie);
    }
    send(state, builder.body(Body::empty()).unwrap()).await
}

pub async fn post_json(state: AppState, uri: &str, body: Value) -> (StatusCode, HeaderMap, Value) {
    post_json_with_cookie(state, uri, body, None).await
}

pub async fn post_json_with_cookie(
    state: AppState,
    uri: &str,
    body: Value,
    cookie: Option<&str>,
) -> (StatusCode, HeaderMap, Value) {
    let mut builder = Request::post(uri).header(header::CONTENT_TYPE, "application/json");
    if let Some(cookie) = cookie {
        builder = builder.header(header::COOKIE, cookie);
    }
    send(state, builder.body(Body::from(body.to_string())).unwrap()).await
}
