use axum::{extract::State, response::IntoResponse, routing::get, Json, Router};
use brief_core::StageScope;
use serde::Serialize;

use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new().route("/", get(get_config))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StageInfo {
    pub name: String,
    pub scope: StageScope,
    pub tools: Vec<String>,
    pub step_budget: usize,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigResponse {
    pub model: String,
    pub request_timeout_secs: u64,
    pub shared_credential: bool,
    pub stages: Vec<StageInfo>,
}

async fn get_config(State(state): State<AppState>) -> impl IntoResponse {
    let stages = state
        .pipeline
        .stages()
        .iter()
        .map(|stage| StageInfo {
            name: stage.name.clone(),
            scope: stage.scope,
            tools: stage.tool_names.iter().cloned().collect(),
            step_budget: stage.step_budget,
        })
        .collect();

    Json(ConfigResponse {
        model: state.orchestrator.runner().model().name().to_string(),
        request_timeout_secs: state.config.request_timeout_secs,
        shared_credential: state.config.composio.api_key.is_some(),
        stages,
    })
}
