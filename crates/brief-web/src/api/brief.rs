use axum::{extract::State, response::IntoResponse, routing::post, Json, Router};
use axum_extra::extract::CookieJar;
use brief_core::brief::{CALENDAR_ID_PARAMETER, DEFAULT_CALENDAR_ID};
use brief_core::{Error, Identity, PipelineContext, PipelineRequest};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::{present, ApiError};
use crate::session::{session_cookie, Session};
use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new().route("/", post(create_brief))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BriefRequest {
    #[serde(alias = "apiKey")]
    pub caller_credential: Option<String>,
    /// Overrides the session identity
    pub identity: Option<String>,
    pub calendar_id: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BriefResponse {
    pub stage_outputs: PipelineContext,
    pub report: String,
}

async fn create_brief(
    State(state): State<AppState>,
    session: Session,
    jar: CookieJar,
    Json(req): Json<BriefRequest>,
) -> impl IntoResponse {
    let result = run_brief(&state, session, req).await;
    (jar.add(session_cookie(session)), result)
}

async fn run_brief(
    state: &AppState,
    session: Session,
    req: BriefRequest,
) -> Result<Json<BriefResponse>, ApiError> {
    let credential = present(req.caller_credential)
        .ok_or_else(|| Error::MissingCredential("caller".to_string()))?;
    let user_id = present(req.identity).unwrap_or_else(|| session.user_id());
    let calendar_id = present(req.calendar_id).unwrap_or_else(|| DEFAULT_CALENDAR_ID.to_string());

    info!(%user_id, "Meeting brief requested");

    let request = PipelineRequest::new(Identity::new(user_id, credential))
        .with_parameter(CALENDAR_ID_PARAMETER, calendar_id);

    // Dropping the handler (client went away) cancels the run.
    let cancel = CancellationToken::new();
    let _guard = cancel.clone().drop_guard();

    let context = state
        .orchestrator
        .execute(&request, &state.pipeline, cancel)
        .await
        .inspect_err(|e| warn!(kind = %e.kind(), stage = ?e.stage(), "Meeting brief failed: {e}"))?;

    let report = context.last().unwrap_or_default().to_string();

    Ok(Json(BriefResponse {
        stage_outputs: context,
        report,
    }))
}
