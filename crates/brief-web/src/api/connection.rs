use axum::{
    extract::{Path, Query, State},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use axum_extra::extract::CookieJar;
use brief_core::{BrokerError, ConnectionStatus, Error, Identity, StageScope};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::{present, ApiError};
use crate::session::{session_cookie, Session};
use crate::state::AppState;

const STATUS_CHECK_FAILED: &str = "Failed to check connection status";

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/{toolkit}", post(initiate_connection))
        .route("/{toolkit}/status", get(connection_status))
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionParams {
    pub api_key: Option<String>,
    /// Whose connection to manage; defaults to the scope of the stage using
    /// the toolkit
    pub scope: Option<StageScope>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InitiateResponse {
    pub status: ConnectionStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub redirect_url: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub connected: bool,
    pub status: ConnectionStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Identity the connection belongs to: the shared identity for toolkits used
/// by shared stages, otherwise the session user with the caller's key.
fn connection_identity(
    state: &AppState,
    session: Session,
    toolkit: &str,
    params: ConnectionParams,
) -> Result<Identity, ApiError> {
    let scope = params
        .scope
        .or_else(|| state.pipeline.scope_of_toolkit(toolkit))
        .unwrap_or(StageScope::Caller);

    match scope {
        StageScope::Shared => state
            .orchestrator
            .shared_identity()
            .cloned()
            .ok_or_else(|| Error::MissingCredential("shared".to_string()).into()),
        StageScope::Caller => {
            let key = present(params.api_key)
                .ok_or_else(|| Error::MissingCredential("caller".to_string()))?;
            Ok(Identity::new(session.user_id(), key))
        }
    }
}

fn broker_failure(toolkit: &str, error: BrokerError) -> ApiError {
    ApiError(if error.is_access_denied() {
        Error::UnauthorizedCapability {
            capability: toolkit.to_string(),
            toolkit: toolkit.to_string(),
            reason: error.to_string(),
        }
    } else {
        Error::Unknown(format!("Failed to initiate {toolkit} connection: {error}"))
    })
}

async fn initiate_connection(
    State(state): State<AppState>,
    session: Session,
    jar: CookieJar,
    Path(toolkit): Path<String>,
    Json(params): Json<ConnectionParams>,
) -> impl IntoResponse {
    let result = initiate(&state, session, &toolkit, params).await;
    (jar.add(session_cookie(session)), result)
}

async fn initiate(
    state: &AppState,
    session: Session,
    toolkit: &str,
    params: ConnectionParams,
) -> Result<Json<InitiateResponse>, ApiError> {
    let identity = connection_identity(state, session, toolkit, params)?;

    let request = state
        .broker
        .initiate(&identity, toolkit)
        .await
        .map_err(|e| broker_failure(toolkit, e))?;

    info!(user_id = %identity.user_id, %toolkit, "Connection request pending");
    let response = InitiateResponse {
        status: request.status,
        redirect_url: request.redirect_url.clone(),
    };
    state
        .connections
        .insert((identity.user_id, toolkit.to_string()), request)
        .await;

    Ok(Json(response))
}

async fn connection_status(
    State(state): State<AppState>,
    session: Session,
    Path(toolkit): Path<String>,
    Query(params): Query<ConnectionParams>,
) -> Result<Json<StatusResponse>, ApiError> {
    let identity = connection_identity(&state, session, &toolkit, params)?;
    let key = (identity.user_id.clone(), toolkit.clone());

    let remote = match state.broker.status(&identity, &toolkit).await {
        Ok(remote) => remote,
        Err(e) => {
            warn!(user_id = %identity.user_id, %toolkit, "Connection status check failed: {e}");
            return Ok(Json(StatusResponse {
                connected: false,
                status: ConnectionStatus::Disconnected,
                error: Some(STATUS_CHECK_FAILED.to_string()),
            }));
        }
    };

    let status = match remote {
        ConnectionStatus::Disconnected if state.connections.contains_key(&key) => {
            ConnectionStatus::Initializing
        }
        ConnectionStatus::Active => {
            state.connections.invalidate(&key).await;
            ConnectionStatus::Active
        }
        other => other,
    };

    Ok(Json(StatusResponse {
        connected: status.is_active(),
        status,
        error: None,
    }))
}
