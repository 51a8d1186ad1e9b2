mod brief;
mod config;
mod connection;

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json, Router,
};
use brief_core::{Error, ErrorKind};
use serde::Serialize;

use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .nest("/meeting-brief", brief::router())
        .nest("/config", config::router())
        .nest("/connection", connection::router())
}

/// Pipeline failure rendered as `{ kind, message, stage? }`
#[derive(Debug)]
pub struct ApiError(pub Error);

#[derive(Debug, Serialize)]
struct ErrorBody {
    kind: ErrorKind,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    stage: Option<String>,
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self.0.kind() {
            ErrorKind::MissingCredential => StatusCode::BAD_REQUEST,
            ErrorKind::UnauthorizedCapability | ErrorKind::InvocationRejected => StatusCode::FORBIDDEN,
            ErrorKind::UnknownCapability => StatusCode::UNPROCESSABLE_ENTITY,
            ErrorKind::ModelUnavailable | ErrorKind::ToolExecutionFailure => StatusCode::BAD_GATEWAY,
            ErrorKind::Cancelled => StatusCode::GATEWAY_TIMEOUT,
            ErrorKind::StepBudgetExceeded | ErrorKind::UnknownFailure => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl From<Error> for ApiError {
    fn from(error: Error) -> Self {
        Self(error)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = ErrorBody {
            kind: self.0.kind(),
            message: self.0.to_string(),
            stage: self.0.stage().map(str::to_string),
        };
        (status, Json(body)).into_response()
    }
}

/// Treat blank strings from request bodies as absent.
fn present(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}
