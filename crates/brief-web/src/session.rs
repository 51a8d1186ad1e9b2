use axum::{
    extract::FromRequestParts,
    http::{request::Parts, StatusCode},
};
use axum_extra::extract::cookie::{Cookie, SameSite};
use axum_extra::extract::CookieJar;
use uuid::Uuid;

use crate::state::AppState;

const SESSION_COOKIE_NAME: &str = "meeting_brief_session";

/// Extractor that provides the caller's session from cookies
///
/// A missing or malformed cookie starts a new session.
#[derive(Debug, Clone, Copy)]
pub struct Session(pub Uuid);

impl Session {
    /// Identity the caller's tools are bound to
    pub fn user_id(&self) -> String {
        format!("user-{}", self.0)
    }
}

impl FromRequestParts<AppState> for Session {
    type Rejection = (StatusCode, &'static str);

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let jar = CookieJar::from_request_parts(parts, state)
            .await
            .map_err(|_| (StatusCode::INTERNAL_SERVER_ERROR, "Failed to read cookies"))?;

        let session_id = jar
            .get(SESSION_COOKIE_NAME)
            .and_then(|cookie| cookie.value().parse::<Uuid>().ok())
            .unwrap_or_else(Uuid::new_v4);

        Ok(Session(session_id))
    }
}

/// Cookie to set on response so the session survives
pub fn session_cookie(session: Session) -> Cookie<'static> {
    Cookie::build((SESSION_COOKIE_NAME, session.0.to_string()))
        .path("/")
        .http_only(true)
        .same_site(SameSite::Strict)
        .build()
}
