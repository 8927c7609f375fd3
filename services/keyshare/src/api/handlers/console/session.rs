//! Session cookie plumbing, logout and `/checksession`.

use axum::extract::Extension;
use axum::http::header::{InvalidHeaderValue, COOKIE, SET_COOKIE};
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use std::sync::Arc;
use std::time::Instant;
use tracing::info;

use super::state::{ConsoleConfig, ConsoleState};
use crate::api::error::ApiError;
use crate::sessions::{Session, SessionData};

pub(crate) const SESSION_COOKIE_NAME: &str = "session";

/// Build the session cookie for `token`, `Secure` only in production.
pub(crate) fn session_cookie(
    config: &ConsoleConfig,
    token: &str,
) -> Result<HeaderValue, InvalidHeaderValue> {
    let max_age = config.session_lifetime_seconds();
    let mut cookie =
        format!("{SESSION_COOKIE_NAME}={token}; Path=/; HttpOnly; Max-Age={max_age}");
    if config.session_cookie_secure() {
        cookie.push_str("; Secure");
    }
    HeaderValue::from_str(&cookie)
}

pub(crate) fn clear_session_cookie(
    config: &ConsoleConfig,
) -> Result<HeaderValue, InvalidHeaderValue> {
    let mut cookie = format!("{SESSION_COOKIE_NAME}=; Path=/; HttpOnly; Max-Age=-1");
    if config.session_cookie_secure() {
        cookie.push_str("; Secure");
    }
    HeaderValue::from_str(&cookie)
}

pub(crate) fn session_token_from_headers(headers: &HeaderMap) -> Option<String> {
    let header = headers.get(COOKIE)?;
    let value = header.to_str().ok()?;
    for pair in value.split(';') {
        let mut parts = pair.trim().splitn(2, '=');
        let key = parts.next()?.trim();
        let val = parts.next()?.trim();
        if key == SESSION_COOKIE_NAME {
            return Some(val.to_string());
        }
    }
    None
}

pub(crate) async fn session_from_headers(
    state: &ConsoleState,
    headers: &HeaderMap,
) -> Option<Arc<Session>> {
    let token = session_token_from_headers(headers)?;
    state.sessions.get(&token).await
}

/// Resolve the cookie to a live session or refuse the request.
pub(crate) async fn authenticated_session(
    state: &ConsoleState,
    headers: &HeaderMap,
) -> Result<Arc<Session>, ApiError> {
    match session_from_headers(state, headers).await {
        Some(session) => Ok(session),
        None => {
            info!("malformed request: user not logged in");
            Err(ApiError::invalid_request("not logged in"))
        }
    }
}

/// Extend the session and emit a refreshed cookie, as every authenticated
/// handler does on success.
pub(crate) fn refresh_session_cookie(
    config: &ConsoleConfig,
    data: &mut SessionData,
    token: &str,
) -> HeaderMap {
    data.expiry = Instant::now() + config.session_lifetime();
    let mut headers = HeaderMap::new();
    if let Ok(cookie) = session_cookie(config, token) {
        headers.insert(SET_COOKIE, cookie);
    }
    headers
}

/// Log the session out.
#[utoipa::path(
    post,
    path = "/logout",
    responses(
        (status = 204, description = "Session invalidated and cookie cleared")
    ),
    tag = "console"
)]
pub async fn logout(
    Extension(state): Extension<Arc<ConsoleState>>,
    headers: HeaderMap,
) -> impl IntoResponse {
    if let Some(session) = session_from_headers(&state, &headers).await {
        session.lock().await.user_id = None;
    }

    // Always clear the cookie, even without a live session.
    let mut response_headers = HeaderMap::new();
    if let Ok(cookie) = clear_session_cookie(&state.config) {
        response_headers.insert(SET_COOKIE, cookie);
    }
    (StatusCode::NO_CONTENT, response_headers)
}

/// Report the session state.
///
/// A pending error parked by a disclosure callback takes precedence over
/// the expired/ok distinction and is consumed by this call.
#[utoipa::path(
    post,
    path = "/checksession",
    responses(
        (status = 200, description = "\"ok\", \"expired\", or a parked disclosure error")
    ),
    tag = "console"
)]
pub async fn check_session(
    Extension(state): Extension<Arc<ConsoleState>>,
    headers: HeaderMap,
) -> Response {
    let Some(session) = session_from_headers(&state, &headers).await else {
        return Json("expired").into_response();
    };

    let mut data = session.lock().await;
    if let Some(err) = data.pending_error.take() {
        return err.into_response();
    }
    if data.user_id.is_none() {
        Json("expired").into_response()
    } else {
        Json("ok").into_response()
    }
}
