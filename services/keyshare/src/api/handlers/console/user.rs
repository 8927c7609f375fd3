//! Authenticated account endpoints: overview, log history, deletion.

use axum::extract::{Extension, Path};
use axum::http::header::SET_COOKIE;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use std::sync::Arc;
use tracing::error;

use super::session::{authenticated_session, refresh_session_cookie};
use super::state::ConsoleState;
use crate::api::error::ApiError;
use crate::db::{LogEntry, LogEventKind, UserInformation};

/// Number of log entries per page.
const LOG_PAGE_SIZE: i64 = 11;

/// Account overview: username, language, deletion state, active emails.
#[utoipa::path(
    get,
    path = "/user",
    responses(
        (status = 200, description = "Account overview", body = UserInformation),
        (status = 400, description = "Not logged in")
    ),
    tag = "console"
)]
pub async fn user_info(
    Extension(state): Extension<Arc<ConsoleState>>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let session = authenticated_session(&state, &headers).await?;
    let mut data = session.lock().await;
    let user_id = data
        .user_id
        .ok_or_else(|| ApiError::invalid_request("not logged in"))?;

    let info = state.db.user_information(user_id).await.map_err(|err| {
        error!("problem fetching user information from database: {err}");
        ApiError::from(err)
    })?;

    let headers = refresh_session_cookie(&state.config, &mut data, session.token());
    Ok((StatusCode::OK, headers, Json(info)).into_response())
}

/// One page of the account's log history, newest first.
#[utoipa::path(
    get,
    path = "/user/logs/{offset}",
    params(
        ("offset" = i64, Path, description = "Number of entries to skip")
    ),
    responses(
        (status = 200, description = "Log entries", body = [LogEntry]),
        (status = 400, description = "Not logged in or malformed offset")
    ),
    tag = "console"
)]
pub async fn user_logs(
    Extension(state): Extension<Arc<ConsoleState>>,
    headers: HeaderMap,
    Path(offset): Path<i64>,
) -> Result<Response, ApiError> {
    let session = authenticated_session(&state, &headers).await?;
    let mut data = session.lock().await;
    let user_id = data
        .user_id
        .ok_or_else(|| ApiError::invalid_request("not logged in"))?;
    if offset < 0 {
        return Err(ApiError::invalid_request("malformed offset"));
    }

    let entries = state
        .db
        .logs(user_id, offset, LOG_PAGE_SIZE)
        .await
        .map_err(|err| {
            error!("could not load log entries: {err}");
            ApiError::from(err)
        })?;

    let headers = refresh_session_cookie(&state.config, &mut data, session.token());
    Ok((StatusCode::OK, headers, Json(entries)).into_response())
}

/// Request account deletion: notify the bound addresses, soft-delete the
/// account with the configured grace delay, and log the session out.
#[utoipa::path(
    post,
    path = "/user/delete",
    responses(
        (status = 204, description = "Deletion scheduled; session logged out"),
        (status = 400, description = "Not logged in or already deleted")
    ),
    tag = "console"
)]
pub async fn delete_user(
    Extension(state): Extension<Arc<ConsoleState>>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let session = authenticated_session(&state, &headers).await?;
    let mut data = session.lock().await;
    let user_id = data
        .user_id
        .ok_or_else(|| ApiError::invalid_request("not logged in"))?;

    if let Some(mailer) = &state.mailer {
        let info = state.db.user_information(user_id).await.map_err(|err| {
            error!("could not fetch user information: {err}");
            ApiError::from(err)
        })?;
        let recipients: Vec<String> = info.emails.iter().map(|e| e.email.clone()).collect();
        mailer
            .send_account_removed(&recipients, &info.username, &info.language)
            .map_err(|err| {
                error!("could not send account deletion notices: {err}");
                ApiError::internal(err)
            })?;
    }

    state
        .db
        .remove_user(user_id, state.config.deletion_grace())
        .await
        .map_err(|err| {
            error!("problem removing user: {err}");
            ApiError::from(err)
        })?;
    if let Err(err) = state
        .db
        .add_log(user_id, LogEventKind::AccountRemoved, None)
        .await
    {
        error!("could not append account removal log entry: {err}");
    }

    // Log out and clear the cookie.
    data.user_id = None;
    drop(data);
    let mut response_headers = HeaderMap::new();
    if let Ok(cookie) = super::session::clear_session_cookie(&state.config) {
        response_headers.insert(SET_COOKIE, cookie);
    }
    Ok((StatusCode::NO_CONTENT, response_headers).into_response())
}
