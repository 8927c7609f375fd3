//! Email binding management: add via attribute disclosure, scheduled
//! removal with a confirmation notice.

use axum::extract::Extension;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use serde_json::json;
use std::sync::Arc;
use tracing::{error, info};

use super::session::{authenticated_session, refresh_session_cookie};
use super::state::ConsoleState;
use crate::api::error::ApiError;
use crate::db::LogEventKind;
use crate::disclosure::{
    DisclosureRequest, ProofStatus, Qr, ResultCallback, SessionResult, SessionStatus,
};

/// Start a disclosure session asking for an email attribute to bind to the
/// current account.
#[utoipa::path(
    post,
    path = "/email/add",
    responses(
        (status = 200, description = "Disclosure session started", body = Qr),
        (status = 400, description = "Not logged in")
    ),
    tag = "console"
)]
pub async fn add_email(
    Extension(state): Extension<Arc<ConsoleState>>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let session = authenticated_session(&state, &headers).await?;
    let mut data = session.lock().await;
    data.user_id
        .ok_or_else(|| ApiError::invalid_request("not logged in"))?;

    let callback_state = Arc::clone(&state);
    let callback_token = session.token().to_string();
    let callback: ResultCallback = Box::new(move |result| {
        Box::pin(process_add_email_disclosure(
            callback_state,
            callback_token,
            result,
        ))
    });

    let request = DisclosureRequest {
        attributes: state.config.email_attributes().to_vec(),
    };
    let qr = state
        .engine
        .start_disclosure(request, callback)
        .await
        .map_err(|err| {
            error!("failed to start disclosure session for adding email address: {err}");
            ApiError::internal(err)
        })?;

    let headers = refresh_session_cookie(&state.config, &mut data, session.token());
    Ok((StatusCode::OK, headers, Json(qr)).into_response())
}

/// Apply a finished email disclosure to the session's account.
async fn process_add_email_disclosure(
    state: Arc<ConsoleState>,
    session_token: String,
    result: SessionResult,
) {
    let Some(session) = state.sessions.get(&session_token).await else {
        info!("console session expired during disclosure session");
        return;
    };
    let mut data = session.lock().await;

    let Some(user_id) = data.user_id else {
        error!("unexpected logged out session during email address add");
        return;
    };
    if result.status != SessionStatus::Done {
        return;
    }
    if result.proof_status != ProofStatus::Valid {
        info!("received invalid email attribute");
        data.pending_error = Some(ApiError::InvalidProofs);
        return;
    }
    let Some(email) = result.first_raw_value() else {
        info!("disclosure session finished without an email attribute");
        data.pending_error = Some(ApiError::InvalidProofs);
        return;
    };

    if let Err(err) = state.db.add_email(user_id, email).await {
        error!("could not add email address to user: {err}");
        data.pending_error = Some(ApiError::internal(err));
        return;
    }
    if let Err(err) = state
        .db
        .add_log(user_id, LogEventKind::EmailAdded, Some(json!({ "email": email })))
        .await
    {
        error!("could not append email log entry: {err}");
    }
}

/// Schedule removal of one of the account's active email addresses.
#[utoipa::path(
    post,
    path = "/email/remove",
    request_body = String,
    responses(
        (status = 204, description = "Removal scheduled"),
        (status = 400, description = "Email address not bound to this account")
    ),
    tag = "console"
)]
pub async fn remove_email(
    Extension(state): Extension<Arc<ConsoleState>>,
    headers: HeaderMap,
    payload: Option<Json<String>>,
) -> Result<Response, ApiError> {
    let session = authenticated_session(&state, &headers).await?;
    let mut data = session.lock().await;
    let user_id = data
        .user_id
        .ok_or_else(|| ApiError::invalid_request("not logged in"))?;
    let Some(Json(email)) = payload else {
        return Err(ApiError::invalid_request("missing request body"));
    };

    let info = state.db.user_information(user_id).await.map_err(|err| {
        error!("error checking whether email address can be removed: {err}");
        ApiError::from(err)
    })?;
    if !info.emails.iter().any(|e| e.email == email) {
        info!("malformed request: invalid email address to delete");
        return Err(ApiError::InvalidEmail);
    }

    if let Some(mailer) = &state.mailer {
        mailer
            .send_email_removed(&email, &info.username, &info.language)
            .map_err(|err| {
                error!("could not send email removal notice: {err}");
                ApiError::internal(err)
            })?;
    }

    state
        .db
        .remove_email(user_id, &email, state.config.deletion_grace())
        .await
        .map_err(|err| {
            error!("error removing user email address: {err}");
            ApiError::from(err)
        })?;
    if let Err(err) = state
        .db
        .add_log(user_id, LogEventKind::EmailRemoved, Some(json!({ "email": email })))
        .await
    {
        error!("could not append email removal log entry: {err}");
    }

    let headers = refresh_session_cookie(&state.config, &mut data, session.token());
    Ok((StatusCode::NO_CONTENT, headers).into_response())
}
