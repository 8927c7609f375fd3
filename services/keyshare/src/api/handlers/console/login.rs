//! Console login flows: attribute disclosure, email links, and email
//! verification tokens.

use axum::extract::Extension;
use axum::http::header::SET_COOKIE;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use std::sync::Arc;
use tracing::{error, info};

use super::session::session_cookie;
use super::state::ConsoleState;
use super::types::{EmailLoginRequest, TokenLoginRequest};
use crate::api::email::Mailer;
use crate::api::error::ApiError;
use crate::db::{with_tx, AccountTx, LogEventKind, LoginCandidate, StoreError};
use crate::disclosure::{
    DisclosureRequest, ProofStatus, Qr, ResultCallback, SessionResult, SessionStatus,
};
use crate::sessions::generate_token;

/// Basic email format check, applied before the database is consulted.
fn valid_email(email: &str) -> bool {
    regex::Regex::new(r"^[^@\s]+@[^@\s]+$").is_ok_and(|regex| regex.is_match(email))
}

/// Start an attribute-disclosure login session.
///
/// The response carries the engine's QR payload; the disclosure result
/// arrives later through a callback keyed to the anonymous session minted
/// here.
#[utoipa::path(
    post,
    path = "/login/irma",
    responses(
        (status = 200, description = "Disclosure session started", body = Qr),
        (status = 500, description = "Engine refused the session")
    ),
    tag = "console"
)]
pub async fn login_irma(
    Extension(state): Extension<Arc<ConsoleState>>,
) -> Result<Response, ApiError> {
    let session = state.sessions.create().await;
    let token = session.token().to_string();

    let callback_state = Arc::clone(&state);
    let callback_token = token.clone();
    let callback: ResultCallback = Box::new(move |result| {
        Box::pin(process_login_disclosure(callback_state, callback_token, result))
    });

    let request = DisclosureRequest {
        attributes: state.config.keyshare_attributes().to_vec(),
    };
    let qr = state
        .engine
        .start_disclosure(request, callback)
        .await
        .map_err(|err| {
            error!("failed to start disclosure session for login: {err}");
            ApiError::internal(err)
        })?;

    let mut headers = HeaderMap::new();
    if let Ok(cookie) = session_cookie(&state.config, &token) {
        headers.insert(SET_COOKIE, cookie);
    }
    Ok((StatusCode::OK, headers, Json(qr)).into_response())
}

/// Apply a finished login disclosure to the session it belongs to. Runs on
/// a task owned by the engine; failures are parked in the session for the
/// next `/checksession`.
async fn process_login_disclosure(
    state: Arc<ConsoleState>,
    session_token: String,
    result: SessionResult,
) {
    let Some(session) = state.sessions.get(&session_token).await else {
        info!("console session expired during disclosure session");
        return;
    };
    let mut data = session.lock().await;

    if result.status != SessionStatus::Done {
        // Incomplete attempts are the frontend's concern.
        return;
    }
    if result.proof_status != ProofStatus::Valid {
        info!("received invalid login attribute");
        data.pending_error = Some(ApiError::InvalidProofs);
        return;
    }
    let Some(username) = result.first_raw_value() else {
        info!("disclosure session finished without a login attribute");
        data.pending_error = Some(ApiError::InvalidProofs);
        return;
    };

    match state.db.user_id(username).await {
        Ok(user_id) => {
            data.user_id = Some(user_id);
            if let Err(err) = state.db.add_log(user_id, LogEventKind::IrmaSession, None).await {
                error!("could not append login log entry: {err}");
            }
            if let Err(err) = state.db.set_seen(user_id).await {
                error!("could not update last seen date: {err}");
            }
        }
        Err(StoreError::UserNotFound) => {
            data.pending_error = Some(ApiError::UserNotRegistered);
        }
        Err(err) => {
            error!("error while resolving disclosed username: {err}");
            data.pending_error = Some(ApiError::internal(err));
        }
    }
}

/// Send a one-time login link to a known email address.
#[utoipa::path(
    post,
    path = "/login/email",
    request_body = EmailLoginRequest,
    responses(
        (status = 204, description = "Login email sent"),
        (status = 400, description = "Email address not known"),
        (status = 500, description = "Email support disabled or sending failed")
    ),
    tag = "console"
)]
pub async fn login_email(
    Extension(state): Extension<Arc<ConsoleState>>,
    payload: Option<Json<EmailLoginRequest>>,
) -> Result<StatusCode, ApiError> {
    let Some(mailer) = state.mailer.as_ref() else {
        return Err(ApiError::Internal(
            "email support not enabled in configuration".to_string(),
        ));
    };
    let Some(Json(request)) = payload else {
        return Err(ApiError::invalid_request("missing request body"));
    };
    if !valid_email(&request.email) {
        return Err(ApiError::invalid_request("malformed email address"));
    }

    with_tx(state.db.as_ref(), |mut tx| async move {
        let result = send_login_email(tx.as_mut(), mailer, &request).await;
        (tx, result)
    })
    .await?;

    Ok(StatusCode::NO_CONTENT)
}

/// Issue a login token and mail it, inside one transaction: a failed send
/// must not leave a live login token behind.
async fn send_login_email(
    tx: &mut dyn AccountTx,
    mailer: &Mailer,
    request: &EmailLoginRequest,
) -> Result<(), ApiError> {
    let token = generate_token();
    tx.add_email_login_token(&request.email, &token)
        .await
        .map_err(|err| match err {
            StoreError::EmailNotFound => ApiError::EmailNotFound,
            other => {
                error!("error adding login token to database: {other}");
                ApiError::from(other)
            }
        })?;
    mailer
        .send_login_email(&request.email, &request.language, &token)
        .map_err(|err| {
            error!("could not send login email: {err}");
            ApiError::internal(err)
        })
}

/// List the users that a login token could sign in.
#[utoipa::path(
    post,
    path = "/login/token/candidates",
    request_body = String,
    responses(
        (status = 200, description = "Users owning the token's email address", body = [LoginCandidate]),
        (status = 400, description = "Token unknown or expired")
    ),
    tag = "console"
)]
pub async fn login_token_candidates(
    Extension(state): Extension<Arc<ConsoleState>>,
    payload: Option<Json<String>>,
) -> Result<Json<Vec<LoginCandidate>>, ApiError> {
    let Some(Json(token)) = payload else {
        return Err(ApiError::invalid_request("missing request body"));
    };
    let candidates = state
        .db
        .login_token_candidates(&token)
        .await
        .map_err(|err| match err {
            StoreError::UserNotFound => ApiError::UserNotFound,
            other => {
                error!("could not retrieve candidates for token: {other}");
                ApiError::from(other)
            }
        })?;
    Ok(Json(candidates))
}

/// Consume a login token for the chosen user and mint an authenticated
/// session.
#[utoipa::path(
    post,
    path = "/login/token",
    request_body = TokenLoginRequest,
    responses(
        (status = 204, description = "Logged in; session cookie set"),
        (status = 400, description = "Token invalid for this user")
    ),
    tag = "console"
)]
pub async fn login_token(
    Extension(state): Extension<Arc<ConsoleState>>,
    payload: Option<Json<TokenLoginRequest>>,
) -> Result<Response, ApiError> {
    let Some(Json(request)) = payload else {
        return Err(ApiError::invalid_request("missing request body"));
    };

    let user_id = with_tx(state.db.as_ref(), |mut tx| async move {
        let result = process_token_login(tx.as_mut(), &request).await;
        (tx, result)
    })
    .await?;

    let session = state.sessions.create().await;
    session.lock().await.user_id = Some(user_id);

    let mut headers = HeaderMap::new();
    if let Ok(cookie) = session_cookie(&state.config, session.token()) {
        headers.insert(SET_COOKIE, cookie);
    }
    Ok((StatusCode::NO_CONTENT, headers).into_response())
}

async fn process_token_login(
    tx: &mut dyn AccountTx,
    request: &TokenLoginRequest,
) -> Result<i64, ApiError> {
    let user_id = tx
        .try_user_login_token(&request.token, &request.username)
        .await
        .map_err(|err| match err {
            StoreError::UserNotFound => ApiError::UserNotFound,
            other => {
                error!("could not log in user with token: {other}");
                ApiError::from(other)
            }
        })?;
    if let Err(err) = tx.set_seen(user_id).await {
        // Not relevant for the frontend.
        error!("could not update last seen date: {err}");
    }
    Ok(user_id)
}

/// Redeem an email verification token. Doubles as a login path right after
/// registration, so a fresh authenticated session is minted.
#[utoipa::path(
    post,
    path = "/verify",
    request_body = String,
    responses(
        (status = 204, description = "Email bound to the account; session cookie set"),
        (status = 400, description = "Token unknown or expired")
    ),
    tag = "console"
)]
pub async fn verify_email(
    Extension(state): Extension<Arc<ConsoleState>>,
    payload: Option<Json<String>>,
) -> Result<Response, ApiError> {
    let Some(Json(token)) = payload else {
        return Err(ApiError::invalid_request("missing request body"));
    };

    let user_id = with_tx(state.db.as_ref(), |mut tx| async move {
        let result = tx.verify_email_token(&token).await.map_err(|err| match err {
            StoreError::TokenNotFound => {
                info!("unknown email verification token");
                ApiError::TokenNotFound
            }
            other => {
                error!("could not verify email token: {other}");
                ApiError::from(other)
            }
        });
        (tx, result)
    })
    .await?;

    if let Err(err) = state.db.add_log(user_id, LogEventKind::EmailAdded, None).await {
        error!("could not append email log entry: {err}");
    }
    if let Err(err) = state.db.set_seen(user_id).await {
        error!("could not update last seen date: {err}");
    }

    let session = state.sessions.create().await;
    session.lock().await.user_id = Some(user_id);

    let mut headers = HeaderMap::new();
    if let Ok(cookie) = session_cookie(&state.config, session.token()) {
        headers.insert(SET_COOKIE, cookie);
    }
    Ok((StatusCode::NO_CONTENT, headers).into_response())
}
