//! Client-visible error taxonomy for the account console.
//!
//! Every error kind is surfaced distinctly so frontends can react to them;
//! the body shape is `{status, error, description}`.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use serde::Serialize;
use tracing::error;
use utoipa::ToSchema;

use crate::db::StoreError;

#[derive(Clone, Debug, thiserror::Error)]
pub enum ApiError {
    #[error("user not found")]
    UserNotFound,
    #[error("user is not registered")]
    UserNotRegistered,
    #[error("user already exists")]
    UserAlreadyExists,
    #[error("stored user record is invalid")]
    InvalidRecord,
    #[error("token not found or expired")]
    TokenNotFound,
    #[error("email address not known")]
    EmailNotFound,
    #[error("email address not associated with account")]
    InvalidEmail,
    #[error("disclosed attribute proofs were invalid")]
    InvalidProofs,
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("internal error")]
    Internal(String),
}

impl ApiError {
    pub fn invalid_request(description: impl Into<String>) -> Self {
        Self::InvalidRequest(description.into())
    }

    pub fn internal(cause: impl std::fmt::Display) -> Self {
        Self::Internal(cause.to_string())
    }

    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::UserNotFound => "USER_NOT_FOUND",
            Self::UserNotRegistered => "USER_NOT_REGISTERED",
            Self::UserAlreadyExists => "USER_ALREADY_EXISTS",
            Self::InvalidRecord => "INVALID_RECORD",
            Self::TokenNotFound => "TOKEN_NOT_FOUND",
            Self::EmailNotFound => "EMAIL_NOT_FOUND",
            Self::InvalidEmail => "INVALID_EMAIL",
            Self::InvalidProofs => "INVALID_PROOFS",
            Self::InvalidRequest(_) => "INVALID_REQUEST",
            Self::Internal(_) => "INTERNAL_ERROR",
        }
    }

    #[must_use]
    pub fn status(&self) -> StatusCode {
        match self {
            Self::UserNotFound
            | Self::TokenNotFound
            | Self::EmailNotFound
            | Self::InvalidEmail
            | Self::InvalidProofs
            | Self::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            Self::UserNotRegistered => StatusCode::FORBIDDEN,
            Self::UserAlreadyExists => StatusCode::CONFLICT,
            Self::InvalidRecord | Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn description(&self) -> String {
        match self {
            // Internal causes are logged, never shipped to clients.
            Self::Internal(_) => "internal error".to_string(),
            other => other.to_string(),
        }
    }
}

#[derive(Debug, Serialize, ToSchema)]
pub struct ErrorBody {
    pub status: u16,
    pub error: String,
    pub description: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if let Self::Internal(cause) = &self {
            error!("internal error: {cause}");
        }
        let status = self.status();
        let body = ErrorBody {
            status: status.as_u16(),
            error: self.code().to_string(),
            description: self.description(),
        };
        (status, Json(body)).into_response()
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::UserNotFound => Self::UserNotFound,
            StoreError::UserAlreadyExists => Self::UserAlreadyExists,
            StoreError::InvalidRecord => Self::InvalidRecord,
            StoreError::TokenNotFound => Self::TokenNotFound,
            StoreError::EmailNotFound => Self::EmailNotFound,
            StoreError::Internal(cause) => Self::Internal(cause.to_string()),
        }
    }
}
