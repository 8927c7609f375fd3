//! Request types for the console endpoints.

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

#[derive(ToSchema, Serialize, Deserialize, Debug)]
pub struct EmailLoginRequest {
    pub email: String,
    pub language: String,
}

#[derive(ToSchema, Serialize, Deserialize, Debug)]
pub struct TokenLoginRequest {
    pub token: String,
    pub username: String,
}
