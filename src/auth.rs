//! # Authentication
//!
//! The companion front end authenticates with an operator bearer token and
//! forwards the already-authenticated end user in `X-User-Id`. Every download
//! route is scoped to that user.

use std::fmt;
use std::sync::Arc;

use axum::{
    extract::{FromRef, FromRequestParts, Request, State},
    http::{HeaderMap, header::AUTHORIZATION, request::Parts},
    middleware::Next,
    response::Response,
};
use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;
use utoipa::IntoParams;

use crate::config::AppConfig;
use crate::error::{ApiError, unauthorized, validation_error};
use crate::server::AppState;

/// Header carrying the authenticated end user
pub const USER_ID_HEADER: &str = "X-User-Id";

const MAX_USER_ID_LEN: usize = 256;

/// Owner identity for download jobs
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct UserId(pub String);

impl UserId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Extractor for the user id placed in request extensions by [`auth_middleware`]
#[derive(Debug, Clone)]
pub struct UserExtension(pub UserId);

impl FromRef<AppState> for Arc<AppConfig> {
    fn from_ref(app_state: &AppState) -> Self {
        Arc::clone(&app_state.config)
    }
}

/// Validates the operator bearer token and the user header
pub async fn auth_middleware(
    State(config): State<Arc<AppConfig>>,
    mut request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let token = extract_bearer_token(request.headers())?;
    validate_token(&config, token)?;

    let user = extract_user_id(request.headers())?;
    tracing::debug!(user_id = %user, "Authenticated request");

    request.extensions_mut().insert(UserExtension(user));
    Ok(next.run(request).await)
}

fn extract_bearer_token(headers: &HeaderMap) -> Result<&str, ApiError> {
    let header = headers
        .get(AUTHORIZATION)
        .ok_or_else(|| unauthorized(Some("Missing Authorization header")))?
        .to_str()
        .map_err(|_| unauthorized(Some("Invalid Authorization header")))?;

    header
        .strip_prefix("Bearer ")
        .ok_or_else(|| unauthorized(Some("Authorization header must use Bearer scheme")))
}

fn validate_token(config: &AppConfig, token: &str) -> Result<(), ApiError> {
    let is_valid = config
        .operator_tokens
        .iter()
        .any(|configured| ConstantTimeEq::ct_eq(token.as_bytes(), configured.as_bytes()).into());

    if is_valid {
        Ok(())
    } else {
        Err(unauthorized(Some("Invalid bearer token")))
    }
}

fn extract_user_id(headers: &HeaderMap) -> Result<UserId, ApiError> {
    let value = headers
        .get(USER_ID_HEADER)
        .ok_or_else(|| {
            validation_error(
                "Missing required header",
                serde_json::json!({ USER_ID_HEADER: "Required header is missing" }),
            )
        })?
        .to_str()
        .map_err(|_| {
            validation_error(
                "Invalid user header",
                serde_json::json!({ USER_ID_HEADER: "Header must be valid UTF-8" }),
            )
        })?
        .trim();

    if value.is_empty() || value.len() > MAX_USER_ID_LEN || value.chars().any(char::is_control) {
        return Err(validation_error(
            "Invalid user id",
            serde_json::json!({
                USER_ID_HEADER: format!("Must be 1-{MAX_USER_ID_LEN} printable characters")
            }),
        ));
    }

    Ok(UserId(value.to_string()))
}

/// OpenAPI header parameter for X-User-Id
#[derive(Debug, Serialize, Deserialize, IntoParams, utoipa::ToSchema)]
#[into_params(parameter_in = Header)]
pub struct UserHeader {
    /// Authenticated end user that owns the downloads
    #[serde(rename = "X-User-Id")]
    #[param(rename = "X-User-Id", value_type = String)]
    pub user_id: String,
}

impl<S> FromRequestParts<S> for UserExtension
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<UserExtension>()
            .cloned()
            .ok_or_else(|| unauthorized(Some("User context missing")))
    }
}
