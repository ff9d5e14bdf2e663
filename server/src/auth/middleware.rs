//! Authentication middleware.
//!
//! Bearer token extraction. With `AUTH_SECRET` set, every request must carry
//! that token; without it, requests are accepted anonymously.

use axum::{
    extract::FromRequestParts,
    http::{header::AUTHORIZATION, request::Parts},
};

use crate::error::AppError;
use crate::AppState;

/// Authenticated caller extracted from the request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthUser {
    Token(String),
    Anonymous,
}

impl FromRequestParts<AppState> for AuthUser {
    type Rejection = AppError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let auth_header = parts
            .headers
            .get(AUTHORIZATION)
            .and_then(|value| value.to_str().ok());

        let secret = state.config.auth_secret.as_deref();
        match (auth_header, secret) {
            (Some(header), _) => {
                let token = header
                    .strip_prefix("Bearer ")
                    .ok_or(AppError::Unauthorized("invalid authorization header format"))?
                    .trim();
                if token.is_empty() {
                    return Err(AppError::Unauthorized("empty bearer token"));
                }
                if secret.is_some_and(|secret| secret != token) {
                    tracing::debug!("rejected request with unknown bearer token");
                    return Err(AppError::Unauthorized("invalid bearer token"));
                }
                Ok(AuthUser::Token(token.to_string()))
            }
            (None, Some(_)) => Err(AppError::Unauthorized("missing authorization header")),
            (None, None) => Ok(AuthUser::Anonymous),
        }
    }
}
