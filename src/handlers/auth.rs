//! Admin authorisation: a bearer token compared against `admin_token`.
//!
//! `require_admin` guards whole routers; `AdminAccess` lets public
//! endpoints ask whether the caller may see trashed objects.

use axum::{
    extract::{FromRequestParts, Request, State},
    http::{HeaderMap, header, request::Parts},
    middleware::Next,
    response::Response,
};
use std::convert::Infallible;

use crate::{errors::AppError, state::AppState};

/// Middleware rejecting requests without the admin bearer token.
pub async fn require_admin(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Result<Response, AppError> {
    let presented = bearer_token(request.headers()).map(str::to_string);
    if state.is_admin_token(presented.as_deref()) {
        return Ok(next.run(request).await);
    }
    if presented.is_some() {
        tracing::warn!(path = %request.uri().path(), "invalid admin token");
    } else {
        tracing::debug!(path = %request.uri().path(), "no admin token provided");
    }
    Err(AppError::unauthorized())
}

/// Whether the caller presented a valid admin token. Never rejects.
#[derive(Debug, Clone, Copy)]
pub struct AdminAccess(pub bool);

impl FromRequestParts<AppState> for AdminAccess {
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        Ok(AdminAccess(state.is_admin_token(bearer_token(&parts.headers))))
    }
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|token| !token.is_empty())
}
