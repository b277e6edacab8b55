// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! JWT authentication middleware.

use crate::auth::verify_jwt;
use crate::AppState;
use axum::{
    extract::{Request, State},
    http::{header, StatusCode},
    middleware::Next,
    response::Response,
};
use std::sync::Arc;

/// Authenticated user extracted from JWT.
#[derive(Debug, Clone)]
pub struct AuthUser {
    pub uid: String,
}

/// Middleware that requires a bearer JWT for the signed-in account.
///
/// The local API acts on behalf of the agent's session, so a valid token for
/// any other account is rejected as well.
pub async fn require_auth(
    State(state): State<Arc<AppState>>,
    mut request: Request,
    next: Next,
) -> Result<Response, StatusCode> {
    let token = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
        .and_then(|h| h.strip_prefix("Bearer "))
        .ok_or(StatusCode::UNAUTHORIZED)?;

    let claims =
        verify_jwt(token, &state.config.jwt_signing_key).map_err(|_| StatusCode::UNAUTHORIZED)?;

    match state.session.uid() {
        Some(uid) if uid == claims.sub => {}
        Some(uid) => {
            tracing::warn!(session = %uid, token_sub = %claims.sub, "Token for another account");
            return Err(StatusCode::FORBIDDEN);
        }
        None => return Err(StatusCode::UNAUTHORIZED),
    }

    request.extensions_mut().insert(AuthUser { uid: claims.sub });

    Ok(next.run(request).await)
}
