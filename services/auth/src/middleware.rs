//! Middleware for access token authentication and role checks

use axum::{
    body::Body,
    extract::State,
    http::{Request, header},
    middleware::Next,
    response::Response,
};
use tracing::{debug, info};

use crate::AppState;
use crate::error::{AuthError, TokenError};
use crate::models::Role;
use crate::service::AuthContext;

/// Extract the bearer token from the Authorization header
fn bearer_token(req: &Request<Body>) -> Result<&str, AuthError> {
    let header = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .ok_or_else(|| missing_bearer("no Authorization header"))?;

    header
        .strip_prefix("Bearer ")
        .map(str::trim)
        .filter(|token| !token.is_empty())
        .ok_or_else(|| missing_bearer("Authorization is not a bearer token"))
}

fn missing_bearer(detail: &str) -> AuthError {
    AuthError::InvalidToken(TokenError::Malformed(detail.to_string()))
}

/// Authenticate the request's access token and attach its [`AuthContext`]
pub async fn auth_middleware(
    State(state): State<AppState>,
    mut req: Request<Body>,
    next: Next,
) -> Result<Response, AuthError> {
    let context = state.auth.authenticate(bearer_token(&req)?).await?;
    debug!(user = %context.user_id, session = %context.session_id, "request authenticated");

    req.extensions_mut().insert(context);
    Ok(next.run(req).await)
}

/// Require the authenticated caller to hold the admin role
///
/// Must run after [`auth_middleware`].
pub async fn admin_middleware(req: Request<Body>, next: Next) -> Result<Response, AuthError> {
    let context = req
        .extensions()
        .get::<AuthContext>()
        .ok_or_else(|| AuthError::Internal("admin check ran before authentication".to_string()))?;

    if context.role != Role::Admin {
        info!(user = %context.user_id, "Admin route refused for role {}", context.role);
        return Err(AuthError::Forbidden);
    }

    Ok(next.run(req).await)
}
