//! Authentication service routes

use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    middleware,
    response::IntoResponse,
    routing::{delete, get, post},
};
use serde::{Deserialize, Serialize};
use tracing::{error, warn};
use uuid::Uuid;

use crate::AppState;
use crate::error::AuthResult;
use crate::middleware::{admin_middleware, auth_middleware};
use crate::models::{LoginCredentials, Role, User};
use crate::realtime;

/// Response for a successful login
#[derive(Debug, Serialize, Deserialize)]
pub struct LoginResponse {
    pub access_token: String,
    /// Unix seconds
    pub access_expiry: i64,
    pub session_token: String,
    /// Unix seconds
    pub session_expiry: i64,
}

/// Public view of a user account
#[derive(Debug, Serialize, Deserialize)]
pub struct UserResponse {
    pub id: Uuid,
    pub username: String,
    pub role: Role,
    /// Unix seconds
    pub created_at: i64,
    /// Unix seconds; null when never seen online or presence is unreadable
    #[serde(default)]
    pub last_online: Option<i64>,
}

impl From<User> for UserResponse {
    fn from(user: User) -> Self {
        Self {
            id: user.id,
            username: user.username,
            role: user.role,
            created_at: user.created_at.timestamp(),
            last_online: None,
        }
    }
}

/// Request carrying a session token (refresh and logout)
#[derive(Debug, Serialize, Deserialize)]
pub struct SessionTokenRequest {
    #[serde(default)]
    pub session_token: String,
}

/// Response for token refresh
#[derive(Debug, Serialize, Deserialize)]
pub struct RefreshResponse {
    pub access_token: String,
    pub access_expiry: i64,
}

/// Create the router for the authentication service
pub fn create_router(state: AppState) -> Router {
    let admin = Router::new()
        .route("/admin/sessions/:user_id/:session_id", delete(revoke_session))
        .route_layer(middleware::from_fn(admin_middleware))
        .route_layer(middleware::from_fn_with_state(state.clone(), auth_middleware));

    let authenticated = Router::new()
        .route("/users/:user_id", get(get_user))
        .route("/ws/chat", get(realtime::ws_handler))
        .route_layer(middleware::from_fn_with_state(state.clone(), auth_middleware));

    Router::new()
        .route("/health", get(health_check))
        .route("/auth/register", post(register))
        .route("/auth/login", post(login))
        .route("/auth/refresh", post(refresh))
        .route("/auth/logout", post(logout))
        .merge(admin)
        .merge(authenticated)
        .with_state(state)
}

/// Health check endpoint
pub async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    let store_ok = match state.auth.sessions().health_check().await {
        Ok(ok) => ok,
        Err(e) => {
            error!("Session store health check failed: {}", e);
            false
        }
    };

    let status = if store_ok {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        status,
        Json(serde_json::json!({
            "status": if store_ok { "ok" } else { "degraded" },
            "service": "auth-service",
            "session_store": store_ok,
            "realtime_connections": state.registry.connection_count(),
        })),
    )
}

/// User registration endpoint
pub async fn register(
    State(state): State<AppState>,
    Json(payload): Json<LoginCredentials>,
) -> AuthResult<(StatusCode, Json<UserResponse>)> {
    let user = state.auth.register(&payload.username, &payload.password).await?;
    Ok((StatusCode::CREATED, Json(user.into())))
}

/// User lookup with last-online presence
pub async fn get_user(
    State(state): State<AppState>,
    Path(user_id): Path<Uuid>,
) -> AuthResult<Json<UserResponse>> {
    let user = state.auth.find_user(user_id).await?;
    let mut response = UserResponse::from(user);

    match state.presence.last_online(user_id).await {
        Ok(last_online) => response.last_online = last_online.map(|at| at.timestamp()),
        Err(e) => warn!(user = %user_id, "Failed to read last online: {}", e),
    }

    Ok(Json(response))
}

/// User login endpoint
pub async fn login(
    State(state): State<AppState>,
    Json(payload): Json<LoginCredentials>,
) -> AuthResult<Json<LoginResponse>> {
    let tokens = state.auth.login(&payload.username, &payload.password).await?;

    Ok(Json(LoginResponse {
        access_token: tokens.access_token,
        access_expiry: tokens.access_expiry.timestamp(),
        session_token: tokens.session_token,
        session_expiry: tokens.session_expiry.timestamp(),
    }))
}

/// Access token refresh endpoint
pub async fn refresh(
    State(state): State<AppState>,
    Json(payload): Json<SessionTokenRequest>,
) -> AuthResult<Json<RefreshResponse>> {
    let refreshed = state.auth.refresh(&payload.session_token).await?;

    Ok(Json(RefreshResponse {
        access_token: refreshed.access_token,
        access_expiry: refreshed.access_expiry.timestamp(),
    }))
}

/// Logout endpoint; idempotent
pub async fn logout(
    State(state): State<AppState>,
    Json(payload): Json<SessionTokenRequest>,
) -> AuthResult<StatusCode> {
    state.auth.logout(&payload.session_token).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Forced revoke of any user's session
pub async fn revoke_session(
    State(state): State<AppState>,
    Path((user_id, session_id)): Path<(Uuid, Uuid)>,
) -> AuthResult<StatusCode> {
    state.auth.revoke_session(user_id, session_id).await?;
    Ok(StatusCode::NO_CONTENT)
}
