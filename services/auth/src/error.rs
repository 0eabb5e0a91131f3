//! Error types for the authentication service

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use common::{CacheError, DatabaseError};
use serde_json::json;
use thiserror::Error;
use tracing::{error, info};

use crate::jwt::TokenType;

/// Why a token failed stateless verification
///
/// Callers only ever see "invalid token"; the variant is for the logs.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TokenError {
    #[error("signature mismatch")]
    Signature,

    #[error("token expired")]
    Expired,

    #[error("issuer mismatch")]
    Issuer,

    #[error("wrong token type: expected {expected}, found {found}")]
    WrongType { expected: TokenType, found: TokenType },

    #[error("malformed claim: {0}")]
    Malformed(String),

    #[error("unknown role '{0}'")]
    UnknownRole(String),

    #[error("token is not bound to the expected session")]
    SessionMismatch,

    #[error("failed to sign token: {0}")]
    Signing(String),
}

impl From<jsonwebtoken::errors::Error> for TokenError {
    fn from(err: jsonwebtoken::errors::Error) -> Self {
        use jsonwebtoken::errors::ErrorKind;
        match err.kind() {
            ErrorKind::InvalidSignature => TokenError::Signature,
            ErrorKind::ExpiredSignature => TokenError::Expired,
            ErrorKind::InvalidIssuer => TokenError::Issuer,
            ErrorKind::MissingRequiredClaim(claim) => {
                TokenError::Malformed(format!("missing claim '{claim}'"))
            }
            _ => TokenError::Malformed(err.to_string()),
        }
    }
}

/// Errors produced by the authentication flows
#[derive(Error, Debug)]
pub enum AuthError {
    /// Missing or malformed request input; no backend was contacted
    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("invalid credentials")]
    InvalidCredentials,

    /// Failed stateless verification
    #[error("invalid token: {0}")]
    InvalidToken(#[from] TokenError),

    /// Cryptographically valid but no longer honoured by the ledger
    #[error("token revoked or superseded")]
    Revoked,

    #[error("permission denied")]
    Forbidden,

    #[error("not found: {0}")]
    NotFound(String),

    /// The resource already exists (duplicate username)
    #[error("conflict: {0}")]
    Conflict(String),

    #[error("cache database error: {0}")]
    Cache(#[from] CacheError),

    #[error("database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("internal error: {0}")]
    Internal(String),
}

impl AuthError {
    pub fn status(&self) -> StatusCode {
        match self {
            AuthError::BadRequest(_) => StatusCode::BAD_REQUEST,
            AuthError::InvalidCredentials | AuthError::InvalidToken(_) | AuthError::Revoked => {
                StatusCode::UNAUTHORIZED
            }
            AuthError::Forbidden => StatusCode::FORBIDDEN,
            AuthError::NotFound(_) => StatusCode::NOT_FOUND,
            AuthError::Conflict(_) => StatusCode::CONFLICT,
            AuthError::Cache(_) | AuthError::Database(_) | AuthError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        let message = match &self {
            AuthError::BadRequest(msg) => msg.clone(),
            AuthError::InvalidCredentials => "Invalid username or password".to_string(),
            AuthError::InvalidToken(cause) => {
                info!("Rejected token: {}", cause);
                "Invalid token".to_string()
            }
            AuthError::Revoked => {
                info!("Rejected token: revoked or superseded");
                "Invalid token".to_string()
            }
            AuthError::Forbidden => "Permission denied".to_string(),
            AuthError::NotFound(msg) | AuthError::Conflict(msg) => msg.clone(),
            AuthError::Cache(e) => {
                error!("Cache database failure: {}", e);
                "Cache database error".to_string()
            }
            AuthError::Database(e) => {
                error!("Database failure: {}", e);
                "Database error".to_string()
            }
            AuthError::Internal(detail) => {
                error!("Internal failure: {}", detail);
                "Internal server error".to_string()
            }
        };

        let status = self.status();
        let body = Json(json!({
            "error": {
                "code": status.as_u16(),
                "message": message,
            }
        }));

        (status, body).into_response()
    }
}

/// Type alias for authentication results
pub type AuthResult<T> = Result<T, AuthError>;
