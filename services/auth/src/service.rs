//! Login, refresh, logout and per-request authentication
//!
//! Every flow runs its stateless token check first and only then suspends on
//! the ledger round trip. A ledger failure is returned as such and never
//! read as "token not found".

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::{AuthError, AuthResult, TokenError};
use crate::jwt::{AccessClaims, IssuedToken, SessionClaims, TokenService};
use crate::models::{CurrentAccess, NewUser, Role, SessionKey, User};
use crate::password::PasswordScheme;
use crate::repositories::UserDirectory;
use crate::session::SessionStore;
use crate::validation::{require_token, validate_new_password, validate_password, validate_username};

/// Token pair handed out at login
#[derive(Debug, Clone)]
pub struct LoginTokens {
    pub user_id: Uuid,
    pub session_id: Uuid,
    pub access_token: String,
    pub access_expiry: DateTime<Utc>,
    pub session_token: String,
    pub session_expiry: DateTime<Utc>,
}

/// Access token minted by a refresh
#[derive(Debug, Clone)]
pub struct RefreshedToken {
    pub access_token: String,
    pub access_expiry: DateTime<Utc>,
}

/// Whether a logout removed a live session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogoutOutcome {
    Revoked,
    AlreadyRevoked,
}

/// Identity attached to an authenticated request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthContext {
    pub user_id: Uuid,
    pub session_id: Uuid,
    pub username: String,
    pub role: Role,
}

impl From<AccessClaims> for AuthContext {
    fn from(claims: AccessClaims) -> Self {
        Self {
            user_id: claims.user_id,
            session_id: claims.session_id,
            username: claims.username,
            role: claims.role,
        }
    }
}

fn current_access(access: &IssuedToken<AccessClaims>) -> CurrentAccess {
    CurrentAccess {
        access_id: access.claims.access_id,
        expires_at: access.claims.expires_at,
    }
}

/// Failing to sign is our fault, not the caller's
fn signing_failure(err: TokenError) -> AuthError {
    AuthError::Internal(format!("token issuance failed: {err}"))
}

#[derive(Clone)]
pub struct AuthService {
    tokens: TokenService,
    sessions: Arc<dyn SessionStore>,
    users: Arc<dyn UserDirectory>,
    passwords: Arc<dyn PasswordScheme>,
}

impl AuthService {
    pub fn new(
        tokens: TokenService,
        sessions: Arc<dyn SessionStore>,
        users: Arc<dyn UserDirectory>,
        passwords: Arc<dyn PasswordScheme>,
    ) -> Self {
        Self {
            tokens,
            sessions,
            users,
            passwords,
        }
    }

    pub fn tokens(&self) -> &TokenService {
        &self.tokens
    }

    pub fn sessions(&self) -> &Arc<dyn SessionStore> {
        &self.sessions
    }

    /// Create a user account with the `user` role
    pub async fn register(&self, username: &str, password: &str) -> AuthResult<User> {
        validate_username(username).map_err(AuthError::BadRequest)?;
        validate_new_password(password).map_err(AuthError::BadRequest)?;

        let passwords = Arc::clone(&self.passwords);
        let owned = password.to_string();
        let password_hash = tokio::task::spawn_blocking(move || passwords.hash_password(&owned))
            .await
            .map_err(|e| AuthError::Internal(format!("password hashing task failed: {e}")))??;

        let user = self
            .users
            .create_user(&NewUser {
                username: username.to_string(),
                password_hash,
                role: Role::User,
            })
            .await?;

        info!(user = %user.id, "User {} registered", user.username);
        Ok(user)
    }

    /// Look up a user by id
    pub async fn find_user(&self, user_id: Uuid) -> AuthResult<User> {
        self.users
            .find_by_id(user_id)
            .await?
            .ok_or_else(|| AuthError::NotFound("User not found".to_string()))
    }

    /// Check credentials, open a session and mint its first access token
    pub async fn login(&self, username: &str, password: &str) -> AuthResult<LoginTokens> {
        validate_username(username).map_err(AuthError::BadRequest)?;
        validate_password(password).map_err(AuthError::BadRequest)?;

        let Some(user) = self.users.find_by_username(username).await? else {
            info!("Login failed: unknown user {}", username);
            return Err(AuthError::InvalidCredentials);
        };

        if !self.verify_password(password, &user.password_hash).await? {
            info!("Login failed: wrong password for {}", username);
            return Err(AuthError::InvalidCredentials);
        }

        let session = self
            .tokens
            .issue_session_token(user.id)
            .map_err(signing_failure)?;
        let access = self.issue_access(&session.claims, &user)?;
        self.sessions
            .create_or_rotate(
                &session.claims.key(),
                Some(&current_access(&access)),
                session.claims.expires_at,
            )
            .await?;

        info!(
            user = %user.id,
            session = %session.claims.session_id,
            "User {} logged in", user.username
        );

        Ok(LoginTokens {
            user_id: user.id,
            session_id: session.claims.session_id,
            access_token: access.token,
            access_expiry: access.claims.expires_at,
            session_token: session.token,
            session_expiry: session.claims.expires_at,
        })
    }

    /// Mint a new access token for a live session, superseding the current one
    pub async fn refresh(&self, session_token: &str) -> AuthResult<RefreshedToken> {
        let session_token = require_token("session_token", session_token).map_err(AuthError::BadRequest)?;
        let session = self.tokens.validate_session_token(session_token)?;

        if !self.sessions.exists(&session.key()).await? {
            info!(session = %session.session_id, "Refresh rejected: session revoked or expired");
            return Err(AuthError::Revoked);
        }

        let Some(user) = self.users.find_by_id(session.user_id).await? else {
            warn!(user = %session.user_id, "Refresh rejected: user no longer exists");
            return Err(AuthError::Revoked);
        };

        // Conditional write: a logout racing this refresh must not be undone
        let access = self.issue_access(&session, &user)?;
        if !self
            .sessions
            .rotate_if_exists(&session.key(), &current_access(&access), session.expires_at)
            .await?
        {
            info!(session = %session.session_id, "Refresh rejected: session revoked during refresh");
            return Err(AuthError::Revoked);
        }
        info!(session = %session.session_id, "Access token rotated");

        Ok(RefreshedToken {
            access_token: access.token,
            access_expiry: access.claims.expires_at,
        })
    }

    /// Delete the session named by `session_token`
    ///
    /// Succeeds whether or not the session was still live.
    pub async fn logout(&self, session_token: &str) -> AuthResult<LogoutOutcome> {
        let session_token = require_token("session_token", session_token).map_err(AuthError::BadRequest)?;
        let session = self.tokens.validate_session_token(session_token)?;

        if self.sessions.delete(&session.key()).await? {
            info!(session = %session.session_id, "Session logged out");
            Ok(LogoutOutcome::Revoked)
        } else {
            info!(session = %session.session_id, "Logout on already revoked session");
            Ok(LogoutOutcome::AlreadyRevoked)
        }
    }

    /// Authenticate a request by its access token
    pub async fn authenticate(&self, access_token: &str) -> AuthResult<AuthContext> {
        let claims = self.tokens.validate_access_token(access_token, None)?;

        if !self
            .sessions
            .is_access_token_current(&claims.key(), claims.access_id)
            .await?
        {
            return Err(AuthError::Revoked);
        }

        Ok(claims.into())
    }

    /// Forcibly end a session regardless of who holds it
    pub async fn revoke_session(&self, user_id: Uuid, session_id: Uuid) -> AuthResult<LogoutOutcome> {
        let key = SessionKey::new(user_id, session_id);
        if self.sessions.delete(&key).await? {
            warn!(user = %user_id, session = %session_id, "Session revoked administratively");
            Ok(LogoutOutcome::Revoked)
        } else {
            Ok(LogoutOutcome::AlreadyRevoked)
        }
    }

    fn issue_access(
        &self,
        session: &SessionClaims,
        user: &User,
    ) -> AuthResult<IssuedToken<AccessClaims>> {
        self.tokens
            .issue_access_token(session, user)
            .map_err(signing_failure)
    }

    async fn verify_password(&self, password: &str, password_hash: &str) -> AuthResult<bool> {
        let passwords = Arc::clone(&self.passwords);
        let password = password.to_string();
        let password_hash = password_hash.to_string();

        tokio::task::spawn_blocking(move || passwords.verify(&password, &password_hash))
            .await
            .map_err(|e| AuthError::Internal(format!("password verification task failed: {e}")))?
    }
}
