//! Token service for session and access token issuance and verification
//!
//! Session tokens are long-lived and identify a login session; their `jti`
//! is the session id used by the ledger. Access tokens are short-lived, carry
//! the session id they belong to, and are only honoured while the ledger
//! names them as current. Everything here is stateless and synchronous: it
//! runs before any store round trip.

use chrono::{DateTime, TimeDelta, Utc};
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation, decode, encode};
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::debug;
use uuid::Uuid;

use crate::{
    error::TokenError,
    models::{Role, SessionKey, User},
    validation::is_uuid_v4,
};

/// Upper bound accepted for either token lifetime (10 years)
pub const MAX_TOKEN_LIFETIME: u64 = 10 * 365 * 24 * 60 * 60;

/// JWT configuration
#[derive(Debug, Clone)]
pub struct JwtConfig {
    /// Shared HMAC secret
    pub secret: String,
    /// Value of the `iss` claim
    pub issuer: String,
    /// Access token lifetime in seconds (default: 1 hour)
    pub access_token_expiry: u64,
    /// Session token lifetime in seconds (default: 30 days)
    pub session_token_expiry: u64,
}

impl JwtConfig {
    /// Create a new JwtConfig from environment variables
    ///
    /// # Environment Variables
    /// - `JWT_SECRET`: HMAC secret used to sign and verify tokens (required)
    /// - `JWT_ISSUER`: Issuer claim (default: "server")
    /// - `JWT_ACCESS_TOKEN_EXPIRY`: Access token expiry in seconds (default: 3600)
    /// - `JWT_SESSION_TOKEN_EXPIRY`: Session token expiry in seconds (default: 2592000)
    pub fn from_env() -> anyhow::Result<Self> {
        let secret = std::env::var("JWT_SECRET")
            .map_err(|_| anyhow::anyhow!("JWT_SECRET environment variable not set"))?;
        if secret.is_empty() {
            anyhow::bail!("JWT_SECRET must not be empty");
        }

        let issuer = std::env::var("JWT_ISSUER").unwrap_or_else(|_| "server".to_string());

        let access_token_expiry = std::env::var("JWT_ACCESS_TOKEN_EXPIRY")
            .unwrap_or_else(|_| "3600".to_string()) // 1 hour
            .parse()
            .unwrap_or(3600);

        let session_token_expiry = std::env::var("JWT_SESSION_TOKEN_EXPIRY")
            .unwrap_or_else(|_| "2592000".to_string()) // 30 days
            .parse()
            .unwrap_or(2_592_000);

        for (name, seconds) in [
            ("JWT_ACCESS_TOKEN_EXPIRY", access_token_expiry),
            ("JWT_SESSION_TOKEN_EXPIRY", session_token_expiry),
        ] {
            if seconds == 0 || seconds > MAX_TOKEN_LIFETIME {
                anyhow::bail!("{} must be between 1 and {} seconds", name, MAX_TOKEN_LIFETIME);
            }
        }

        Ok(JwtConfig {
            secret,
            issuer,
            access_token_expiry,
            session_token_expiry,
        })
    }
}

/// Token type tag carried in the `typ` claim
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TokenType {
    Session,
    Access,
}

impl fmt::Display for TokenType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TokenType::Session => f.write_str("session"),
            TokenType::Access => f.write_str("access"),
        }
    }
}

/// JWT claims as they appear on the wire
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub iss: String,
    /// Token id (UUID-v4); for session tokens this is the session id
    pub jti: String,
    /// User id
    pub sub: String,
    pub typ: TokenType,
    pub iat: i64,
    pub exp: i64,
    /// Session the access token is bound to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
}

/// Verified contents of a session token
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionClaims {
    pub session_id: Uuid,
    pub user_id: Uuid,
    pub expires_at: DateTime<Utc>,
}

impl SessionClaims {
    pub fn key(&self) -> SessionKey {
        SessionKey::new(self.user_id, self.session_id)
    }
}

/// Verified contents of an access token
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessClaims {
    pub access_id: Uuid,
    pub user_id: Uuid,
    pub session_id: Uuid,
    pub username: String,
    pub role: Role,
    pub expires_at: DateTime<Utc>,
}

impl AccessClaims {
    pub fn key(&self) -> SessionKey {
        SessionKey::new(self.user_id, self.session_id)
    }
}

/// A freshly signed token together with what it asserts
#[derive(Debug, Clone)]
pub struct IssuedToken<C> {
    pub token: String,
    pub claims: C,
}

/// Issues and verifies session and access tokens (HS256)
#[derive(Clone)]
pub struct TokenService {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    validation: Validation,
    config: JwtConfig,
}

impl TokenService {
    /// Initialize a new token service
    pub fn new(config: JwtConfig) -> Self {
        let encoding_key = EncodingKey::from_secret(config.secret.as_bytes());
        let decoding_key = DecodingKey::from_secret(config.secret.as_bytes());

        let mut validation = Validation::new(Algorithm::HS256);
        validation.set_issuer(&[config.issuer.as_str()]);
        validation.set_required_spec_claims(&["exp", "iss", "sub"]);
        validation.validate_exp = true;
        validation.leeway = 0;

        TokenService {
            encoding_key,
            decoding_key,
            validation,
            config,
        }
    }

    /// Get the access token expiry time in seconds
    pub fn access_token_expiry(&self) -> u64 {
        self.config.access_token_expiry
    }

    /// Get the session token expiry time in seconds
    pub fn session_token_expiry(&self) -> u64 {
        self.config.session_token_expiry
    }

    /// Issue a session token for a user, opening a new session id
    pub fn issue_session_token(&self, user_id: Uuid) -> Result<IssuedToken<SessionClaims>, TokenError> {
        let now = Utc::now();
        let session_id = Uuid::new_v4();
        let expires_at = expiry_after(now, self.config.session_token_expiry)?;

        let claims = Claims {
            iss: self.config.issuer.clone(),
            jti: session_id.to_string(),
            sub: user_id.to_string(),
            typ: TokenType::Session,
            iat: now.timestamp(),
            exp: expires_at.timestamp(),
            session_id: None,
            username: None,
            role: None,
        };
        let token = self.sign(&claims)?;

        Ok(IssuedToken {
            token,
            claims: SessionClaims {
                session_id,
                user_id,
                expires_at: truncate_to_seconds(expires_at)?,
            },
        })
    }

    /// Issue an access token bound to the given session
    ///
    /// Subject and session come from the session token; username and role
    /// from the caller-supplied user record.
    pub fn issue_access_token(
        &self,
        session: &SessionClaims,
        user: &User,
    ) -> Result<IssuedToken<AccessClaims>, TokenError> {
        let now = Utc::now();
        let access_id = Uuid::new_v4();
        let expires_at = expiry_after(now, self.config.access_token_expiry)?;

        let claims = Claims {
            iss: self.config.issuer.clone(),
            jti: access_id.to_string(),
            sub: session.user_id.to_string(),
            typ: TokenType::Access,
            iat: now.timestamp(),
            exp: expires_at.timestamp(),
            session_id: Some(session.session_id.to_string()),
            username: Some(user.username.clone()),
            role: Some(user.role.as_str().to_string()),
        };
        let token = self.sign(&claims)?;

        Ok(IssuedToken {
            token,
            claims: AccessClaims {
                access_id,
                user_id: session.user_id,
                session_id: session.session_id,
                username: user.username.clone(),
                role: user.role,
                expires_at: truncate_to_seconds(expires_at)?,
            },
        })
    }

    /// Verify a token's signature, issuer, expiry, type tag and claim shapes
    ///
    /// For access tokens `bound_session`, when supplied, must equal the
    /// token's `session_id` claim exactly.
    pub fn validate_token(
        &self,
        token: &str,
        expected: TokenType,
        bound_session: Option<Uuid>,
    ) -> Result<Claims, TokenError> {
        let claims = decode::<Claims>(token, &self.decoding_key, &self.validation)?.claims;

        if claims.typ != expected {
            return Err(TokenError::WrongType {
                expected,
                found: claims.typ,
            });
        }
        if !is_uuid_v4(&claims.jti) {
            return Err(TokenError::Malformed("jti is not a UUID-v4".to_string()));
        }
        if Uuid::try_parse(&claims.sub).is_err() {
            return Err(TokenError::Malformed("sub is not a user id".to_string()));
        }

        if expected == TokenType::Access {
            let session_id = claims
                .session_id
                .as_deref()
                .filter(|id| is_uuid_v4(id))
                .ok_or_else(|| TokenError::Malformed("session_id is not a UUID-v4".to_string()))?;

            if claims.username.as_deref().is_none_or(str::is_empty) {
                return Err(TokenError::Malformed("username is missing".to_string()));
            }

            let role = claims
                .role
                .as_deref()
                .ok_or_else(|| TokenError::Malformed("role is missing".to_string()))?;
            role.parse::<Role>()
                .map_err(|e| TokenError::UnknownRole(e.0))?;

            if let Some(bound) = bound_session {
                if session_id != bound.as_hyphenated().to_string() {
                    return Err(TokenError::SessionMismatch);
                }
            }
        }

        debug!(jti = %claims.jti, typ = %claims.typ, "token verified");
        Ok(claims)
    }

    /// Verify a session token and extract its session identity
    pub fn validate_session_token(&self, token: &str) -> Result<SessionClaims, TokenError> {
        let claims = self.validate_token(token, TokenType::Session, None)?;
        Ok(SessionClaims {
            session_id: parse_uuid(&claims.jti, "jti")?,
            user_id: parse_uuid(&claims.sub, "sub")?,
            expires_at: from_timestamp(claims.exp)?,
        })
    }

    /// Verify an access token and extract its claims
    pub fn validate_access_token(
        &self,
        token: &str,
        bound_session: Option<Uuid>,
    ) -> Result<AccessClaims, TokenError> {
        let claims = self.validate_token(token, TokenType::Access, bound_session)?;
        let role = claims
            .role
            .as_deref()
            .unwrap_or_default()
            .parse::<Role>()
            .map_err(|e| TokenError::UnknownRole(e.0))?;

        Ok(AccessClaims {
            access_id: parse_uuid(&claims.jti, "jti")?,
            user_id: parse_uuid(&claims.sub, "sub")?,
            session_id: parse_uuid(claims.session_id.as_deref().unwrap_or_default(), "session_id")?,
            username: claims.username.unwrap_or_default(),
            role,
            expires_at: from_timestamp(claims.exp)?,
        })
    }

    pub(crate) fn sign(&self, claims: &Claims) -> Result<String, TokenError> {
        encode(&Header::new(Algorithm::HS256), claims, &self.encoding_key)
            .map_err(|e| TokenError::Signing(e.to_string()))
    }
}

fn expiry_after(now: DateTime<Utc>, seconds: u64) -> Result<DateTime<Utc>, TokenError> {
    i64::try_from(seconds)
        .ok()
        .and_then(TimeDelta::try_seconds)
        .and_then(|lifetime| now.checked_add_signed(lifetime))
        .ok_or_else(|| TokenError::Signing(format!("token lifetime of {seconds}s is out of range")))
}

fn parse_uuid(value: &str, claim: &str) -> Result<Uuid, TokenError> {
    Uuid::try_parse(value).map_err(|_| TokenError::Malformed(format!("{claim} is not a UUID")))
}

fn from_timestamp(seconds: i64) -> Result<DateTime<Utc>, TokenError> {
    DateTime::from_timestamp(seconds, 0)
        .ok_or_else(|| TokenError::Malformed("exp is out of range".to_string()))
}

// Claims carry whole seconds; the returned instants must match what a later
// verification of the same token reports.
fn truncate_to_seconds(at: DateTime<Utc>) -> Result<DateTime<Utc>, TokenError> {
    from_timestamp(at.timestamp())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    fn test_config() -> JwtConfig {
        JwtConfig {
            secret: "test-secret".to_string(),
            issuer: "server".to_string(),
            access_token_expiry: 3600,
            session_token_expiry: 86400,
        }
    }

    fn test_user(role: Role) -> User {
        User {
            id: Uuid::new_v4(),
            username: "alice".to_string(),
            password_hash: String::new(),
            role,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn issue_pair(service: &TokenService) -> (IssuedToken<SessionClaims>, IssuedToken<AccessClaims>) {
        let user = test_user(Role::User);
        let session = service.issue_session_token(user.id).unwrap();
        let access = service.issue_access_token(&session.claims, &user).unwrap();
        (session, access)
    }

    fn access_claims_for(service: &TokenService, session_id: &str) -> Claims {
        let now = Utc::now().timestamp();
        Claims {
            iss: "server".to_string(),
            jti: Uuid::new_v4().to_string(),
            sub: Uuid::new_v4().to_string(),
            typ: TokenType::Access,
            iat: now,
            exp: now + service.access_token_expiry() as i64,
            session_id: Some(session_id.to_string()),
            username: Some("alice".to_string()),
            role: Some("user".to_string()),
        }
    }

    #[test]
    fn issued_tokens_verify_and_are_linked() {
        let service = TokenService::new(test_config());
        let (session, access) = issue_pair(&service);

        let verified_session = service.validate_session_token(&session.token).unwrap();
        assert_eq!(verified_session, session.claims);

        let verified_access = service
            .validate_access_token(&access.token, Some(session.claims.session_id))
            .unwrap();
        assert_eq!(verified_access, access.claims);
        assert_eq!(verified_access.session_id, verified_session.session_id);
        assert_eq!(verified_access.user_id, verified_session.user_id);
        assert_eq!(verified_access.username, "alice");
        assert_eq!(verified_access.role, Role::User);
    }

    #[test]
    fn flipped_signature_byte_is_rejected() {
        let service = TokenService::new(test_config());
        let (_, access) = issue_pair(&service);

        let signature_start = access.token.rfind('.').unwrap() + 1;
        let mut bytes = access.token.into_bytes();
        let target = signature_start + 10;
        bytes[target] = if bytes[target] == b'A' { b'B' } else { b'A' };
        let tampered = String::from_utf8(bytes).unwrap();

        assert_eq!(
            service.validate_access_token(&tampered, None),
            Err(TokenError::Signature)
        );
    }

    #[test]
    fn non_uuid_identifier_is_rejected_despite_valid_signature() {
        let service = TokenService::new(test_config());
        let mut claims = access_claims_for(&service, &Uuid::new_v4().to_string());
        claims.jti = "1:forged".to_string();
        let token = service.sign(&claims).unwrap();

        assert!(matches!(
            service.validate_access_token(&token, None),
            Err(TokenError::Malformed(_))
        ));
    }

    #[test]
    fn non_uuid_session_reference_is_rejected() {
        let service = TokenService::new(test_config());
        let claims = access_claims_for(&service, "not-a-session");
        let token = service.sign(&claims).unwrap();

        assert!(matches!(
            service.validate_access_token(&token, None),
            Err(TokenError::Malformed(_))
        ));
    }

    #[test]
    fn unknown_role_and_empty_username_are_rejected() {
        let service = TokenService::new(test_config());
        let session_id = Uuid::new_v4().to_string();

        let mut claims = access_claims_for(&service, &session_id);
        claims.role = Some("superuser".to_string());
        let token = service.sign(&claims).unwrap();
        assert_eq!(
            service.validate_access_token(&token, None),
            Err(TokenError::UnknownRole("superuser".to_string()))
        );

        let mut claims = access_claims_for(&service, &session_id);
        claims.username = Some(String::new());
        let token = service.sign(&claims).unwrap();
        assert!(matches!(
            service.validate_access_token(&token, None),
            Err(TokenError::Malformed(_))
        ));
    }

    #[test]
    fn token_types_are_not_interchangeable() {
        let service = TokenService::new(test_config());
        let (session, access) = issue_pair(&service);

        assert_eq!(
            service.validate_session_token(&access.token),
            Err(TokenError::WrongType {
                expected: TokenType::Session,
                found: TokenType::Access
            })
        );
        assert!(matches!(
            service.validate_access_token(&session.token, None),
            Err(TokenError::WrongType { .. })
        ));
    }

    #[test]
    fn bound_session_must_match() {
        let service = TokenService::new(test_config());
        let (_, access) = issue_pair(&service);

        assert_eq!(
            service.validate_access_token(&access.token, Some(Uuid::new_v4())),
            Err(TokenError::SessionMismatch)
        );
    }

    #[test]
    fn bound_session_comparison_is_exact() {
        let service = TokenService::new(test_config());
        let session_id = Uuid::new_v4();
        let claims = access_claims_for(&service, &session_id.to_string().to_uppercase());
        let token = service.sign(&claims).unwrap();

        // Same UUID, different spelling
        assert_eq!(
            service.validate_access_token(&token, Some(session_id)),
            Err(TokenError::SessionMismatch)
        );

        let claims = access_claims_for(&service, &session_id.to_string());
        let token = service.sign(&claims).unwrap();
        assert!(service.validate_access_token(&token, Some(session_id)).is_ok());
    }

    #[test]
    fn out_of_range_lifetime_is_an_error_not_a_panic() {
        let mut config = test_config();
        config.session_token_expiry = 100_000_000_000_000;
        config.access_token_expiry = u64::MAX;
        let service = TokenService::new(config);
        let user = test_user(Role::User);

        assert!(matches!(
            service.issue_session_token(user.id),
            Err(TokenError::Signing(_))
        ));

        let session = SessionClaims {
            session_id: Uuid::new_v4(),
            user_id: user.id,
            expires_at: Utc::now(),
        };
        assert!(matches!(
            service.issue_access_token(&session, &user),
            Err(TokenError::Signing(_))
        ));
    }

    #[test]
    fn expired_token_is_rejected() {
        let service = TokenService::new(test_config());
        let mut claims = access_claims_for(&service, &Uuid::new_v4().to_string());
        claims.exp = Utc::now().timestamp() - 5;
        let token = service.sign(&claims).unwrap();

        assert_eq!(
            service.validate_access_token(&token, None),
            Err(TokenError::Expired)
        );
    }

    #[test]
    fn foreign_issuer_and_secret_are_rejected() {
        let service = TokenService::new(test_config());
        let mut other_config = test_config();
        other_config.issuer = "elsewhere".to_string();
        let other = TokenService::new(other_config);
        let (session, _) = issue_pair(&other);
        assert_eq!(
            service.validate_session_token(&session.token),
            Err(TokenError::Issuer)
        );

        let mut other_config = test_config();
        other_config.secret = "another-secret".to_string();
        let other = TokenService::new(other_config);
        let (session, _) = issue_pair(&other);
        assert_eq!(
            service.validate_session_token(&session.token),
            Err(TokenError::Signature)
        );
    }

    #[test]
    fn garbage_is_malformed() {
        let service = TokenService::new(test_config());
        assert!(matches!(
            service.validate_session_token("not.a.jwt"),
            Err(TokenError::Malformed(_))
        ));
    }

    #[test]
    #[serial]
    fn test_jwt_config_from_env() {
        unsafe {
            std::env::set_var("JWT_SECRET", "env-secret");
            std::env::remove_var("JWT_ISSUER");
            std::env::set_var("JWT_ACCESS_TOKEN_EXPIRY", "60");
            std::env::remove_var("JWT_SESSION_TOKEN_EXPIRY");
        }

        let config = JwtConfig::from_env().unwrap();
        assert_eq!(config.secret, "env-secret");
        assert_eq!(config.issuer, "server");
        assert_eq!(config.access_token_expiry, 60);
        assert_eq!(config.session_token_expiry, 2_592_000);

        unsafe {
            std::env::set_var("JWT_ACCESS_TOKEN_EXPIRY", "0");
        }
        assert!(JwtConfig::from_env().is_err());

        unsafe {
            std::env::set_var("JWT_ACCESS_TOKEN_EXPIRY", "60");
            std::env::set_var("JWT_SESSION_TOKEN_EXPIRY", "100000000000000");
        }
        assert!(JwtConfig::from_env().is_err());

        unsafe {
            std::env::remove_var("JWT_SECRET");
            std::env::remove_var("JWT_ACCESS_TOKEN_EXPIRY");
            std::env::remove_var("JWT_SESSION_TOKEN_EXPIRY");
        }
        assert!(JwtConfig::from_env().is_err());
    }
}
