//! Password hashing and verification

use argon2::{Argon2, PasswordHash, PasswordHasher, PasswordVerifier, password_hash::SaltString};

use crate::error::{AuthError, AuthResult};

/// Hashes new passwords and checks presented ones against stored hashes
///
/// Both operations are CPU-bound; async callers run them on the blocking pool.
pub trait PasswordScheme: Send + Sync {
    /// Hash a password for storage
    fn hash_password(&self, password: &str) -> AuthResult<String>;

    fn verify(&self, password: &str, password_hash: &str) -> AuthResult<bool>;
}

/// Argon2id with default parameters
#[derive(Clone, Default)]
pub struct Argon2Hasher {
    argon2: Argon2<'static>,
}

impl Argon2Hasher {
    pub fn new() -> Self {
        Self::default()
    }
}

impl PasswordScheme for Argon2Hasher {
    /// Hash with a fresh random salt (PHC string format)
    fn hash_password(&self, password: &str) -> AuthResult<String> {
        let salt = SaltString::generate(&mut rand::thread_rng());
        self.argon2
            .hash_password(password.as_bytes(), &salt)
            .map(|hash| hash.to_string())
            .map_err(|e| AuthError::Internal(format!("failed to hash password: {e}")))
    }

    fn verify(&self, password: &str, password_hash: &str) -> AuthResult<bool> {
        let parsed = PasswordHash::new(password_hash)
            .map_err(|e| AuthError::Internal(format!("failed to parse password hash: {e}")))?;
        Ok(self
            .argon2
            .verify_password(password.as_bytes(), &parsed)
            .is_ok())
    }
}
