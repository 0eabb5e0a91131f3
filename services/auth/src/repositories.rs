//! User lookup for the authentication flows

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::AuthResult;
use crate::models::{NewUser, User};

pub mod user;

pub use user::{MemoryUserDirectory, PgUserRepository};

/// Access to user records
#[async_trait]
pub trait UserDirectory: Send + Sync {
    /// Insert a user; a taken username is [`crate::error::AuthError::Conflict`]
    async fn create_user(&self, new_user: &NewUser) -> AuthResult<User>;

    async fn find_by_username(&self, username: &str) -> AuthResult<Option<User>>;

    async fn find_by_id(&self, id: Uuid) -> AuthResult<Option<User>>;
}
