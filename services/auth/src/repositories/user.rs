//! User repository backends

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use common::DatabaseError;
use parking_lot::RwLock;
use sqlx::{PgPool, Row, postgres::PgRow};
use tracing::{debug, info};
use uuid::Uuid;

use super::UserDirectory;
use crate::error::{AuthError, AuthResult};
use crate::models::{NewUser, Role, User};

/// PostgreSQL-backed user repository
#[derive(Clone)]
pub struct PgUserRepository {
    pool: PgPool,
}

impl PgUserRepository {
    /// Create a new user repository
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn user_from_row(row: PgRow) -> AuthResult<User> {
        let role: String = row.get("role");
        let role = role
            .parse::<Role>()
            .map_err(|e| AuthError::Internal(format!("stored user has {e}")))?;

        Ok(User {
            id: row.get("id"),
            username: row.get("username"),
            password_hash: row.get("password_hash"),
            role,
            created_at: row.get("created_at"),
            updated_at: row.get("updated_at"),
        })
    }
}

fn duplicate_username(username: &str) -> AuthError {
    AuthError::Conflict(format!("Username {username} already exists"))
}

#[async_trait]
impl UserDirectory for PgUserRepository {
    async fn create_user(&self, new_user: &NewUser) -> AuthResult<User> {
        info!("Creating new user: {}", new_user.username);

        let row = sqlx::query(
            r#"
            INSERT INTO users (username, password_hash, role)
            VALUES ($1, $2, $3)
            RETURNING id, username, password_hash, role, created_at, updated_at
            "#,
        )
        .bind(&new_user.username)
        .bind(&new_user.password_hash)
        .bind(new_user.role.as_str())
        .fetch_one(&self.pool)
        .await
        .map_err(|e| match e {
            sqlx::Error::Database(ref db) if db.is_unique_violation() => {
                duplicate_username(&new_user.username)
            }
            other => DatabaseError::Query(other).into(),
        })?;

        Self::user_from_row(row)
    }

    async fn find_by_username(&self, username: &str) -> AuthResult<Option<User>> {
        debug!("Finding user by username: {}", username);

        let row = sqlx::query(
            r#"
            SELECT id, username, password_hash, role, created_at, updated_at
            FROM users
            WHERE username = $1
            "#,
        )
        .bind(username)
        .fetch_optional(&self.pool)
        .await
        .map_err(DatabaseError::Query)?;

        row.map(Self::user_from_row).transpose()
    }

    async fn find_by_id(&self, id: Uuid) -> AuthResult<Option<User>> {
        debug!("Finding user by ID: {}", id);

        let row = sqlx::query(
            r#"
            SELECT id, username, password_hash, role, created_at, updated_at
            FROM users
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(DatabaseError::Query)?;

        row.map(Self::user_from_row).transpose()
    }
}

/// In-process user directory for tests and local runs
#[derive(Clone, Default)]
pub struct MemoryUserDirectory {
    users: Arc<RwLock<HashMap<Uuid, User>>>,
}

impl MemoryUserDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, user: User) {
        self.users.write().insert(user.id, user);
    }

    /// Drop a user, as if the account had been deleted
    pub fn remove(&self, id: Uuid) -> Option<User> {
        self.users.write().remove(&id)
    }
}

#[async_trait]
impl UserDirectory for MemoryUserDirectory {
    async fn create_user(&self, new_user: &NewUser) -> AuthResult<User> {
        let mut users = self.users.write();
        if users.values().any(|user| user.username == new_user.username) {
            return Err(duplicate_username(&new_user.username));
        }

        let now = Utc::now();
        let user = User {
            id: Uuid::new_v4(),
            username: new_user.username.clone(),
            password_hash: new_user.password_hash.clone(),
            role: new_user.role,
            created_at: now,
            updated_at: now,
        };
        users.insert(user.id, user.clone());
        Ok(user)
    }

    async fn find_by_username(&self, username: &str) -> AuthResult<Option<User>> {
        Ok(self
            .users
            .read()
            .values()
            .find(|user| user.username == username)
            .cloned())
    }

    async fn find_by_id(&self, id: Uuid) -> AuthResult<Option<User>> {
        Ok(self.users.read().get(&id).cloned())
    }
}
