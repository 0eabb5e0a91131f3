//! Custom error types for the common library
//!
//! This module defines infrastructure error types that services map onto
//! their own outward error surfaces.

use redis::RedisError;
use sqlx::Error as SqlxError;
use std::time::Duration;
use thiserror::Error;

/// Custom error type for database operations
#[derive(Error, Debug)]
pub enum DatabaseError {
    /// Error occurred during database connection
    #[error("Database connection error: {0}")]
    Connection(#[source] SqlxError),

    /// Error occurred during database query execution
    #[error("Database query error: {0}")]
    Query(#[source] SqlxError),

    /// Configuration error
    #[error("Database configuration error: {0}")]
    Configuration(String),
}

/// Type alias for Result with DatabaseError
pub type DatabaseResult<T> = Result<T, DatabaseError>;

/// Error type for Redis operations
///
/// A timeout is a failure in its own right and must never be read as
/// "key not found".
#[derive(Error, Debug)]
pub enum CacheError {
    /// Could not open or obtain a connection
    #[error("Redis connection error: {0}")]
    Connection(#[source] RedisError),

    /// The server rejected or failed a command
    #[error("Redis command error: {0}")]
    Command(#[from] RedisError),

    /// The round trip did not complete before its deadline
    #[error("Redis operation timed out after {0:?}")]
    Timeout(Duration),

    /// The server answered with something we cannot interpret
    #[error("Unexpected Redis reply: {0}")]
    Protocol(String),
}

/// Type alias for Result with CacheError
pub type CacheResult<T> = Result<T, CacheError>;
