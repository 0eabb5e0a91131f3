//! Common library for the Joy Kunga application
//!
//! This crate provides shared infrastructure used across services: the
//! Redis client with keyspace subscriptions, PostgreSQL pooling, and the
//! error types both of them surface.

pub mod cache;
pub mod database;
pub mod error;

pub use error::{CacheError, CacheResult, DatabaseError, DatabaseResult};
