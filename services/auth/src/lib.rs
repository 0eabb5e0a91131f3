//! Authentication service: two-tier tokens, the session ledger, and
//! propagation of session revocation to open realtime connections.

pub mod config;
pub mod error;
pub mod invalidation;
pub mod jwt;
pub mod middleware;
pub mod models;
pub mod password;
pub mod presence;
pub mod realtime;
pub mod registry;
pub mod repositories;
pub mod routes;
pub mod service;
pub mod session;
pub mod state;
pub mod validation;

pub use state::AppState;
