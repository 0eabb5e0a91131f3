//! Authentication service models

pub mod role;
pub mod session;
pub mod user;

// Re-export for convenience
pub use role::Role;
pub use session::{CurrentAccess, LedgerEvent, LedgerEventKind, LedgerValue, SessionKey};
pub use user::{LoginCredentials, NewUser, User};
