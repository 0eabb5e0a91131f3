//! Application state shared across handlers

use std::sync::Arc;

use crate::presence::PresenceStore;
use crate::registry::ConnectionRegistry;
use crate::service::AuthService;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub auth: AuthService,
    pub registry: ConnectionRegistry,
    pub presence: Arc<dyn PresenceStore>,
}
