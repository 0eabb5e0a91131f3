//! Turns ledger expirations and deletions into forced disconnects
//!
//! Realtime connections never poll for revocation. This listener watches
//! the ledger's change feed and, for each expired or deleted session,
//! disconnects the connection registered for that exact (user, session)
//! pair. Delivery is best effort: a missed event only delays the close,
//! since every later request on the dead session fails the ledger check.

use std::sync::Arc;
use std::time::Duration;

use common::CacheResult;
use futures_util::StreamExt;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::models::LedgerEvent;
use crate::registry::ConnectionRegistry;
use crate::session::{LedgerFeed, SessionStore};

const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// What handling one event resulted in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvalidationOutcome {
    DisconnectIssued,
    NoOp,
}

/// Background subscriber bridging the ledger and the connection registry
#[derive(Clone)]
pub struct InvalidationListener {
    store: Arc<dyn SessionStore>,
    registry: ConnectionRegistry,
}

impl InvalidationListener {
    pub fn new(store: Arc<dyn SessionStore>, registry: ConnectionRegistry) -> Self {
        Self { store, registry }
    }

    /// Resolve one event against the registry
    pub fn handle_event(&self, event: &LedgerEvent) -> InvalidationOutcome {
        let key = event.key;
        match self.registry.find(key.user_id, key.session_id) {
            Some(handle) => {
                self.registry
                    .evict(&handle, event.kind.disconnect_reason());
                info!(
                    user = %key.user_id,
                    session = %key.session_id,
                    "Session {:?}, realtime connection disconnected", event.kind
                );
                InvalidationOutcome::DisconnectIssued
            }
            None => {
                debug!(
                    user = %key.user_id,
                    session = %key.session_id,
                    "Session {:?}, no live connection", event.kind
                );
                InvalidationOutcome::NoOp
            }
        }
    }

    /// Subscribe to the change feed, then process it on a background task
    ///
    /// Returns once the subscription is live. If the feed later ends, the
    /// task re-subscribes with exponential backoff.
    pub async fn start(self) -> CacheResult<JoinHandle<()>> {
        let feed = self.store.subscribe().await?;
        info!("Session invalidation listener subscribed");
        Ok(tokio::spawn(self.run(feed)))
    }

    async fn run(self, mut feed: LedgerFeed) {
        loop {
            while let Some(event) = feed.next().await {
                self.handle_event(&event);
            }
            warn!("Session change feed ended, revocations are not propagated until resubscribed");
            feed = self.resubscribe().await;
        }
    }

    async fn resubscribe(&self) -> LedgerFeed {
        let mut delay = INITIAL_BACKOFF;
        loop {
            tokio::time::sleep(delay).await;
            match self.store.subscribe().await {
                Ok(feed) => {
                    info!("Session invalidation listener resubscribed");
                    return feed;
                }
                Err(e) => {
                    error!("Failed to resubscribe to session change feed: {}", e);
                    delay = (delay * 2).min(MAX_BACKOFF);
                }
            }
        }
    }
}
