//! Registry of live realtime connections keyed by (user, session)
//!
//! At most one connection exists per pair: registering a new one
//! disconnects the previous holder before the new handle becomes visible.
//! Lookups and liveness updates take the shared lock; structural changes
//! take the exclusive lock. A path that needs to mutate after a shared lookup
//! drops the shared guard first and re-checks under the exclusive one.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, error, info};
use uuid::Uuid;

/// Reason given to a connection displaced by a newer one for the same pair
pub const DUPLICATE_CONNECTION: &str = "duplicate connection";

/// Default minimum spacing between liveness updates of one connection
pub const DEFAULT_LIVENESS_INTERVAL: std::time::Duration = std::time::Duration::from_secs(120);

/// Structured frames the server pushes to realtime clients
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ServerFrame {
    Disconnect { message: String },
}

/// Work item for a connection's writer task
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    Text(String),
    Close,
}

/// Opaque handle on one live realtime connection
#[derive(Debug)]
pub struct ConnectionHandle {
    id: Uuid,
    user_id: Uuid,
    session_id: Uuid,
    outbound: mpsc::UnboundedSender<Outbound>,
    last_liveness: Mutex<DateTime<Utc>>,
}

impl ConnectionHandle {
    /// Create a handle and the receiving end its writer task drains
    pub fn new(
        user_id: Uuid,
        session_id: Uuid,
        now: DateTime<Utc>,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<Outbound>) {
        let (outbound, receiver) = mpsc::unbounded_channel();
        let handle = Arc::new(Self {
            id: Uuid::new_v4(),
            user_id,
            session_id,
            outbound,
            last_liveness: Mutex::new(now),
        });
        (handle, receiver)
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn user_id(&self) -> Uuid {
        self.user_id
    }

    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    pub fn last_liveness(&self) -> DateTime<Utc> {
        *self.last_liveness.lock()
    }

    /// Whether the writer side has gone away
    pub fn is_closed(&self) -> bool {
        self.outbound.is_closed()
    }

    /// Queue a text message; false if the transport is already gone
    pub fn send_text(&self, text: impl Into<String>) -> bool {
        self.outbound.send(Outbound::Text(text.into())).is_ok()
    }

    /// Queue a structured frame
    pub fn send_frame(&self, frame: &ServerFrame) -> bool {
        match serde_json::to_string(frame) {
            Ok(text) => self.send_text(text),
            Err(e) => {
                error!("Failed to encode server frame: {}", e);
                false
            }
        }
    }

    /// Send exactly one disconnect notice, then close the transport
    ///
    /// A transport that is already closed is not an error.
    pub fn disconnect(&self, reason: &str) {
        self.send_frame(&ServerFrame::Disconnect {
            message: reason.to_string(),
        });
        let _ = self.outbound.send(Outbound::Close);
        debug!(
            connection = %self.id,
            user = %self.user_id,
            session = %self.session_id,
            "disconnect issued: {}", reason
        );
    }
}

type SessionBucket = HashMap<Uuid, Arc<ConnectionHandle>>;

/// Concurrent index of live connections
#[derive(Clone)]
pub struct ConnectionRegistry {
    buckets: Arc<RwLock<HashMap<Uuid, SessionBucket>>>,
    liveness_interval: chrono::Duration,
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_LIVENESS_INTERVAL)
    }
}

impl ConnectionRegistry {
    pub fn new(liveness_interval: std::time::Duration) -> Self {
        Self {
            buckets: Arc::new(RwLock::new(HashMap::new())),
            liveness_interval: chrono::Duration::from_std(liveness_interval)
                .unwrap_or_else(|_| chrono::Duration::days(365)),
        }
    }

    /// Install `handle` for its (user, session) pair
    ///
    /// Any previous connection for the pair is sent the duplicate-connection
    /// notice and closed before the new handle is inserted; it is returned.
    pub fn register(&self, handle: Arc<ConnectionHandle>) -> Option<Arc<ConnectionHandle>> {
        let mut buckets = self.buckets.write();
        let bucket = buckets.entry(handle.user_id).or_default();

        let displaced = bucket.remove(&handle.session_id);
        if let Some(previous) = &displaced {
            info!(
                user = %handle.user_id,
                session = %handle.session_id,
                "Displacing duplicate connection {}", previous.id
            );
            previous.disconnect(DUPLICATE_CONNECTION);
        }

        bucket.insert(handle.session_id, handle);
        displaced
    }

    /// Remove the entry holding exactly this handle
    ///
    /// A connection that was already displaced leaves its successor alone.
    /// Emptied user buckets are pruned.
    pub fn unregister(&self, handle: &ConnectionHandle) -> bool {
        if !self.holds(handle) {
            return false;
        }

        let mut buckets = self.buckets.write();
        let Some(bucket) = buckets.get_mut(&handle.user_id) else {
            return false;
        };
        let removed = match bucket.get(&handle.session_id) {
            Some(current) if current.id == handle.id => {
                bucket.remove(&handle.session_id);
                true
            }
            _ => false,
        };
        if bucket.is_empty() {
            buckets.remove(&handle.user_id);
        }
        removed
    }

    /// Connection currently registered for the pair
    pub fn find(&self, user_id: Uuid, session_id: Uuid) -> Option<Arc<ConnectionHandle>> {
        self.buckets
            .read()
            .get(&user_id)
            .and_then(|bucket| bucket.get(&session_id))
            .cloned()
    }

    /// Disconnect `handle` with `reason` and drop it from the registry
    pub fn evict(&self, handle: &ConnectionHandle, reason: &str) -> bool {
        handle.disconnect(reason);
        self.unregister(handle)
    }

    /// Record liveness for a registered connection
    ///
    /// Only updates, and returns true, when at least the configured interval
    /// has passed since the previous update.
    pub fn touch_liveness(&self, handle: &ConnectionHandle, now: DateTime<Utc>) -> bool {
        let buckets = self.buckets.read();
        let registered = buckets
            .get(&handle.user_id)
            .and_then(|bucket| bucket.get(&handle.session_id))
            .is_some_and(|current| current.id == handle.id);
        if !registered {
            return false;
        }

        let mut last = handle.last_liveness.lock();
        if now - *last < self.liveness_interval {
            return false;
        }
        *last = now;
        true
    }

    /// Total number of registered connections
    pub fn connection_count(&self) -> usize {
        self.buckets.read().values().map(HashMap::len).sum()
    }

    /// Number of users with at least one registered connection
    pub fn user_count(&self) -> usize {
        self.buckets.read().len()
    }

    fn holds(&self, handle: &ConnectionHandle) -> bool {
        self.buckets
            .read()
            .get(&handle.user_id)
            .and_then(|bucket| bucket.get(&handle.session_id))
            .is_some_and(|current| current.id == handle.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn drain(receiver: &mut mpsc::UnboundedReceiver<Outbound>) -> Vec<Outbound> {
        let mut items = Vec::new();
        while let Ok(item) = receiver.try_recv() {
            items.push(item);
        }
        items
    }

    fn disconnect_frame(reason: &str) -> Outbound {
        Outbound::Text(format!(r#"{{"type":"disconnect","message":"{reason}"}}"#))
    }

    #[test]
    fn second_registration_evicts_first() {
        let registry = ConnectionRegistry::default();
        let user = Uuid::new_v4();
        let session = Uuid::new_v4();

        let (first, mut first_rx) = ConnectionHandle::new(user, session, Utc::now());
        let (second, mut second_rx) = ConnectionHandle::new(user, session, Utc::now());

        assert!(registry.register(first.clone()).is_none());
        let displaced = registry.register(second.clone()).unwrap();
        assert_eq!(displaced.id(), first.id());

        assert_eq!(
            drain(&mut first_rx),
            vec![disconnect_frame(DUPLICATE_CONNECTION), Outbound::Close]
        );
        assert!(drain(&mut second_rx).is_empty());
        assert_eq!(registry.find(user, session).unwrap().id(), second.id());
        assert_eq!(registry.connection_count(), 1);
    }

    #[test]
    fn displaced_connection_closing_keeps_successor() {
        let registry = ConnectionRegistry::default();
        let user = Uuid::new_v4();
        let session = Uuid::new_v4();
        let (first, _first_rx) = ConnectionHandle::new(user, session, Utc::now());
        let (second, _second_rx) = ConnectionHandle::new(user, session, Utc::now());

        registry.register(first.clone());
        registry.register(second.clone());

        assert!(!registry.unregister(&first));
        assert_eq!(registry.find(user, session).unwrap().id(), second.id());
    }

    #[test]
    fn sessions_of_one_user_are_independent_and_buckets_pruned() {
        let registry = ConnectionRegistry::default();
        let user = Uuid::new_v4();
        let (a, mut a_rx) = ConnectionHandle::new(user, Uuid::new_v4(), Utc::now());
        let (b, _b_rx) = ConnectionHandle::new(user, Uuid::new_v4(), Utc::now());

        registry.register(a.clone());
        registry.register(b.clone());
        assert_eq!(registry.connection_count(), 2);
        assert_eq!(registry.user_count(), 1);
        assert!(drain(&mut a_rx).is_empty());

        assert!(registry.unregister(&a));
        assert_eq!(registry.user_count(), 1);
        assert!(registry.unregister(&b));
        assert_eq!(registry.user_count(), 0);
        assert!(!registry.unregister(&b));
    }

    #[test]
    fn evict_notifies_and_removes() {
        let registry = ConnectionRegistry::default();
        let (handle, mut rx) = ConnectionHandle::new(Uuid::new_v4(), Uuid::new_v4(), Utc::now());
        registry.register(handle.clone());

        assert!(registry.evict(&handle, "session revoked"));
        assert_eq!(
            drain(&mut rx),
            vec![disconnect_frame("session revoked"), Outbound::Close]
        );
        assert!(registry.find(handle.user_id(), handle.session_id()).is_none());
    }

    #[test]
    fn disconnect_on_closed_transport_is_harmless() {
        let (handle, rx) = ConnectionHandle::new(Uuid::new_v4(), Uuid::new_v4(), Utc::now());
        drop(rx);
        assert!(handle.is_closed());
        handle.disconnect("session expired");
        assert!(!handle.send_text("hello"));
    }

    #[test]
    fn liveness_updates_are_rate_limited() {
        let registry = ConnectionRegistry::new(std::time::Duration::from_secs(120));
        let start = Utc::now();
        let (handle, _rx) = ConnectionHandle::new(Uuid::new_v4(), Uuid::new_v4(), start);

        // Unregistered handles are ignored
        assert!(!registry.touch_liveness(&handle, start + Duration::seconds(500)));

        registry.register(handle.clone());
        assert!(!registry.touch_liveness(&handle, start + Duration::seconds(60)));
        assert_eq!(handle.last_liveness(), start);

        let later = start + Duration::seconds(120);
        assert!(registry.touch_liveness(&handle, later));
        assert_eq!(handle.last_liveness(), later);
        assert!(!registry.touch_liveness(&handle, later + Duration::seconds(119)));
    }

    #[test]
    fn concurrent_registration_keeps_one_entry_per_pair() {
        let registry = ConnectionRegistry::default();
        let user = Uuid::new_v4();
        let session = Uuid::new_v4();

        let threads: Vec<_> = (0..8)
            .map(|_| {
                let registry = registry.clone();
                std::thread::spawn(move || {
                    for _ in 0..50 {
                        let (handle, _rx) = ConnectionHandle::new(user, session, Utc::now());
                        registry.register(handle.clone());
                        registry.find(user, session);
                        registry.unregister(&handle);
                    }
                })
            })
            .collect();
        for thread in threads {
            thread.join().unwrap();
        }

        assert!(registry.connection_count() <= 1);
    }
}
