//! # Connection Registry
//!
//! Maps each device id to its single live session.
//!
//! ## Core Responsibilities:
//! - **Registration handshake:** resolves the identity token, rejects a second
//!   session for a device that is already connected and, on success, pushes the
//!   device's subset of today's cache as `init_schedules`.
//! - **Scoped cleanup:** every successful registration returns a
//!   [`SessionGuard`]; dropping it frees the slot on every exit path of the
//!   connection task.
//! - **Best-effort delivery:** pushes go through each session's outbound
//!   channel. A device without a session is a logged no-op.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, info, warn};

use super::error::RegistrationError;
use super::schedule_cache::ScheduleCache;
use crate::models::{Device, DeviceId, Target};
use crate::protocol::OutboundMessage;
use crate::store::DeviceDirectory;

pub type SessionId = u64;
pub type OutboundSender = UnboundedSender<OutboundMessage>;

#[derive(Debug)]
struct SessionEntry {
    session_id: SessionId,
    device: Device,
    sender: OutboundSender,
}

type SessionMap = Arc<RwLock<HashMap<DeviceId, SessionEntry>>>;

fn read_sessions(map: &SessionMap) -> RwLockReadGuard<'_, HashMap<DeviceId, SessionEntry>> {
    map.read().unwrap_or_else(PoisonError::into_inner)
}

fn write_sessions(map: &SessionMap) -> RwLockWriteGuard<'_, HashMap<DeviceId, SessionEntry>> {
    map.write().unwrap_or_else(PoisonError::into_inner)
}

/// A device with a live session, as seen by the dispatcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectedDevice {
    pub device: Device,
    pub session_id: SessionId,
}

pub struct ConnectionRegistry {
    sessions: SessionMap,
    directory: Arc<dyn DeviceDirectory>,
    cache: ScheduleCache,
    next_session: AtomicU64,
}

impl ConnectionRegistry {
    pub fn new(directory: Arc<dyn DeviceDirectory>, cache: ScheduleCache) -> Self {
        Self {
            sessions: Arc::new(RwLock::new(HashMap::new())),
            directory,
            cache,
            next_session: AtomicU64::new(1),
        }
    }

    /// Runs the registration handshake for a new connection.
    ///
    /// # Arguments
    /// * `sender` - Outbound channel of the connection task.
    /// * `token` - Identity token from the `register_monitor` frame.
    ///
    /// ## Logic:
    /// 1. Missing or blank token is rejected before any lookup.
    /// 2. The token is resolved through the device directory.
    /// 3. The slot is claimed under the write lock; an existing session wins.
    /// 4. `init_schedules` is queued before the lock is released, so no
    ///    `schedule_update` for this device can overtake it.
    pub async fn register(
        &self,
        sender: OutboundSender,
        token: Option<&str>,
    ) -> Result<SessionGuard, RegistrationError> {
        let token = match token.map(str::trim) {
            Some(t) if !t.is_empty() => t,
            _ => return Err(RegistrationError::TokenRequired),
        };

        let device = match self.directory.resolve_token(token).await {
            Ok(Some(device)) => device,
            Ok(None) => return Err(RegistrationError::InvalidToken),
            Err(e) => {
                warn!(error = %e, "Device identity lookup failed");
                return Err(RegistrationError::Unavailable(e.to_string()));
            }
        };

        let session_id = self.next_session.fetch_add(1, Ordering::Relaxed);
        {
            let mut sessions = write_sessions(&self.sessions);
            if sessions.contains_key(&device.id) {
                return Err(RegistrationError::AlreadyConnected(device.id));
            }
            let initial = self.cache.get_for_device(&device);
            let count = initial.len();
            if sender.send(OutboundMessage::InitSchedules(initial)).is_err() {
                // The connection task is already gone; do not claim the slot.
                warn!(device_id = device.id, "Connection closed before init_schedules");
                return Err(RegistrationError::Unavailable("connection closed".into()));
            }
            sessions.insert(
                device.id,
                SessionEntry {
                    session_id,
                    device: device.clone(),
                    sender,
                },
            );
            info!(device_id = device.id, session_id, schedules = count, "Monitor registered");
        }

        Ok(SessionGuard {
            sessions: Arc::clone(&self.sessions),
            device,
            session_id,
        })
    }

    /// Removes the session of a device regardless of which session owns it.
    pub fn handle_disconnect(&self, device_id: DeviceId) -> bool {
        let removed = write_sessions(&self.sessions).remove(&device_id).is_some();
        if removed {
            info!(device_id, "Monitor disconnected");
        }
        removed
    }

    /// Best-effort push to one device.
    pub fn notify_update(&self, device_id: DeviceId, message: OutboundMessage) -> bool {
        let sessions = read_sessions(&self.sessions);
        let Some(entry) = sessions.get(&device_id) else {
            debug!(device_id, event = message.event(), "No live session, push dropped");
            return false;
        };
        deliver(entry, message)
    }

    /// Push to one device only if it is still served by `session_id`.
    pub fn notify_session(
        &self,
        device_id: DeviceId,
        session_id: SessionId,
        message: OutboundMessage,
    ) -> bool {
        let sessions = read_sessions(&self.sessions);
        match sessions.get(&device_id) {
            Some(entry) if entry.session_id == session_id => deliver(entry, message),
            _ => {
                debug!(device_id, session_id, "Session replaced or gone, push dropped");
                false
            }
        }
    }

    /// Pushes `message` to every connected device `target` covers.
    /// Returns how many sessions accepted it.
    pub fn notify_target(&self, target: &Target, message: &OutboundMessage) -> usize {
        let sessions = read_sessions(&self.sessions);
        sessions
            .values()
            .filter(|entry| target.covers(&entry.device))
            .filter(|entry| deliver(entry, message.clone()))
            .count()
    }

    /// Re-sends `init_schedules` to every connected device covered by `target`.
    pub fn resync_target(&self, target: &Target) -> usize {
        self.resync_where(|device| target.covers(device))
    }

    /// Re-sends `init_schedules` to every connected device.
    pub fn resync_all(&self) -> usize {
        self.resync_where(|_| true)
    }

    fn resync_where(&self, mut wanted: impl FnMut(&Device) -> bool) -> usize {
        let sessions = read_sessions(&self.sessions);
        let mut delivered = 0;
        for entry in sessions.values().filter(|e| wanted(&e.device)) {
            let subset = self.cache.get_for_device(&entry.device);
            if deliver(entry, OutboundMessage::InitSchedules(subset)) {
                delivered += 1;
            }
        }
        delivered
    }

    pub fn connected_devices(&self) -> Vec<ConnectedDevice> {
        read_sessions(&self.sessions)
            .values()
            .map(|entry| ConnectedDevice {
                device: entry.device.clone(),
                session_id: entry.session_id,
            })
            .collect()
    }

    pub fn is_connected(&self, device_id: DeviceId) -> bool {
        read_sessions(&self.sessions).contains_key(&device_id)
    }

    pub fn len(&self) -> usize {
        read_sessions(&self.sessions).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn deliver(entry: &SessionEntry, message: OutboundMessage) -> bool {
    let event = message.event();
    match entry.sender.send(message) {
        Ok(()) => true,
        Err(_) => {
            warn!(
                device_id = entry.device.id,
                session_id = entry.session_id,
                event,
                "Push failed, session channel closed"
            );
            false
        }
    }
}

/// Owns a registry slot for the lifetime of a connection task.
#[must_use = "dropping the guard releases the session immediately"]
#[derive(Debug)]
pub struct SessionGuard {
    sessions: SessionMap,
    device: Device,
    session_id: SessionId,
}

impl SessionGuard {
    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn session_id(&self) -> SessionId {
        self.session_id
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        let mut sessions = write_sessions(&self.sessions);
        // Only release the slot if it still belongs to this session.
        if sessions
            .get(&self.device.id)
            .is_some_and(|entry| entry.session_id == self.session_id)
        {
            sessions.remove(&self.device.id);
            debug!(device_id = self.device.id, session_id = self.session_id, "Session released");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryStore;
    use tokio::sync::mpsc;

    fn registry() -> ConnectionRegistry {
        let store = InMemoryStore::new()
            .with_device("tok-5", Device::new(5, "lobby").in_group(3))
            .with_device("tok-6", Device::new(6, "entrance"));
        ConnectionRegistry::new(Arc::new(store), ScheduleCache::new())
    }

    #[tokio::test]
    async fn register_pushes_init_schedules() {
        let registry = registry();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let guard = registry.register(tx, Some("tok-5")).await.unwrap();
        assert_eq!(guard.device().id, 5);
        assert!(matches!(rx.recv().await, Some(OutboundMessage::InitSchedules(v)) if v.is_empty()));
        assert!(registry.is_connected(5));
    }

    #[tokio::test]
    async fn missing_and_unknown_tokens_are_rejected() {
        let registry = registry();
        let (tx, _rx) = mpsc::unbounded_channel();
        assert_eq!(
            registry.register(tx.clone(), None).await.err(),
            Some(RegistrationError::TokenRequired)
        );
        assert_eq!(
            registry.register(tx.clone(), Some("  ")).await.err(),
            Some(RegistrationError::TokenRequired)
        );
        assert_eq!(
            registry.register(tx, Some("nope")).await.err(),
            Some(RegistrationError::InvalidToken)
        );
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn second_session_is_rejected_and_first_keeps_receiving() {
        let registry = registry();
        let (tx1, mut rx1) = mpsc::unbounded_channel();
        let (tx2, _rx2) = mpsc::unbounded_channel();
        let _first = registry.register(tx1, Some("tok-5")).await.unwrap();
        let _ = rx1.recv().await;

        assert_eq!(
            registry.register(tx2, Some("tok-5")).await.err(),
            Some(RegistrationError::AlreadyConnected(5))
        );
        assert_eq!(registry.notify_target(&Target::Group(3), &OutboundMessage::InitSchedules(vec![])), 1);
        assert!(rx1.recv().await.is_some());
    }

    #[tokio::test]
    async fn dropping_guard_frees_slot_but_not_a_newer_session() {
        let registry = registry();
        let (tx1, _rx1) = mpsc::unbounded_channel();
        let first = registry.register(tx1, Some("tok-6")).await.unwrap();
        drop(first);
        assert!(!registry.is_connected(6));

        let (tx2, _rx2) = mpsc::unbounded_channel();
        let second = registry.register(tx2, Some("tok-6")).await.unwrap();
        let stale = SessionGuard {
            sessions: Arc::clone(&registry.sessions),
            device: second.device().clone(),
            session_id: second.session_id() + 100,
        };
        drop(stale);
        assert!(registry.is_connected(6));
    }

    #[tokio::test]
    async fn notify_without_session_is_a_no_op() {
        let registry = registry();
        assert!(!registry.notify_update(42, OutboundMessage::InitSchedules(vec![])));
        assert!(!registry.handle_disconnect(42));
    }

    #[tokio::test]
    async fn directory_outage_reports_unavailable() {
        let store = Arc::new(InMemoryStore::new().with_device("tok", Device::new(1, "a")));
        store.set_offline(true);
        let registry = ConnectionRegistry::new(store, ScheduleCache::new());
        let (tx, _rx) = mpsc::unbounded_channel();
        assert!(matches!(
            registry.register(tx, Some("tok")).await,
            Err(RegistrationError::Unavailable(_))
        ));
    }
}
