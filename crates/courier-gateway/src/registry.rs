use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::{Mutex, PoisonError};

use uuid::Uuid;

use crate::presence::{PresenceTracker, PresenceTransition};

/// Identifies one live connection. A user may hold several.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Default)]
struct RegistryState {
    by_user: HashMap<Uuid, HashSet<ConnectionId>>,
    owners: HashMap<ConnectionId, Uuid>,
}

impl RegistryState {
    fn count(&self, user_id: Uuid) -> usize {
        self.by_user.get(&user_id).map_or(0, HashSet::len)
    }
}

/// Live connections per user. A user is online iff they hold at least one.
pub struct ConnectionRegistry {
    state: Mutex<RegistryState>,
    presence: PresenceTracker,
}

impl ConnectionRegistry {
    pub fn new(presence: PresenceTracker) -> Self {
        Self {
            state: Mutex::new(RegistryState::default()),
            presence,
        }
    }

    /// Record a live connection. The presence announcement happens inside
    /// the critical section so two transitions of the same user can't be
    /// published out of order.
    pub fn admit(&self, user_id: Uuid, conn: ConnectionId) -> PresenceTransition {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let before = state.count(user_id);
        state.owners.insert(conn, user_id);
        state.by_user.entry(user_id).or_default().insert(conn);
        let transition = PresenceTransition::between(before, state.count(user_id));
        self.presence.announce(user_id, transition);
        transition
    }

    /// Forget a connection. `None` if it was never admitted or already removed.
    pub fn remove(&self, conn: ConnectionId) -> Option<(Uuid, PresenceTransition)> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let user_id = state.owners.remove(&conn)?;
        let before = state.count(user_id);
        if let Some(conns) = state.by_user.get_mut(&user_id) {
            conns.remove(&conn);
            if conns.is_empty() {
                state.by_user.remove(&user_id);
            }
        }
        let transition = PresenceTransition::between(before, state.count(user_id));
        self.presence.announce(user_id, transition);
        Some((user_id, transition))
    }

    pub fn is_online(&self, user_id: Uuid) -> bool {
        self.connection_count(user_id) > 0
    }

    pub fn connection_count(&self, user_id: Uuid) -> usize {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .count(user_id)
    }

    pub fn online_users(&self) -> Vec<Uuid> {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.by_user.keys().copied().collect()
    }

    #[cfg(test)]
    fn owner_of(&self, conn: ConnectionId) -> Option<Uuid> {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.owners.get(&conn).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pubsub::{Broker, InProcessBroker};
    use crate::rooms::RoomId;
    use courier_types::events::ServerEvent;
    use std::sync::Arc;
    use tokio::sync::mpsc;

    fn registry_with_observer() -> (ConnectionRegistry, mpsc::UnboundedReceiver<ServerEvent>) {
        let broker = Arc::new(InProcessBroker::new());
        let observer = ConnectionId::new();
        let (tx, rx) = mpsc::unbounded_channel();
        broker.attach(observer, tx);
        broker.subscribe(&RoomId::Everyone, observer);
        (ConnectionRegistry::new(PresenceTracker::new(broker)), rx)
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<ServerEvent>) -> Vec<ServerEvent> {
        std::iter::from_fn(|| rx.try_recv().ok()).collect()
    }

    #[test]
    fn test_online_iff_live_connections() {
        let (registry, _rx) = registry_with_observer();
        let user = Uuid::new_v4();
        assert!(!registry.is_online(user));

        let conns: Vec<_> = (0..3).map(|_| ConnectionId::new()).collect();
        for conn in &conns {
            registry.admit(user, *conn);
            assert!(registry.is_online(user));
        }
        assert_eq!(registry.connection_count(user), 3);

        for (i, conn) in conns.iter().enumerate() {
            registry.remove(*conn);
            assert_eq!(registry.is_online(user), i < conns.len() - 1);
        }
        assert!(registry.online_users().is_empty());
    }

    #[test]
    fn test_presence_is_edge_triggered() {
        let (registry, mut rx) = registry_with_observer();
        let user = Uuid::new_v4();
        let (phone, laptop) = (ConnectionId::new(), ConnectionId::new());

        assert_eq!(registry.admit(user, phone), PresenceTransition::CameOnline);
        assert_eq!(registry.admit(user, laptop), PresenceTransition::Unchanged);
        assert_eq!(registry.remove(phone), Some((user, PresenceTransition::Unchanged)));
        assert_eq!(registry.remove(laptop), Some((user, PresenceTransition::WentOffline)));

        assert_eq!(
            drain(&mut rx),
            vec![
                ServerEvent::PresenceChanged { user_id: user, online: true },
                ServerEvent::PresenceChanged { user_id: user, online: false },
            ]
        );
    }

    #[test]
    fn test_double_remove_is_noop() {
        let (registry, mut rx) = registry_with_observer();
        let user = Uuid::new_v4();
        let conn = ConnectionId::new();
        registry.admit(user, conn);
        assert_eq!(registry.owner_of(conn), Some(user));
        assert!(registry.remove(conn).is_some());
        assert!(registry.remove(conn).is_none());
        assert_eq!(drain(&mut rx).len(), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_admit_remove_settles() {
        let (registry, _rx) = registry_with_observer();
        let registry = Arc::new(registry);
        let user = Uuid::new_v4();

        let tasks: Vec<_> = (0..32)
            .map(|i| {
                let registry = registry.clone();
                tokio::spawn(async move {
                    let conn = ConnectionId::new();
                    registry.admit(user, conn);
                    tokio::task::yield_now().await;
                    // keep every fourth connection alive
                    if i % 4 != 0 {
                        registry.remove(conn);
                    }
                })
            })
            .collect();
        for task in tasks {
            task.await.unwrap();
        }

        assert_eq!(registry.connection_count(user), 8);
        assert!(registry.is_online(user));
    }
}
