//! Room fan-out. Every live connection owns an outbox; rooms are sets of
//! connections. The delivery pipeline only ever talks to [`Broker`], so the
//! in-process implementation can be replaced by a networked one.

use std::collections::{HashMap, HashSet};
use std::sync::{PoisonError, RwLock};

use tokio::sync::mpsc;
use tracing::trace;

use courier_types::events::ServerEvent;

use crate::registry::ConnectionId;
use crate::rooms::RoomId;

/// Outbound queue of a single connection. Events arrive in publication order.
pub type Outbox = mpsc::UnboundedSender<ServerEvent>;

pub trait Broker: Send + Sync + 'static {
    /// Make a connection addressable. Replaces any previous outbox for it.
    fn attach(&self, conn: ConnectionId, outbox: Outbox);

    /// Forget a connection and drop it from every room. Returns the rooms it was in.
    fn detach(&self, conn: ConnectionId) -> Vec<RoomId>;

    /// Returns false if already subscribed or the connection isn't attached.
    fn subscribe(&self, room: &RoomId, conn: ConnectionId) -> bool;

    /// Returns false if the connection wasn't subscribed.
    fn unsubscribe(&self, room: &RoomId, conn: ConnectionId) -> bool;

    fn is_subscribed(&self, room: &RoomId, conn: ConnectionId) -> bool;

    /// Deliver to every subscriber of `room` except `except`. Returns how many
    /// outboxes accepted the event.
    fn publish(&self, room: &RoomId, event: &ServerEvent, except: Option<ConnectionId>) -> usize;

    /// Deliver to exactly one connection.
    fn send_to(&self, conn: ConnectionId, event: ServerEvent) -> bool;

    /// Every attached connection.
    fn connections(&self) -> Vec<ConnectionId>;
}

#[derive(Default)]
struct BrokerState {
    outboxes: HashMap<ConnectionId, Outbox>,
    rooms: HashMap<RoomId, HashSet<ConnectionId>>,
    memberships: HashMap<ConnectionId, HashSet<RoomId>>,
}

/// Single-process broker over unbounded mpsc channels.
#[derive(Default)]
pub struct InProcessBroker {
    state: RwLock<BrokerState>,
}

impl InProcessBroker {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Broker for InProcessBroker {
    fn attach(&self, conn: ConnectionId, outbox: Outbox) {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        state.outboxes.insert(conn, outbox);
        state.memberships.entry(conn).or_default();
    }

    fn detach(&self, conn: ConnectionId) -> Vec<RoomId> {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        state.outboxes.remove(&conn);

        let joined = state.memberships.remove(&conn).unwrap_or_default();
        for room in &joined {
            if let Some(members) = state.rooms.get_mut(room) {
                members.remove(&conn);
                if members.is_empty() {
                    state.rooms.remove(room);
                }
            }
        }
        joined.into_iter().collect()
    }

    fn subscribe(&self, room: &RoomId, conn: ConnectionId) -> bool {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        let Some(joined) = state.memberships.get_mut(&conn) else {
            return false;
        };
        if !joined.insert(room.clone()) {
            return false;
        }
        state.rooms.entry(room.clone()).or_default().insert(conn);
        true
    }

    fn unsubscribe(&self, room: &RoomId, conn: ConnectionId) -> bool {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        let removed = state
            .memberships
            .get_mut(&conn)
            .is_some_and(|joined| joined.remove(room));
        if removed {
            if let Some(members) = state.rooms.get_mut(room) {
                members.remove(&conn);
                if members.is_empty() {
                    state.rooms.remove(room);
                }
            }
        }
        removed
    }

    fn is_subscribed(&self, room: &RoomId, conn: ConnectionId) -> bool {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        state.rooms.get(room).is_some_and(|members| members.contains(&conn))
    }

    fn publish(&self, room: &RoomId, event: &ServerEvent, except: Option<ConnectionId>) -> usize {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        let Some(members) = state.rooms.get(room) else {
            return 0;
        };

        let mut delivered = 0;
        for conn in members {
            if Some(*conn) == except {
                continue;
            }
            // A closed outbox means the connection is mid-teardown.
            if let Some(outbox) = state.outboxes.get(conn) {
                if outbox.send(event.clone()).is_ok() {
                    delivered += 1;
                }
            }
        }
        trace!("published to {} ({} recipients)", room, delivered);
        delivered
    }

    fn send_to(&self, conn: ConnectionId, event: ServerEvent) -> bool {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        state
            .outboxes
            .get(&conn)
            .is_some_and(|outbox| outbox.send(event).is_ok())
    }

    fn connections(&self) -> Vec<ConnectionId> {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        state.outboxes.keys().copied().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn presence(online: bool) -> ServerEvent {
        ServerEvent::PresenceChanged {
            user_id: Uuid::nil(),
            online,
        }
    }

    #[test]
    fn test_publish_skips_excluded_connection() {
        let broker = InProcessBroker::new();
        let room = RoomId::Group(Uuid::new_v4());
        let (a, b) = (ConnectionId::new(), ConnectionId::new());
        let (tx_a, mut rx_a) = mpsc::unbounded_channel();
        let (tx_b, mut rx_b) = mpsc::unbounded_channel();
        broker.attach(a, tx_a);
        broker.attach(b, tx_b);
        assert!(broker.subscribe(&room, a));
        assert!(broker.subscribe(&room, b));

        assert_eq!(broker.publish(&room, &presence(true), Some(a)), 1);
        assert!(rx_a.try_recv().is_err());
        assert_eq!(rx_b.try_recv().unwrap(), presence(true));
    }

    #[test]
    fn test_subscribe_is_idempotent_and_requires_attach() {
        let broker = InProcessBroker::new();
        let room = RoomId::Mailbox(Uuid::new_v4());
        let conn = ConnectionId::new();

        assert!(!broker.subscribe(&room, conn));
        let (tx, _rx) = mpsc::unbounded_channel();
        broker.attach(conn, tx);
        assert!(broker.subscribe(&room, conn));
        assert!(!broker.subscribe(&room, conn));
        assert!(broker.unsubscribe(&room, conn));
        assert!(!broker.unsubscribe(&room, conn));
        assert!(!broker.is_subscribed(&room, conn));
    }

    #[test]
    fn test_detach_leaves_every_room() {
        let broker = InProcessBroker::new();
        let conn = ConnectionId::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        broker.attach(conn, tx);
        let rooms = [RoomId::Everyone, RoomId::Group(Uuid::new_v4())];
        for room in &rooms {
            broker.subscribe(room, conn);
        }

        let mut left = broker.detach(conn);
        left.sort_by_key(|r| r.to_string());
        assert_eq!(left.len(), 2);
        for room in &rooms {
            assert_eq!(broker.publish(room, &presence(false), None), 0);
        }
        assert!(!broker.send_to(conn, presence(false)));
        assert!(rx.try_recv().is_err());
        assert!(broker.connections().is_empty());
    }
}
