use std::fmt;
use std::sync::Arc;

use tracing::info;
use uuid::Uuid;

use courier_types::events::ServerEvent;
use courier_types::models::{Conversation, Message};

use crate::pubsub::Broker;
use crate::registry::ConnectionId;

/// A named broadcast target.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum RoomId {
    /// Every live connection; carries presence.
    Everyone,
    /// Every connection of one user; carries direct messages and personal notifications.
    Mailbox(Uuid),
    /// Every connection that joined a group's room.
    Group(Uuid),
}

impl fmt::Display for RoomId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Everyone => write!(f, "everyone"),
            Self::Mailbox(user_id) => write!(f, "user_{}", user_id),
            Self::Group(group_id) => write!(f, "group_{}", group_id),
        }
    }
}

/// Room bookkeeping on top of the broker: which rooms a connection sits in,
/// and which rooms an event about a conversation goes to.
#[derive(Clone)]
pub struct RoomMembership {
    broker: Arc<dyn Broker>,
}

impl RoomMembership {
    pub fn new(broker: Arc<dyn Broker>) -> Self {
        Self { broker }
    }

    /// Subscribe a freshly admitted connection to its user's mailbox and the
    /// presence room.
    pub fn join_mailbox(&self, conn: ConnectionId, user_id: Uuid) {
        self.broker.subscribe(&RoomId::Mailbox(user_id), conn);
        self.broker.subscribe(&RoomId::Everyone, conn);
    }

    /// Idempotent. Returns whether the connection was newly joined.
    pub fn join_group_room(&self, conn: ConnectionId, group_id: Uuid) -> bool {
        let room = RoomId::Group(group_id);
        let joined = self.broker.subscribe(&room, conn);
        if joined {
            info!("connection {} joined room {}", conn, room);
        }
        joined
    }

    /// Idempotent. Returns whether the connection was actually in the room.
    pub fn leave_group_room(&self, conn: ConnectionId, group_id: Uuid) -> bool {
        let room = RoomId::Group(group_id);
        let left = self.broker.unsubscribe(&room, conn);
        if left {
            info!("connection {} left room {}", conn, room);
        }
        left
    }

    pub fn in_room(&self, conn: ConnectionId, room: &RoomId) -> bool {
        self.broker.is_subscribed(room, conn)
    }

    pub fn publish(&self, room: &RoomId, event: &ServerEvent, except: Option<ConnectionId>) -> usize {
        self.broker.publish(room, event, except)
    }

    /// Publish to every room that follows `message`'s conversation.
    pub fn publish_for(&self, message: &Message, event: &ServerEvent, except: Option<ConnectionId>) -> usize {
        rooms_for(message)
            .iter()
            .map(|room| self.broker.publish(room, event, except))
            .sum()
    }

    pub fn send_to(&self, conn: ConnectionId, event: ServerEvent) -> bool {
        self.broker.send_to(conn, event)
    }
}

/// Rooms that follow a message. Direct messages skip shared rooms and go
/// straight to both participants' mailboxes.
pub fn rooms_for(message: &Message) -> Vec<RoomId> {
    match message.conversation {
        Conversation::Direct(recipient) => {
            vec![RoomId::Mailbox(recipient), RoomId::Mailbox(message.sender_id)]
        }
        Conversation::Group(group_id) => vec![RoomId::Group(group_id)],
    }
}

/// Where an ephemeral signal from `user_id` about `target` goes, and how the
/// receivers address that conversation.
pub fn audience(user_id: Uuid, target: Conversation) -> (RoomId, Conversation) {
    match target {
        Conversation::Direct(peer) => (RoomId::Mailbox(peer), Conversation::Direct(user_id)),
        Conversation::Group(group_id) => (RoomId::Group(group_id), target),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pubsub::InProcessBroker;
    use tokio::sync::mpsc;

    #[test]
    fn test_group_join_leave_idempotent() {
        let broker = Arc::new(InProcessBroker::new());
        let rooms = RoomMembership::new(broker.clone());
        let conn = ConnectionId::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        broker.attach(conn, tx);
        let group = Uuid::new_v4();

        assert!(rooms.join_group_room(conn, group));
        assert!(!rooms.join_group_room(conn, group));
        assert!(rooms.in_room(conn, &RoomId::Group(group)));
        assert!(rooms.leave_group_room(conn, group));
        assert!(!rooms.leave_group_room(conn, group));
        assert!(!rooms.leave_group_room(conn, Uuid::new_v4()));
    }

    #[test]
    fn test_audience_mirrors_direct_conversation() {
        let (me, peer, group) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        assert_eq!(
            audience(me, Conversation::Direct(peer)),
            (RoomId::Mailbox(peer), Conversation::Direct(me))
        );
        assert_eq!(
            audience(me, Conversation::Group(group)),
            (RoomId::Group(group), Conversation::Group(group))
        );
    }

    #[test]
    fn test_room_names() {
        let id = Uuid::nil();
        assert_eq!(RoomId::Mailbox(id).to_string(), format!("user_{}", id));
        assert_eq!(RoomId::Group(id).to_string(), format!("group_{}", id));
    }
}
