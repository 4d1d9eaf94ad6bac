use std::sync::Arc;

use tracing::info;
use uuid::Uuid;

use courier_types::events::ServerEvent;

use crate::pubsub::Broker;
use crate::rooms::RoomId;

/// Change in a user's online state caused by one admit or remove.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresenceTransition {
    CameOnline,
    WentOffline,
    Unchanged,
}

impl PresenceTransition {
    /// Edge-triggered: only an empty <-> non-empty change of the live
    /// connection count is a transition.
    pub fn between(before: usize, after: usize) -> Self {
        match (before, after) {
            (0, n) if n > 0 => Self::CameOnline,
            (n, 0) if n > 0 => Self::WentOffline,
            _ => Self::Unchanged,
        }
    }

    pub fn event(self, user_id: Uuid) -> Option<ServerEvent> {
        match self {
            Self::CameOnline => Some(ServerEvent::PresenceChanged { user_id, online: true }),
            Self::WentOffline => Some(ServerEvent::PresenceChanged { user_id, online: false }),
            Self::Unchanged => None,
        }
    }
}

/// Announces presence transitions to every live connection.
pub struct PresenceTracker {
    broker: Arc<dyn Broker>,
}

impl PresenceTracker {
    pub fn new(broker: Arc<dyn Broker>) -> Self {
        Self { broker }
    }

    pub fn announce(&self, user_id: Uuid, transition: PresenceTransition) {
        if let Some(event) = transition.event(user_id) {
            info!("{} is now {:?}", user_id, transition);
            self.broker.publish(&RoomId::Everyone, &event, None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_edges_are_transitions() {
        assert_eq!(PresenceTransition::between(0, 1), PresenceTransition::CameOnline);
        assert_eq!(PresenceTransition::between(1, 2), PresenceTransition::Unchanged);
        assert_eq!(PresenceTransition::between(2, 1), PresenceTransition::Unchanged);
        assert_eq!(PresenceTransition::between(1, 0), PresenceTransition::WentOffline);
        assert_eq!(PresenceTransition::between(0, 0), PresenceTransition::Unchanged);
    }

    #[test]
    fn test_unchanged_has_no_event() {
        assert!(PresenceTransition::Unchanged.event(Uuid::nil()).is_none());
        assert_eq!(
            PresenceTransition::WentOffline.event(Uuid::nil()),
            Some(ServerEvent::PresenceChanged { user_id: Uuid::nil(), online: false })
        );
    }
}
