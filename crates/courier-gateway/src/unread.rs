use tracing::debug;
use uuid::Uuid;

use courier_types::events::ServerEvent;
use courier_types::models::{Conversation, UnreadCount};

use crate::error::GatewayError;
use crate::rooms::{RoomId, RoomMembership};
use crate::store::{Blocking, Store};

/// Durable per-(user, conversation) unread counters, mirrored to every
/// connection of the owning user.
#[derive(Clone)]
pub struct UnreadCounter {
    store: Blocking<dyn Store>,
    rooms: RoomMembership,
}

impl UnreadCounter {
    pub fn new(store: Blocking<dyn Store>, rooms: RoomMembership) -> Self {
        Self { store, rooms }
    }

    /// Atomically bump the counter and push the new value to the user's devices.
    pub async fn increment(&self, user_id: Uuid, conversation: Conversation) -> Result<u32, GatewayError> {
        let count = self
            .store
            .call("increment_unread", move |s| s.increment_unread(user_id, conversation))
            .await?;
        debug!("unread for {} in {:?} is now {}", user_id, conversation, count);
        self.announce(user_id, conversation, count);
        Ok(count)
    }

    /// Zero the counter. Idempotent; the zero is pushed to the user's devices
    /// every time so a stale device converges too.
    pub async fn reset(&self, user_id: Uuid, conversation: Conversation) -> Result<bool, GatewayError> {
        let changed = self
            .store
            .call("reset_unread", move |s| s.reset_unread(user_id, conversation))
            .await?;
        if changed {
            debug!("unread for {} in {:?} reset", user_id, conversation);
        }
        self.announce(user_id, conversation, 0);
        Ok(changed)
    }

    /// Every non-zero counter the user has.
    pub async fn snapshot(&self, user_id: Uuid) -> Result<Vec<UnreadCount>, GatewayError> {
        self.store
            .call("unread_counts", move |s| s.unread_counts(user_id))
            .await
    }

    fn announce(&self, user_id: Uuid, conversation: Conversation, count: u32) {
        self.rooms.publish(
            &RoomId::Mailbox(user_id),
            &ServerEvent::UnreadCountChanged { conversation, count },
            None,
        );
    }
}
