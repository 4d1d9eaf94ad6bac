use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use uuid::Uuid;

use courier_types::models::Conversation;

use crate::registry::ConnectionId;

#[derive(Default)]
struct ViewportState {
    by_connection: HashMap<ConnectionId, (Uuid, Conversation)>,
    by_user: HashMap<Uuid, HashMap<ConnectionId, Conversation>>,
}

/// Which conversation each connection currently has open.
///
/// Best-effort: it only decides whether a new direct message is stamped
/// `read` on arrival and whether an unread counter is bumped. The explicit
/// mark-read path is authoritative.
#[derive(Default)]
pub struct ViewportTracker {
    state: RwLock<ViewportState>,
}

impl ViewportTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// `conversation` is addressed from `user_id`'s side.
    pub fn set(&self, conn: ConnectionId, user_id: Uuid, conversation: Conversation) {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        if let Some((previous_owner, _)) = state.by_connection.insert(conn, (user_id, conversation)) {
            if previous_owner != user_id {
                remove_user_entry(&mut state, previous_owner, conn);
            }
        }
        state.by_user.entry(user_id).or_default().insert(conn, conversation);
    }

    /// Returns what the connection was viewing, if anything.
    pub fn clear(&self, conn: ConnectionId) -> Option<Conversation> {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        let (user_id, conversation) = state.by_connection.remove(&conn)?;
        remove_user_entry(&mut state, user_id, conn);
        Some(conversation)
    }

    #[cfg(test)]
    fn current(&self, conn: ConnectionId) -> Option<Conversation> {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        state.by_connection.get(&conn).map(|(_, conversation)| *conversation)
    }

    /// True if any of `user_id`'s connections has `conversation` open.
    pub fn is_viewing(&self, user_id: Uuid, conversation: Conversation) -> bool {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        state
            .by_user
            .get(&user_id)
            .is_some_and(|views| views.values().any(|open| *open == conversation))
    }
}

fn remove_user_entry(state: &mut ViewportState, user_id: Uuid, conn: ConnectionId) {
    if let Some(views) = state.by_user.get_mut(&user_id) {
        views.remove(&conn);
        if views.is_empty() {
            state.by_user.remove(&user_id);
        }
    }
}
