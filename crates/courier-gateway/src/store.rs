//! Seams to the durable collaborators: the transactional message store and
//! the group-membership lookup. Both are blocking; [`Blocking`] runs them off
//! the async runtime under a bounded timeout.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tracing::error;
use uuid::Uuid;

use courier_db::Database;
use courier_types::models::{Conversation, Message, NewMessage, UnreadCount};

use crate::error::GatewayError;

/// Durable store for everything the delivery core writes.
///
/// Each method is its own transaction: it either commits fully or leaves
/// no trace.
pub trait Store: Send + Sync + 'static {
    /// The flag is `false` when `new` repeats an earlier message's sender and
    /// client temp id; that earlier message comes back and nothing is stored.
    fn insert_message(&self, new: &NewMessage) -> Result<(Message, bool)>;
    fn get_message(&self, id: Uuid) -> Result<Option<Message>>;
    fn update_message_body(&self, id: Uuid, body: &str) -> Result<Option<Message>>;
    fn delete_message(&self, id: Uuid) -> Result<bool>;
    fn hide_message(&self, user_id: Uuid, message_id: Uuid) -> Result<bool>;
    fn history(
        &self,
        viewer: Uuid,
        conversation: Conversation,
        before: Option<Uuid>,
        limit: u32,
    ) -> Result<Vec<Message>>;
    fn mark_direct_read(&self, reader: Uuid, sender: Uuid) -> Result<usize>;

    fn add_reaction(&self, message_id: Uuid, user_id: Uuid, symbol: &str) -> Result<bool>;
    fn remove_reaction(&self, message_id: Uuid, user_id: Uuid, symbol: &str) -> Result<bool>;

    /// Must be a single atomic upsert-or-increment.
    fn increment_unread(&self, user_id: Uuid, conversation: Conversation) -> Result<u32>;
    fn reset_unread(&self, user_id: Uuid, conversation: Conversation) -> Result<bool>;
    fn unread_counts(&self, user_id: Uuid) -> Result<Vec<UnreadCount>>;
}

/// Read-only view of group membership, owned by group administration.
pub trait GroupDirectory: Send + Sync + 'static {
    fn groups_of(&self, user_id: Uuid) -> Result<Vec<Uuid>>;
    fn members_of(&self, group_id: Uuid) -> Result<Vec<Uuid>>;
}

impl Store for Database {
    fn insert_message(&self, new: &NewMessage) -> Result<(Message, bool)> {
        Database::insert_message(self, new)
    }

    fn get_message(&self, id: Uuid) -> Result<Option<Message>> {
        Database::get_message(self, id)
    }

    fn update_message_body(&self, id: Uuid, body: &str) -> Result<Option<Message>> {
        Database::update_message_body(self, id, body)
    }

    fn delete_message(&self, id: Uuid) -> Result<bool> {
        Database::delete_message(self, id)
    }

    fn hide_message(&self, user_id: Uuid, message_id: Uuid) -> Result<bool> {
        Database::hide_message(self, user_id, message_id)
    }

    fn history(
        &self,
        viewer: Uuid,
        conversation: Conversation,
        before: Option<Uuid>,
        limit: u32,
    ) -> Result<Vec<Message>> {
        Database::history(self, viewer, conversation, before, limit)
    }

    fn mark_direct_read(&self, reader: Uuid, sender: Uuid) -> Result<usize> {
        Database::mark_direct_read(self, reader, sender)
    }

    fn add_reaction(&self, message_id: Uuid, user_id: Uuid, symbol: &str) -> Result<bool> {
        Database::add_reaction(self, message_id, user_id, symbol)
    }

    fn remove_reaction(&self, message_id: Uuid, user_id: Uuid, symbol: &str) -> Result<bool> {
        Database::remove_reaction(self, message_id, user_id, symbol)
    }

    fn increment_unread(&self, user_id: Uuid, conversation: Conversation) -> Result<u32> {
        Database::increment_unread(self, user_id, conversation)
    }

    fn reset_unread(&self, user_id: Uuid, conversation: Conversation) -> Result<bool> {
        Database::reset_unread(self, user_id, conversation)
    }

    fn unread_counts(&self, user_id: Uuid) -> Result<Vec<UnreadCount>> {
        Database::unread_counts(self, user_id)
    }
}

impl GroupDirectory for Database {
    fn groups_of(&self, user_id: Uuid) -> Result<Vec<Uuid>> {
        Database::groups_of(self, user_id)
    }

    fn members_of(&self, group_id: Uuid) -> Result<Vec<Uuid>> {
        Database::members_of(self, group_id)
    }
}

/// A blocking collaborator plus the deadline every call to it must meet.
pub struct Blocking<S: ?Sized> {
    inner: Arc<S>,
    timeout: Duration,
}

impl<S: ?Sized> Clone for Blocking<S> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            timeout: self.timeout,
        }
    }
}

impl<S: ?Sized + Send + Sync + 'static> Blocking<S> {
    pub fn new(inner: Arc<S>, timeout: Duration) -> Self {
        Self { inner, timeout }
    }

    /// Run `f` on the blocking pool. Store errors become `Persistence`,
    /// an elapsed deadline becomes `Timeout`.
    ///
    /// On timeout the blocking call keeps running to completion; whatever it
    /// commits is still the source of truth, the issuer just isn't told.
    /// Work that must act on what was committed uses [`Blocking::run`] from a
    /// task of its own instead.
    pub async fn call<T, F>(&self, op: &'static str, f: F) -> Result<T, GatewayError>
    where
        T: Send + 'static,
        F: FnOnce(&S) -> Result<T> + Send + 'static,
    {
        tokio::time::timeout(self.timeout, self.run(op, f))
            .await
            .unwrap_or_else(|_| Err(GatewayError::Timeout(op)))
    }

    /// Run `f` on the blocking pool and wait for it however long it takes.
    pub async fn run<T, F>(&self, op: &'static str, f: F) -> Result<T, GatewayError>
    where
        T: Send + 'static,
        F: FnOnce(&S) -> Result<T> + Send + 'static,
    {
        let inner = self.inner.clone();
        match tokio::task::spawn_blocking(move || f(&inner)).await {
            Err(join_err) => {
                error!("spawn_blocking join error in {}: {}", op, join_err);
                Err(GatewayError::persistence(op, join_err))
            }
            Ok(result) => result.map_err(|e| GatewayError::persistence(op, e)),
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Slow;

    impl Slow {
        fn nap(&self) -> Result<u8> {
            std::thread::sleep(Duration::from_millis(200));
            Ok(1)
        }
    }

    #[tokio::test]
    async fn test_call_times_out() {
        let slow = Blocking::new(Arc::new(Slow), Duration::from_millis(20));
        let err = slow.call("nap", |s| s.nap()).await.unwrap_err();
        assert!(matches!(err, GatewayError::Timeout("nap")));
    }

    #[tokio::test]
    async fn test_run_outlasts_the_deadline() {
        let slow = Blocking::new(Arc::new(Slow), Duration::from_millis(20));
        assert_eq!(slow.run("nap", |s| s.nap()).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_call_maps_store_errors() {
        let store: Arc<dyn Store> = Arc::new(Database::open_in_memory().unwrap());
        let db = Blocking::new(store, Duration::from_secs(1));
        let missing = db.call("get_message", |s| s.get_message(Uuid::new_v4())).await.unwrap();
        assert!(missing.is_none());

        let err = db
            .call("explode", |_| -> Result<()> { Err(anyhow::anyhow!("boom")) })
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::Persistence { op: "explode", .. }));
    }
}
