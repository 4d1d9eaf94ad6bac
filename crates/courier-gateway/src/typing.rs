use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::debug;
use uuid::Uuid;

use courier_types::events::ServerEvent;
use courier_types::models::Conversation;

use crate::pubsub::Broker;
use crate::registry::ConnectionId;
use crate::rooms::audience;

/// Who is typing, as needed to address and label the broadcast.
#[derive(Debug, Clone)]
pub struct Typist {
    pub connection: ConnectionId,
    pub user_id: Uuid,
    pub user_name: String,
}

type TypingKey = (Uuid, Conversation);

struct TypingEntry {
    generation: u64,
    typist: Typist,
    timer: JoinHandle<()>,
}

type Entries = Arc<Mutex<HashMap<TypingKey, TypingEntry>>>;

/// Ephemeral "is typing" state. Every entry carries an expiry timer; an
/// entry is never left behind without one.
pub struct TypingIndicator {
    expiry: Duration,
    broker: Arc<dyn Broker>,
    entries: Entries,
    generations: AtomicU64,
}

impl TypingIndicator {
    pub fn new(broker: Arc<dyn Broker>, expiry: Duration) -> Self {
        Self {
            expiry,
            broker,
            entries: Arc::new(Mutex::new(HashMap::new())),
            generations: AtomicU64::new(0),
        }
    }

    /// Broadcast "started" and (re)arm the expiry timer for this
    /// (user, conversation) pair.
    pub fn start(&self, typist: &Typist, target: Conversation) {
        emit(self.broker.as_ref(), typist, target, true);

        let key = (typist.user_id, target);
        let generation = self.generations.fetch_add(1, Ordering::Relaxed);

        // The timer is spawned while holding the lock, so it can never look
        // for its entry before the entry exists.
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        let timer = tokio::spawn(expire_after(
            self.expiry,
            key,
            generation,
            self.entries.clone(),
            self.broker.clone(),
        ));
        let entry = TypingEntry {
            generation,
            typist: typist.clone(),
            timer,
        };
        if let Some(previous) = entries.insert(key, entry) {
            previous.timer.abort();
        }
    }

    /// Cancel the timer and broadcast "stopped" right away.
    pub fn stop(&self, typist: &Typist, target: Conversation) {
        let removed = self
            .entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&(typist.user_id, target));
        if let Some(entry) = removed {
            entry.timer.abort();
        }
        emit(self.broker.as_ref(), typist, target, false);
    }

    /// End every indicator armed by `conn`. Called when the connection closes.
    pub fn cancel_connection(&self, conn: ConnectionId) {
        let ended: Vec<(Conversation, TypingEntry)> = {
            let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
            let keys: Vec<TypingKey> = entries
                .iter()
                .filter(|(_, entry)| entry.typist.connection == conn)
                .map(|(key, _)| *key)
                .collect();
            keys.into_iter()
                .filter_map(|key| entries.remove(&key).map(|entry| (key.1, entry)))
                .collect()
        };

        for (target, entry) in ended {
            entry.timer.abort();
            emit(self.broker.as_ref(), &entry.typist, target, false);
        }
    }

    pub fn is_typing(&self, user_id: Uuid, target: Conversation) -> bool {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(&(user_id, target))
    }

    /// Drop every timer without announcing anything.
    pub fn shutdown(&self) {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        for (_, entry) in entries.drain() {
            entry.timer.abort();
        }
    }
}

async fn expire_after(
    expiry: Duration,
    key: TypingKey,
    generation: u64,
    entries: Entries,
    broker: Arc<dyn Broker>,
) {
    tokio::time::sleep(expiry).await;

    let expired = {
        let mut entries = entries.lock().unwrap_or_else(PoisonError::into_inner);
        let current = entries.get(&key).map(|entry| entry.generation);
        if current == Some(generation) {
            entries.remove(&key)
        } else {
            None
        }
    };

    if let Some(entry) = expired {
        debug!("typing indicator of {} in {:?} expired", entry.typist.user_id, key.1);
        emit(broker.as_ref(), &entry.typist, key.1, false);
    }
}

fn emit(broker: &dyn Broker, typist: &Typist, target: Conversation, started: bool) {
    let (room, conversation) = audience(typist.user_id, target);
    let event = if started {
        ServerEvent::TypingStarted {
            conversation,
            user_id: typist.user_id,
            user_name: typist.user_name.clone(),
        }
    } else {
        ServerEvent::TypingStopped {
            conversation,
            user_id: typist.user_id,
            user_name: typist.user_name.clone(),
        }
    };
    broker.publish(&room, &event, Some(typist.connection));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pubsub::InProcessBroker;
    use crate::rooms::RoomId;
    use tokio::sync::mpsc;

    struct Fixture {
        typing: TypingIndicator,
        typist: Typist,
        peer: Uuid,
        peer_rx: mpsc::UnboundedReceiver<ServerEvent>,
    }

    fn fixture(expiry: Duration) -> Fixture {
        let broker = Arc::new(InProcessBroker::new());
        let peer = Uuid::new_v4();
        let peer_conn = ConnectionId::new();
        let (tx, peer_rx) = mpsc::unbounded_channel();
        broker.attach(peer_conn, tx);
        broker.subscribe(&RoomId::Mailbox(peer), peer_conn);

        Fixture {
            typing: TypingIndicator::new(broker, expiry),
            typist: Typist {
                connection: ConnectionId::new(),
                user_id: Uuid::new_v4(),
                user_name: "ada".into(),
            },
            peer,
            peer_rx,
        }
    }

    #[tokio::test]
    async fn test_start_without_stop_expires() {
        let mut f = fixture(Duration::from_millis(50));
        let target = Conversation::Direct(f.peer);
        f.typing.start(&f.typist, target);
        assert!(f.typing.is_typing(f.typist.user_id, target));

        let started = f.peer_rx.recv().await.unwrap();
        assert!(matches!(started, ServerEvent::TypingStarted { conversation, .. }
            if conversation == Conversation::Direct(f.typist.user_id)));

        let stopped = tokio::time::timeout(Duration::from_secs(2), f.peer_rx.recv())
            .await
            .expect("indicator never expired")
            .unwrap();
        assert!(matches!(stopped, ServerEvent::TypingStopped { .. }));
        assert!(!f.typing.is_typing(f.typist.user_id, target));
    }

    #[tokio::test]
    async fn test_stop_cancels_timer() {
        let mut f = fixture(Duration::from_millis(50));
        let target = Conversation::Direct(f.peer);
        f.typing.start(&f.typist, target);
        f.typing.stop(&f.typist, target);

        tokio::time::sleep(Duration::from_millis(150)).await;
        let events: Vec<_> = std::iter::from_fn(|| f.peer_rx.try_recv().ok()).collect();
        assert_eq!(events.len(), 2, "expected exactly one start and one stop: {:?}", events);
        assert!(matches!(events[1], ServerEvent::TypingStopped { .. }));
    }

    #[tokio::test]
    async fn test_restart_extends_deadline() {
        let mut f = fixture(Duration::from_millis(120));
        let target = Conversation::Direct(f.peer);
        f.typing.start(&f.typist, target);
        tokio::time::sleep(Duration::from_millis(80)).await;
        f.typing.start(&f.typist, target);
        tokio::time::sleep(Duration::from_millis(80)).await;

        // first timer was superseded, second hasn't fired yet
        assert!(f.typing.is_typing(f.typist.user_id, target));
        let stops = std::iter::from_fn(|| f.peer_rx.try_recv().ok())
            .filter(|e| matches!(e, ServerEvent::TypingStopped { .. }))
            .count();
        assert_eq!(stops, 0);
    }

    #[tokio::test]
    async fn test_cancel_connection_announces_stop() {
        let mut f = fixture(Duration::from_secs(30));
        let target = Conversation::Direct(f.peer);
        f.typing.start(&f.typist, target);
        f.typing.cancel_connection(f.typist.connection);

        assert!(!f.typing.is_typing(f.typist.user_id, target));
        let events: Vec<_> = std::iter::from_fn(|| f.peer_rx.try_recv().ok()).collect();
        assert!(matches!(events.last(), Some(ServerEvent::TypingStopped { .. })));
    }
}
