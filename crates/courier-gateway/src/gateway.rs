use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use courier_db::Database;
use courier_types::api::AckOutcome;
use courier_types::events::{GatewayCommand, ServerEvent};
use courier_types::models::{Conversation, Message};

use crate::auth::{CredentialVerifier, Identity};
use crate::config::GatewayConfig;
use crate::error::GatewayError;
use crate::pipeline::{DeliveryPipeline, Draft, Issuer};
use crate::presence::PresenceTracker;
use crate::pubsub::{Broker, InProcessBroker};
use crate::registry::{ConnectionId, ConnectionRegistry};
use crate::rooms::{RoomId, RoomMembership};
use crate::store::{Blocking, GroupDirectory, Store};
use crate::typing::{Typist, TypingIndicator};
use crate::unread::UnreadCounter;
use crate::viewport::ViewportTracker;

/// External collaborators the gateway is wired to.
pub struct Collaborators {
    pub verifier: Arc<dyn CredentialVerifier>,
    pub store: Arc<dyn Store>,
    pub groups: Arc<dyn GroupDirectory>,
    pub broker: Arc<dyn Broker>,
}

impl Collaborators {
    /// One SQLite database for messages and groups, single-node fan-out.
    pub fn sqlite(db: Arc<Database>, verifier: Arc<dyn CredentialVerifier>) -> Self {
        Self {
            verifier,
            store: db.clone(),
            groups: db,
            broker: Arc::new(InProcessBroker::new()),
        }
    }
}

struct GatewayInner {
    config: GatewayConfig,
    verifier: Arc<dyn CredentialVerifier>,
    broker: Arc<dyn Broker>,
    rooms: RoomMembership,
    registry: ConnectionRegistry,
    viewports: Arc<ViewportTracker>,
    typing: TypingIndicator,
    unread: UnreadCounter,
    groups: Blocking<dyn GroupDirectory>,
    pipeline: DeliveryPipeline,
}

/// The realtime delivery core. Cheap to clone; every clone shares state.
#[derive(Clone)]
pub struct Gateway {
    inner: Arc<GatewayInner>,
}

impl Gateway {
    pub fn new(config: GatewayConfig, collaborators: Collaborators) -> Self {
        let Collaborators {
            verifier,
            store,
            groups,
            broker,
        } = collaborators;

        let rooms = RoomMembership::new(broker.clone());
        let store = Blocking::new(store, config.store_timeout);
        let groups = Blocking::new(groups, config.store_timeout);
        let viewports = Arc::new(ViewportTracker::new());
        let unread = UnreadCounter::new(store.clone(), rooms.clone());
        let pipeline = DeliveryPipeline::new(
            config.clone(),
            store,
            groups.clone(),
            rooms.clone(),
            viewports.clone(),
            unread.clone(),
        );

        Self {
            inner: Arc::new(GatewayInner {
                registry: ConnectionRegistry::new(PresenceTracker::new(broker.clone())),
                typing: TypingIndicator::new(broker.clone(), config.typing_expiry),
                config,
                verifier,
                broker,
                rooms,
                viewports,
                unread,
                groups,
                pipeline,
            }),
        }
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.inner.config
    }

    /// Runs before admission; a rejected credential never touches any
    /// connection state.
    pub fn authenticate(&self, credential: &str) -> Result<Identity, GatewayError> {
        self.inner.verifier.verify(credential).inspect_err(|e| {
            warn!("rejected gateway credential: {}", e);
        })
    }

    pub async fn connect(&self, credential: &str) -> Result<Session, GatewayError> {
        let identity = self.authenticate(credential)?;
        Ok(self.admit(identity).await)
    }

    /// Register a new connection for an authenticated user.
    ///
    /// The connection is subscribed to its mailbox and group rooms and handed
    /// a `Ready` snapshot before the user's presence is announced.
    pub async fn admit(&self, identity: Identity) -> Session {
        let inner = &self.inner;
        let Identity { user_id, username } = identity;
        let conn = ConnectionId::new();

        let (tx, rx) = mpsc::unbounded_channel();
        inner.broker.attach(conn, tx);
        inner.rooms.join_mailbox(conn, user_id);

        // From here on the session owns the attachment and cleans it up on drop.
        let session = Session {
            gateway: self.clone(),
            connection_id: conn,
            user_id,
            username: username.clone(),
            events: Some(rx),
            closed: false,
        };

        match inner.groups.call("groups_of", move |g| g.groups_of(user_id)).await {
            Ok(group_ids) => {
                for group_id in group_ids {
                    inner.rooms.join_group_room(conn, group_id);
                }
            }
            Err(e) => warn!("could not load groups of {}: {}", user_id, e),
        }

        let unread = inner.unread.snapshot(user_id).await.unwrap_or_else(|e| {
            warn!("could not load unread counts of {}: {}", user_id, e);
            Vec::new()
        });

        let mut online_users = inner.registry.online_users();
        if !online_users.contains(&user_id) {
            online_users.push(user_id);
        }
        inner.rooms.send_to(
            conn,
            ServerEvent::Ready {
                user_id,
                username: username.clone(),
                connection_id: conn.as_uuid(),
                online_users,
                unread,
            },
        );

        inner.registry.admit(user_id, conn);
        info!("{} ({}) connected as {}", username, user_id, conn);
        session
    }

    pub fn is_online(&self, user_id: Uuid) -> bool {
        self.inner.registry.is_online(user_id)
    }

    pub fn connection_count(&self, user_id: Uuid) -> usize {
        self.inner.registry.connection_count(user_id)
    }

    pub fn online_users(&self) -> Vec<Uuid> {
        self.inner.registry.online_users()
    }

    pub fn is_typing(&self, user_id: Uuid, conversation: Conversation) -> bool {
        self.inner.typing.is_typing(user_id, conversation)
    }

    pub fn is_viewing(&self, user_id: Uuid, conversation: Conversation) -> bool {
        self.inner.viewports.is_viewing(user_id, conversation)
    }

    /// Stop every pending typing timer and detach every connection. A
    /// detached connection's event stream ends, which closes its socket.
    pub fn shutdown(&self) {
        self.inner.typing.shutdown();
        let connections = self.inner.broker.connections();
        info!("gateway shutting down with {} live connections", connections.len());
        for conn in connections {
            self.release(conn);
        }
    }

    /// Release everything a connection holds, in dependency order.
    fn release(&self, conn: ConnectionId) {
        let inner = &self.inner;
        inner.viewports.clear(conn);
        inner.typing.cancel_connection(conn);
        if let Some((user_id, _)) = inner.registry.remove(conn) {
            info!("{} disconnected ({})", user_id, conn);
        }
        let rooms = inner.broker.detach(conn);
        debug!("connection {} left {} rooms", conn, rooms.len());
    }
}

/// One admitted connection. Dropping it is the disconnect.
pub struct Session {
    gateway: Gateway,
    connection_id: ConnectionId,
    user_id: Uuid,
    username: String,
    events: Option<mpsc::UnboundedReceiver<ServerEvent>>,
    closed: bool,
}

impl Session {
    pub fn connection_id(&self) -> ConnectionId {
        self.connection_id
    }

    pub fn user_id(&self) -> Uuid {
        self.user_id
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    /// Hand the outbound event stream to a writer task. `None` once taken.
    pub fn take_events(&mut self) -> Option<mpsc::UnboundedReceiver<ServerEvent>> {
        self.events.take()
    }

    pub async fn recv(&mut self) -> Option<ServerEvent> {
        self.events.as_mut()?.recv().await
    }

    pub fn try_recv(&mut self) -> Option<ServerEvent> {
        self.events.as_mut()?.try_recv().ok()
    }

    /// Push an event to this connection only.
    pub fn reply(&self, event: ServerEvent) -> bool {
        self.gateway.inner.rooms.send_to(self.connection_id, event)
    }

    fn issuer(&self) -> Issuer {
        Issuer {
            connection: self.connection_id,
            user_id: self.user_id,
        }
    }

    fn typist(&self) -> Typist {
        Typist {
            connection: self.connection_id,
            user_id: self.user_id,
            user_name: self.username.clone(),
        }
    }

    fn not_self(&self, conversation: Conversation) -> Result<(), GatewayError> {
        match conversation {
            Conversation::Direct(peer) if peer == self.user_id => {
                Err(GatewayError::Invalid("cannot address a conversation with yourself".into()))
            }
            _ => Ok(()),
        }
    }

    pub fn set_viewport(&self, conversation: Conversation) -> Result<(), GatewayError> {
        self.not_self(conversation)?;
        self.gateway
            .inner
            .viewports
            .set(self.connection_id, self.user_id, conversation);
        Ok(())
    }

    pub fn clear_viewport(&self) -> Option<Conversation> {
        self.gateway.inner.viewports.clear(self.connection_id)
    }

    /// Members only. Idempotent; returns whether the room was newly joined.
    pub async fn join_group_room(&self, group_id: Uuid) -> Result<bool, GatewayError> {
        let inner = &self.gateway.inner;
        inner.pipeline.require_member(group_id, self.user_id).await?;
        Ok(inner.rooms.join_group_room(self.connection_id, group_id))
    }

    pub fn leave_group_room(&self, group_id: Uuid) -> bool {
        self.gateway
            .inner
            .rooms
            .leave_group_room(self.connection_id, group_id)
    }

    pub async fn send(&self, draft: Draft) -> Result<Message, GatewayError> {
        self.gateway.inner.pipeline.send(self.issuer(), draft).await
    }

    pub async fn edit(&self, message_id: Uuid, body: impl Into<String>) -> Result<Message, GatewayError> {
        self.gateway
            .inner
            .pipeline
            .edit(self.issuer(), message_id, body.into())
            .await
    }

    pub async fn delete(&self, message_id: Uuid, for_everyone: bool) -> Result<(), GatewayError> {
        self.gateway
            .inner
            .pipeline
            .delete(self.issuer(), message_id, for_everyone)
            .await
    }

    pub async fn react(&self, message_id: Uuid, symbol: impl Into<String>) -> Result<bool, GatewayError> {
        self.gateway
            .inner
            .pipeline
            .react(self.issuer(), message_id, symbol.into())
            .await
    }

    pub async fn unreact(&self, message_id: Uuid, symbol: impl Into<String>) -> Result<bool, GatewayError> {
        self.gateway
            .inner
            .pipeline
            .unreact(self.issuer(), message_id, symbol.into())
            .await
    }

    pub async fn mark_read(&self, conversation: Conversation) -> Result<(), GatewayError> {
        self.gateway
            .inner
            .pipeline
            .mark_read(self.issuer(), conversation)
            .await
    }

    /// Group typing needs the connection to sit in the group's room.
    pub fn start_typing(&self, conversation: Conversation) -> Result<(), GatewayError> {
        self.check_typing_target(conversation)?;
        self.gateway.inner.typing.start(&self.typist(), conversation);
        Ok(())
    }

    pub fn stop_typing(&self, conversation: Conversation) -> Result<(), GatewayError> {
        self.check_typing_target(conversation)?;
        self.gateway.inner.typing.stop(&self.typist(), conversation);
        Ok(())
    }

    fn check_typing_target(&self, conversation: Conversation) -> Result<(), GatewayError> {
        self.not_self(conversation)?;
        if let Conversation::Group(group_id) = conversation {
            if !self
                .gateway
                .inner
                .rooms
                .in_room(self.connection_id, &RoomId::Group(group_id))
            {
                return Err(GatewayError::Authorization("join the group room first"));
            }
        }
        Ok(())
    }

    pub async fn history(
        &self,
        conversation: Conversation,
        before: Option<Uuid>,
        limit: u32,
    ) -> Result<Vec<Message>, GatewayError> {
        self.not_self(conversation)?;
        self.gateway
            .inner
            .pipeline
            .history(self.issuer(), conversation, before, limit)
            .await
    }

    /// Run one client command and build the ack for it. History pages are
    /// pushed to this connection before the ack.
    pub async fn handle(&self, command: GatewayCommand) -> ServerEvent {
        let op = command.name();
        let mut client_temp_id = None;

        let result: Result<Option<Message>, GatewayError> = match command {
            GatewayCommand::SetViewport { conversation } => self.set_viewport(conversation).map(|_| None),
            GatewayCommand::ClearViewport => {
                self.clear_viewport();
                Ok(None)
            }
            GatewayCommand::JoinGroupRoom { group_id } => self.join_group_room(group_id).await.map(|_| None),
            GatewayCommand::LeaveGroupRoom { group_id } => {
                self.leave_group_room(group_id);
                Ok(None)
            }
            GatewayCommand::SendMessage {
                target,
                body,
                kind,
                parent_id,
                client_temp_id: temp_id,
            } => {
                client_temp_id = temp_id.clone();
                let draft = Draft {
                    target,
                    body,
                    kind,
                    parent_id,
                    client_temp_id: temp_id,
                };
                self.send(draft).await.map(Some)
            }
            GatewayCommand::EditMessage { message_id, body } => self.edit(message_id, body).await.map(Some),
            GatewayCommand::DeleteMessage {
                message_id,
                for_everyone,
            } => self.delete(message_id, for_everyone).await.map(|_| None),
            GatewayCommand::ReactToMessage { message_id, symbol } => {
                self.react(message_id, symbol).await.map(|_| None)
            }
            GatewayCommand::UnreactToMessage { message_id, symbol } => {
                self.unreact(message_id, symbol).await.map(|_| None)
            }
            GatewayCommand::MarkConversationRead { conversation } => {
                self.mark_read(conversation).await.map(|_| None)
            }
            GatewayCommand::StartTyping { conversation } => self.start_typing(conversation).map(|_| None),
            GatewayCommand::StopTyping { conversation } => self.stop_typing(conversation).map(|_| None),
            GatewayCommand::FetchHistory {
                conversation,
                before,
                limit,
            } => self.history(conversation, before, limit).await.map(|messages| {
                self.reply(ServerEvent::History {
                    conversation,
                    messages,
                });
                None
            }),
        };

        let outcome = match result {
            Ok(message) => AckOutcome::Ok { message },
            Err(e) => {
                warn!("{} ({}) {} failed: {}", self.username, self.user_id, op, e);
                e.to_outcome()
            }
        };

        ServerEvent::Ack {
            op: op.to_string(),
            client_temp_id,
            outcome,
        }
    }

    /// Disconnect. Equivalent to dropping the session.
    pub fn close(mut self) {
        self.teardown();
    }

    fn teardown(&mut self) {
        if !self.closed {
            self.closed = true;
            self.gateway.release(self.connection_id);
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.teardown();
    }
}
