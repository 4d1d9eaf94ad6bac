//! Message delivery: persist, decide status, fan out, count unread, ack.
//!
//! Every operation commits to the store before anything is published. A
//! failed store call returns an error to the issuer and nothing else happens.
//! A send that reaches the store is carried through fan-out and unread
//! counting on its own task, whether or not the issuer is still waiting.

use std::sync::Arc;

use futures_util::future::join_all;
use tracing::{debug, warn};
use uuid::Uuid;

use courier_types::events::ServerEvent;
use courier_types::models::{Conversation, Message, MessageKind, MessageStatus, NewMessage};

use crate::config::GatewayConfig;
use crate::error::GatewayError;
use crate::registry::ConnectionId;
use crate::rooms::{RoomId, RoomMembership};
use crate::store::{Blocking, GroupDirectory, Store};
use crate::unread::UnreadCounter;
use crate::viewport::ViewportTracker;

/// The connection an operation came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Issuer {
    pub connection: ConnectionId,
    pub user_id: Uuid,
}

/// A message as submitted by a client.
#[derive(Debug, Clone)]
pub struct Draft {
    pub target: Conversation,
    pub body: String,
    pub kind: MessageKind,
    pub parent_id: Option<Uuid>,
    /// Makes a resend of the same draft return the original message.
    pub client_temp_id: Option<String>,
}

impl Draft {
    pub fn text(target: Conversation, body: impl Into<String>) -> Self {
        Self {
            target,
            body: body.into(),
            kind: MessageKind::Text,
            parent_id: None,
            client_temp_id: None,
        }
    }

    pub fn with_temp_id(mut self, client_temp_id: impl Into<String>) -> Self {
        self.client_temp_id = Some(client_temp_id.into());
        self
    }
}

/// Who besides the sender a new message is for.
enum Audience {
    Direct(Uuid),
    Group { group_id: Uuid, members: Vec<Uuid> },
}

#[derive(Clone)]
pub struct DeliveryPipeline {
    config: GatewayConfig,
    store: Blocking<dyn Store>,
    groups: Blocking<dyn GroupDirectory>,
    rooms: RoomMembership,
    viewports: Arc<ViewportTracker>,
    unread: UnreadCounter,
}

impl DeliveryPipeline {
    pub fn new(
        config: GatewayConfig,
        store: Blocking<dyn Store>,
        groups: Blocking<dyn GroupDirectory>,
        rooms: RoomMembership,
        viewports: Arc<ViewportTracker>,
        unread: UnreadCounter,
    ) -> Self {
        Self {
            config,
            store,
            groups,
            rooms,
            viewports,
            unread,
        }
    }

    pub async fn send(&self, issuer: Issuer, draft: Draft) -> Result<Message, GatewayError> {
        self.validate_body(&draft.body)?;

        let (audience, status) = match draft.target {
            Conversation::Direct(recipient) => {
                if recipient == issuer.user_id {
                    return Err(GatewayError::Invalid("cannot send a direct message to yourself".into()));
                }
                // Racy on purpose: the recipient may switch away before commit.
                // Mark-read corrects it later.
                let viewing = self
                    .viewports
                    .is_viewing(recipient, Conversation::Direct(issuer.user_id));
                let status = if viewing { MessageStatus::Read } else { MessageStatus::Sent };
                (Audience::Direct(recipient), status)
            }
            Conversation::Group(group_id) => {
                let members = self.require_member(group_id, issuer.user_id).await?;
                (Audience::Group { group_id, members }, MessageStatus::Sent)
            }
        };

        if let Some(parent_id) = draft.parent_id {
            let parent = self.load(parent_id).await?;
            if parent.conversation_for(issuer.user_id) != draft.target {
                return Err(GatewayError::Invalid("reply parent belongs to another conversation".into()));
            }
        }

        let new = NewMessage {
            id: Uuid::new_v4(),
            sender_id: issuer.user_id,
            conversation: draft.target,
            body: draft.body,
            kind: draft.kind,
            status,
            parent_id: draft.parent_id,
            client_temp_id: draft.client_temp_id,
        };

        let pipeline = self.clone();
        let delivery = tokio::spawn(async move { pipeline.deliver(issuer, new, audience).await });
        match tokio::time::timeout(self.store.timeout(), delivery).await {
            Err(_) => {
                warn!("{} stopped waiting on a send; delivery continues", issuer.user_id);
                Err(GatewayError::Timeout("insert_message"))
            }
            Ok(Err(join_err)) => Err(GatewayError::persistence("insert_message", join_err)),
            Ok(Ok(result)) => result,
        }
    }

    /// Commit, fan out, count. Runs detached from the issuer.
    async fn deliver(self, issuer: Issuer, new: NewMessage, audience: Audience) -> Result<Message, GatewayError> {
        let (message, inserted) = self
            .store
            .run("insert_message", move |s| s.insert_message(&new))
            .await?;
        if !inserted {
            debug!("{} resent message {}; already delivered", issuer.user_id, message.id);
            return Ok(message);
        }
        debug!(
            "{} committed message {} to {:?} as {:?}",
            issuer.user_id, message.id, message.conversation, message.status
        );

        // Committed; from here on nothing can un-send the message.
        let delivered = self.rooms.publish_for(
            &message,
            &ServerEvent::MessageCreated {
                message: message.clone(),
            },
            Some(issuer.connection),
        );
        debug!("message {} fanned out to {} connections", message.id, delivered);

        self.count_unread(&message, audience).await;
        Ok(message)
    }

    /// Bump the counter of every recipient not looking at the conversation.
    /// Failures are logged, not surfaced: the message is already committed.
    async fn count_unread(&self, message: &Message, audience: Audience) {
        let pending: Vec<(Uuid, Conversation)> = match audience {
            Audience::Direct(recipient) => {
                if message.status == MessageStatus::Read {
                    Vec::new()
                } else {
                    vec![(recipient, Conversation::Direct(message.sender_id))]
                }
            }
            Audience::Group { group_id, members } => {
                let conversation = Conversation::Group(group_id);
                members
                    .into_iter()
                    .filter(|member| *member != message.sender_id)
                    .filter(|member| !self.viewports.is_viewing(*member, conversation))
                    .map(|member| (member, conversation))
                    .collect()
            }
        };

        let results = join_all(
            pending
                .iter()
                .map(|(user_id, conversation)| self.unread.increment(*user_id, *conversation)),
        )
        .await;

        for ((user_id, _), result) in pending.iter().zip(results) {
            if let Err(e) = result {
                warn!("unread increment for {} after message {} failed: {}", user_id, message.id, e);
            }
        }
    }

    /// Only the sender may edit. Broadcasts an edit event, never a resend.
    pub async fn edit(&self, issuer: Issuer, message_id: Uuid, body: String) -> Result<Message, GatewayError> {
        self.validate_body(&body)?;
        let message = self.load(message_id).await?;
        if message.sender_id != issuer.user_id {
            return Err(GatewayError::Authorization("only the sender may edit a message"));
        }

        let updated = self
            .store
            .call("update_message_body", move |s| s.update_message_body(message_id, &body))
            .await?
            .ok_or(GatewayError::NotFound("message"))?;

        self.rooms.publish_for(
            &updated,
            &ServerEvent::MessageEdited {
                id: updated.id,
                body: updated.body.clone(),
                edited_at: updated.updated_at,
            },
            Some(issuer.connection),
        );
        Ok(updated)
    }

    /// `for_everyone`: sender-only hard delete, broadcast to the conversation.
    /// Otherwise a private hidden marker for the issuer, broadcast to nobody.
    pub async fn delete(&self, issuer: Issuer, message_id: Uuid, for_everyone: bool) -> Result<(), GatewayError> {
        let message = self.load(message_id).await?;

        if !for_everyone {
            self.require_participant(&message, issuer.user_id).await?;
            let user_id = issuer.user_id;
            self.store
                .call("hide_message", move |s| s.hide_message(user_id, message_id))
                .await?;
            return Ok(());
        }

        if message.sender_id != issuer.user_id {
            return Err(GatewayError::Authorization("only the sender may delete a message for everyone"));
        }
        let deleted = self
            .store
            .call("delete_message", move |s| s.delete_message(message_id))
            .await?;
        if !deleted {
            return Err(GatewayError::NotFound("message"));
        }

        self.rooms.publish_for(
            &message,
            &ServerEvent::MessageDeleted { id: message_id },
            Some(issuer.connection),
        );
        Ok(())
    }

    /// Idempotent. Returns whether the reaction was new; repeats broadcast nothing.
    pub async fn react(&self, issuer: Issuer, message_id: Uuid, symbol: String) -> Result<bool, GatewayError> {
        self.validate_symbol(&symbol)?;
        let message = self.load(message_id).await?;
        self.require_participant(&message, issuer.user_id).await?;

        let user_id = issuer.user_id;
        let stored_symbol = symbol.clone();
        let added = self
            .store
            .call("add_reaction", move |s| s.add_reaction(message_id, user_id, &stored_symbol))
            .await?;

        if added {
            self.rooms.publish_for(
                &message,
                &ServerEvent::ReactionAdded {
                    message_id,
                    symbol,
                    user_id,
                },
                Some(issuer.connection),
            );
        }
        Ok(added)
    }

    /// Idempotent. Returns whether a reaction was actually removed.
    pub async fn unreact(&self, issuer: Issuer, message_id: Uuid, symbol: String) -> Result<bool, GatewayError> {
        self.validate_symbol(&symbol)?;
        let message = self.load(message_id).await?;
        self.require_participant(&message, issuer.user_id).await?;

        let user_id = issuer.user_id;
        let stored_symbol = symbol.clone();
        let removed = self
            .store
            .call("remove_reaction", move |s| s.remove_reaction(message_id, user_id, &stored_symbol))
            .await?;

        if removed {
            self.rooms.publish_for(
                &message,
                &ServerEvent::ReactionRemoved {
                    message_id,
                    symbol,
                    user_id,
                },
                Some(issuer.connection),
            );
        }
        Ok(removed)
    }

    /// The authoritative read path. Zeroes the issuer's counter; for direct
    /// conversations also flips the peer's messages to `read` and tells the peer.
    pub async fn mark_read(&self, issuer: Issuer, conversation: Conversation) -> Result<(), GatewayError> {
        let reader = issuer.user_id;

        if let Conversation::Direct(peer) = conversation {
            if peer == reader {
                return Err(GatewayError::Invalid("cannot mark a conversation with yourself".into()));
            }
            let flipped = self
                .store
                .call("mark_direct_read", move |s| s.mark_direct_read(reader, peer))
                .await?;
            if flipped > 0 {
                debug!("{} read {} messages from {}", reader, flipped, peer);
                self.rooms.publish(
                    &RoomId::Mailbox(peer),
                    &ServerEvent::ReadReceiptUpdated {
                        conversation: Conversation::Direct(reader),
                        read_by: reader,
                    },
                    None,
                );
            }
        }

        self.unread.reset(reader, conversation).await?;
        Ok(())
    }

    /// Newest page of a conversation as the issuer sees it, oldest first.
    /// `before` names a message of the same conversation to page back from.
    pub async fn history(
        &self,
        issuer: Issuer,
        conversation: Conversation,
        before: Option<Uuid>,
        limit: u32,
    ) -> Result<Vec<Message>, GatewayError> {
        if let Conversation::Group(group_id) = conversation {
            self.require_member(group_id, issuer.user_id).await?;
        }
        if let Some(boundary) = before {
            if self.load(boundary).await?.conversation_for(issuer.user_id) != conversation {
                return Err(GatewayError::Invalid("history cursor belongs to another conversation".into()));
            }
        }
        let viewer = issuer.user_id;
        let limit = limit.clamp(1, self.config.history_page_max);
        self.store
            .call("history", move |s| s.history(viewer, conversation, before, limit))
            .await
    }

    /// Members of `group_id`, provided `user_id` is one of them.
    pub async fn require_member(&self, group_id: Uuid, user_id: Uuid) -> Result<Vec<Uuid>, GatewayError> {
        let members = self
            .groups
            .call("members_of", move |g| g.members_of(group_id))
            .await?;
        if members.is_empty() {
            return Err(GatewayError::NotFound("group"));
        }
        if !members.contains(&user_id) {
            return Err(GatewayError::Authorization("not a member of this group"));
        }
        Ok(members)
    }

    async fn require_participant(&self, message: &Message, user_id: Uuid) -> Result<(), GatewayError> {
        match message.conversation {
            Conversation::Direct(recipient) => {
                if user_id == message.sender_id || user_id == recipient {
                    Ok(())
                } else {
                    Err(GatewayError::Authorization("not a participant in this conversation"))
                }
            }
            Conversation::Group(group_id) => self.require_member(group_id, user_id).await.map(|_| ()),
        }
    }

    async fn load(&self, message_id: Uuid) -> Result<Message, GatewayError> {
        self.store
            .call("get_message", move |s| s.get_message(message_id))
            .await?
            .ok_or(GatewayError::NotFound("message"))
    }

    fn validate_body(&self, body: &str) -> Result<(), GatewayError> {
        if body.trim().is_empty() {
            return Err(GatewayError::Invalid("message body is empty".into()));
        }
        if body.chars().count() > self.config.max_body_len {
            return Err(GatewayError::Invalid(format!(
                "message body exceeds {} characters",
                self.config.max_body_len
            )));
        }
        Ok(())
    }

    fn validate_symbol(&self, symbol: &str) -> Result<(), GatewayError> {
        if symbol.trim().is_empty() || symbol.chars().count() > self.config.max_symbol_len {
            return Err(GatewayError::Invalid(format!(
                "reaction symbol must be 1 to {} characters",
                self.config.max_symbol_len
            )));
        }
        Ok(())
    }
}
