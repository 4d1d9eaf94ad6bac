use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::api::AckOutcome;
use crate::models::{Conversation, Message, MessageKind, UnreadCount};

/// Events sent over the WebSocket gateway.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum ServerEvent {
    /// Server confirms admission, with enough state to resync a client
    Ready {
        user_id: Uuid,
        username: String,
        connection_id: Uuid,
        online_users: Vec<Uuid>,
        unread: Vec<UnreadCount>,
    },

    /// A user's first connection opened or last connection closed
    PresenceChanged { user_id: Uuid, online: bool },

    /// A message was committed
    MessageCreated { message: Message },

    /// A message body was replaced by its sender
    MessageEdited {
        id: Uuid,
        body: String,
        edited_at: DateTime<Utc>,
    },

    /// A message was deleted for everyone
    MessageDeleted { id: Uuid },

    ReactionAdded {
        message_id: Uuid,
        symbol: String,
        user_id: Uuid,
    },

    ReactionRemoved {
        message_id: Uuid,
        symbol: String,
        user_id: Uuid,
    },

    /// The durable unread count for one of the receiving user's conversations
    UnreadCountChanged {
        conversation: Conversation,
        count: u32,
    },

    /// The peer read everything the receiving user sent in `conversation`
    ReadReceiptUpdated {
        conversation: Conversation,
        read_by: Uuid,
    },

    TypingStarted {
        conversation: Conversation,
        user_id: Uuid,
        user_name: String,
    },

    TypingStopped {
        conversation: Conversation,
        user_id: Uuid,
        user_name: String,
    },

    /// Reply to `FetchHistory`, oldest first
    History {
        conversation: Conversation,
        messages: Vec<Message>,
    },

    /// Outcome of a command issued by this connection
    Ack {
        op: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        client_temp_id: Option<String>,
        outcome: AckOutcome,
    },
}

/// Commands sent FROM client TO server over WebSocket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum GatewayCommand {
    SetViewport { conversation: Conversation },

    ClearViewport,

    JoinGroupRoom { group_id: Uuid },

    LeaveGroupRoom { group_id: Uuid },

    SendMessage {
        target: Conversation,
        body: String,
        #[serde(default)]
        kind: MessageKind,
        #[serde(default)]
        parent_id: Option<Uuid>,
        /// Echoed back in the ack so the client can swap out its optimistic copy
        #[serde(default)]
        client_temp_id: Option<String>,
    },

    EditMessage { message_id: Uuid, body: String },

    DeleteMessage { message_id: Uuid, for_everyone: bool },

    ReactToMessage { message_id: Uuid, symbol: String },

    UnreactToMessage { message_id: Uuid, symbol: String },

    MarkConversationRead { conversation: Conversation },

    StartTyping { conversation: Conversation },

    StopTyping { conversation: Conversation },

    FetchHistory {
        conversation: Conversation,
        /// Id of the oldest message the client already holds; the page
        /// returned is strictly older than it
        #[serde(default)]
        before: Option<Uuid>,
        #[serde(default = "default_history_limit")]
        limit: u32,
    },
}

fn default_history_limit() -> u32 {
    50
}

impl GatewayCommand {
    /// Stable name used in acknowledgements and logs.
    pub fn name(&self) -> &'static str {
        match self {
            Self::SetViewport { .. } => "set_viewport",
            Self::ClearViewport => "clear_viewport",
            Self::JoinGroupRoom { .. } => "join_group_room",
            Self::LeaveGroupRoom { .. } => "leave_group_room",
            Self::SendMessage { .. } => "send_message",
            Self::EditMessage { .. } => "edit_message",
            Self::DeleteMessage { .. } => "delete_message",
            Self::ReactToMessage { .. } => "react_to_message",
            Self::UnreactToMessage { .. } => "unreact_to_message",
            Self::MarkConversationRead { .. } => "mark_conversation_read",
            Self::StartTyping { .. } => "start_typing",
            Self::StopTyping { .. } => "stop_typing",
            Self::FetchHistory { .. } => "fetch_history",
        }
    }
}
