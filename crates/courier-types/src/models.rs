use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// A conversation as addressed by one participant.
///
/// `Direct` carries the *other* participant's id, so the same two-party
/// conversation is `Direct(b)` from a's side and `Direct(a)` from b's side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum Conversation {
    Direct(Uuid),
    Group(Uuid),
}

impl Conversation {
    pub fn from_parts(kind: ConversationKind, id: Uuid) -> Self {
        match kind {
            ConversationKind::Direct => Self::Direct(id),
            ConversationKind::Group => Self::Group(id),
        }
    }

    pub fn kind(&self) -> ConversationKind {
        match self {
            Self::Direct(_) => ConversationKind::Direct,
            Self::Group(_) => ConversationKind::Group,
        }
    }

    pub fn id(&self) -> Uuid {
        match self {
            Self::Direct(id) | Self::Group(id) => *id,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversationKind {
    Direct,
    Group,
}

impl ConversationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Direct => "direct",
            Self::Group => "group",
        }
    }
}

impl FromStr for ConversationKind {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "direct" => Ok(Self::Direct),
            "group" => Ok(Self::Group),
            other => Err(UnknownVariant::new("conversation kind", other)),
        }
    }
}

/// Per-recipient status of a direct message.
///
/// Transitions only `Sent -> Read`. `Delivered` exists in the stored schema
/// but nothing ever moves a message into it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    Sent,
    Delivered,
    Read,
}

impl MessageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sent => "sent",
            Self::Delivered => "delivered",
            Self::Read => "read",
        }
    }
}

impl FromStr for MessageStatus {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sent" => Ok(Self::Sent),
            "delivered" => Ok(Self::Delivered),
            "read" => Ok(Self::Read),
            other => Err(UnknownVariant::new("message status", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    #[default]
    Text,
    Image,
    File,
    Link,
}

impl MessageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Image => "image",
            Self::File => "file",
            Self::Link => "link",
        }
    }
}

impl FromStr for MessageKind {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "text" => Ok(Self::Text),
            "image" => Ok(Self::Image),
            "file" => Ok(Self::File),
            "link" => Ok(Self::Link),
            other => Err(UnknownVariant::new("message kind", other)),
        }
    }
}

/// A persisted message. `conversation` is addressed from the sender's side:
/// for direct messages it holds the recipient.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: Uuid,
    pub sender_id: Uuid,
    pub conversation: Conversation,
    pub body: String,
    pub kind: MessageKind,
    pub status: MessageStatus,
    pub parent_id: Option<Uuid>,
    pub edited: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Filled in on history pages. Live events carry reactions as their own
    /// `ReactionAdded` / `ReactionRemoved` events instead.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub reactions: Vec<Reaction>,
}

impl Message {
    /// The conversation this message belongs to, as seen by `viewer`.
    pub fn conversation_for(&self, viewer: Uuid) -> Conversation {
        match self.conversation {
            Conversation::Direct(recipient) if recipient == viewer => {
                Conversation::Direct(self.sender_id)
            }
            other => other,
        }
    }
}

/// A message about to be persisted.
#[derive(Debug, Clone)]
pub struct NewMessage {
    pub id: Uuid,
    pub sender_id: Uuid,
    pub conversation: Conversation,
    pub body: String,
    pub kind: MessageKind,
    pub status: MessageStatus,
    pub parent_id: Option<Uuid>,
    /// Client-chosen key; a second insert with the same sender and key
    /// returns the first message instead of storing a duplicate.
    pub client_temp_id: Option<String>,
}

/// One user's reaction to a message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reaction {
    pub symbol: String,
    pub user_id: Uuid,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnreadCount {
    pub conversation: Conversation,
    pub count: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown {what}: {value:?}")]
pub struct UnknownVariant {
    what: &'static str,
    value: String,
}

impl UnknownVariant {
    fn new(what: &'static str, value: &str) -> Self {
        Self {
            what,
            value: value.to_string(),
        }
    }
}
