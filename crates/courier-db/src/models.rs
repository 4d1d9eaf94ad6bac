//! Database row types. These map directly to SQLite rows.
//! Distinct from courier-types models to keep the DB layer independent.

use anyhow::{Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use uuid::Uuid;

use courier_types::models::{Conversation, ConversationKind, Message, Reaction, UnreadCount};

pub const MESSAGE_COLUMNS: &str = "id, sender_id, conversation_kind, conversation_id, body, kind, \
     status, parent_id, edited, created_at, updated_at";

pub struct MessageRow {
    pub id: String,
    pub sender_id: String,
    pub conversation_kind: String,
    pub conversation_id: String,
    pub body: String,
    pub kind: String,
    pub status: String,
    pub parent_id: Option<String>,
    pub edited: bool,
    pub created_at: String,
    pub updated_at: String,
}

impl MessageRow {
    /// Map a row selected with [`MESSAGE_COLUMNS`].
    pub fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            sender_id: row.get(1)?,
            conversation_kind: row.get(2)?,
            conversation_id: row.get(3)?,
            body: row.get(4)?,
            kind: row.get(5)?,
            status: row.get(6)?,
            parent_id: row.get(7)?,
            edited: row.get(8)?,
            created_at: row.get(9)?,
            updated_at: row.get(10)?,
        })
    }

    pub fn into_message(self) -> Result<Message> {
        let kind: ConversationKind = self.conversation_kind.parse()?;
        let conversation_id = parse_uuid(&self.conversation_id, "conversation_id")?;
        Ok(Message {
            id: parse_uuid(&self.id, "id")?,
            sender_id: parse_uuid(&self.sender_id, "sender_id")?,
            conversation: Conversation::from_parts(kind, conversation_id),
            body: self.body,
            kind: self.kind.parse()?,
            status: self.status.parse()?,
            parent_id: self
                .parent_id
                .as_deref()
                .map(|p| parse_uuid(p, "parent_id"))
                .transpose()?,
            edited: self.edited,
            created_at: parse_timestamp(&self.created_at)?,
            updated_at: parse_timestamp(&self.updated_at)?,
            reactions: Vec::new(),
        })
    }
}

pub struct ReactionRow {
    pub symbol: String,
    pub user_id: String,
}

impl ReactionRow {
    pub fn into_reaction(self) -> Result<Reaction> {
        Ok(Reaction {
            user_id: parse_uuid(&self.user_id, "user_id")?,
            symbol: self.symbol,
        })
    }
}

pub struct UnreadRow {
    pub conversation_kind: String,
    pub conversation_id: String,
    pub count: u32,
}

impl UnreadRow {
    pub fn into_unread(self) -> Result<UnreadCount> {
        let kind: ConversationKind = self.conversation_kind.parse()?;
        Ok(UnreadCount {
            conversation: Conversation::from_parts(
                kind,
                parse_uuid(&self.conversation_id, "conversation_id")?,
            ),
            count: self.count,
        })
    }
}

/// Fixed-width RFC 3339 (millisecond precision, `Z` suffix) so stored
/// timestamps sort lexicographically.
pub fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>> {
    let parsed = DateTime::parse_from_rfc3339(raw)
        .with_context(|| format!("corrupt timestamp '{}'", raw))?;
    Ok(parsed.with_timezone(&Utc))
}

fn parse_uuid(raw: &str, column: &str) -> Result<Uuid> {
    raw.parse()
        .with_context(|| format!("corrupt {} '{}'", column, raw))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timestamps_sort_as_text() {
        let early = "2024-01-02T03:04:05.006Z".parse::<DateTime<Utc>>().unwrap();
        let late = early + chrono::Duration::milliseconds(994);
        let (a, b) = (format_timestamp(early), format_timestamp(late));
        assert!(a < b);
        assert_eq!(parse_timestamp(&a).unwrap(), early);
    }
}
