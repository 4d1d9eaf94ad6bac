use anyhow::Result;
use chrono::Utc;
use rusqlite::{Connection, OptionalExtension, params};
use uuid::Uuid;

use courier_types::models::{Conversation, Message, NewMessage, UnreadCount};

use crate::Database;
use crate::models::{MESSAGE_COLUMNS, MessageRow, ReactionRow, UnreadRow, format_timestamp};

impl Database {
    // -- Messages --

    /// Insert a message and read it back, in one transaction.
    ///
    /// The flag is `false` when the sender already stored a message under the
    /// same `client_temp_id`: nothing is written and that earlier message is
    /// returned instead.
    pub fn insert_message(&self, new: &NewMessage) -> Result<(Message, bool)> {
        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;
            let now = format_timestamp(Utc::now());
            let inserted = tx.execute(
                "INSERT INTO messages (id, sender_id, conversation_kind, conversation_id, body, kind, status, parent_id, client_temp_id, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?10)
                 ON CONFLICT (sender_id, client_temp_id) DO NOTHING",
                params![
                    new.id.to_string(),
                    new.sender_id.to_string(),
                    new.conversation.kind().as_str(),
                    new.conversation.id().to_string(),
                    new.body,
                    new.kind.as_str(),
                    new.status.as_str(),
                    new.parent_id.map(|p| p.to_string()),
                    new.client_temp_id,
                    now,
                ],
            )? > 0;

            let id = if inserted {
                new.id
            } else {
                let existing: String = tx.query_row(
                    "SELECT id FROM messages WHERE sender_id = ?1 AND client_temp_id = ?2",
                    params![new.sender_id.to_string(), new.client_temp_id],
                    |row| row.get(0),
                )?;
                existing
                    .parse::<Uuid>()
                    .map_err(|e| anyhow::anyhow!("corrupt id '{}': {}", existing, e))?
            };
            let message = query_message(&tx, id)?
                .ok_or_else(|| anyhow::anyhow!("message {} vanished inside its own transaction", id))?;
            tx.commit()?;
            Ok((message, inserted))
        })
    }

    pub fn get_message(&self, id: Uuid) -> Result<Option<Message>> {
        self.with_conn(|conn| query_message(conn, id))
    }

    /// Replace a message body. Returns the updated message, or `None` if it no longer exists.
    pub fn update_message_body(&self, id: Uuid, body: &str) -> Result<Option<Message>> {
        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;
            let changed = tx.execute(
                "UPDATE messages SET body = ?1, edited = 1, updated_at = ?2 WHERE id = ?3",
                params![body, format_timestamp(Utc::now()), id.to_string()],
            )?;
            if changed == 0 {
                return Ok(None);
            }
            let message = query_message(&tx, id)?;
            tx.commit()?;
            Ok(message)
        })
    }

    /// Hard delete. Reactions and hidden markers go with it; replies keep
    /// living with their parent link cleared.
    pub fn delete_message(&self, id: Uuid) -> Result<bool> {
        self.with_conn(|conn| {
            let changed = conn.execute("DELETE FROM messages WHERE id = ?1", [id.to_string()])?;
            Ok(changed > 0)
        })
    }

    /// Per-user "delete for me". Idempotent; returns whether a marker was added.
    pub fn hide_message(&self, user_id: Uuid, message_id: Uuid) -> Result<bool> {
        self.with_conn(|conn| {
            let changed = conn.execute(
                "INSERT OR IGNORE INTO hidden_messages (user_id, message_id) VALUES (?1, ?2)",
                [user_id.to_string(), message_id.to_string()],
            )?;
            Ok(changed > 0)
        })
    }

    /// Newest `limit` messages of a conversation as seen by `viewer`,
    /// returned oldest first with their reactions. `before` is the id of a
    /// message in the conversation; only messages stored ahead of it are
    /// returned. Messages the viewer hid are skipped.
    pub fn history(
        &self,
        viewer: Uuid,
        conversation: Conversation,
        before: Option<Uuid>,
        limit: u32,
    ) -> Result<Vec<Message>> {
        self.with_conn(|conn| query_history(conn, viewer, conversation, before, limit))
    }

    /// Flip every unread direct message from `sender` to `reader` to `read`.
    pub fn mark_direct_read(&self, reader: Uuid, sender: Uuid) -> Result<usize> {
        self.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE messages SET status = 'read', updated_at = ?1
                 WHERE conversation_kind = 'direct'
                   AND sender_id = ?2
                   AND conversation_id = ?3
                   AND status != 'read'",
                params![format_timestamp(Utc::now()), sender.to_string(), reader.to_string()],
            )?;
            Ok(changed)
        })
    }

    // -- Reactions --

    /// Returns true if the (message, user, symbol) triple was newly created.
    pub fn add_reaction(&self, message_id: Uuid, user_id: Uuid, symbol: &str) -> Result<bool> {
        self.with_conn(|conn| {
            let changed = conn.execute(
                "INSERT OR IGNORE INTO reactions (message_id, user_id, symbol, created_at) VALUES (?1, ?2, ?3, ?4)",
                params![
                    message_id.to_string(),
                    user_id.to_string(),
                    symbol,
                    format_timestamp(Utc::now()),
                ],
            )?;
            Ok(changed > 0)
        })
    }

    /// Returns true if the triple existed and was removed.
    pub fn remove_reaction(&self, message_id: Uuid, user_id: Uuid, symbol: &str) -> Result<bool> {
        self.with_conn(|conn| {
            let changed = conn.execute(
                "DELETE FROM reactions WHERE message_id = ?1 AND user_id = ?2 AND symbol = ?3",
                params![message_id.to_string(), user_id.to_string(), symbol],
            )?;
            Ok(changed > 0)
        })
    }

    // -- Unread counters --

    /// Atomic upsert-or-increment. Returns the new count.
    pub fn increment_unread(&self, user_id: Uuid, conversation: Conversation) -> Result<u32> {
        self.with_conn(|conn| {
            let count = conn.query_row(
                "INSERT INTO unread_counts (user_id, conversation_kind, conversation_id, count, updated_at)
                 VALUES (?1, ?2, ?3, 1, ?4)
                 ON CONFLICT (user_id, conversation_kind, conversation_id)
                 DO UPDATE SET count = count + 1, updated_at = excluded.updated_at
                 RETURNING count",
                params![
                    user_id.to_string(),
                    conversation.kind().as_str(),
                    conversation.id().to_string(),
                    format_timestamp(Utc::now()),
                ],
                |row| row.get(0),
            )?;
            Ok(count)
        })
    }

    /// Set the counter to zero if present. Returns whether anything changed.
    pub fn reset_unread(&self, user_id: Uuid, conversation: Conversation) -> Result<bool> {
        self.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE unread_counts SET count = 0, updated_at = ?1
                 WHERE user_id = ?2 AND conversation_kind = ?3 AND conversation_id = ?4 AND count != 0",
                params![
                    format_timestamp(Utc::now()),
                    user_id.to_string(),
                    conversation.kind().as_str(),
                    conversation.id().to_string(),
                ],
            )?;
            Ok(changed > 0)
        })
    }

    pub fn unread_count(&self, user_id: Uuid, conversation: Conversation) -> Result<u32> {
        self.with_conn(|conn| {
            let count = conn
                .query_row(
                    "SELECT count FROM unread_counts
                     WHERE user_id = ?1 AND conversation_kind = ?2 AND conversation_id = ?3",
                    params![
                        user_id.to_string(),
                        conversation.kind().as_str(),
                        conversation.id().to_string(),
                    ],
                    |row| row.get(0),
                )
                .optional()?;
            Ok(count.unwrap_or(0))
        })
    }

    /// Every non-zero counter for a user.
    pub fn unread_counts(&self, user_id: Uuid) -> Result<Vec<UnreadCount>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT conversation_kind, conversation_id, count FROM unread_counts
                 WHERE user_id = ?1 AND count > 0
                 ORDER BY updated_at DESC",
            )?;
            let rows = stmt
                .query_map([user_id.to_string()], |row| {
                    Ok(UnreadRow {
                        conversation_kind: row.get(0)?,
                        conversation_id: row.get(1)?,
                        count: row.get(2)?,
                    })
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;

            rows.into_iter().map(UnreadRow::into_unread).collect()
        })
    }

    // -- Group membership --

    pub fn groups_of(&self, user_id: Uuid) -> Result<Vec<Uuid>> {
        self.with_conn(|conn| {
            query_ids(
                conn,
                "SELECT group_id FROM group_members WHERE user_id = ?1 ORDER BY joined_at",
                user_id,
            )
        })
    }

    pub fn members_of(&self, group_id: Uuid) -> Result<Vec<Uuid>> {
        self.with_conn(|conn| {
            query_ids(
                conn,
                "SELECT user_id FROM group_members WHERE group_id = ?1 ORDER BY joined_at",
                group_id,
            )
        })
    }

    /// Seed a membership row. Group administration lives outside this store;
    /// this exists for provisioning scripts and tests.
    pub fn add_group_member(&self, group_id: Uuid, user_id: Uuid) -> Result<bool> {
        self.with_conn(|conn| {
            let changed = conn.execute(
                "INSERT OR IGNORE INTO group_members (group_id, user_id, joined_at) VALUES (?1, ?2, ?3)",
                params![group_id.to_string(), user_id.to_string(), format_timestamp(Utc::now())],
            )?;
            Ok(changed > 0)
        })
    }
}

fn query_message(conn: &Connection, id: Uuid) -> Result<Option<Message>> {
    let sql = format!("SELECT {} FROM messages WHERE id = ?1", MESSAGE_COLUMNS);
    let row = conn
        .query_row(&sql, [id.to_string()], MessageRow::from_row)
        .optional()?;

    row.map(MessageRow::into_message).transpose()
}

fn query_history(
    conn: &Connection,
    viewer: Uuid,
    conversation: Conversation,
    before: Option<Uuid>,
    limit: u32,
) -> Result<Vec<Message>> {
    let scope = match conversation {
        Conversation::Direct(_) => {
            "conversation_kind = 'direct'
             AND ((sender_id = ?1 AND conversation_id = ?2) OR (sender_id = ?2 AND conversation_id = ?1))"
        }
        Conversation::Group(_) => "conversation_kind = 'group' AND conversation_id = ?2",
    };
    let sql = format!(
        "SELECT {} FROM messages
         WHERE {}
           AND NOT EXISTS (SELECT 1 FROM hidden_messages h WHERE h.user_id = ?1 AND h.message_id = messages.id)
           AND (?3 IS NULL OR (created_at, rowid) < (SELECT created_at, rowid FROM messages WHERE id = ?3))
         ORDER BY created_at DESC, rowid DESC
         LIMIT ?4",
        MESSAGE_COLUMNS, scope
    );

    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(
            params![
                viewer.to_string(),
                conversation.id().to_string(),
                before.map(|id| id.to_string()),
                limit,
            ],
            MessageRow::from_row,
        )?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    let mut messages = rows
        .into_iter()
        .map(MessageRow::into_message)
        .collect::<Result<Vec<_>>>()?;
    messages.reverse();
    attach_reactions(conn, &mut messages)?;
    Ok(messages)
}

fn attach_reactions(conn: &Connection, messages: &mut [Message]) -> Result<()> {
    let mut stmt = conn.prepare(
        "SELECT symbol, user_id FROM reactions WHERE message_id = ?1 ORDER BY created_at, rowid",
    )?;
    for message in messages.iter_mut() {
        let rows = stmt
            .query_map([message.id.to_string()], |row| {
                Ok(ReactionRow {
                    symbol: row.get(0)?,
                    user_id: row.get(1)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        message.reactions = rows
            .into_iter()
            .map(ReactionRow::into_reaction)
            .collect::<Result<Vec<_>>>()?;
    }
    Ok(())
}

fn query_ids(conn: &Connection, sql: &str, key: Uuid) -> Result<Vec<Uuid>> {
    let mut stmt = conn.prepare(sql)?;
    let raw = stmt
        .query_map([key.to_string()], |row| row.get::<_, String>(0))?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    raw.iter()
        .map(|id| id.parse().map_err(|e| anyhow::anyhow!("corrupt id '{}': {}", id, e)))
        .collect()
}
