use anyhow::Result;
use rusqlite::Connection;
use tracing::info;

pub fn run(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS messages (
            id                  TEXT PRIMARY KEY,
            sender_id           TEXT NOT NULL,
            conversation_kind   TEXT NOT NULL CHECK (conversation_kind IN ('direct', 'group')),
            -- recipient id for direct messages, group id for group messages
            conversation_id     TEXT NOT NULL,
            body                TEXT NOT NULL,
            kind                TEXT NOT NULL DEFAULT 'text',
            status              TEXT NOT NULL DEFAULT 'sent'
                                CHECK (status IN ('sent', 'delivered', 'read')),
            parent_id           TEXT REFERENCES messages(id) ON DELETE SET NULL,
            -- retry key chosen by the sending client, NULL when none was given
            client_temp_id      TEXT,
            edited              INTEGER NOT NULL DEFAULT 0,
            created_at          TEXT NOT NULL,
            updated_at          TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_messages_conversation
            ON messages(conversation_kind, conversation_id, created_at);

        CREATE INDEX IF NOT EXISTS idx_messages_sender
            ON messages(sender_id, conversation_id, status);

        CREATE UNIQUE INDEX IF NOT EXISTS idx_messages_client_temp
            ON messages(sender_id, client_temp_id);

        CREATE TABLE IF NOT EXISTS reactions (
            message_id  TEXT NOT NULL REFERENCES messages(id) ON DELETE CASCADE,
            user_id     TEXT NOT NULL,
            symbol      TEXT NOT NULL,
            created_at  TEXT NOT NULL,
            PRIMARY KEY (message_id, user_id, symbol)
        );

        CREATE TABLE IF NOT EXISTS hidden_messages (
            user_id     TEXT NOT NULL,
            message_id  TEXT NOT NULL REFERENCES messages(id) ON DELETE CASCADE,
            PRIMARY KEY (user_id, message_id)
        );

        CREATE TABLE IF NOT EXISTS unread_counts (
            user_id             TEXT NOT NULL,
            conversation_kind   TEXT NOT NULL CHECK (conversation_kind IN ('direct', 'group')),
            conversation_id     TEXT NOT NULL,
            count               INTEGER NOT NULL DEFAULT 0 CHECK (count >= 0),
            updated_at          TEXT NOT NULL,
            PRIMARY KEY (user_id, conversation_kind, conversation_id)
        );

        -- Owned by group administration; the gateway only reads it
        CREATE TABLE IF NOT EXISTS group_members (
            group_id    TEXT NOT NULL,
            user_id     TEXT NOT NULL,
            joined_at   TEXT NOT NULL,
            PRIMARY KEY (group_id, user_id)
        );

        CREATE INDEX IF NOT EXISTS idx_group_members_user
            ON group_members(user_id);
        ",
    )?;

    info!("Database migrations complete");
    Ok(())
}
