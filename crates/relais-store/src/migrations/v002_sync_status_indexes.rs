use rusqlite::Connection;

const UP_SQL: &str = r#"
-- Retry sweeps select every row in a given sync status.
CREATE INDEX IF NOT EXISTS idx_messages_sync_status ON messages(sync_status);
CREATE INDEX IF NOT EXISTS idx_reactions_sync_status ON reactions(sync_status);
CREATE INDEX IF NOT EXISTS idx_channels_sync_status ON channels(sync_status);
CREATE INDEX IF NOT EXISTS idx_reactions_message_user ON reactions(message_id, user_id);
"#;

pub fn up(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(UP_SQL)
}
