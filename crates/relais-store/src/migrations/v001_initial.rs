//! v001 -- Initial schema creation.
//!
//! Creates the five collections: `channels`, `messages`, `reactions`,
//! `query_specs` and `sync_state`. Every row carries the full entity as a
//! JSON document in `doc`; the other columns exist only for lookups.

use rusqlite::Connection;

/// SQL executed when upgrading from version 0 to version 1.
const UP_SQL: &str = r#"
-- ----------------------------------------------------------------
-- Channels
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS channels (
    cid             TEXT PRIMARY KEY NOT NULL,  -- "type:id"
    sync_status     TEXT NOT NULL,
    last_message_at TEXT,                       -- RFC-3339, nullable
    doc             TEXT NOT NULL
);

-- ----------------------------------------------------------------
-- Messages
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS messages (
    id          TEXT PRIMARY KEY NOT NULL,
    cid         TEXT NOT NULL,
    user_id     TEXT NOT NULL,
    sync_status TEXT NOT NULL,
    created_at  TEXT,                           -- server time, else local compose time
    doc         TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_messages_cid_created
    ON messages(cid, created_at DESC);

-- ----------------------------------------------------------------
-- Reactions
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS reactions (
    message_id  TEXT NOT NULL,
    user_id     TEXT NOT NULL,
    type        TEXT NOT NULL,
    sync_status TEXT NOT NULL,
    doc         TEXT NOT NULL,

    PRIMARY KEY (message_id, user_id, type)
);

-- ----------------------------------------------------------------
-- Channel list queries
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS query_specs (
    query_key TEXT PRIMARY KEY NOT NULL,        -- serialized (filter, sort)
    doc       TEXT NOT NULL
);

-- ----------------------------------------------------------------
-- Sync state (one row per user)
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS sync_state (
    user_id TEXT PRIMARY KEY NOT NULL,
    doc     TEXT NOT NULL
);
"#;

/// Apply the initial migration.
pub fn up(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(UP_SQL)
}
