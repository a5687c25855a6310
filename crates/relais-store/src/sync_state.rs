use relais_shared::SyncState;
use rusqlite::{params, OptionalExtension};

use crate::database::Database;
use crate::error::Result;

impl Database {
    pub fn upsert_sync_state(&self, state: &SyncState) -> Result<()> {
        let doc = serde_json::to_string(state)?;
        self.conn().execute(
            "INSERT OR REPLACE INTO sync_state (user_id, doc) VALUES (?1, ?2)",
            params![state.user_id, doc],
        )?;
        Ok(())
    }

    pub fn get_sync_state(&self, user_id: &str) -> Result<Option<SyncState>> {
        let doc: Option<String> = self
            .conn()
            .query_row(
                "SELECT doc FROM sync_state WHERE user_id = ?1",
                params![user_id],
                |row| row.get(0),
            )
            .optional()?;
        doc.map(|d| serde_json::from_str(&d).map_err(Into::into))
            .transpose()
    }
}
