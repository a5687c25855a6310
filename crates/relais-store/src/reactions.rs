use relais_shared::models::ReactionKey;
use relais_shared::{Reaction, SyncStatus};
use rusqlite::{params, OptionalExtension};

use crate::database::{decode_rows, Database};
use crate::error::Result;

impl Database {
    pub fn upsert_reaction(&self, reaction: &Reaction) -> Result<()> {
        let doc = serde_json::to_string(reaction)?;
        self.conn().execute(
            "INSERT OR REPLACE INTO reactions (message_id, user_id, type, sync_status, doc)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                reaction.message_id,
                reaction.user_id,
                reaction.reaction_type,
                reaction.sync_status.as_str(),
                doc,
            ],
        )?;
        Ok(())
    }

    pub fn get_reaction(&self, key: &ReactionKey) -> Result<Option<Reaction>> {
        let doc: Option<String> = self
            .conn()
            .query_row(
                "SELECT doc FROM reactions WHERE message_id = ?1 AND user_id = ?2 AND type = ?3",
                params![key.message_id, key.user_id, key.reaction_type],
                |row| row.get(0),
            )
            .optional()?;
        doc.map(|d| serde_json::from_str(&d).map_err(Into::into))
            .transpose()
    }

    pub fn get_reactions_by_sync_status(&self, status: SyncStatus) -> Result<Vec<Reaction>> {
        let mut stmt = self
            .conn()
            .prepare("SELECT doc FROM reactions WHERE sync_status = ?1")?;
        let rows = stmt.query_map(params![status.as_str()], |row| row.get(0))?;
        decode_rows(rows)
    }

    /// Every reaction `user_id` left on `message_id`, including soft-deleted ones.
    pub fn get_user_reactions_to_message(
        &self,
        message_id: &str,
        user_id: &str,
    ) -> Result<Vec<Reaction>> {
        let mut stmt = self
            .conn()
            .prepare("SELECT doc FROM reactions WHERE message_id = ?1 AND user_id = ?2")?;
        let rows = stmt.query_map(params![message_id, user_id], |row| row.get(0))?;
        decode_rows(rows)
    }

    pub fn delete_reaction(&self, key: &ReactionKey) -> Result<bool> {
        let affected = self.conn().execute(
            "DELETE FROM reactions WHERE message_id = ?1 AND user_id = ?2 AND type = ?3",
            params![key.message_id, key.user_id, key.reaction_type],
        )?;
        Ok(affected > 0)
    }
}
