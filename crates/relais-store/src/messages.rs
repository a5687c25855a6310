use relais_shared::{Message, SyncStatus};
use rusqlite::{params, params_from_iter, OptionalExtension};

use crate::database::{decode_rows, placeholders, Database};
use crate::error::Result;

impl Database {
    /// Insert or replace a message.
    pub fn upsert_message(&self, message: &Message) -> Result<()> {
        let doc = serde_json::to_string(message)?;
        self.conn().execute(
            "INSERT OR REPLACE INTO messages (id, cid, user_id, sync_status, created_at, doc)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                message.id,
                message.cid,
                message.user_id,
                message.sync_status.as_str(),
                message.effective_created_at().map(|t| t.to_rfc3339()),
                doc,
            ],
        )?;
        Ok(())
    }

    /// Insert or replace a batch of messages in one transaction.
    pub fn upsert_messages(&self, messages: &[Message]) -> Result<()> {
        if messages.is_empty() {
            return Ok(());
        }
        let tx = self.conn().unchecked_transaction()?;
        for message in messages {
            self.upsert_message(message)?;
        }
        tx.commit()?;
        Ok(())
    }

    pub fn get_message(&self, id: &str) -> Result<Option<Message>> {
        let doc: Option<String> = self
            .conn()
            .query_row("SELECT doc FROM messages WHERE id = ?1", params![id], |row| {
                row.get(0)
            })
            .optional()?;
        doc.map(|d| serde_json::from_str(&d).map_err(Into::into))
            .transpose()
    }

    pub fn get_messages(&self, ids: &[String]) -> Result<Vec<Message>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let sql = format!(
            "SELECT doc FROM messages WHERE id IN ({})",
            placeholders(1, ids.len())
        );
        let mut stmt = self.conn().prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(ids.iter()), |row| row.get(0))?;
        decode_rows(rows)
    }

    /// Latest `limit` messages of a channel, oldest first.
    pub fn get_messages_for_channel(&self, cid: &str, limit: u32) -> Result<Vec<Message>> {
        let mut stmt = self.conn().prepare(
            "SELECT doc FROM messages
             WHERE cid = ?1
             ORDER BY created_at DESC
             LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![cid, limit], |row| row.get(0))?;
        let mut messages: Vec<Message> = decode_rows(rows)?;
        messages.reverse();
        Ok(messages)
    }

    pub fn get_message_ids_by_sync_status(&self, status: SyncStatus) -> Result<Vec<String>> {
        let mut stmt = self
            .conn()
            .prepare("SELECT id FROM messages WHERE sync_status = ?1 ORDER BY created_at ASC")?;
        let rows = stmt.query_map(params![status.as_str()], |row| row.get(0))?;
        let mut ids = Vec::new();
        for row in rows {
            ids.push(row?);
        }
        Ok(ids)
    }

    pub fn delete_message(&self, id: &str) -> Result<bool> {
        let affected = self
            .conn()
            .execute("DELETE FROM messages WHERE id = ?1", params![id])?;
        Ok(affected > 0)
    }

    /// Remove every message of a channel; returns how many rows were dropped.
    pub fn delete_channel_messages(&self, cid: &str) -> Result<usize> {
        let affected = self
            .conn()
            .execute("DELETE FROM messages WHERE cid = ?1", params![cid])?;
        Ok(affected)
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, Utc};

    use super::*;

    fn message(id: &str, cid: &str, minutes_ago: i64, status: SyncStatus) -> Message {
        Message {
            id: id.into(),
            cid: cid.into(),
            user_id: "alice".into(),
            text: format!("body of {id}"),
            created_locally_at: Some(Utc::now() - Duration::minutes(minutes_ago)),
            sync_status: status,
            ..Default::default()
        }
    }

    #[test]
    fn upsert_replaces_document() {
        let db = Database::open_in_memory().unwrap();
        let mut msg = message("m1", "messaging:a", 1, SyncStatus::SyncNeeded);
        db.upsert_message(&msg).unwrap();

        msg.text = "edited".into();
        msg.sync_status = SyncStatus::Completed;
        db.upsert_message(&msg).unwrap();

        let stored = db.get_message("m1").unwrap().unwrap();
        assert_eq!(stored.text, "edited");
        assert!(db
            .get_message_ids_by_sync_status(SyncStatus::SyncNeeded)
            .unwrap()
            .is_empty());
    }

    #[test]
    fn channel_page_is_latest_first_then_reversed() {
        let db = Database::open_in_memory().unwrap();
        db.upsert_messages(&[
            message("old", "messaging:a", 30, SyncStatus::Completed),
            message("mid", "messaging:a", 20, SyncStatus::Completed),
            message("new", "messaging:a", 10, SyncStatus::Completed),
            message("other", "messaging:b", 5, SyncStatus::Completed),
        ])
        .unwrap();

        let page = db.get_messages_for_channel("messaging:a", 2).unwrap();
        let ids: Vec<_> = page.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, vec!["mid", "new"]);
    }

    #[test]
    fn sync_status_index_lists_dirty_messages_oldest_first() {
        let db = Database::open_in_memory().unwrap();
        db.upsert_messages(&[
            message("b", "messaging:a", 1, SyncStatus::SyncNeeded),
            message("a", "messaging:a", 2, SyncStatus::SyncNeeded),
            message("c", "messaging:a", 3, SyncStatus::Completed),
        ])
        .unwrap();

        let ids = db
            .get_message_ids_by_sync_status(SyncStatus::SyncNeeded)
            .unwrap();
        assert_eq!(ids, vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn delete_channel_messages_only_touches_that_channel() {
        let db = Database::open_in_memory().unwrap();
        db.upsert_messages(&[
            message("m1", "messaging:a", 1, SyncStatus::Completed),
            message("m2", "messaging:b", 1, SyncStatus::Completed),
        ])
        .unwrap();

        assert_eq!(db.delete_channel_messages("messaging:a").unwrap(), 1);
        assert!(db.get_message("m1").unwrap().is_none());
        assert!(db.get_message("m2").unwrap().is_some());
    }
}
