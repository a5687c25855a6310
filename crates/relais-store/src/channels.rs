use relais_shared::{Channel, SyncStatus};
use rusqlite::{params, params_from_iter, OptionalExtension};

use crate::database::{decode_rows, placeholders, Database};
use crate::error::Result;

impl Database {
    /// Insert or replace a channel.
    ///
    /// The embedded message page is persisted separately through
    /// [`Database::upsert_messages`]; the channel document only keeps the
    /// snapshot it was handed.
    pub fn upsert_channel(&self, channel: &Channel) -> Result<()> {
        let doc = serde_json::to_string(channel)?;
        self.conn().execute(
            "INSERT OR REPLACE INTO channels (cid, sync_status, last_message_at, doc)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                channel.cid,
                channel.sync_status.as_str(),
                channel.last_message_at.map(|t| t.to_rfc3339()),
                doc,
            ],
        )?;
        Ok(())
    }

    pub fn upsert_channels(&self, channels: &[Channel]) -> Result<()> {
        if channels.is_empty() {
            return Ok(());
        }
        let tx = self.conn().unchecked_transaction()?;
        for channel in channels {
            self.upsert_channel(channel)?;
        }
        tx.commit()?;
        Ok(())
    }

    pub fn get_channel(&self, cid: &str) -> Result<Option<Channel>> {
        let doc: Option<String> = self
            .conn()
            .query_row("SELECT doc FROM channels WHERE cid = ?1", params![cid], |row| {
                row.get(0)
            })
            .optional()?;
        doc.map(|d| serde_json::from_str(&d).map_err(Into::into))
            .transpose()
    }

    /// Channels for the given cids, in the order the cids were given.
    /// Unknown cids are skipped.
    pub fn get_channels(&self, cids: &[String]) -> Result<Vec<Channel>> {
        if cids.is_empty() {
            return Ok(Vec::new());
        }
        let sql = format!(
            "SELECT doc FROM channels WHERE cid IN ({})",
            placeholders(1, cids.len())
        );
        let mut stmt = self.conn().prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(cids.iter()), |row| row.get(0))?;
        let found: Vec<Channel> = decode_rows(rows)?;

        let mut ordered = Vec::with_capacity(found.len());
        for cid in cids {
            if let Some(channel) = found.iter().find(|c| &c.cid == cid) {
                ordered.push(channel.clone());
            }
        }
        Ok(ordered)
    }

    pub fn get_channel_cids_by_sync_status(&self, status: SyncStatus) -> Result<Vec<String>> {
        let mut stmt = self
            .conn()
            .prepare("SELECT cid FROM channels WHERE sync_status = ?1")?;
        let rows = stmt.query_map(params![status.as_str()], |row| row.get(0))?;
        let mut cids = Vec::new();
        for row in rows {
            cids.push(row?);
        }
        Ok(cids)
    }

    pub fn delete_channel(&self, cid: &str) -> Result<bool> {
        let affected = self
            .conn()
            .execute("DELETE FROM channels WHERE cid = ?1", params![cid])?;
        Ok(affected > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channels_come_back_in_requested_order() {
        let db = Database::open_in_memory().unwrap();
        db.upsert_channels(&[
            Channel::new("messaging", "a"),
            Channel::new("messaging", "b"),
            Channel::new("messaging", "c"),
        ])
        .unwrap();

        let cids = vec![
            "messaging:c".to_string(),
            "messaging:missing".to_string(),
            "messaging:a".to_string(),
        ];
        let channels = db.get_channels(&cids).unwrap();
        let ids: Vec<_> = channels.iter().map(|c| c.id.as_str()).collect();
        assert_eq!(ids, vec!["c", "a"]);
    }

    #[test]
    fn pending_channels_are_listed() {
        let db = Database::open_in_memory().unwrap();
        let mut pending = Channel::new("messaging", "new");
        pending.sync_status = SyncStatus::SyncNeeded;
        db.upsert_channel(&pending).unwrap();
        db.upsert_channel(&Channel::new("messaging", "synced")).unwrap();

        let cids = db
            .get_channel_cids_by_sync_status(SyncStatus::SyncNeeded)
            .unwrap();
        assert_eq!(cids, vec!["messaging:new".to_string()]);

        assert!(db.delete_channel("messaging:new").unwrap());
        assert!(db.get_channel("messaging:new").unwrap().is_none());
    }
}
