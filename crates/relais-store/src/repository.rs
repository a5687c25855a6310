//! Async repository seam between the sync engine and storage.
//!
//! All persistence the engine does goes through [`Repository`]; the default
//! implementation wraps a [`Database`] in a `tokio::sync::Mutex`.

use async_trait::async_trait;
use relais_shared::models::ReactionKey;
use relais_shared::{Channel, FilterObject, Message, QuerySort, QuerySpec, Reaction, SyncState, SyncStatus};
use tokio::sync::Mutex;

use crate::database::Database;
use crate::error::Result;

#[async_trait]
pub trait Repository: Send + Sync {
    // -- messages ---------------------------------------------------------
    async fn insert_message(&self, message: &Message) -> Result<()>;
    async fn insert_messages(&self, messages: &[Message]) -> Result<()>;
    async fn select_message(&self, id: &str) -> Result<Option<Message>>;
    async fn select_messages(&self, ids: &[String]) -> Result<Vec<Message>>;
    /// Latest `limit` messages of a channel, oldest first.
    async fn select_messages_for_channel(&self, cid: &str, limit: u32) -> Result<Vec<Message>>;
    async fn select_message_ids_by_sync_status(&self, status: SyncStatus) -> Result<Vec<String>>;
    async fn delete_message(&self, id: &str) -> Result<()>;
    async fn delete_channel_messages(&self, cid: &str) -> Result<()>;

    // -- reactions --------------------------------------------------------
    async fn insert_reaction(&self, reaction: &Reaction) -> Result<()>;
    async fn select_reaction(&self, key: &ReactionKey) -> Result<Option<Reaction>>;
    async fn select_reactions_by_sync_status(&self, status: SyncStatus) -> Result<Vec<Reaction>>;
    async fn select_user_reactions_to_message(
        &self,
        message_id: &str,
        user_id: &str,
    ) -> Result<Vec<Reaction>>;
    async fn delete_reaction(&self, key: &ReactionKey) -> Result<()>;

    // -- channels ---------------------------------------------------------
    async fn insert_channel(&self, channel: &Channel) -> Result<()>;
    async fn insert_channels(&self, channels: &[Channel]) -> Result<()>;
    async fn select_channel(&self, cid: &str) -> Result<Option<Channel>>;
    async fn select_channels(&self, cids: &[String]) -> Result<Vec<Channel>>;
    async fn select_channel_cids_by_sync_status(&self, status: SyncStatus) -> Result<Vec<String>>;
    async fn delete_channel(&self, cid: &str) -> Result<()>;

    // -- queries ----------------------------------------------------------
    async fn insert_query_spec(&self, spec: &QuerySpec) -> Result<()>;
    async fn select_query_spec(&self, filter: &FilterObject, sort: &QuerySort) -> Result<Option<QuerySpec>>;

    // -- sync state -------------------------------------------------------
    async fn insert_sync_state(&self, state: &SyncState) -> Result<()>;
    async fn select_sync_state(&self, user_id: &str) -> Result<Option<SyncState>>;

    /// Persist channels together with the message pages they carry.
    async fn store_channels_with_messages(&self, channels: &[Channel]) -> Result<()> {
        let messages: Vec<Message> = channels
            .iter()
            .flat_map(|c| c.messages.iter().cloned())
            .collect();
        self.insert_messages(&messages).await?;
        self.insert_channels(channels).await
    }

    /// Load channels and re-attach their latest `message_limit` messages.
    async fn select_channels_with_messages(
        &self,
        cids: &[String],
        message_limit: u32,
    ) -> Result<Vec<Channel>> {
        let mut channels = self.select_channels(cids).await?;
        for channel in &mut channels {
            let stored = self
                .select_messages_for_channel(&channel.cid, message_limit)
                .await?;
            if !stored.is_empty() {
                channel.messages = stored;
            }
        }
        Ok(channels)
    }
}

// ---------------------------------------------------------------------------
// SQLite
// ---------------------------------------------------------------------------

pub struct SqliteRepository {
    db: Mutex<Database>,
}

impl SqliteRepository {
    pub fn new(db: Database) -> Self {
        Self { db: Mutex::new(db) }
    }

    pub fn open_in_memory() -> Result<Self> {
        Ok(Self::new(Database::open_in_memory()?))
    }
}

#[async_trait]
impl Repository for SqliteRepository {
    async fn insert_message(&self, message: &Message) -> Result<()> {
        self.db.lock().await.upsert_message(message)
    }

    async fn insert_messages(&self, messages: &[Message]) -> Result<()> {
        self.db.lock().await.upsert_messages(messages)
    }

    async fn select_message(&self, id: &str) -> Result<Option<Message>> {
        self.db.lock().await.get_message(id)
    }

    async fn select_messages(&self, ids: &[String]) -> Result<Vec<Message>> {
        self.db.lock().await.get_messages(ids)
    }

    async fn select_messages_for_channel(&self, cid: &str, limit: u32) -> Result<Vec<Message>> {
        self.db.lock().await.get_messages_for_channel(cid, limit)
    }

    async fn select_message_ids_by_sync_status(&self, status: SyncStatus) -> Result<Vec<String>> {
        self.db.lock().await.get_message_ids_by_sync_status(status)
    }

    async fn delete_message(&self, id: &str) -> Result<()> {
        self.db.lock().await.delete_message(id).map(|_| ())
    }

    async fn delete_channel_messages(&self, cid: &str) -> Result<()> {
        let removed = self.db.lock().await.delete_channel_messages(cid)?;
        tracing::debug!(channel = %cid, removed, "cleared channel messages");
        Ok(())
    }

    async fn insert_reaction(&self, reaction: &Reaction) -> Result<()> {
        self.db.lock().await.upsert_reaction(reaction)
    }

    async fn select_reaction(&self, key: &ReactionKey) -> Result<Option<Reaction>> {
        self.db.lock().await.get_reaction(key)
    }

    async fn select_reactions_by_sync_status(&self, status: SyncStatus) -> Result<Vec<Reaction>> {
        self.db.lock().await.get_reactions_by_sync_status(status)
    }

    async fn select_user_reactions_to_message(
        &self,
        message_id: &str,
        user_id: &str,
    ) -> Result<Vec<Reaction>> {
        self.db
            .lock()
            .await
            .get_user_reactions_to_message(message_id, user_id)
    }

    async fn delete_reaction(&self, key: &ReactionKey) -> Result<()> {
        self.db.lock().await.delete_reaction(key).map(|_| ())
    }

    async fn insert_channel(&self, channel: &Channel) -> Result<()> {
        self.db.lock().await.upsert_channel(channel)
    }

    async fn insert_channels(&self, channels: &[Channel]) -> Result<()> {
        self.db.lock().await.upsert_channels(channels)
    }

    async fn select_channel(&self, cid: &str) -> Result<Option<Channel>> {
        self.db.lock().await.get_channel(cid)
    }

    async fn select_channels(&self, cids: &[String]) -> Result<Vec<Channel>> {
        self.db.lock().await.get_channels(cids)
    }

    async fn select_channel_cids_by_sync_status(&self, status: SyncStatus) -> Result<Vec<String>> {
        self.db.lock().await.get_channel_cids_by_sync_status(status)
    }

    async fn delete_channel(&self, cid: &str) -> Result<()> {
        self.db.lock().await.delete_channel(cid).map(|_| ())
    }

    async fn insert_query_spec(&self, spec: &QuerySpec) -> Result<()> {
        self.db.lock().await.upsert_query_spec(spec)
    }

    async fn select_query_spec(&self, filter: &FilterObject, sort: &QuerySort) -> Result<Option<QuerySpec>> {
        self.db.lock().await.get_query_spec(filter, sort)
    }

    async fn insert_sync_state(&self, state: &SyncState) -> Result<()> {
        self.db.lock().await.upsert_sync_state(state)
    }

    async fn select_sync_state(&self, user_id: &str) -> Result<Option<SyncState>> {
        self.db.lock().await.get_sync_state(user_id)
    }
}
