//! Bounded read-through caches in front of a [`Repository`].
//!
//! Messages and channels are cached by primary key. Every write goes through
//! the table's write lock, so concurrent writers to the same table are
//! serialized and the cache never holds a value older than the row.
//!
//! A miss reads the row without holding the write lock. Each table keeps a
//! write generation, and a miss only populates the cache when no write to
//! that table landed while the row was being read.

use std::collections::{BTreeMap, HashMap};
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use relais_shared::models::ReactionKey;
use relais_shared::{Channel, FilterObject, Message, QuerySort, QuerySpec, Reaction, SyncState, SyncStatus};
use tokio::sync::Mutex;

use crate::error::Result;
use crate::repository::Repository;

/// Least-recently-used map with a fixed capacity.
pub struct LruCache<K, V> {
    capacity: usize,
    tick: u64,
    entries: HashMap<K, (V, u64)>,
    order: BTreeMap<u64, K>,
}

impl<K: Clone + Eq + Hash, V: Clone> LruCache<K, V> {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            tick: 0,
            entries: HashMap::new(),
            order: BTreeMap::new(),
        }
    }

    pub fn get(&mut self, key: &K) -> Option<V> {
        let tick = self.next_tick();
        let (value, last_used) = self.entries.get_mut(key)?;
        self.order.remove(last_used);
        *last_used = tick;
        self.order.insert(tick, key.clone());
        Some(value.clone())
    }

    pub fn put(&mut self, key: K, value: V) {
        let tick = self.next_tick();
        if let Some((_, last_used)) = self.entries.insert(key.clone(), (value, tick)) {
            self.order.remove(&last_used);
        }
        self.order.insert(tick, key);

        while self.entries.len() > self.capacity {
            let Some((_, oldest)) = self.order.pop_first() else {
                break;
            };
            self.entries.remove(&oldest);
        }
    }

    pub fn remove(&mut self, key: &K) {
        if let Some((_, last_used)) = self.entries.remove(key) {
            self.order.remove(&last_used);
        }
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.order.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn next_tick(&mut self) -> u64 {
        self.tick += 1;
        self.tick
    }
}

// ---------------------------------------------------------------------------
// Cached repository
// ---------------------------------------------------------------------------

pub struct CachedRepository<R> {
    inner: R,
    messages: Mutex<LruCache<String, Message>>,
    channels: Mutex<LruCache<String, Channel>>,
    message_writes: Mutex<()>,
    channel_writes: Mutex<()>,
    reaction_writes: Mutex<()>,
    message_generation: AtomicU64,
    channel_generation: AtomicU64,
}

impl<R: Repository> CachedRepository<R> {
    pub fn new(inner: R, message_capacity: usize, channel_capacity: usize) -> Self {
        Self {
            inner,
            messages: Mutex::new(LruCache::new(message_capacity)),
            channels: Mutex::new(LruCache::new(channel_capacity)),
            message_writes: Mutex::new(()),
            channel_writes: Mutex::new(()),
            reaction_writes: Mutex::new(()),
            message_generation: AtomicU64::new(0),
            channel_generation: AtomicU64::new(0),
        }
    }

    pub fn inner(&self) -> &R {
        &self.inner
    }
}

#[async_trait]
impl<R: Repository> Repository for CachedRepository<R> {
    async fn insert_message(&self, message: &Message) -> Result<()> {
        let _guard = self.message_writes.lock().await;
        self.inner.insert_message(message).await?;
        self.message_generation.fetch_add(1, Ordering::SeqCst);
        self.messages
            .lock()
            .await
            .put(message.id.clone(), message.clone());
        Ok(())
    }

    async fn insert_messages(&self, messages: &[Message]) -> Result<()> {
        let _guard = self.message_writes.lock().await;
        self.inner.insert_messages(messages).await?;
        self.message_generation.fetch_add(1, Ordering::SeqCst);
        let mut cache = self.messages.lock().await;
        for message in messages {
            cache.put(message.id.clone(), message.clone());
        }
        Ok(())
    }

    async fn select_message(&self, id: &str) -> Result<Option<Message>> {
        let generation = {
            let mut cache = self.messages.lock().await;
            if let Some(hit) = cache.get(&id.to_string()) {
                return Ok(Some(hit));
            }
            self.message_generation.load(Ordering::SeqCst)
        };
        let loaded = self.inner.select_message(id).await?;
        if let Some(message) = &loaded {
            let mut cache = self.messages.lock().await;
            if self.message_generation.load(Ordering::SeqCst) == generation {
                cache.put(message.id.clone(), message.clone());
            }
        }
        Ok(loaded)
    }

    async fn select_messages(&self, ids: &[String]) -> Result<Vec<Message>> {
        let mut found = Vec::with_capacity(ids.len());
        let mut missing = Vec::new();
        let generation = {
            let mut cache = self.messages.lock().await;
            for id in ids {
                match cache.get(id) {
                    Some(message) => found.push(message),
                    None => missing.push(id.clone()),
                }
            }
            self.message_generation.load(Ordering::SeqCst)
        };
        if !missing.is_empty() {
            let loaded = self.inner.select_messages(&missing).await?;
            let mut cache = self.messages.lock().await;
            let unchanged = self.message_generation.load(Ordering::SeqCst) == generation;
            for message in loaded {
                if unchanged {
                    cache.put(message.id.clone(), message.clone());
                }
                found.push(message);
            }
        }
        Ok(found)
    }

    async fn select_messages_for_channel(&self, cid: &str, limit: u32) -> Result<Vec<Message>> {
        self.inner.select_messages_for_channel(cid, limit).await
    }

    async fn select_message_ids_by_sync_status(&self, status: SyncStatus) -> Result<Vec<String>> {
        self.inner.select_message_ids_by_sync_status(status).await
    }

    async fn delete_message(&self, id: &str) -> Result<()> {
        let _guard = self.message_writes.lock().await;
        self.inner.delete_message(id).await?;
        self.message_generation.fetch_add(1, Ordering::SeqCst);
        self.messages.lock().await.remove(&id.to_string());
        Ok(())
    }

    async fn delete_channel_messages(&self, cid: &str) -> Result<()> {
        let _guard = self.message_writes.lock().await;
        self.inner.delete_channel_messages(cid).await?;
        self.message_generation.fetch_add(1, Ordering::SeqCst);
        // Bulk delete: the cache has no per-channel index.
        self.messages.lock().await.clear();
        Ok(())
    }

    async fn insert_reaction(&self, reaction: &Reaction) -> Result<()> {
        let _guard = self.reaction_writes.lock().await;
        self.inner.insert_reaction(reaction).await
    }

    async fn select_reaction(&self, key: &ReactionKey) -> Result<Option<Reaction>> {
        self.inner.select_reaction(key).await
    }

    async fn select_reactions_by_sync_status(&self, status: SyncStatus) -> Result<Vec<Reaction>> {
        self.inner.select_reactions_by_sync_status(status).await
    }

    async fn select_user_reactions_to_message(
        &self,
        message_id: &str,
        user_id: &str,
    ) -> Result<Vec<Reaction>> {
        self.inner
            .select_user_reactions_to_message(message_id, user_id)
            .await
    }

    async fn delete_reaction(&self, key: &ReactionKey) -> Result<()> {
        let _guard = self.reaction_writes.lock().await;
        self.inner.delete_reaction(key).await
    }

    async fn insert_channel(&self, channel: &Channel) -> Result<()> {
        let _guard = self.channel_writes.lock().await;
        self.inner.insert_channel(channel).await?;
        self.channel_generation.fetch_add(1, Ordering::SeqCst);
        self.channels
            .lock()
            .await
            .put(channel.cid.clone(), channel.clone());
        Ok(())
    }

    async fn insert_channels(&self, channels: &[Channel]) -> Result<()> {
        let _guard = self.channel_writes.lock().await;
        self.inner.insert_channels(channels).await?;
        self.channel_generation.fetch_add(1, Ordering::SeqCst);
        let mut cache = self.channels.lock().await;
        for channel in channels {
            cache.put(channel.cid.clone(), channel.clone());
        }
        Ok(())
    }

    async fn select_channel(&self, cid: &str) -> Result<Option<Channel>> {
        let generation = {
            let mut cache = self.channels.lock().await;
            if let Some(hit) = cache.get(&cid.to_string()) {
                return Ok(Some(hit));
            }
            self.channel_generation.load(Ordering::SeqCst)
        };
        let loaded = self.inner.select_channel(cid).await?;
        if let Some(channel) = &loaded {
            let mut cache = self.channels.lock().await;
            if self.channel_generation.load(Ordering::SeqCst) == generation {
                cache.put(channel.cid.clone(), channel.clone());
            }
        }
        Ok(loaded)
    }

    async fn select_channels(&self, cids: &[String]) -> Result<Vec<Channel>> {
        let mut cached = HashMap::new();
        let mut missing = Vec::new();
        let generation = {
            let mut cache = self.channels.lock().await;
            for cid in cids {
                match cache.get(cid) {
                    Some(channel) => {
                        cached.insert(cid.clone(), channel);
                    }
                    None => missing.push(cid.clone()),
                }
            }
            self.channel_generation.load(Ordering::SeqCst)
        };
        if !missing.is_empty() {
            let loaded = self.inner.select_channels(&missing).await?;
            let mut cache = self.channels.lock().await;
            let unchanged = self.channel_generation.load(Ordering::SeqCst) == generation;
            for channel in loaded {
                if unchanged {
                    cache.put(channel.cid.clone(), channel.clone());
                }
                cached.insert(channel.cid.clone(), channel);
            }
        }
        Ok(cids.iter().filter_map(|cid| cached.remove(cid)).collect())
    }

    async fn select_channel_cids_by_sync_status(&self, status: SyncStatus) -> Result<Vec<String>> {
        self.inner.select_channel_cids_by_sync_status(status).await
    }

    async fn delete_channel(&self, cid: &str) -> Result<()> {
        let _guard = self.channel_writes.lock().await;
        self.inner.delete_channel(cid).await?;
        self.channel_generation.fetch_add(1, Ordering::SeqCst);
        self.channels.lock().await.remove(&cid.to_string());
        Ok(())
    }

    async fn insert_query_spec(&self, spec: &QuerySpec) -> Result<()> {
        self.inner.insert_query_spec(spec).await
    }

    async fn select_query_spec(&self, filter: &FilterObject, sort: &QuerySort) -> Result<Option<QuerySpec>> {
        self.inner.select_query_spec(filter, sort).await
    }

    async fn insert_sync_state(&self, state: &SyncState) -> Result<()> {
        self.inner.insert_sync_state(state).await
    }

    async fn select_sync_state(&self, user_id: &str) -> Result<Option<SyncState>> {
        self.inner.select_sync_state(user_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::SqliteRepository;
    use std::sync::atomic::AtomicBool;
    use std::sync::Arc;
    use tokio::sync::Notify;

    /// Sqlite store whose next single-row read stalls after it has read the
    /// row, until the test lets it go.
    struct StallingReads {
        db: SqliteRepository,
        armed: AtomicBool,
        read_done: Arc<Notify>,
        resume: Arc<Notify>,
    }

    impl StallingReads {
        fn new() -> Self {
            Self {
                db: SqliteRepository::open_in_memory().unwrap(),
                armed: AtomicBool::new(false),
                read_done: Arc::new(Notify::new()),
                resume: Arc::new(Notify::new()),
            }
        }

        async fn stall(&self) {
            if self.armed.swap(false, Ordering::SeqCst) {
                self.read_done.notify_one();
                self.resume.notified().await;
            }
        }
    }

    #[async_trait]
    impl Repository for StallingReads {
        async fn insert_message(&self, message: &Message) -> Result<()> {
            self.db.insert_message(message).await
        }
        async fn insert_messages(&self, messages: &[Message]) -> Result<()> {
            self.db.insert_messages(messages).await
        }
        async fn select_message(&self, id: &str) -> Result<Option<Message>> {
            let loaded = self.db.select_message(id).await;
            self.stall().await;
            loaded
        }
        async fn select_messages(&self, ids: &[String]) -> Result<Vec<Message>> {
            self.db.select_messages(ids).await
        }
        async fn select_messages_for_channel(&self, cid: &str, limit: u32) -> Result<Vec<Message>> {
            self.db.select_messages_for_channel(cid, limit).await
        }
        async fn select_message_ids_by_sync_status(&self, status: SyncStatus) -> Result<Vec<String>> {
            self.db.select_message_ids_by_sync_status(status).await
        }
        async fn delete_message(&self, id: &str) -> Result<()> {
            self.db.delete_message(id).await
        }
        async fn delete_channel_messages(&self, cid: &str) -> Result<()> {
            self.db.delete_channel_messages(cid).await
        }
        async fn insert_reaction(&self, reaction: &Reaction) -> Result<()> {
            self.db.insert_reaction(reaction).await
        }
        async fn select_reaction(&self, key: &ReactionKey) -> Result<Option<Reaction>> {
            self.db.select_reaction(key).await
        }
        async fn select_reactions_by_sync_status(&self, status: SyncStatus) -> Result<Vec<Reaction>> {
            self.db.select_reactions_by_sync_status(status).await
        }
        async fn select_user_reactions_to_message(
            &self,
            message_id: &str,
            user_id: &str,
        ) -> Result<Vec<Reaction>> {
            self.db.select_user_reactions_to_message(message_id, user_id).await
        }
        async fn delete_reaction(&self, key: &ReactionKey) -> Result<()> {
            self.db.delete_reaction(key).await
        }
        async fn insert_channel(&self, channel: &Channel) -> Result<()> {
            self.db.insert_channel(channel).await
        }
        async fn insert_channels(&self, channels: &[Channel]) -> Result<()> {
            self.db.insert_channels(channels).await
        }
        async fn select_channel(&self, cid: &str) -> Result<Option<Channel>> {
            let loaded = self.db.select_channel(cid).await;
            self.stall().await;
            loaded
        }
        async fn select_channels(&self, cids: &[String]) -> Result<Vec<Channel>> {
            self.db.select_channels(cids).await
        }
        async fn select_channel_cids_by_sync_status(&self, status: SyncStatus) -> Result<Vec<String>> {
            self.db.select_channel_cids_by_sync_status(status).await
        }
        async fn delete_channel(&self, cid: &str) -> Result<()> {
            self.db.delete_channel(cid).await
        }
        async fn insert_query_spec(&self, spec: &QuerySpec) -> Result<()> {
            self.db.insert_query_spec(spec).await
        }
        async fn select_query_spec(&self, filter: &FilterObject, sort: &QuerySort) -> Result<Option<QuerySpec>> {
            self.db.select_query_spec(filter, sort).await
        }
        async fn insert_sync_state(&self, state: &SyncState) -> Result<()> {
            self.db.insert_sync_state(state).await
        }
        async fn select_sync_state(&self, user_id: &str) -> Result<Option<SyncState>> {
            self.db.select_sync_state(user_id).await
        }
    }

    fn message(id: &str, cid: &str) -> Message {
        Message {
            id: id.into(),
            cid: cid.into(),
            user_id: "alice".into(),
            text: id.into(),
            ..Default::default()
        }
    }

    #[test]
    fn lru_evicts_least_recently_used() {
        let mut cache = LruCache::new(2);
        cache.put("a", 1);
        cache.put("b", 2);
        assert_eq!(cache.get(&"a"), Some(1));
        cache.put("c", 3);

        assert_eq!(cache.len(), 2);
        assert_eq!(cache.get(&"b"), None);
        assert_eq!(cache.get(&"a"), Some(1));
        assert_eq!(cache.get(&"c"), Some(3));
    }

    #[test]
    fn lru_overwrite_does_not_grow() {
        let mut cache = LruCache::new(2);
        cache.put("a", 1);
        cache.put("a", 2);
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get(&"a"), Some(2));
        cache.remove(&"a");
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn cached_reads_see_latest_write() {
        let repo = CachedRepository::new(SqliteRepository::open_in_memory().unwrap(), 10, 10);
        let mut msg = message("m1", "messaging:a");
        repo.insert_message(&msg).await.unwrap();
        msg.text = "edited".into();
        repo.insert_message(&msg).await.unwrap();

        let stored = repo.select_message("m1").await.unwrap().unwrap();
        assert_eq!(stored.text, "edited");
    }

    #[tokio::test]
    async fn bulk_delete_clears_message_cache() {
        let repo = CachedRepository::new(SqliteRepository::open_in_memory().unwrap(), 10, 10);
        repo.insert_messages(&[message("m1", "messaging:a"), message("m2", "messaging:a")])
            .await
            .unwrap();
        assert!(repo.select_message("m1").await.unwrap().is_some());

        repo.delete_channel_messages("messaging:a").await.unwrap();
        assert!(repo.select_message("m1").await.unwrap().is_none());
        assert!(repo.select_messages(&["m2".into()]).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn select_channels_preserves_order_across_hits_and_misses() {
        let repo = CachedRepository::new(SqliteRepository::open_in_memory().unwrap(), 10, 10);
        repo.inner()
            .insert_channels(&[Channel::new("messaging", "a"), Channel::new("messaging", "b")])
            .await
            .unwrap();
        // Warm only "b".
        repo.select_channel("messaging:b").await.unwrap();

        let channels = repo
            .select_channels(&["messaging:b".into(), "messaging:a".into()])
            .await
            .unwrap();
        let ids: Vec<_> = channels.iter().map(|c| c.id.as_str()).collect();
        assert_eq!(ids, vec!["b", "a"]);
    }

    #[tokio::test]
    async fn miss_racing_a_write_does_not_cache_the_old_row() {
        let stalling = StallingReads::new();
        let (read_done, resume) = (stalling.read_done.clone(), stalling.resume.clone());
        let mut old = message("m1", "messaging:a");
        old.text = "old".into();
        stalling.insert_message(&old).await.unwrap();
        stalling.armed.store(true, Ordering::SeqCst);
        let repo = Arc::new(CachedRepository::new(stalling, 10, 10));

        let reader = tokio::spawn({
            let repo = repo.clone();
            async move { repo.select_message("m1").await.unwrap() }
        });
        read_done.notified().await;

        let mut new = old.clone();
        new.text = "new".into();
        repo.insert_message(&new).await.unwrap();
        resume.notify_one();
        assert_eq!(reader.await.unwrap().unwrap().text, "old");

        let cached = repo.select_message("m1").await.unwrap().unwrap();
        assert_eq!(cached.text, "new");
    }

    #[tokio::test]
    async fn channel_miss_racing_a_write_does_not_cache_the_old_row() {
        let stalling = StallingReads::new();
        let (read_done, resume) = (stalling.read_done.clone(), stalling.resume.clone());
        let mut old = Channel::new("messaging", "a");
        old.member_count = 1;
        stalling.insert_channel(&old).await.unwrap();
        stalling.armed.store(true, Ordering::SeqCst);
        let repo = Arc::new(CachedRepository::new(stalling, 10, 10));

        let reader = tokio::spawn({
            let repo = repo.clone();
            async move { repo.select_channel("messaging:a").await.unwrap() }
        });
        read_done.notified().await;

        let mut new = old.clone();
        new.member_count = 2;
        repo.insert_channel(&new).await.unwrap();
        resume.notify_one();
        assert_eq!(reader.await.unwrap().unwrap().member_count, 1);

        let cached = repo.select_channel("messaging:a").await.unwrap().unwrap();
        assert_eq!(cached.member_count, 2);
    }
}
