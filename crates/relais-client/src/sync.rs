//! Recovery after (re)connecting.
//!
//! A pass retries pending local mutations (channels, then messages, then
//! reactions), replays the events missed since the last sync, then
//! refreshes channel list queries, then re-fetches the remaining active
//! channels in one batch. Each pass is bounded; whatever does not fit stays
//! flagged for the next one.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use relais_shared::{ChatResult, Cid, FilterObject, QuerySort, Reaction, SyncState, SyncStatus};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::api::QueryChannelsRequest;
use crate::channel::{ChannelCreationService, ChannelLogic};
use crate::context::ChatContext;
use crate::events::EventSender;
use crate::reactions::ReactionSyncService;
use crate::sending::MessageSendingService;

/// How much a recovery pass re-synchronizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryScope {
    /// Only what is flagged as needing recovery.
    Flagged,
    /// Every active query and channel.
    All,
}

pub struct SyncManager {
    ctx: Arc<ChatContext>,
    messages: Arc<MessageSendingService>,
    reactions: Arc<ReactionSyncService>,
    channels: Arc<ChannelCreationService>,
    sync_state: Mutex<Option<SyncState>>,
    first_connect: AtomicBool,
    /// Serializes passes.
    recovery_lock: Mutex<()>,
    running: Mutex<Vec<JoinHandle<()>>>,
    /// Where replayed history goes. Unset until the session wires it.
    events: Mutex<Option<EventSender>>,
}

impl SyncManager {
    pub fn new(
        ctx: Arc<ChatContext>,
        messages: Arc<MessageSendingService>,
        reactions: Arc<ReactionSyncService>,
        channels: Arc<ChannelCreationService>,
    ) -> Arc<Self> {
        Arc::new(Self {
            ctx,
            messages,
            reactions,
            channels,
            sync_state: Mutex::new(None),
            first_connect: AtomicBool::new(true),
            recovery_lock: Mutex::new(()),
            running: Mutex::new(Vec::new()),
            events: Mutex::new(None),
        })
    }

    /// Route replayed history through the event sequencer.
    pub async fn attach_events(&self, sender: EventSender) {
        *self.events.lock().await = Some(sender);
    }

    // -----------------------------------------------------------------------
    // Sync state
    // -----------------------------------------------------------------------

    /// Load the user's cursor, creating it on first login.
    pub async fn load_sync_state(&self, user_id: &str) -> ChatResult<SyncState> {
        let state = match self.ctx.repository.select_sync_state(user_id).await? {
            Some(state) => state,
            None => {
                let state = SyncState::new(user_id);
                self.ctx.repository.insert_sync_state(&state).await?;
                info!(user_id, "Sync state created");
                state
            }
        };
        *self.sync_state.lock().await = Some(state.clone());
        Ok(state)
    }

    pub async fn sync_state(&self) -> Option<SyncState> {
        self.sync_state.lock().await.clone()
    }

    async fn update_sync_state(&self, f: impl FnOnce(&mut SyncState)) -> ChatResult<()> {
        let mut guard = self.sync_state.lock().await;
        let Some(state) = guard.as_mut() else {
            return Ok(());
        };
        f(state);
        self.ctx.repository.insert_sync_state(state).await?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Triggers
    // -----------------------------------------------------------------------

    /// The first connect only retries what is known to be dirty; later
    /// reconnects refresh every active subscription.
    pub async fn on_connected(self: &Arc<Self>) {
        let scope = if self.first_connect.swap(false, Ordering::SeqCst) {
            RecoveryScope::Flagged
        } else {
            RecoveryScope::All
        };
        self.spawn_recovery(scope).await;
    }

    pub async fn on_health_check(self: &Arc<Self>) {
        self.spawn_recovery(RecoveryScope::Flagged).await;
    }

    /// Remember which channels were active so the next session can resume.
    pub async fn on_disconnected(&self) -> ChatResult<()> {
        let active = self.ctx.registry.active_cids().await;
        debug!(channels = active.len(), "Saving active channels");
        self.update_sync_state(|state| state.active_channel_ids = active)
            .await
    }

    /// Record a mark-all-read. Older timestamps are ignored.
    pub async fn mark_all_read(&self, at: DateTime<Utc>) -> ChatResult<bool> {
        let mut moved = false;
        self.update_sync_state(|state| {
            if state.marked_all_read_at.map_or(true, |previous| at > previous) {
                state.marked_all_read_at = Some(at);
                moved = true;
            }
        })
        .await?;
        Ok(moved)
    }

    async fn spawn_recovery(self: &Arc<Self>, scope: RecoveryScope) {
        let manager = Arc::clone(self);
        let handle = tokio::spawn(async move {
            if let Err(e) = manager.recover(scope).await {
                error!(error = %e, "Recovery failed");
            }
        });
        let mut running = self.running.lock().await;
        running.retain(|h| !h.is_finished());
        running.push(handle);
    }

    /// Wait for the recovery passes started so far.
    pub async fn wait_idle(&self) {
        let handles: Vec<JoinHandle<()>> = self.running.lock().await.drain(..).collect();
        for handle in handles {
            if let Err(e) = handle.await {
                warn!(error = %e, "Recovery task panicked");
            }
        }
    }

    // -----------------------------------------------------------------------
    // Recovery
    // -----------------------------------------------------------------------

    pub async fn recover(&self, scope: RecoveryScope) -> ChatResult<()> {
        let _pass = self.recovery_lock.lock().await;
        if !self.ctx.is_online() {
            debug!("Offline, recovery skipped");
            return Ok(());
        }
        info!(?scope, "Recovery started");

        self.retry_failed_entities().await?;
        let caught_up = self.replay_missed_events().await;
        self.restore_active_queries_and_channels(scope).await?;

        let active = self.ctx.registry.active_cids().await;
        self.update_sync_state(|state| {
            // A failed replay keeps the cursor so the next pass asks again.
            if caught_up {
                state.last_synced_at = Some(Utc::now());
            }
            state.active_channel_ids = active;
        })
        .await?;
        info!(?scope, "Recovery finished");
        Ok(())
    }

    /// Fetch what happened in the active channels since the cursor and feed
    /// it through the event handler, oldest first. Falls back to the
    /// channels saved at disconnect when none is active yet.
    ///
    /// Returns false when the history could not be applied.
    pub async fn replay_missed_events(&self) -> bool {
        let Some(state) = self.sync_state().await else {
            return true;
        };
        let Some(since) = state.last_synced_at else {
            return true;
        };
        let mut cids = self.ctx.registry.active_cids().await;
        if cids.is_empty() {
            cids = state.active_channel_ids;
        }
        if cids.is_empty() {
            debug!("No channels to sync");
            return true;
        }
        let Some(sender) = self.events.lock().await.clone() else {
            debug!("No event sink, history not replayed");
            return true;
        };

        let mut events = match self.ctx.api.sync_history(&cids, since).await {
            Ok(events) => events,
            Err(e) => {
                warn!(channels = cids.len(), error = %e, "Sync history request failed");
                return false;
            }
        };
        events.sort_by_key(|e| e.created_at);
        info!(channels = cids.len(), events = events.len(), %since, "Replaying missed events");

        for event in events {
            if let Err(e) = sender.send(event).await {
                warn!(error = %e, "History replay interrupted");
                return false;
            }
        }
        match sender.flush().await {
            Ok(()) => true,
            Err(e) => {
                warn!(error = %e, "History replay interrupted");
                false
            }
        }
    }

    /// Retry every pending local mutation once, oldest kind first.
    pub async fn retry_failed_entities(&self) -> ChatResult<()> {
        self.retry_channels().await?;
        self.retry_messages().await?;
        self.retry_reactions().await?;
        Ok(())
    }

    fn is_expired(&self, local_time: Option<DateTime<Utc>>) -> bool {
        let Some(at) = local_time else {
            return true;
        };
        let age = Utc::now().signed_duration_since(at);
        age.to_std()
            .map(|age| age > self.ctx.config.sync_max_threshold)
            .unwrap_or(false)
    }

    async fn retry_channels(&self) -> ChatResult<()> {
        let cids = self
            .ctx
            .repository
            .select_channel_cids_by_sync_status(SyncStatus::SyncNeeded)
            .await?;
        if cids.is_empty() {
            return Ok(());
        }
        let channels = self.ctx.repository.select_channels(&cids).await?;
        debug!(count = channels.len(), "Retrying channels");

        for channel in channels {
            if self.is_expired(channel.created_at) {
                warn!(cid = %channel.cid, "Pending channel expired, dropping");
                self.ctx.repository.delete_channel(&channel.cid).await?;
                if let Ok(cid) = Cid::parse(&channel.cid) {
                    self.ctx.registry.remove_channel(&cid).await;
                }
                continue;
            }
            let cid = channel.cid.clone();
            if let Err(e) = self.channels.retry_channel(channel).await {
                warn!(cid = %cid, error = %e, "Channel retry failed");
            }
        }
        Ok(())
    }

    async fn retry_messages(&self) -> ChatResult<()> {
        let mut ids = self
            .ctx
            .repository
            .select_message_ids_by_sync_status(SyncStatus::SyncNeeded)
            .await?;
        ids.extend(
            self.ctx
                .repository
                .select_message_ids_by_sync_status(SyncStatus::AwaitingAttachments)
                .await?,
        );
        if ids.is_empty() {
            return Ok(());
        }
        let messages = self.ctx.repository.select_messages(&ids).await?;
        debug!(count = messages.len(), "Retrying messages");

        for message in messages {
            if self.is_expired(message.last_local_update_time()) {
                warn!(message_id = %message.id, "Pending message expired, dropping");
                self.messages.remove_locally(&message).await?;
                continue;
            }
            let id = message.id.clone();
            match self.messages.retry_message(message).await {
                Ok(m) => debug!(message_id = %id, status = %m.sync_status, "Message retried"),
                Err(e) => warn!(message_id = %id, error = %e, "Message retry failed"),
            }
        }
        Ok(())
    }

    async fn retry_reactions(&self) -> ChatResult<()> {
        let reactions = self
            .ctx
            .repository
            .select_reactions_by_sync_status(SyncStatus::SyncNeeded)
            .await?;
        if reactions.is_empty() {
            return Ok(());
        }
        debug!(count = reactions.len(), "Retrying reactions");

        for reaction in reactions {
            let local_time = reaction.deleted_at.max(reaction.created_locally_at);
            if self.is_expired(local_time) {
                warn!(message_id = %reaction.message_id, kind = %reaction.reaction_type, "Pending reaction expired, dropping");
                self.drop_reaction(&reaction).await?;
                continue;
            }
            let message_id = reaction.message_id.clone();
            if let Err(e) = self.reactions.retry_reaction(reaction).await {
                warn!(message_id = %message_id, error = %e, "Reaction retry failed");
            }
        }
        Ok(())
    }

    async fn drop_reaction(&self, reaction: &Reaction) -> ChatResult<()> {
        self.ctx.repository.delete_reaction(&reaction.key()).await?;
        let Some(mut message) = self.ctx.repository.select_message(&reaction.message_id).await? else {
            return Ok(());
        };
        if reaction.deleted_at.is_some() {
            // The removal never reached the server, nothing to undo locally.
            return Ok(());
        }
        message.remove_reaction(reaction);
        self.ctx.repository.insert_message(&message).await?;
        if let Some(logic) = self.ctx.registry.active_channel_str(&message.cid).await {
            logic.upsert_message(message).await;
        }
        Ok(())
    }

    /// Refresh queries, then the active channels they did not cover.
    pub async fn restore_active_queries_and_channels(&self, scope: RecoveryScope) -> ChatResult<()> {
        let refreshed = self.recover_queries(scope).await;
        self.recover_channels(scope, &refreshed).await
    }

    async fn recover_queries(&self, scope: RecoveryScope) -> HashSet<String> {
        let mut refreshed = HashSet::new();
        let candidates: Vec<_> = self
            .ctx
            .registry
            .queries()
            .await
            .into_iter()
            .filter(|q| scope == RecoveryScope::All || q.recovery_needed())
            .collect();
        let limit = self.ctx.config.queries_to_recover;

        for (index, query) in candidates.into_iter().enumerate() {
            if index >= limit {
                query.set_recovery_needed(true);
                continue;
            }
            match query.refresh_first_page(self.ctx.config.channel_limit).await {
                Ok(channels) => {
                    refreshed.extend(channels.into_iter().map(|c| c.cid));
                }
                Err(e) => warn!(query = %query.key(), error = %e, "Query recovery failed"),
            }
        }
        refreshed
    }

    async fn recover_channels(&self, scope: RecoveryScope, refreshed: &HashSet<String>) -> ChatResult<()> {
        let mut candidates: Vec<Arc<ChannelLogic>> = Vec::new();
        for logic in self.ctx.registry.active_channels().await {
            let cid = logic.cid().to_string();
            if refreshed.contains(&cid) {
                logic.set_recovery_needed(false).await;
                continue;
            }
            if scope == RecoveryScope::All || logic.recovery_needed().await {
                candidates.push(logic);
            }
        }
        candidates.sort_by_key(|l| l.cid().to_string());

        let limit = self.ctx.config.channels_to_recover;
        if candidates.len() > limit {
            for deferred in &candidates[limit..] {
                deferred.set_recovery_needed(true).await;
            }
            candidates.truncate(limit);
        }
        if candidates.is_empty() {
            return Ok(());
        }

        let cids: Vec<String> = candidates.iter().map(|l| l.cid().to_string()).collect();
        info!(channels = cids.len(), "Recovering channels");
        let request = QueryChannelsRequest::new(
            FilterObject::in_values("cid", cids.iter().cloned()),
            QuerySort::default(),
            cids.len() as u32,
        )
        .with_presence(self.ctx.config.user_presence);

        let channels = match self.ctx.api.query_channels(&request).await {
            Ok(channels) => channels,
            Err(e) => {
                error!(error = %e, "Channel recovery request failed");
                for logic in &candidates {
                    logic.set_recovery_needed(true).await;
                }
                return Ok(());
            }
        };

        self.ctx
            .repository
            .store_channels_with_messages(&channels)
            .await?;
        let returned: HashSet<&str> = channels.iter().map(|c| c.cid.as_str()).collect();
        self.ctx.registry.apply_channel_snapshots(&channels).await;

        for logic in candidates {
            if returned.contains(logic.cid().to_string().as_str()) {
                logic.set_recovery_needed(false).await;
                continue;
            }
            self.rewatch(&logic).await?;
        }
        Ok(())
    }

    /// A channel missing from the batch needs a fresh watch.
    async fn rewatch(&self, logic: &ChannelLogic) -> ChatResult<()> {
        let cid = logic.cid();
        debug!(cid = %cid, "Channel missing from recovery batch, watching again");
        match self
            .ctx
            .api
            .watch_channel(cid, self.ctx.config.channel_limit)
            .await
        {
            Ok(channel) => {
                self.ctx
                    .repository
                    .store_channels_with_messages(std::slice::from_ref(&channel))
                    .await?;
                logic.update_data_from_channel(channel).await;
                logic.set_recovery_needed(false).await;
            }
            Err(e) => {
                warn!(cid = %cid, error = %e, "Watch during recovery failed");
                logic.set_recovery_needed(!e.is_permanent()).await;
            }
        }
        Ok(())
    }
}
