//! The per-user session: builds the context once and exposes every
//! operation of the engine.

use std::sync::Arc;

use relais_shared::{
    Channel, ChatError, ChatEvent, ChatResult, Cid, FilterObject, Message, QuerySort, Reaction,
    User,
};
use relais_store::{CachedRepository, Database, Repository, SqliteRepository};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::api::ChatApi;
use crate::channel::{ChannelCreationService, ChannelLogic};
use crate::config::ClientConfig;
use crate::context::ChatContext;
use crate::error::Result;
use crate::events::{EventHandler, EventSender, EventSequencer};
use crate::query_channels::{Pagination, QueryChannelsLogic, QueryContext};
use crate::reactions::ReactionSyncService;
use crate::retry::DefaultRetryPolicy;
use crate::sending::MessageSendingService;
use crate::state::{ClientState, GlobalState, LogicRegistry};
use crate::sync::SyncManager;
use crate::upload::{AttachmentUploader, UploadJobs};

pub struct ChatSession {
    ctx: Arc<ChatContext>,
    messages: Arc<MessageSendingService>,
    reactions: Arc<ReactionSyncService>,
    channels: Arc<ChannelCreationService>,
    sync: Arc<SyncManager>,
    sequencer: EventSequencer,
}

impl ChatSession {
    /// Open a session for `user` over an existing repository.
    ///
    /// The session starts offline; feed it a `Connected` event once the
    /// transport is up.
    pub async fn open(
        user: User,
        config: ClientConfig,
        repository: Arc<dyn Repository>,
        api: Arc<dyn ChatApi>,
        uploader: Arc<dyn AttachmentUploader>,
    ) -> Result<Self> {
        let client_state = Arc::new(ClientState::new());
        client_state.set_user(user.clone());

        let ctx = Arc::new(ChatContext {
            retry_policy: Arc::new(DefaultRetryPolicy::from_config(&config)),
            uploads: UploadJobs::new(uploader, Arc::clone(&repository)),
            config,
            repository,
            api,
            client_state,
            global_state: Arc::new(GlobalState::new()),
            registry: Arc::new(LogicRegistry::new()),
            shutdown: CancellationToken::new(),
        });

        let messages = MessageSendingService::new(Arc::clone(&ctx))?;
        let reactions = Arc::new(ReactionSyncService::new(Arc::clone(&ctx)));
        let channels = Arc::new(ChannelCreationService::new(Arc::clone(&ctx)));
        let sync = SyncManager::new(
            Arc::clone(&ctx),
            Arc::clone(&messages),
            Arc::clone(&reactions),
            Arc::clone(&channels),
        );
        let state = sync.load_sync_state(&user.id).await?;

        let handler = Arc::new(EventHandler::new(Arc::clone(&ctx), Arc::clone(&sync)));
        let sequencer = EventSequencer::spawn(
            handler,
            ctx.config.event_buffer,
            ctx.shutdown.child_token(),
        );
        sync.attach_events(sequencer.sender()).await;

        info!(
            user_id = %user.id,
            last_synced_at = ?state.last_synced_at,
            "Chat session opened"
        );
        Ok(Self {
            ctx,
            messages,
            reactions,
            channels,
            sync,
            sequencer,
        })
    }

    /// Open a session backed by the user's on-disk database.
    pub async fn open_with_store(
        user: User,
        config: ClientConfig,
        api: Arc<dyn ChatApi>,
        uploader: Arc<dyn AttachmentUploader>,
    ) -> Result<Self> {
        let db = Database::new(&user.id)?;
        let repository: Arc<dyn Repository> = Arc::new(CachedRepository::new(
            SqliteRepository::new(db),
            config.message_cache_capacity,
            config.channel_cache_capacity,
        ));
        Self::open(user, config, repository, api, uploader).await
    }

    // -----------------------------------------------------------------------
    // State
    // -----------------------------------------------------------------------

    pub fn context(&self) -> &Arc<ChatContext> {
        &self.ctx
    }

    pub fn client_state(&self) -> &ClientState {
        &self.ctx.client_state
    }

    pub fn global_state(&self) -> &GlobalState {
        &self.ctx.global_state
    }

    pub fn sync_manager(&self) -> &Arc<SyncManager> {
        &self.sync
    }

    // -----------------------------------------------------------------------
    // Events
    // -----------------------------------------------------------------------

    pub async fn handle_event(&self, event: ChatEvent) -> Result<()> {
        self.sequencer.push(event).await
    }

    /// Handle for transports that deliver events from their own task.
    pub fn events_sender(&self) -> EventSender {
        self.sequencer.sender()
    }

    /// Wait until every event pushed so far has been handled.
    pub async fn flush_events(&self) -> Result<()> {
        self.sequencer.flush().await
    }

    /// Wait for recovery passes triggered so far.
    pub async fn wait_for_sync(&self) {
        self.sync.wait_idle().await;
    }

    // -----------------------------------------------------------------------
    // Channels
    // -----------------------------------------------------------------------

    /// Start watching a channel: serve the stored copy at once, then
    /// refresh it from the server when online.
    pub async fn watch_channel(&self, cid: &Cid) -> ChatResult<Arc<ChannelLogic>> {
        let user_id = self.require_user()?;
        let (logic, created) = self.ctx.registry.channel(cid, &user_id).await;

        if created {
            let stored = self
                .ctx
                .repository
                .select_channels_with_messages(&[cid.to_string()], self.ctx.config.channel_limit)
                .await?;
            if let Some(channel) = stored.into_iter().next() {
                logic.update_data_from_channel(channel).await;
            }
        }

        if !self.ctx.is_online() {
            logic.set_recovery_needed(true).await;
            return Ok(logic);
        }

        let api = Arc::clone(&self.ctx.api);
        let limit = self.ctx.config.channel_limit;
        let result = self
            .ctx
            .with_retry(|| {
                let api = Arc::clone(&api);
                let cid = cid.clone();
                async move { api.watch_channel(&cid, limit).await }
            })
            .await;
        match result {
            Ok(channel) => {
                self.ctx
                    .repository
                    .store_channels_with_messages(std::slice::from_ref(&channel))
                    .await?;
                logic.update_data_from_channel(channel).await;
                logic.set_recovery_needed(false).await;
                debug!(cid = %cid, "Channel watched");
            }
            Err(e) if e.is_permanent() => {
                warn!(cid = %cid, error = %e, "Watch rejected");
                return Err(e);
            }
            Err(e) => {
                warn!(cid = %cid, error = %e, "Watch failed, flagged for recovery");
                logic.set_recovery_needed(true).await;
            }
        }
        Ok(logic)
    }

    pub async fn stop_watching(&self, cid: &Cid) -> bool {
        self.ctx.registry.remove_channel(cid).await
    }

    pub async fn create_channel(&self, channel: Channel) -> ChatResult<Channel> {
        self.channels.create(channel).await
    }

    /// Run the first page of a channel list query, registering it so events
    /// and recovery keep it current.
    pub async fn query_channels(
        &self,
        filter: FilterObject,
        sort: QuerySort,
    ) -> ChatResult<Arc<QueryChannelsLogic>> {
        let key = relais_shared::models::query_key(&filter, &sort);
        let query = match self.ctx.registry.query(&key).await {
            Some(query) => query,
            None => {
                let logic = QueryChannelsLogic::new(
                    filter,
                    sort,
                    QueryContext {
                        repository: Arc::clone(&self.ctx.repository),
                        api: Arc::clone(&self.ctx.api),
                        client_state: Arc::clone(&self.ctx.client_state),
                        registry: Arc::downgrade(&self.ctx.registry),
                        message_limit: self.ctx.config.channel_limit,
                        user_presence: self.ctx.config.user_presence,
                    },
                );
                self.ctx.registry.insert_query(logic).await
            }
        };
        query
            .query(Pagination::first_page(self.ctx.config.channel_limit))
            .await?;
        Ok(query)
    }

    /// Load the page after the channels already in `query`.
    pub async fn load_more_channels(&self, query: &QueryChannelsLogic) -> ChatResult<Vec<Channel>> {
        if query.end_of_channels().await {
            return Ok(Vec::new());
        }
        let offset = query.channels().len() as u32;
        query
            .query(Pagination {
                offset,
                limit: self.ctx.config.channel_limit,
            })
            .await
    }

    // -----------------------------------------------------------------------
    // Messages and reactions
    // -----------------------------------------------------------------------

    pub async fn send_message(&self, cid: &Cid, message: Message) -> ChatResult<Message> {
        self.messages.send(cid, message).await
    }

    pub async fn update_message(&self, message: Message) -> ChatResult<Message> {
        self.messages.update(message).await
    }

    pub async fn delete_message(&self, message_id: &str, hard: bool) -> ChatResult<Message> {
        self.messages.delete(message_id, hard).await
    }

    pub async fn send_reaction(&self, reaction: Reaction, enforce_unique: bool) -> ChatResult<Reaction> {
        self.reactions.add(reaction, enforce_unique).await
    }

    pub async fn delete_reaction(&self, reaction: Reaction) -> ChatResult<Reaction> {
        self.reactions.remove(reaction).await
    }

    // -----------------------------------------------------------------------
    // Shutdown
    // -----------------------------------------------------------------------

    /// Save the active channels, stop background work and close every
    /// live channel.
    pub async fn shutdown(self) -> Result<()> {
        self.sync.on_disconnected().await?;
        self.ctx.shutdown.cancel();
        self.sequencer.abort();
        self.ctx.registry.clear().await;
        info!("Chat session closed");
        Ok(())
    }

    fn require_user(&self) -> ChatResult<String> {
        self.ctx
            .current_user_id()
            .ok_or_else(|| ChatError::Validation("no connected user".into()))
    }
}
