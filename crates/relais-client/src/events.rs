//! Ordered processing of realtime events.
//!
//! The [`EventSequencer`] owns the only consumer of the event queue, so
//! events are applied strictly one after another, in receipt order. The
//! [`EventHandler`] does the work for one event: global bookkeeping,
//! persistence, routing to live channels and queries, and sync triggers.

use std::sync::Arc;

use relais_shared::{Channel, ChatEvent, ChatResult, EventPayload, Message, SyncStatus};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::channel::ChannelLogic;
use crate::context::ChatContext;
use crate::error::{Result, SyncError};
use crate::query_channels::EventHandlingResult;
use crate::sync::SyncManager;

enum Item {
    Event(ChatEvent),
    /// Completes once every event queued before it has been handled.
    Flush(oneshot::Sender<()>),
}

/// Cloneable handle for feeding events into the sequencer.
#[derive(Clone)]
pub struct EventSender {
    tx: mpsc::Sender<Item>,
}

impl EventSender {
    pub async fn send(&self, event: ChatEvent) -> Result<()> {
        self.tx
            .send(Item::Event(event))
            .await
            .map_err(|_| SyncError::SequencerClosed)
    }

    /// Wait until everything sent so far has been handled.
    pub async fn flush(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(Item::Flush(tx))
            .await
            .map_err(|_| SyncError::SequencerClosed)?;
        rx.await.map_err(|_| SyncError::SequencerClosed)
    }
}

pub struct EventSequencer {
    sender: EventSender,
    task: JoinHandle<()>,
}

impl EventSequencer {
    pub fn spawn(handler: Arc<EventHandler>, buffer: usize, shutdown: CancellationToken) -> Self {
        let (tx, mut rx) = mpsc::channel::<Item>(buffer.max(1));
        let task = tokio::spawn(async move {
            loop {
                let item = tokio::select! {
                    _ = shutdown.cancelled() => break,
                    item = rx.recv() => match item {
                        Some(item) => item,
                        None => break,
                    },
                };
                match item {
                    Item::Event(event) => {
                        if let Err(e) = handler.handle(&event).await {
                            error!(kind = event.kind(), error = %e, "Event handling failed");
                        }
                    }
                    Item::Flush(done) => {
                        let _ = done.send(());
                    }
                }
            }
            debug!("Event sequencer stopped");
        });
        Self {
            sender: EventSender { tx },
            task,
        }
    }

    pub fn sender(&self) -> EventSender {
        self.sender.clone()
    }

    pub async fn push(&self, event: ChatEvent) -> Result<()> {
        self.sender.send(event).await
    }

    /// Wait until everything pushed so far has been handled.
    pub async fn flush(&self) -> Result<()> {
        self.sender.flush().await
    }

    pub fn abort(&self) {
        self.task.abort();
    }
}

pub struct EventHandler {
    ctx: Arc<ChatContext>,
    sync: Arc<SyncManager>,
}

impl EventHandler {
    pub fn new(ctx: Arc<ChatContext>, sync: Arc<SyncManager>) -> Self {
        Self { ctx, sync }
    }

    pub async fn handle(&self, event: &ChatEvent) -> ChatResult<()> {
        trace!(kind = event.kind(), cid = ?event.cid, "Handling event");

        self.handle_connection(event).await?;
        self.update_global_state(event);
        self.persist(event).await?;
        let logic = self.route(event).await;
        self.update_queries(event, logic.as_deref()).await?;

        if let EventPayload::MarkAllRead { user, .. } = &event.payload {
            if Some(&user.id) == self.ctx.current_user_id().as_ref() {
                self.sync.mark_all_read(event.created_at).await?;
            }
        }
        Ok(())
    }

    async fn handle_connection(&self, event: &ChatEvent) -> ChatResult<()> {
        match &event.payload {
            EventPayload::Connecting => {
                self.ctx.client_state.set_connecting();
            }
            EventPayload::Connected {
                user,
                connection_id,
            } => {
                self.ctx.client_state.set_user(user.clone());
                self.ctx.client_state.set_connected(connection_id.clone());
                info!(user_id = %user.id, connection_id = %connection_id, "Connection established");
                self.sync.on_connected().await;
            }
            EventPayload::Disconnected => {
                self.ctx.client_state.set_offline();
                info!("Connection lost");
                self.sync.on_disconnected().await?;
            }
            EventPayload::HealthCheck { connection_id } => {
                trace!(connection_id = %connection_id, "Health check");
                if self.ctx.client_state.connection_id().as_ref() != Some(connection_id) {
                    self.ctx.client_state.set_connected(connection_id.clone());
                }
                self.sync.on_health_check().await;
            }
            _ => {}
        }
        Ok(())
    }

    /// Totals and current-user state. Applied before routing, as part of
    /// the same event.
    fn update_global_state(&self, event: &ChatEvent) {
        if let Some(counts) = event.unread_counts() {
            self.ctx
                .global_state
                .set_unread_counts(counts.total_unread_count, counts.unread_channels);
        }

        let current = self.ctx.current_user_id();
        match &event.payload {
            EventPayload::GlobalUserBanned { user } if Some(&user.id) == current.as_ref() => {
                warn!(user_id = %user.id, "Current user banned");
                self.ctx.global_state.banned.set_if_changed(true);
            }
            EventPayload::GlobalUserUnbanned { user } if Some(&user.id) == current.as_ref() => {
                self.ctx.global_state.banned.set_if_changed(false);
            }
            EventPayload::UserUpdated { user } if Some(&user.id) == current.as_ref() => {
                self.ctx.client_state.set_user(user.clone());
            }
            _ => {}
        }
    }

    /// Write the event's entities to the store, for every channel, watched
    /// or not.
    async fn persist(&self, event: &ChatEvent) -> ChatResult<()> {
        let repository = &self.ctx.repository;
        match &event.payload {
            EventPayload::NewMessage { message, .. } | EventPayload::MessageUpdated { message } => {
                self.persist_message(message).await?;
                self.touch_channel(&message.cid, |c| bump_last_message(c, message))
                    .await?;
            }
            EventPayload::NotificationMessageNew {
                channel, message, ..
            } => {
                repository
                    .store_channels_with_messages(std::slice::from_ref(channel))
                    .await?;
                self.persist_message(message).await?;
            }
            EventPayload::MessageDeleted {
                message,
                hard_delete,
            } => {
                if *hard_delete {
                    repository.delete_message(&message.id).await?;
                } else {
                    self.persist_message(message).await?;
                }
            }
            EventPayload::ReactionNew { message, reaction }
            | EventPayload::ReactionUpdated { message, reaction } => {
                self.persist_message(message).await?;
                let mut confirmed = reaction.clone();
                confirmed.sync_status = SyncStatus::Completed;
                repository.insert_reaction(&confirmed).await?;
            }
            EventPayload::ReactionDeleted { message, reaction } => {
                self.persist_message(message).await?;
                repository.delete_reaction(&reaction.key()).await?;
            }
            EventPayload::MemberAdded { member } | EventPayload::MemberUpdated { member } => {
                if let Some(cid) = &event.cid {
                    let member = member.clone();
                    self.touch_channel(cid, |c| c.upsert_member(member)).await?;
                }
            }
            EventPayload::MemberRemoved { user_id } => {
                if let Some(cid) = &event.cid {
                    self.touch_channel(cid, |c| {
                        c.members.remove(user_id);
                        c.reads.remove(user_id);
                    })
                    .await?;
                }
            }
            EventPayload::NotificationAddedToChannel { channel, .. }
            | EventPayload::ChannelUpdated { channel }
            | EventPayload::ChannelVisible { channel } => {
                repository
                    .store_channels_with_messages(std::slice::from_ref(channel))
                    .await?;
            }
            EventPayload::NotificationRemovedFromChannel { channel, member } => {
                let user_id = member.user_id().to_string();
                let mut stored = channel.clone();
                stored.members.remove(&user_id);
                repository.insert_channel(&stored).await?;
            }
            EventPayload::ChannelDeleted { channel } => {
                let mut deleted = channel.clone();
                deleted.deleted_at.get_or_insert(event.created_at);
                repository.insert_channel(&deleted).await?;
            }
            EventPayload::ChannelHidden { clear_history } => {
                if let Some(cid) = &event.cid {
                    if *clear_history {
                        repository.delete_channel_messages(cid).await?;
                    }
                    self.touch_channel(cid, |c| c.hidden = true).await?;
                }
            }
            EventPayload::ChannelTruncated { channel, message } => {
                repository.delete_channel_messages(&channel.cid).await?;
                if let Some(message) = message {
                    self.persist_message(message).await?;
                }
            }
            _ => {}
        }
        Ok(())
    }

    /// Server copies never carry the current user's own reactions; keep
    /// the stored ones.
    async fn persist_message(&self, message: &Message) -> ChatResult<()> {
        let mut incoming = message.clone();
        incoming.sync_status = SyncStatus::Completed;
        if let Some(stored) = self.ctx.repository.select_message(&message.id).await? {
            if incoming.own_reactions.is_empty() {
                incoming.own_reactions = stored.own_reactions;
            }
            incoming.created_locally_at = incoming.created_locally_at.or(stored.created_locally_at);
        }
        self.ctx.repository.insert_message(&incoming).await?;
        Ok(())
    }

    async fn touch_channel(&self, cid: &str, f: impl FnOnce(&mut Channel)) -> ChatResult<()> {
        let Some(mut channel) = self.ctx.repository.select_channel(cid).await? else {
            return Ok(());
        };
        f(&mut channel);
        self.ctx.repository.insert_channel(&channel).await?;
        Ok(())
    }

    /// Hand the event to live channels. Channel-scoped events reach only
    /// their channel; the others fan out to every live channel.
    async fn route(&self, event: &ChatEvent) -> Option<Arc<ChannelLogic>> {
        match event.cid.as_deref() {
            Some(cid) => {
                let logic = self.ctx.registry.active_channel_str(cid).await;
                match &logic {
                    Some(logic) => logic.handle_event(event).await,
                    None => debug!(cid, kind = event.kind(), "Channel not watched, stored only"),
                }
                logic
            }
            None if is_fan_out(&event.payload) => {
                for logic in self.ctx.registry.active_channels().await {
                    logic.handle_event(event).await;
                }
                None
            }
            None => None,
        }
    }

    async fn update_queries(&self, event: &ChatEvent, logic: Option<&ChannelLogic>) -> ChatResult<()> {
        let queries = self.ctx.registry.queries().await;
        if queries.is_empty() {
            return Ok(());
        }
        let Some(cid) = event.cid.as_deref() else {
            // User-wide events only touch the listed channels' members.
            for query in queries {
                query.handle_event(event, None).await;
            }
            return Ok(());
        };

        let snapshot = match (logic, event_channel(&event.payload)) {
            (Some(logic), _) => Some(logic.snapshot()),
            (None, Some(channel)) => Some(channel.clone()),
            (None, None) => self.ctx.repository.select_channel(cid).await?,
        };

        for query in queries {
            let decision = query.handle_event(event, snapshot.as_ref()).await;
            if decision == EventHandlingResult::Skip {
                if let Some(channel) = &snapshot {
                    query.refresh_channel(channel).await;
                }
                continue;
            }
            debug!(query = %query.key(), cid, ?decision, "Query membership changed");
            query.apply(decision).await?;
        }
        Ok(())
    }
}

fn is_fan_out(payload: &EventPayload) -> bool {
    matches!(
        payload,
        EventPayload::UserMessagesDeleted { .. }
            | EventPayload::UserPresenceChanged { .. }
            | EventPayload::UserUpdated { .. }
            | EventPayload::GlobalUserBanned { .. }
            | EventPayload::GlobalUserUnbanned { .. }
            | EventPayload::MarkAllRead { .. }
    )
}

fn event_channel(payload: &EventPayload) -> Option<&Channel> {
    match payload {
        EventPayload::NotificationMessageNew { channel, .. }
        | EventPayload::NotificationAddedToChannel { channel, .. }
        | EventPayload::NotificationRemovedFromChannel { channel, .. }
        | EventPayload::ChannelUpdated { channel }
        | EventPayload::ChannelDeleted { channel }
        | EventPayload::ChannelVisible { channel }
        | EventPayload::ChannelTruncated { channel, .. } => Some(channel),
        _ => None,
    }
}

fn bump_last_message(channel: &mut Channel, message: &Message) {
    if let Some(created) = message.effective_created_at() {
        if channel.last_message_at.map_or(true, |at| created > at) {
            channel.last_message_at = Some(created);
        }
    }
    channel.hidden = false;
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, Utc};
    use relais_shared::{
        Cid, FilterObject, Member, QuerySort, UnreadCounts, User,
    };

    use super::*;
    use crate::channel::ChannelCreationService;
    use crate::query_channels::{QueryChannelsLogic, QueryContext};
    use crate::reactions::ReactionSyncService;
    use crate::sending::MessageSendingService;
    use crate::testing::{test_context, FakeApi, FakeUploader};

    struct Harness {
        ctx: Arc<ChatContext>,
        sync: Arc<SyncManager>,
        sequencer: EventSequencer,
    }

    async fn harness(api: Arc<FakeApi>) -> Harness {
        let ctx = test_context(api, FakeUploader::default()).await;
        ctx.client_state.set_user(User::new("alice"));
        let sync = SyncManager::new(
            Arc::clone(&ctx),
            MessageSendingService::new(Arc::clone(&ctx)).unwrap(),
            Arc::new(ReactionSyncService::new(Arc::clone(&ctx))),
            Arc::new(ChannelCreationService::new(Arc::clone(&ctx))),
        );
        sync.load_sync_state("alice").await.unwrap();
        let handler = Arc::new(EventHandler::new(Arc::clone(&ctx), Arc::clone(&sync)));
        let sequencer = EventSequencer::spawn(handler, 16, ctx.shutdown.child_token());
        Harness {
            ctx,
            sync,
            sequencer,
        }
    }

    fn message(id: &str, user: &str, text: &str, secs_ago: i64) -> Message {
        Message {
            id: id.into(),
            cid: "messaging:general".into(),
            user_id: user.into(),
            text: text.into(),
            created_at: Some(Utc::now() - Duration::seconds(secs_ago)),
            ..Default::default()
        }
    }

    fn new_message(message: Message) -> ChatEvent {
        ChatEvent::channel(
            message.cid.clone(),
            EventPayload::NewMessage {
                message,
                unread: None,
            },
        )
    }

    #[tokio::test]
    async fn events_are_applied_in_receipt_order() {
        let h = harness(Arc::new(FakeApi::default())).await;
        let (logic, _) = h.ctx.registry.channel(&Cid::new("messaging", "general"), "alice").await;

        let original = message("m1", "bob", "first", 10);
        let mut edited = original.clone();
        edited.text = "edited".into();
        h.sequencer.push(new_message(original)).await.unwrap();
        h.sequencer
            .push(ChatEvent::channel(
                "messaging:general",
                EventPayload::MessageUpdated { message: edited },
            ))
            .await
            .unwrap();
        h.sequencer.flush().await.unwrap();

        assert_eq!(logic.last_message().unwrap().text, "edited");
        assert_eq!(logic.unread_count(), 1);
        let stored = h.ctx.repository.select_message("m1").await.unwrap().unwrap();
        assert_eq!(stored.text, "edited");
    }

    #[tokio::test]
    async fn unwatched_channels_are_only_stored() {
        let h = harness(Arc::new(FakeApi::default())).await;

        h.sequencer.push(new_message(message("m1", "bob", "hi", 1))).await.unwrap();
        h.sequencer.flush().await.unwrap();

        assert!(h.ctx.registry.active_cids().await.is_empty());
        assert!(h.ctx.repository.select_message("m1").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn user_wide_events_fan_out_to_live_channels() {
        let h = harness(Arc::new(FakeApi::default())).await;
        let (general, _) = h.ctx.registry.channel(&Cid::new("messaging", "general"), "alice").await;
        let (random, _) = h.ctx.registry.channel(&Cid::new("messaging", "random"), "alice").await;
        general.upsert_message(message("m1", "spammer", "spam", 5)).await;
        let mut other = message("m2", "spammer", "spam", 5);
        other.cid = "messaging:random".into();
        random.upsert_message(other).await;

        h.sequencer
            .push(ChatEvent::global(EventPayload::UserMessagesDeleted {
                user_id: "spammer".into(),
                hard_delete: true,
            }))
            .await
            .unwrap();
        h.sequencer.flush().await.unwrap();

        assert!(general.messages().await.is_empty());
        assert!(random.messages().await.is_empty());
    }

    #[tokio::test]
    async fn unread_totals_update_with_the_event() {
        let h = harness(Arc::new(FakeApi::default())).await;
        h.sequencer
            .push(ChatEvent::channel(
                "messaging:general",
                EventPayload::NewMessage {
                    message: message("m1", "bob", "hi", 1),
                    unread: Some(UnreadCounts {
                        total_unread_count: 7,
                        unread_channels: 2,
                    }),
                },
            ))
            .await
            .unwrap();
        h.sequencer.flush().await.unwrap();

        assert_eq!(h.ctx.global_state.total_unread_count.get(), 7);
        assert_eq!(h.ctx.global_state.channel_unread_count.get(), 2);
    }

    #[tokio::test]
    async fn added_to_channel_updates_matching_query() {
        let h = harness(Arc::new(FakeApi::default())).await;
        let ctx = &h.ctx;
        let query = ctx
            .registry
            .insert_query(QueryChannelsLogic::new(
                FilterObject::contains("members", "alice"),
                QuerySort::by_last_message(),
                QueryContext {
                    repository: Arc::clone(&ctx.repository),
                    api: Arc::clone(&ctx.api),
                    client_state: Arc::clone(&ctx.client_state),
                    registry: Arc::downgrade(&ctx.registry),
                    message_limit: 10,
                    user_presence: false,
                },
            ))
            .await;

        let mut channel = Channel::new("messaging", "team");
        channel.upsert_member(Member::new(User::new("alice")));
        h.sequencer
            .push(ChatEvent::channel(
                "messaging:team",
                EventPayload::NotificationAddedToChannel {
                    channel,
                    member: Member::new(User::new("alice")),
                },
            ))
            .await
            .unwrap();
        h.sequencer.flush().await.unwrap();

        assert_eq!(query.cids().await, vec!["messaging:team".to_string()]);
        assert!(ctx.repository.select_channel("messaging:team").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn connection_events_drive_client_state() {
        let h = harness(Arc::new(FakeApi::default())).await;

        h.sequencer
            .push(ChatEvent::global(EventPayload::Connected {
                user: User::new("alice"),
                connection_id: "conn-1".into(),
            }))
            .await
            .unwrap();
        h.sequencer.flush().await.unwrap();
        assert!(h.ctx.is_online());
        h.sync.wait_idle().await;
        assert!(h.sync.sync_state().await.unwrap().last_synced_at.is_some());

        h.sequencer.push(ChatEvent::global(EventPayload::Disconnected)).await.unwrap();
        h.sequencer.flush().await.unwrap();
        assert!(!h.ctx.is_online());
    }

    #[tokio::test]
    async fn mark_all_read_moves_the_cursor() {
        let h = harness(Arc::new(FakeApi::default())).await;
        let at = Utc::now();
        h.sequencer
            .push(
                ChatEvent::global(EventPayload::MarkAllRead {
                    user: User::new("alice"),
                    unread: None,
                })
                .at(at),
            )
            .await
            .unwrap();
        h.sequencer.flush().await.unwrap();

        let state = h.sync.sync_state().await.unwrap();
        assert_eq!(state.marked_all_read_at, Some(at));
    }
}
