//! In-memory projection of one watched channel.
//!
//! REST responses, realtime events and local optimistic writes all funnel
//! through [`ChannelLogic`]; each mutation runs under one lock and publishes
//! a fresh snapshot afterwards.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use relais_shared::{
    Channel, ChannelUserRead, ChatEvent, Cid, EventPayload, Member, Message, Reaction, User,
};
use tokio::sync::{watch, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::reconcile::{compute_unread_count, should_increment_unread, should_replace_last_message};
use crate::observable::Observable;

struct ChannelData {
    channel: Channel,
    last_message: Option<Message>,
    /// Messages already counted by the unread increment.
    counted_message_ids: HashSet<String>,
    recovery_needed: bool,
}

pub struct ChannelLogic {
    cid: Cid,
    current_user_id: String,
    data: Mutex<ChannelData>,
    channel: Observable<Channel>,
    unread_count: Observable<u32>,
    last_message: Observable<Option<Message>>,
    closed: CancellationToken,
}

impl ChannelLogic {
    pub fn new(cid: Cid, current_user_id: impl Into<String>) -> Self {
        let channel = Channel::new(cid.channel_type.clone(), cid.id.clone());
        Self {
            cid,
            current_user_id: current_user_id.into(),
            channel: Observable::new(channel.clone()),
            data: Mutex::new(ChannelData {
                channel,
                last_message: None,
                counted_message_ids: HashSet::new(),
                recovery_needed: false,
            }),
            unread_count: Observable::new(0),
            last_message: Observable::new(None),
            closed: CancellationToken::new(),
        }
    }

    pub fn cid(&self) -> &Cid {
        &self.cid
    }

    // -----------------------------------------------------------------------
    // Observation
    // -----------------------------------------------------------------------

    pub fn snapshot(&self) -> Channel {
        self.channel.get()
    }

    pub fn subscribe(&self) -> watch::Receiver<Channel> {
        self.channel.subscribe()
    }

    pub fn unread_count(&self) -> u32 {
        self.unread_count.get()
    }

    pub fn subscribe_unread_count(&self) -> watch::Receiver<u32> {
        self.unread_count.subscribe()
    }

    pub fn last_message(&self) -> Option<Message> {
        self.last_message.get()
    }

    pub async fn message(&self, id: &str) -> Option<Message> {
        let data = self.data.lock().await;
        data.channel.messages.iter().find(|m| m.id == id).cloned()
    }

    pub async fn messages(&self) -> Vec<Message> {
        self.data.lock().await.channel.messages.clone()
    }

    /// Cancelled once the channel stops being watched. Listeners registered
    /// for this channel should stop when it fires.
    pub fn listener_token(&self) -> CancellationToken {
        self.closed.child_token()
    }

    pub fn close(&self) {
        debug!(cid = %self.cid, "Channel logic closed");
        self.closed.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    pub async fn recovery_needed(&self) -> bool {
        self.data.lock().await.recovery_needed
    }

    pub async fn set_recovery_needed(&self, needed: bool) {
        self.data.lock().await.recovery_needed = needed;
    }

    // -----------------------------------------------------------------------
    // Upserts
    // -----------------------------------------------------------------------

    /// Merge a full channel snapshot from the server or the store.
    ///
    /// Members and reads are upserted by user id, messages by id, so
    /// applying the same snapshot twice yields the same state.
    pub async fn update_data_from_channel(&self, incoming: Channel) {
        let mut data = self.data.lock().await;
        self.merge_channel_locked(&mut data, incoming);
        self.publish(&data);
    }

    fn merge_channel_locked(&self, data: &mut ChannelData, incoming: Channel) {
        let Channel {
            name,
            created_by,
            created_at,
            updated_at,
            deleted_at,
            last_message_at,
            hidden,
            frozen,
            member_count,
            members,
            reads,
            messages,
            config,
            own_capabilities,
            sync_status,
            extra,
            ..
        } = incoming;

        let channel = &mut data.channel;
        channel.name = name;
        channel.created_by = created_by;
        channel.created_at = created_at;
        channel.updated_at = updated_at;
        channel.deleted_at = deleted_at;
        channel.hidden = hidden;
        channel.frozen = frozen;
        channel.config = config;
        channel.own_capabilities = own_capabilities;
        channel.sync_status = sync_status;
        channel.extra = extra;
        channel.last_message_at = max_time(channel.last_message_at, last_message_at);

        for member in members.into_values() {
            channel.upsert_member(member);
        }
        channel.member_count = channel.member_count.max(member_count);

        let server_unread = reads
            .get(&self.current_user_id)
            .map(|r| r.unread_messages)
            .unwrap_or(0);
        for read in reads.into_values() {
            channel.upsert_read(read);
        }

        for message in messages {
            Self::upsert_message_locked(data, message);
        }
        self.recompute_unread_locked(data, server_unread);
    }

    /// Insert or replace a message and advance the last-message pointer.
    pub async fn upsert_message(&self, message: Message) {
        let mut data = self.data.lock().await;
        Self::upsert_message_locked(&mut data, message);
        self.publish(&data);
    }

    pub async fn upsert_messages(&self, messages: Vec<Message>) {
        let mut data = self.data.lock().await;
        for message in messages {
            Self::upsert_message_locked(&mut data, message);
        }
        self.publish(&data);
    }

    /// Remove a message outright (hard delete or dropped local message).
    pub async fn remove_message(&self, message_id: &str) {
        let mut data = self.data.lock().await;
        Self::remove_message_locked(&mut data, message_id);
        self.publish(&data);
    }

    pub async fn upsert_member(&self, member: Member) {
        let mut data = self.data.lock().await;
        data.channel.upsert_member(member);
        self.publish(&data);
    }

    pub async fn upsert_read(&self, read: ChannelUserRead) {
        let mut data = self.data.lock().await;
        self.apply_read_locked(&mut data, read);
        self.publish(&data);
    }

    /// Apply a reaction change to the stored message it belongs to.
    pub async fn apply_reaction(&self, reaction: &Reaction, removed: bool) -> Option<Message> {
        let mut data = self.data.lock().await;
        let is_own = reaction.user_id == self.current_user_id;
        let message = data
            .channel
            .messages
            .iter_mut()
            .find(|m| m.id == reaction.message_id)?;
        if removed {
            message.remove_reaction(reaction);
        } else {
            message.add_reaction(reaction, is_own, reaction.enforce_unique);
        }
        let updated = message.clone();
        Self::refresh_last_message_locked(&mut data, &updated);
        self.publish(&data);
        Some(updated)
    }

    // -----------------------------------------------------------------------
    // Events
    // -----------------------------------------------------------------------

    /// Apply one realtime event. Events must arrive in receipt order.
    pub async fn handle_event(&self, event: &ChatEvent) {
        let mut data = self.data.lock().await;
        let at = event.created_at;

        match &event.payload {
            EventPayload::NewMessage { message, .. }
            | EventPayload::NotificationMessageNew { message, .. } => {
                data.channel.hidden = false;
                self.upsert_event_message_locked(&mut data, message.clone());
                self.increment_unread_locked(&mut data, message);
            }
            EventPayload::MessageUpdated { message } => {
                self.upsert_event_message_locked(&mut data, message.clone());
            }
            EventPayload::MessageDeleted {
                message,
                hard_delete,
            } => {
                if *hard_delete {
                    Self::remove_message_locked(&mut data, &message.id);
                } else {
                    self.upsert_event_message_locked(&mut data, message.clone());
                }
            }
            EventPayload::ReactionNew { message, reaction }
            | EventPayload::ReactionUpdated { message, reaction } => {
                let mut message = message.clone();
                self.merge_own_reactions_locked(&data, &mut message);
                if reaction.user_id == self.current_user_id {
                    message.own_reactions.retain(|r| r.reaction_type != reaction.reaction_type);
                    message.own_reactions.insert(0, reaction.clone());
                }
                Self::upsert_message_locked(&mut data, message);
            }
            EventPayload::ReactionDeleted { message, reaction } => {
                let mut message = message.clone();
                self.merge_own_reactions_locked(&data, &mut message);
                if reaction.user_id == self.current_user_id {
                    message.own_reactions.retain(|r| r.reaction_type != reaction.reaction_type);
                }
                Self::upsert_message_locked(&mut data, message);
            }
            EventPayload::MessageRead { user }
            | EventPayload::NotificationMarkRead { user, .. }
            | EventPayload::MarkAllRead { user, .. } => {
                let read = ChannelUserRead::new(user.id.clone(), Some(at));
                self.apply_read_locked(&mut data, read);
            }
            EventPayload::MemberAdded { member } | EventPayload::MemberUpdated { member } => {
                data.channel.upsert_member(member.clone());
            }
            EventPayload::MemberRemoved { user_id } => {
                Self::remove_member_locked(&mut data, user_id);
            }
            EventPayload::NotificationRemovedFromChannel { member, .. } => {
                Self::remove_member_locked(&mut data, member.user_id());
            }
            EventPayload::NotificationAddedToChannel { channel, .. }
            | EventPayload::ChannelUpdated { channel }
            | EventPayload::ChannelVisible { channel } => {
                let mut channel = channel.clone();
                if matches!(event.payload, EventPayload::ChannelVisible { .. }) {
                    channel.hidden = false;
                }
                self.merge_channel_locked(&mut data, channel);
            }
            EventPayload::ChannelDeleted { channel } => {
                data.channel.deleted_at = channel.deleted_at.or(Some(at));
            }
            EventPayload::ChannelHidden { clear_history } => {
                data.channel.hidden = true;
                if *clear_history {
                    Self::truncate_locked(&mut data, at);
                }
            }
            EventPayload::ChannelTruncated { message, .. } => {
                Self::truncate_locked(&mut data, at);
                if let Some(message) = message {
                    Self::upsert_message_locked(&mut data, message.clone());
                }
                for read in data.channel.reads.values_mut() {
                    read.unread_messages = 0;
                }
            }
            EventPayload::ChannelUserBanned { user } => {
                Self::set_member_banned_locked(&mut data, &user.id, true);
            }
            EventPayload::ChannelUserUnbanned { user } => {
                Self::set_member_banned_locked(&mut data, &user.id, false);
            }
            EventPayload::UserPresenceChanged { user }
            | EventPayload::UserUpdated { user }
            | EventPayload::GlobalUserBanned { user }
            | EventPayload::GlobalUserUnbanned { user } => {
                Self::update_user_locked(&mut data, user);
            }
            EventPayload::UserMessagesDeleted {
                user_id,
                hard_delete,
            } => {
                if *hard_delete {
                    data.channel.messages.retain(|m| &m.user_id != user_id);
                } else {
                    let authored = data
                        .channel
                        .messages
                        .iter_mut()
                        .filter(|m| &m.user_id == user_id);
                    for message in authored {
                        message.deleted_at.get_or_insert(at);
                    }
                }
                let last_is_gone = data
                    .last_message
                    .as_ref()
                    .is_some_and(|m| &m.user_id == user_id);
                if last_is_gone {
                    Self::reset_last_message_locked(&mut data);
                }
            }
            EventPayload::Connecting
            | EventPayload::Connected { .. }
            | EventPayload::Disconnected
            | EventPayload::HealthCheck { .. }
            | EventPayload::Unknown { .. } => return,
        }

        self.publish(&data);
    }

    // -----------------------------------------------------------------------
    // Locked helpers
    // -----------------------------------------------------------------------

    fn upsert_message_locked(data: &mut ChannelData, message: Message) {
        match data.channel.messages.iter_mut().find(|m| m.id == message.id) {
            Some(existing) => *existing = message.clone(),
            None => data.channel.messages.push(message.clone()),
        }
        data.channel
            .messages
            .sort_by_key(|m| m.effective_created_at());

        if should_replace_last_message(data.last_message.as_ref(), &message) {
            data.channel.last_message_at =
                max_time(data.channel.last_message_at, message.effective_created_at());
            data.last_message = Some(message);
        }
    }

    fn remove_message_locked(data: &mut ChannelData, message_id: &str) {
        data.channel.messages.retain(|m| m.id != message_id);
        if data.last_message.as_ref().map(|m| m.id.as_str()) == Some(message_id) {
            Self::reset_last_message_locked(data);
        }
    }

    fn reset_last_message_locked(data: &mut ChannelData) {
        data.last_message = data
            .channel
            .messages
            .iter()
            .rev()
            .find(|m| !m.is_deleted())
            .cloned();
    }

    /// Keep the last-message pointer in step with an edited copy of it.
    fn refresh_last_message_locked(data: &mut ChannelData, message: &Message) {
        if data.last_message.as_ref().map(|m| &m.id) == Some(&message.id) {
            data.last_message = Some(message.clone());
        }
    }

    /// Events carry the server's view of a message, which never includes
    /// the current user's own reactions.
    fn merge_own_reactions_locked(&self, data: &ChannelData, message: &mut Message) {
        if let Some(existing) = data.channel.messages.iter().find(|m| m.id == message.id) {
            if message.own_reactions.is_empty() {
                message.own_reactions = existing.own_reactions.clone();
            }
        }
    }

    fn upsert_event_message_locked(&self, data: &mut ChannelData, mut message: Message) {
        self.merge_own_reactions_locked(data, &mut message);
        Self::upsert_message_locked(data, message);
    }

    fn increment_unread_locked(&self, data: &mut ChannelData, message: &Message) {
        if !data.counted_message_ids.insert(message.id.clone()) {
            return;
        }
        let current = self.current_user_id.clone();
        if !should_increment_unread(message, &current, data.channel.reads.get(&current)) {
            return;
        }
        let read = data
            .channel
            .reads
            .entry(current.clone())
            .or_insert_with(|| ChannelUserRead::new(current, None));
        read.unread_messages += 1;
        read.last_received_event_at =
            max_time(read.last_received_event_at, message.effective_created_at());
        debug!(cid = %self.cid, unread = read.unread_messages, "Unread count incremented");
    }

    fn apply_read_locked(&self, data: &mut ChannelData, read: ChannelUserRead) {
        if let Some(existing) = data.channel.reads.get(&read.user_id) {
            if let (Some(old), Some(new)) = (existing.last_read, read.last_read) {
                if new < old {
                    warn!(cid = %self.cid, user_id = %read.user_id, "Stale read event ignored");
                    return;
                }
            }
        }
        data.channel.upsert_read(read);
    }

    fn recompute_unread_locked(&self, data: &mut ChannelData, server_count: u32) {
        let current = self.current_user_id.clone();
        let count = compute_unread_count(
            &current,
            data.channel.reads.get(&current),
            &data.channel.messages,
            server_count,
        );
        if let Some(read) = data.channel.reads.get_mut(&current) {
            read.unread_messages = count;
        } else if count > 0 {
            let mut read = ChannelUserRead::new(current.clone(), None);
            read.unread_messages = count;
            data.channel.reads.insert(current, read);
        }
        for message in &data.channel.messages {
            data.counted_message_ids.insert(message.id.clone());
        }
    }

    fn remove_member_locked(data: &mut ChannelData, user_id: &str) {
        if data.channel.members.remove(user_id).is_some() {
            data.channel.member_count = data.channel.member_count.saturating_sub(1);
        }
    }

    fn set_member_banned_locked(data: &mut ChannelData, user_id: &str, banned: bool) {
        if let Some(member) = data.channel.members.get_mut(user_id) {
            member.banned = banned;
        }
    }

    fn update_user_locked(data: &mut ChannelData, user: &User) {
        if let Some(member) = data.channel.members.get_mut(&user.id) {
            member.user = user.clone();
        }
    }

    /// Drop every message created at or before `at`.
    fn truncate_locked(data: &mut ChannelData, at: DateTime<Utc>) {
        data.channel
            .messages
            .retain(|m| m.effective_created_at().is_some_and(|t| t > at));
        data.last_message = data.channel.messages.last().cloned();
    }

    fn publish(&self, data: &ChannelData) {
        let unread = data
            .channel
            .reads
            .get(&self.current_user_id)
            .map(|r| r.unread_messages)
            .unwrap_or(0);
        self.unread_count.set_if_changed(unread);
        self.last_message.set(data.last_message.clone());
        self.channel.set(data.channel.clone());
    }
}

fn max_time(a: Option<DateTime<Utc>>, b: Option<DateTime<Utc>>) -> Option<DateTime<Utc>> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.max(b)),
        (a, b) => a.or(b),
    }
}
