//! Realtime events delivered by the transport, in receipt order.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::{Channel, Member, Message, Reaction, User};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChatEvent {
    pub created_at: DateTime<Utc>,
    /// Set for channel-scoped events.
    pub cid: Option<String>,
    pub payload: EventPayload,
}

/// Unread totals the server attaches to some events.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct UnreadCounts {
    pub total_unread_count: u32,
    pub unread_channels: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventPayload {
    // -- connection -------------------------------------------------------
    Connecting,
    Connected { user: User, connection_id: String },
    Disconnected,
    HealthCheck { connection_id: String },

    // -- messages ---------------------------------------------------------
    NewMessage { message: Message, unread: Option<UnreadCounts> },
    MessageUpdated { message: Message },
    MessageDeleted { message: Message, hard_delete: bool },
    NotificationMessageNew { channel: Channel, message: Message, unread: Option<UnreadCounts> },

    // -- reactions --------------------------------------------------------
    ReactionNew { message: Message, reaction: Reaction },
    ReactionUpdated { message: Message, reaction: Reaction },
    ReactionDeleted { message: Message, reaction: Reaction },

    // -- read state -------------------------------------------------------
    MessageRead { user: User },
    NotificationMarkRead { user: User, unread: Option<UnreadCounts> },
    MarkAllRead { user: User, unread: Option<UnreadCounts> },

    // -- membership -------------------------------------------------------
    MemberAdded { member: Member },
    MemberUpdated { member: Member },
    MemberRemoved { user_id: String },
    NotificationAddedToChannel { channel: Channel, member: Member },
    NotificationRemovedFromChannel { channel: Channel, member: Member },
    ChannelUserBanned { user: User },
    ChannelUserUnbanned { user: User },

    // -- channel lifecycle ------------------------------------------------
    ChannelUpdated { channel: Channel },
    ChannelDeleted { channel: Channel },
    ChannelHidden { clear_history: bool },
    ChannelVisible { channel: Channel },
    ChannelTruncated { channel: Channel, message: Option<Message> },

    // -- users ------------------------------------------------------------
    UserPresenceChanged { user: User },
    UserUpdated { user: User },
    /// Every message of `user_id` was deleted; not channel-scoped.
    UserMessagesDeleted { user_id: String, hard_delete: bool },
    GlobalUserBanned { user: User },
    GlobalUserUnbanned { user: User },

    Unknown { raw_type: String },
}

impl ChatEvent {
    pub fn new(cid: Option<String>, payload: EventPayload) -> Self {
        Self {
            created_at: Utc::now(),
            cid,
            payload,
        }
    }

    pub fn channel(cid: impl Into<String>, payload: EventPayload) -> Self {
        Self::new(Some(cid.into()), payload)
    }

    pub fn global(payload: EventPayload) -> Self {
        Self::new(None, payload)
    }

    pub fn at(mut self, created_at: DateTime<Utc>) -> Self {
        self.created_at = created_at;
        self
    }

    /// Short name used in logs.
    pub fn kind(&self) -> &'static str {
        match &self.payload {
            EventPayload::Connecting => "connection.connecting",
            EventPayload::Connected { .. } => "connection.connected",
            EventPayload::Disconnected => "connection.disconnected",
            EventPayload::HealthCheck { .. } => "health.check",
            EventPayload::NewMessage { .. } => "message.new",
            EventPayload::MessageUpdated { .. } => "message.updated",
            EventPayload::MessageDeleted { .. } => "message.deleted",
            EventPayload::NotificationMessageNew { .. } => "notification.message_new",
            EventPayload::ReactionNew { .. } => "reaction.new",
            EventPayload::ReactionUpdated { .. } => "reaction.updated",
            EventPayload::ReactionDeleted { .. } => "reaction.deleted",
            EventPayload::MessageRead { .. } => "message.read",
            EventPayload::NotificationMarkRead { .. } => "notification.mark_read",
            EventPayload::MarkAllRead { .. } => "notification.mark_all_read",
            EventPayload::MemberAdded { .. } => "member.added",
            EventPayload::MemberUpdated { .. } => "member.updated",
            EventPayload::MemberRemoved { .. } => "member.removed",
            EventPayload::NotificationAddedToChannel { .. } => "notification.added_to_channel",
            EventPayload::NotificationRemovedFromChannel { .. } => "notification.removed_from_channel",
            EventPayload::ChannelUserBanned { .. } => "user.banned",
            EventPayload::ChannelUserUnbanned { .. } => "user.unbanned",
            EventPayload::ChannelUpdated { .. } => "channel.updated",
            EventPayload::ChannelDeleted { .. } => "channel.deleted",
            EventPayload::ChannelHidden { .. } => "channel.hidden",
            EventPayload::ChannelVisible { .. } => "channel.visible",
            EventPayload::ChannelTruncated { .. } => "channel.truncated",
            EventPayload::UserPresenceChanged { .. } => "user.presence.changed",
            EventPayload::UserUpdated { .. } => "user.updated",
            EventPayload::UserMessagesDeleted { .. } => "user.messages.deleted",
            EventPayload::GlobalUserBanned { .. } => "user.banned.global",
            EventPayload::GlobalUserUnbanned { .. } => "user.unbanned.global",
            EventPayload::Unknown { .. } => "unknown",
        }
    }

    /// Unread totals carried by the event, if any.
    pub fn unread_counts(&self) -> Option<UnreadCounts> {
        match &self.payload {
            EventPayload::NewMessage { unread, .. }
            | EventPayload::NotificationMessageNew { unread, .. }
            | EventPayload::NotificationMarkRead { unread, .. }
            | EventPayload::MarkAllRead { unread, .. } => *unread,
            _ => None,
        }
    }
}
