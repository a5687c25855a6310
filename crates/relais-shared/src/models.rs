//! Domain models persisted in the local store and exchanged with the sync
//! engine.
//!
//! Every struct derives `Serialize` and `Deserialize`; the store keeps each
//! entity as a JSON document keyed by its primary key.

use std::collections::BTreeMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::constants::LATEST_REACTIONS_LIMIT;
use crate::filter::{FilterObject, QuerySort};

// ---------------------------------------------------------------------------
// Sync status
// ---------------------------------------------------------------------------

/// Lifecycle tag tracking whether a local mutation was confirmed by the server.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SyncStatus {
    /// Dirty; must be sent on the next opportunity.
    SyncNeeded,
    /// A request for this entity is in flight.
    InProgress,
    /// Confirmed by the server.
    #[default]
    Completed,
    /// The server rejected it; only a fresh user edit re-dirties it.
    FailedPermanently,
    /// Blocked until every attachment has been uploaded.
    AwaitingAttachments,
}

impl SyncStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SyncNeeded => "SYNC_NEEDED",
            Self::InProgress => "IN_PROGRESS",
            Self::Completed => "COMPLETED",
            Self::FailedPermanently => "FAILED_PERMANENTLY",
            Self::AwaitingAttachments => "AWAITING_ATTACHMENTS",
        }
    }

    /// Terminal for the current attempt.
    pub fn is_settled(&self) -> bool {
        matches!(self, Self::Completed | Self::FailedPermanently)
    }
}

impl std::fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// User / Member / Read state
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct User {
    pub id: String,
    pub name: Option<String>,
    #[serde(default)]
    pub online: bool,
    #[serde(default)]
    pub banned: bool,
    pub last_active: Option<DateTime<Utc>>,
}

impl User {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Default::default()
        }
    }
}

/// A channel member, carrying a snapshot of the user.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Member {
    pub user: User,
    pub role: Option<String>,
    #[serde(default)]
    pub banned: bool,
    pub created_at: Option<DateTime<Utc>>,
}

impl Member {
    pub fn new(user: User) -> Self {
        Self {
            user,
            role: None,
            banned: false,
            created_at: None,
        }
    }

    pub fn user_id(&self) -> &str {
        &self.user.id
    }
}

/// Per-user read marker inside a channel.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChannelUserRead {
    pub user_id: String,
    pub last_read: Option<DateTime<Utc>>,
    pub unread_messages: u32,
    /// Time of the latest event that touched this read entry.
    pub last_received_event_at: Option<DateTime<Utc>>,
}

impl ChannelUserRead {
    pub fn new(user_id: impl Into<String>, last_read: Option<DateTime<Utc>>) -> Self {
        Self {
            user_id: user_id.into(),
            last_read,
            unread_messages: 0,
            last_received_event_at: last_read,
        }
    }
}

// ---------------------------------------------------------------------------
// Attachments
// ---------------------------------------------------------------------------

/// Upload state machine: `Idle -> InProgress -> Success | Failed`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum UploadState {
    Idle,
    InProgress { bytes_uploaded: u64, total_bytes: u64 },
    Success,
    Failed { error: String },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct Attachment {
    /// Unique per-attachment upload id, assigned when the message is prepared.
    pub upload_id: Option<String>,
    /// Local file still to be uploaded. `None` means the attachment is already remote.
    pub upload: Option<PathBuf>,
    pub asset_url: Option<String>,
    pub mime_type: Option<String>,
    pub name: Option<String>,
    #[serde(default)]
    pub file_size: u64,
    pub upload_state: Option<UploadState>,
}

impl Attachment {
    pub fn is_uploaded(&self) -> bool {
        matches!(self.upload_state, Some(UploadState::Success))
    }

    pub fn is_failed(&self) -> bool {
        matches!(self.upload_state, Some(UploadState::Failed { .. }))
    }
}

// ---------------------------------------------------------------------------
// Reaction
// ---------------------------------------------------------------------------

/// A reaction; identity is the `(message_id, user_id, reaction_type)` triple.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Reaction {
    pub message_id: String,
    pub user_id: String,
    #[serde(rename = "type")]
    pub reaction_type: String,
    pub score: u32,
    pub created_at: Option<DateTime<Utc>>,
    pub created_locally_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
    pub deleted_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub sync_status: SyncStatus,
    /// Replace the user's other reactions on the message when sent.
    #[serde(default)]
    pub enforce_unique: bool,
}

impl Reaction {
    pub fn new(
        message_id: impl Into<String>,
        user_id: impl Into<String>,
        reaction_type: impl Into<String>,
    ) -> Self {
        Self {
            message_id: message_id.into(),
            user_id: user_id.into(),
            reaction_type: reaction_type.into(),
            score: crate::constants::DEFAULT_REACTION_SCORE,
            created_at: None,
            created_locally_at: None,
            updated_at: None,
            deleted_at: None,
            sync_status: SyncStatus::Completed,
            enforce_unique: false,
        }
    }

    pub fn key(&self) -> ReactionKey {
        ReactionKey {
            message_id: self.message_id.clone(),
            user_id: self.user_id.clone(),
            reaction_type: self.reaction_type.clone(),
        }
    }

    fn same_identity(&self, other: &Reaction) -> bool {
        self.message_id == other.message_id
            && self.user_id == other.user_id
            && self.reaction_type == other.reaction_type
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ReactionKey {
    pub message_id: String,
    pub user_id: String,
    pub reaction_type: String,
}

// ---------------------------------------------------------------------------
// Message
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    #[default]
    Regular,
    Ephemeral,
    Error,
    System,
    Deleted,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct Message {
    pub id: String,
    pub cid: String,
    pub user_id: String,
    pub text: String,
    #[serde(rename = "type", default)]
    pub message_type: MessageType,
    /// Server-assigned creation time.
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
    /// Local compose time.
    pub created_locally_at: Option<DateTime<Utc>>,
    pub updated_locally_at: Option<DateTime<Utc>>,
    /// Soft-delete marker.
    pub deleted_at: Option<DateTime<Utc>>,
    /// The pending deletion removes the message for good.
    #[serde(default)]
    pub hard_delete: bool,
    #[serde(default)]
    pub sync_status: SyncStatus,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
    #[serde(default)]
    pub reaction_counts: BTreeMap<String, u32>,
    #[serde(default)]
    pub reaction_scores: BTreeMap<String, u32>,
    #[serde(default)]
    pub latest_reactions: Vec<Reaction>,
    #[serde(default)]
    pub own_reactions: Vec<Reaction>,
    #[serde(default)]
    pub silent: bool,
    #[serde(default)]
    pub shadowed: bool,
}

impl Message {
    /// Server time, falling back to local compose time.
    pub fn effective_created_at(&self) -> Option<DateTime<Utc>> {
        self.created_at.or(self.created_locally_at)
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }

    pub fn has_pending_attachments(&self) -> bool {
        self.attachments.iter().any(|a| !a.is_uploaded())
    }

    pub fn has_failed_attachments(&self) -> bool {
        self.attachments.iter().any(Attachment::is_failed)
    }

    /// Latest server-side change (creation, edit or deletion).
    pub fn last_update_time(&self) -> Option<DateTime<Utc>> {
        [self.created_at, self.updated_at, self.deleted_at]
            .into_iter()
            .flatten()
            .max()
    }

    /// Latest local change (compose, local edit or deletion).
    pub fn last_local_update_time(&self) -> Option<DateTime<Utc>> {
        [self.created_locally_at, self.updated_locally_at, self.deleted_at]
            .into_iter()
            .flatten()
            .max()
    }

    /// Add a reaction to the aggregates.
    ///
    /// With `enforce_unique` the acting user's other reactions are stripped
    /// first. A reaction with the same identity is replaced, never counted
    /// twice.
    pub fn add_reaction(&mut self, reaction: &Reaction, is_own: bool, enforce_unique: bool) {
        if enforce_unique {
            let previous: Vec<Reaction> = self
                .latest_reactions
                .iter()
                .chain(self.own_reactions.iter())
                .filter(|r| r.user_id == reaction.user_id)
                .cloned()
                .collect();
            for old in dedup_by_identity(previous) {
                self.remove_reaction(&old);
            }
        } else {
            let existing = self
                .latest_reactions
                .iter()
                .chain(self.own_reactions.iter())
                .find(|r| r.same_identity(reaction))
                .cloned();
            if let Some(old) = existing {
                self.remove_reaction(&old);
            }
        }

        *self
            .reaction_counts
            .entry(reaction.reaction_type.clone())
            .or_insert(0) += 1;
        *self
            .reaction_scores
            .entry(reaction.reaction_type.clone())
            .or_insert(0) += reaction.score;

        self.latest_reactions.insert(0, reaction.clone());
        self.latest_reactions.truncate(LATEST_REACTIONS_LIMIT);
        if is_own {
            self.own_reactions.insert(0, reaction.clone());
        }
    }

    /// Remove a reaction from the aggregates, if it is present.
    pub fn remove_reaction(&mut self, reaction: &Reaction) {
        let known = self
            .latest_reactions
            .iter()
            .chain(self.own_reactions.iter())
            .find(|r| r.same_identity(reaction))
            .cloned();
        self.latest_reactions.retain(|r| !r.same_identity(reaction));
        self.own_reactions.retain(|r| !r.same_identity(reaction));

        let Some(known) = known else {
            return;
        };
        decrement(&mut self.reaction_counts, &known.reaction_type, 1);
        decrement(&mut self.reaction_scores, &known.reaction_type, known.score);
    }
}

fn dedup_by_identity(reactions: Vec<Reaction>) -> Vec<Reaction> {
    let mut unique: Vec<Reaction> = Vec::with_capacity(reactions.len());
    for reaction in reactions {
        if !unique.iter().any(|r| r.same_identity(&reaction)) {
            unique.push(reaction);
        }
    }
    unique
}

fn decrement(map: &mut BTreeMap<String, u32>, key: &str, by: u32) {
    if let Some(value) = map.get_mut(key) {
        *value = value.saturating_sub(by);
        if *value == 0 {
            map.remove(key);
        }
    }
}

// ---------------------------------------------------------------------------
// Channel
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChannelConfig {
    pub read_events: bool,
    pub reactions: bool,
    pub typing_events: bool,
    pub uploads: bool,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            read_events: true,
            reactions: true,
            typing_events: true,
            uploads: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct Channel {
    pub cid: String,
    pub channel_type: String,
    pub id: String,
    pub name: Option<String>,
    pub created_by: Option<String>,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
    pub deleted_at: Option<DateTime<Utc>>,
    pub last_message_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub hidden: bool,
    #[serde(default)]
    pub frozen: bool,
    #[serde(default)]
    pub member_count: u32,
    /// Keyed by user id.
    #[serde(default)]
    pub members: BTreeMap<String, Member>,
    /// Keyed by user id.
    #[serde(default)]
    pub reads: BTreeMap<String, ChannelUserRead>,
    /// Latest page of messages as returned by the server.
    #[serde(default)]
    pub messages: Vec<Message>,
    #[serde(default)]
    pub config: ChannelConfig,
    #[serde(default)]
    pub own_capabilities: Vec<String>,
    #[serde(default)]
    pub sync_status: SyncStatus,
    #[serde(default)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl Channel {
    pub fn new(channel_type: impl Into<String>, id: impl Into<String>) -> Self {
        let channel_type = channel_type.into();
        let id = id.into();
        Self {
            cid: format!("{channel_type}:{id}"),
            channel_type,
            id,
            ..Default::default()
        }
    }

    pub fn upsert_member(&mut self, member: Member) {
        self.members.insert(member.user_id().to_string(), member);
        self.member_count = self.member_count.max(self.members.len() as u32);
    }

    pub fn upsert_read(&mut self, read: ChannelUserRead) {
        self.reads.insert(read.user_id.clone(), read);
    }
}

// ---------------------------------------------------------------------------
// Query spec
// ---------------------------------------------------------------------------

/// A channel list query and its materialized result.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QuerySpec {
    pub filter: FilterObject,
    pub sort: QuerySort,
    /// Ordered set of channel ids in the result.
    #[serde(default)]
    pub cids: Vec<String>,
    #[serde(default)]
    pub channels_offset: u32,
    #[serde(default)]
    pub end_of_channels: bool,
    #[serde(default)]
    pub end_of_channels_backward: bool,
}

impl QuerySpec {
    pub fn new(filter: FilterObject, sort: QuerySort) -> Self {
        Self {
            filter,
            sort,
            cids: Vec::new(),
            channels_offset: 0,
            end_of_channels: false,
            end_of_channels_backward: false,
        }
    }

    /// Stable identity of the (filter, sort) pair.
    pub fn key(&self) -> String {
        query_key(&self.filter, &self.sort)
    }

    /// Insert cids keeping set semantics and existing order.
    pub fn add_cids<'a>(&mut self, cids: impl IntoIterator<Item = &'a str>) {
        for cid in cids {
            if !self.cids.iter().any(|c| c == cid) {
                self.cids.push(cid.to_string());
            }
        }
    }

    pub fn remove_cids(&mut self, cids: &[String]) {
        self.cids.retain(|c| !cids.contains(c));
    }
}

pub fn query_key(filter: &FilterObject, sort: &QuerySort) -> String {
    format!(
        "{}|{}",
        serde_json::to_string(filter).unwrap_or_default(),
        serde_json::to_string(sort).unwrap_or_default()
    )
}

// ---------------------------------------------------------------------------
// Sync state
// ---------------------------------------------------------------------------

/// Per-user resumable sync cursor.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SyncState {
    pub user_id: String,
    pub last_synced_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub active_channel_ids: Vec<String>,
    pub marked_all_read_at: Option<DateTime<Utc>>,
}

impl SyncState {
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            last_synced_at: None,
            active_channel_ids: Vec::new(),
            marked_all_read_at: None,
        }
    }
}
