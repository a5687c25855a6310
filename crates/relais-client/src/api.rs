//! REST collaborator: the calls the engine makes against the backend.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use relais_shared::constants::{DEFAULT_MEMBER_LIMIT, DEFAULT_MESSAGE_LIMIT};
use relais_shared::{Channel, ChatEvent, ChatResult, Cid, FilterObject, Message, QuerySort, Reaction};

/// Parameters of a `queryChannels` call.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryChannelsRequest {
    pub filter: FilterObject,
    pub sort: QuerySort,
    pub limit: u32,
    pub offset: u32,
    pub message_limit: u32,
    pub member_limit: u32,
    /// Subscribe to the returned channels.
    pub watch: bool,
    /// Subscribe to presence of the returned members.
    pub presence: bool,
}

impl QueryChannelsRequest {
    pub fn new(filter: FilterObject, sort: QuerySort, limit: u32) -> Self {
        Self {
            filter,
            sort,
            limit,
            offset: 0,
            message_limit: DEFAULT_MESSAGE_LIMIT,
            member_limit: DEFAULT_MEMBER_LIMIT,
            watch: true,
            presence: false,
        }
    }

    pub fn with_offset(mut self, offset: u32) -> Self {
        self.offset = offset;
        self
    }

    pub fn with_presence(mut self, presence: bool) -> Self {
        self.presence = presence;
        self
    }

    pub fn is_first_page(&self) -> bool {
        self.offset == 0
    }
}

/// Every call returns the server's authoritative copy or a classified
/// [`ChatError`](relais_shared::ChatError).
#[async_trait]
pub trait ChatApi: Send + Sync {
    async fn create_channel(&self, channel: &Channel) -> ChatResult<Channel>;

    async fn query_channels(&self, request: &QueryChannelsRequest) -> ChatResult<Vec<Channel>>;

    /// Subscribe to one channel and return its current state.
    async fn watch_channel(&self, cid: &Cid, message_limit: u32) -> ChatResult<Channel>;

    async fn send_message(&self, message: &Message) -> ChatResult<Message>;

    async fn update_message(&self, message: &Message) -> ChatResult<Message>;

    async fn delete_message(&self, message_id: &str, hard: bool) -> ChatResult<Message>;

    async fn send_reaction(&self, reaction: &Reaction, enforce_unique: bool) -> ChatResult<Reaction>;

    async fn delete_reaction(&self, message_id: &str, reaction_type: &str) -> ChatResult<Message>;

    /// Events of `cids` created after `since`, as the server recorded them
    /// while the client was away.
    async fn sync_history(&self, cids: &[String], since: DateTime<Utc>) -> ChatResult<Vec<ChatEvent>>;
}
