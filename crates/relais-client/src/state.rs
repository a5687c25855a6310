//! Client-wide observable state and the registry of live logic objects.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use relais_shared::{Channel, Cid, User};
use tokio::sync::{watch, RwLock};
use tracing::debug;

use crate::channel::ChannelLogic;
use crate::observable::Observable;
use crate::query_channels::QueryChannelsLogic;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    Offline,
    Connecting,
    Connected { connection_id: String },
}

/// Who is logged in and whether the realtime connection is up.
pub struct ClientState {
    user: Observable<Option<User>>,
    connection: Observable<ConnectionState>,
}

impl ClientState {
    pub fn new() -> Self {
        Self {
            user: Observable::new(None),
            connection: Observable::new(ConnectionState::Offline),
        }
    }

    pub fn is_online(&self) -> bool {
        matches!(self.connection.get(), ConnectionState::Connected { .. })
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.connection.get()
    }

    pub fn subscribe_connection(&self) -> watch::Receiver<ConnectionState> {
        self.connection.subscribe()
    }

    pub fn connection_id(&self) -> Option<String> {
        match self.connection.get() {
            ConnectionState::Connected { connection_id } => Some(connection_id),
            _ => None,
        }
    }

    pub fn user(&self) -> Option<User> {
        self.user.get()
    }

    pub fn current_user_id(&self) -> Option<String> {
        self.user.get().map(|u| u.id)
    }

    pub fn set_user(&self, user: User) {
        self.user.set(Some(user));
    }

    pub fn set_connecting(&self) {
        self.connection.set_if_changed(ConnectionState::Connecting);
    }

    pub fn set_connected(&self, connection_id: impl Into<String>) {
        self.connection.set_if_changed(ConnectionState::Connected {
            connection_id: connection_id.into(),
        });
    }

    pub fn set_offline(&self) {
        self.connection.set_if_changed(ConnectionState::Offline);
    }
}

impl Default for ClientState {
    fn default() -> Self {
        Self::new()
    }
}

/// Totals across every channel of the current user.
pub struct GlobalState {
    pub total_unread_count: Observable<u32>,
    pub channel_unread_count: Observable<u32>,
    pub banned: Observable<bool>,
}

impl GlobalState {
    pub fn new() -> Self {
        Self {
            total_unread_count: Observable::new(0),
            channel_unread_count: Observable::new(0),
            banned: Observable::new(false),
        }
    }

    pub fn set_unread_counts(&self, total: u32, channels: u32) {
        self.total_unread_count.set_if_changed(total);
        self.channel_unread_count.set_if_changed(channels);
    }
}

impl Default for GlobalState {
    fn default() -> Self {
        Self::new()
    }
}

/// Live [`ChannelLogic`] and [`QueryChannelsLogic`] instances, keyed by cid
/// and by query key.
#[derive(Default)]
pub struct LogicRegistry {
    channels: RwLock<HashMap<Cid, Arc<ChannelLogic>>>,
    queries: RwLock<HashMap<String, Arc<QueryChannelsLogic>>>,
}

impl LogicRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Existing logic for `cid`, or a fresh one. The flag tells which.
    pub async fn channel(&self, cid: &Cid, current_user_id: &str) -> (Arc<ChannelLogic>, bool) {
        if let Some(logic) = self.channels.read().await.get(cid) {
            return (Arc::clone(logic), false);
        }
        let mut channels = self.channels.write().await;
        if let Some(logic) = channels.get(cid) {
            return (Arc::clone(logic), false);
        }
        let logic = Arc::new(ChannelLogic::new(cid.clone(), current_user_id));
        channels.insert(cid.clone(), Arc::clone(&logic));
        debug!(cid = %cid, "Channel logic created");
        (logic, true)
    }

    pub async fn active_channel(&self, cid: &Cid) -> Option<Arc<ChannelLogic>> {
        self.channels.read().await.get(cid).cloned()
    }

    pub async fn active_channel_str(&self, cid: &str) -> Option<Arc<ChannelLogic>> {
        let cid = Cid::parse(cid).ok()?;
        self.active_channel(&cid).await
    }

    pub async fn active_channels(&self) -> Vec<Arc<ChannelLogic>> {
        self.channels.read().await.values().cloned().collect()
    }

    pub async fn active_cids(&self) -> Vec<String> {
        let channels = self.channels.read().await;
        let sorted: BTreeSet<String> = channels.keys().map(Cid::to_string).collect();
        sorted.into_iter().collect()
    }

    /// Drop the logic for `cid`, cancelling its listeners.
    pub async fn remove_channel(&self, cid: &Cid) -> bool {
        match self.channels.write().await.remove(cid) {
            Some(logic) => {
                logic.close();
                true
            }
            None => false,
        }
    }

    /// Push fresh server snapshots into the logic of channels being watched.
    pub async fn apply_channel_snapshots(&self, channels: &[Channel]) {
        for channel in channels {
            if let Some(logic) = self.active_channel_str(&channel.cid).await {
                logic.update_data_from_channel(channel.clone()).await;
            }
        }
    }

    pub async fn query(&self, key: &str) -> Option<Arc<QueryChannelsLogic>> {
        self.queries.read().await.get(key).cloned()
    }

    /// Register `logic` unless a query with the same key exists; either way
    /// the registered instance is returned.
    pub async fn insert_query(&self, logic: QueryChannelsLogic) -> Arc<QueryChannelsLogic> {
        let mut queries = self.queries.write().await;
        Arc::clone(
            queries
                .entry(logic.key())
                .or_insert_with(|| Arc::new(logic)),
        )
    }

    pub async fn queries(&self) -> Vec<Arc<QueryChannelsLogic>> {
        self.queries.read().await.values().cloned().collect()
    }

    /// Close everything. Used on disconnect of the user.
    pub async fn clear(&self) {
        for (_, logic) in self.channels.write().await.drain() {
            logic.close();
        }
        self.queries.write().await.clear();
    }
}
