//! Materialized channel list queries.
//!
//! A [`QueryChannelsLogic`] owns one `(filter, sort)` pair. The first page
//! and the next-page loads are tracked independently; asking for a page
//! that is already loading fails with [`ChatError::InProgress`] instead of
//! queueing a second request.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use relais_shared::{
    Channel, ChatError, ChatEvent, ChatResult, Cid, EventPayload, FilterObject, QuerySort,
    QuerySpec, User,
};
use relais_store::Repository;
use tokio::sync::{watch, Mutex};
use tracing::{debug, info, warn};

use crate::api::{ChatApi, QueryChannelsRequest};
use crate::observable::Observable;
use crate::state::{ClientState, LogicRegistry};

/// Lifecycle of the first page. Next-page loads run beside `Ready`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryState {
    Idle,
    LoadingFirstPage,
    Ready,
}

/// What an event means for the materialized result.
#[derive(Debug, Clone, PartialEq)]
pub enum EventHandlingResult {
    Add(Channel),
    Remove(String),
    Skip,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pagination {
    pub offset: u32,
    pub limit: u32,
}

impl Pagination {
    pub fn first_page(limit: u32) -> Self {
        Self { offset: 0, limit }
    }

    pub fn is_first_page(&self) -> bool {
        self.offset == 0
    }
}

/// Collaborators a query needs.
pub struct QueryContext {
    pub repository: Arc<dyn Repository>,
    pub api: Arc<dyn ChatApi>,
    pub client_state: Arc<ClientState>,
    pub registry: Weak<LogicRegistry>,
    pub message_limit: u32,
    pub user_presence: bool,
}

pub struct QueryChannelsLogic {
    filter: FilterObject,
    sort: QuerySort,
    ctx: QueryContext,
    spec: Mutex<QuerySpec>,
    first_page_loading: AtomicBool,
    next_page_loading: AtomicBool,
    recovery_needed: AtomicBool,
    state: Observable<QueryState>,
    loading_more: Observable<bool>,
    channels: Observable<Vec<Channel>>,
}

/// Clears a loading flag however the load ends.
struct LoadingGuard<'a> {
    flag: &'a AtomicBool,
    observable: Option<&'a Observable<bool>>,
}

impl Drop for LoadingGuard<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::SeqCst);
        if let Some(observable) = self.observable {
            observable.set_if_changed(false);
        }
    }
}

impl QueryChannelsLogic {
    pub fn new(filter: FilterObject, sort: QuerySort, ctx: QueryContext) -> Self {
        let spec = QuerySpec::new(filter.clone(), sort.clone());
        Self {
            filter,
            sort,
            ctx,
            spec: Mutex::new(spec),
            first_page_loading: AtomicBool::new(false),
            next_page_loading: AtomicBool::new(false),
            recovery_needed: AtomicBool::new(false),
            state: Observable::new(QueryState::Idle),
            loading_more: Observable::new(false),
            channels: Observable::new(Vec::new()),
        }
    }

    pub fn key(&self) -> String {
        relais_shared::models::query_key(&self.filter, &self.sort)
    }

    pub fn filter(&self) -> &FilterObject {
        &self.filter
    }

    pub fn state(&self) -> QueryState {
        self.state.get()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<QueryState> {
        self.state.subscribe()
    }

    pub fn is_loading(&self) -> bool {
        self.first_page_loading.load(Ordering::SeqCst)
    }

    pub fn is_loading_more(&self) -> bool {
        self.loading_more.get()
    }

    pub fn channels(&self) -> Vec<Channel> {
        self.channels.get()
    }

    pub fn subscribe_channels(&self) -> watch::Receiver<Vec<Channel>> {
        self.channels.subscribe()
    }

    pub async fn cids(&self) -> Vec<String> {
        self.spec.lock().await.cids.clone()
    }

    pub async fn end_of_channels(&self) -> bool {
        self.spec.lock().await.end_of_channels
    }

    pub fn recovery_needed(&self) -> bool {
        self.recovery_needed.load(Ordering::SeqCst)
    }

    pub fn set_recovery_needed(&self, needed: bool) {
        self.recovery_needed.store(needed, Ordering::SeqCst);
    }

    // -----------------------------------------------------------------------
    // Loading
    // -----------------------------------------------------------------------

    fn begin_loading(&self, pagination: Pagination) -> ChatResult<LoadingGuard<'_>> {
        let (flag, observable, what) = if pagination.is_first_page() {
            (&self.first_page_loading, None, "first page query")
        } else {
            (&self.next_page_loading, Some(&self.loading_more), "next page query")
        };
        if flag
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            warn!(query = %self.key(), what, "Loading already in progress, request refused");
            return Err(ChatError::InProgress(what.to_string()));
        }
        if let Some(observable) = observable {
            observable.set_if_changed(true);
        } else if self.state.get() == QueryState::Idle {
            self.state.set(QueryState::LoadingFirstPage);
        }
        Ok(LoadingGuard { flag, observable })
    }

    /// Load a page from the local store only.
    ///
    /// `Ok(None)` means the query was never cached; it is not an error.
    pub async fn query_offline(&self, pagination: Pagination) -> ChatResult<Option<Vec<Channel>>> {
        let _guard = self.begin_loading(pagination)?;
        self.load_offline(pagination).await
    }

    /// Serve the cached page first, then refresh it from the server when
    /// online.
    pub async fn query(&self, pagination: Pagination) -> ChatResult<Vec<Channel>> {
        let _guard = self.begin_loading(pagination)?;
        let offline = self.load_offline(pagination).await?;

        if !self.ctx.client_state.is_online() {
            return Ok(offline.unwrap_or_default());
        }
        self.query_online(pagination).await
    }

    /// Refresh the first page from the server. Used by recovery, which runs
    /// whatever the current loading state is.
    pub async fn refresh_first_page(&self, limit: u32) -> ChatResult<Vec<Channel>> {
        self.query_online(Pagination::first_page(limit)).await
    }

    async fn load_offline(&self, pagination: Pagination) -> ChatResult<Option<Vec<Channel>>> {
        let Some(stored) = self
            .ctx
            .repository
            .select_query_spec(&self.filter, &self.sort)
            .await?
        else {
            debug!(query = %self.key(), "No cached result");
            self.finish_if_first_page(pagination, false);
            return Ok(None);
        };

        let mut channels = self
            .ctx
            .repository
            .select_channels_with_messages(&stored.cids, self.ctx.message_limit)
            .await?;
        self.sort.sort(&mut channels);
        let page: Vec<Channel> = channels
            .into_iter()
            .skip(pagination.offset as usize)
            .take(pagination.limit as usize)
            .collect();

        {
            let mut spec = self.spec.lock().await;
            spec.add_cids(stored.cids.iter().map(String::as_str));
            spec.end_of_channels = stored.end_of_channels;
        }
        self.publish_page(pagination, page.clone());
        self.finish_if_first_page(pagination, true);
        debug!(query = %self.key(), count = page.len(), "Served channels from cache");
        Ok(Some(page))
    }

    async fn query_online(&self, pagination: Pagination) -> ChatResult<Vec<Channel>> {
        let request = QueryChannelsRequest::new(self.filter.clone(), self.sort.clone(), pagination.limit)
            .with_offset(pagination.offset)
            .with_presence(self.ctx.user_presence);

        let channels = match self.ctx.api.query_channels(&request).await {
            Ok(channels) => channels,
            Err(e) => {
                if pagination.is_first_page() && !e.is_permanent() {
                    self.set_recovery_needed(true);
                }
                warn!(query = %self.key(), error = %e, "Channel query failed");
                return Err(e);
            }
        };

        self.ctx
            .repository
            .store_channels_with_messages(&channels)
            .await?;

        let spec = {
            let mut spec = self.spec.lock().await;
            let returned: Vec<&str> = channels.iter().map(|c| c.cid.as_str()).collect();
            if pagination.is_first_page() {
                spec.cids.clear();
            }
            spec.add_cids(returned);
            spec.channels_offset = pagination.offset + channels.len() as u32;
            spec.end_of_channels = (channels.len() as u32) < pagination.limit;
            spec.clone()
        };
        self.ctx.repository.insert_query_spec(&spec).await?;

        if let Some(registry) = self.ctx.registry.upgrade() {
            registry.apply_channel_snapshots(&channels).await;
        }

        if pagination.is_first_page() {
            self.set_recovery_needed(false);
        }
        self.publish_page(pagination, channels.clone());
        self.finish_if_first_page(pagination, true);
        info!(
            query = %self.key(),
            count = channels.len(),
            end_reached = spec.end_of_channels,
            "Channel query succeeded"
        );
        Ok(channels)
    }

    fn finish_if_first_page(&self, pagination: Pagination, loaded: bool) {
        if !pagination.is_first_page() {
            return;
        }
        if loaded {
            self.state.set_if_changed(QueryState::Ready);
        } else if self.state.get() == QueryState::LoadingFirstPage {
            self.state.set(QueryState::Idle);
        }
    }

    fn publish_page(&self, pagination: Pagination, page: Vec<Channel>) {
        if pagination.is_first_page() {
            self.channels.set(page);
            return;
        }
        let sort = &self.sort;
        self.channels.update(|current| {
            for channel in page {
                match current.iter_mut().find(|c| c.cid == channel.cid) {
                    Some(existing) => *existing = channel,
                    None => current.push(channel),
                }
            }
            sort.sort(current);
        });
    }

    // -----------------------------------------------------------------------
    // Events
    // -----------------------------------------------------------------------

    /// Decide what an event means for this query. `channel` is the freshest
    /// known snapshot of the channel the event touches, if any.
    pub async fn handle_event(&self, event: &ChatEvent, channel: Option<&Channel>) -> EventHandlingResult {
        let contains = match event.cid.as_deref().or(channel.map(|c| c.cid.as_str())) {
            Some(cid) => self.spec.lock().await.cids.iter().any(|c| c == cid),
            None => false,
        };

        match (&event.payload, channel) {
            (EventPayload::ChannelDeleted { channel }, _)
            | (EventPayload::NotificationRemovedFromChannel { channel, .. }, _) => {
                if contains {
                    EventHandlingResult::Remove(channel.cid.clone())
                } else {
                    EventHandlingResult::Skip
                }
            }
            (
                EventPayload::NotificationAddedToChannel { .. }
                | EventPayload::NotificationMessageNew { .. }
                | EventPayload::ChannelUpdated { .. }
                | EventPayload::ChannelVisible { .. }
                | EventPayload::ChannelHidden { .. }
                | EventPayload::MemberAdded { .. }
                | EventPayload::MemberUpdated { .. }
                | EventPayload::MemberRemoved { .. }
                | EventPayload::NewMessage { .. },
                Some(channel),
            ) => {
                let matches = self.filter.matches(channel);
                match (matches, contains) {
                    (true, false) => EventHandlingResult::Add(channel.clone()),
                    (false, true) => EventHandlingResult::Remove(channel.cid.clone()),
                    _ => EventHandlingResult::Skip,
                }
            }
            (EventPayload::UserPresenceChanged { user } | EventPayload::UserUpdated { user }, _) => {
                self.update_user(user);
                EventHandlingResult::Skip
            }
            _ => EventHandlingResult::Skip,
        }
    }

    /// Carry a user's new data into the listed channels they are a member of.
    fn update_user(&self, user: &User) {
        let listed = self.channels.get();
        if !listed.iter().any(|c| c.members.contains_key(&user.id)) {
            return;
        }
        self.channels.update(|current| {
            for channel in current.iter_mut() {
                if let Some(member) = channel.members.get_mut(&user.id) {
                    member.user = user.clone();
                }
            }
        });
    }

    /// Apply an event decision to the materialized result and persist it.
    pub async fn apply(&self, result: EventHandlingResult) -> ChatResult<()> {
        match result {
            EventHandlingResult::Skip => Ok(()),
            EventHandlingResult::Add(channel) => self.add_channel(channel).await,
            EventHandlingResult::Remove(cid) => self.remove_channel(&cid).await,
        }
    }

    /// Refresh an entry already in the result after the channel changed.
    pub async fn refresh_channel(&self, channel: &Channel) {
        if !self.spec.lock().await.cids.iter().any(|c| c == &channel.cid) {
            return;
        }
        let sort = &self.sort;
        self.channels.update(|current| {
            if let Some(existing) = current.iter_mut().find(|c| c.cid == channel.cid) {
                *existing = channel.clone();
                sort.sort(current);
            }
        });
    }

    async fn add_channel(&self, snapshot: Channel) -> ChatResult<()> {
        let mut channel = snapshot;
        if self.ctx.client_state.is_online() {
            match Cid::parse(&channel.cid) {
                Ok(cid) => match self.ctx.api.watch_channel(&cid, self.ctx.message_limit).await {
                    Ok(fetched) => channel = fetched,
                    Err(e) => warn!(cid = %channel.cid, error = %e, "Could not fetch added channel"),
                },
                Err(e) => warn!(cid = %channel.cid, error = %e, "Added channel has a malformed cid"),
            }
        }
        self.ctx
            .repository
            .store_channels_with_messages(std::slice::from_ref(&channel))
            .await?;

        let spec = {
            let mut spec = self.spec.lock().await;
            spec.add_cids([channel.cid.as_str()]);
            spec.clone()
        };
        self.ctx.repository.insert_query_spec(&spec).await?;

        let sort = &self.sort;
        self.channels.update(|current| {
            current.retain(|c| c.cid != channel.cid);
            current.push(channel.clone());
            sort.sort(current);
        });
        debug!(query = %self.key(), cid = %channel.cid, "Channel added to query");
        Ok(())
    }

    async fn remove_channel(&self, cid: &str) -> ChatResult<()> {
        let spec = {
            let mut spec = self.spec.lock().await;
            spec.remove_cids(&[cid.to_string()]);
            spec.clone()
        };
        self.ctx.repository.insert_query_spec(&spec).await?;
        self.channels.update(|current| current.retain(|c| c.cid != cid));
        debug!(query = %self.key(), cid, "Channel removed from query");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use relais_shared::{Member, User};
    use relais_store::SqliteRepository;

    use super::*;
    use crate::testing::FakeApi;

    fn member_channel(id: &str, members: &[&str]) -> Channel {
        let mut channel = Channel::new("messaging", id);
        for m in members {
            channel.upsert_member(Member::new(User::new(*m)));
        }
        channel
    }

    fn query(api: Arc<FakeApi>, online: bool) -> (QueryChannelsLogic, Arc<dyn Repository>) {
        let repository: Arc<dyn Repository> = Arc::new(SqliteRepository::open_in_memory().unwrap());
        let client_state = Arc::new(ClientState::new());
        client_state.set_user(User::new("alice"));
        if online {
            client_state.set_connected("conn-1");
        }
        let ctx = QueryContext {
            repository: Arc::clone(&repository),
            api,
            client_state,
            registry: Weak::new(),
            message_limit: 10,
            user_presence: false,
        };
        let logic = QueryChannelsLogic::new(
            FilterObject::contains("members", "alice"),
            QuerySort::by_last_message(),
            ctx,
        );
        (logic, repository)
    }

    #[tokio::test]
    async fn offline_query_without_cache_is_not_an_error() {
        let (logic, _) = query(Arc::new(FakeApi::default()), false);

        let result = logic.query_offline(Pagination::first_page(30)).await;
        assert_eq!(result, Ok(None));
        assert!(!logic.is_loading());
        assert_eq!(logic.state(), QueryState::Idle);
    }

    #[tokio::test]
    async fn offline_query_with_empty_cache_resets_loading() {
        let (logic, repository) = query(Arc::new(FakeApi::default()), false);
        let spec = QuerySpec::new(logic.filter.clone(), logic.sort.clone());
        repository.insert_query_spec(&spec).await.unwrap();

        let result = logic.query_offline(Pagination::first_page(30)).await;
        assert_eq!(result, Ok(Some(Vec::new())));
        assert!(!logic.is_loading());
        assert_eq!(logic.state(), QueryState::Ready);
    }

    #[tokio::test]
    async fn concurrent_first_page_is_refused() {
        let (logic, _) = query(Arc::new(FakeApi::default()), false);
        let _held = logic.begin_loading(Pagination::first_page(30)).unwrap();

        let err = logic.query_offline(Pagination::first_page(30)).await;
        assert!(matches!(err, Err(ChatError::InProgress(_))));

        // The next page is tracked on its own.
        let more = logic
            .query_offline(Pagination {
                offset: 30,
                limit: 30,
            })
            .await;
        assert!(more.is_ok());
    }

    #[tokio::test]
    async fn online_query_persists_result_and_detects_end() {
        let api = Arc::new(FakeApi::default());
        api.add_channels(vec![
            member_channel("a", &["alice"]),
            member_channel("b", &["alice", "bob"]),
            member_channel("c", &["bob"]),
        ]);
        let (logic, repository) = query(Arc::clone(&api), true);

        let channels = logic.query(Pagination::first_page(30)).await.unwrap();
        assert_eq!(channels.len(), 2);
        assert!(logic.end_of_channels().await);
        assert_eq!(logic.state(), QueryState::Ready);

        let stored = repository
            .select_query_spec(&logic.filter, &logic.sort)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.cids.len(), 2);
    }

    #[tokio::test]
    async fn failed_first_page_flags_recovery() {
        let api = Arc::new(FakeApi::default());
        api.push_error(ChatError::server(500, 0, "boom"));
        let (logic, _) = query(Arc::clone(&api), true);

        assert!(logic.query(Pagination::first_page(30)).await.is_err());
        assert!(logic.recovery_needed());
        assert!(!logic.is_loading());
    }

    #[tokio::test]
    async fn events_add_and_remove_by_filter() {
        let (logic, _) = query(Arc::new(FakeApi::default()), false);

        let joined = member_channel("new", &["alice"]);
        let added = ChatEvent::channel(
            joined.cid.clone(),
            EventPayload::NotificationAddedToChannel {
                channel: joined.clone(),
                member: Member::new(User::new("alice")),
            },
        );
        let decision = logic.handle_event(&added, Some(&joined)).await;
        assert_eq!(decision, EventHandlingResult::Add(joined.clone()));
        logic.apply(decision).await.unwrap();
        assert_eq!(logic.cids().await, vec![joined.cid.clone()]);

        let left = member_channel("new", &["bob"]);
        let removed = ChatEvent::channel(
            left.cid.clone(),
            EventPayload::MemberRemoved {
                user_id: "alice".into(),
            },
        );
        let decision = logic.handle_event(&removed, Some(&left)).await;
        assert_eq!(decision, EventHandlingResult::Remove(left.cid.clone()));
        logic.apply(decision).await.unwrap();
        assert!(logic.cids().await.is_empty());
        assert!(logic.channels().is_empty());
    }

    #[tokio::test]
    async fn unrelated_events_are_skipped() {
        let (logic, _) = query(Arc::new(FakeApi::default()), false);
        let outsider = member_channel("x", &["bob"]);
        let event = ChatEvent::channel(
            outsider.cid.clone(),
            EventPayload::ChannelUpdated {
                channel: outsider.clone(),
            },
        );
        assert_eq!(
            logic.handle_event(&event, Some(&outsider)).await,
            EventHandlingResult::Skip
        );
    }

    #[tokio::test]
    async fn presence_changes_reach_listed_members() {
        let api = Arc::new(FakeApi::default());
        api.add_channels(vec![
            member_channel("a", &["alice", "bob"]),
            member_channel("b", &["alice"]),
        ]);
        let (logic, _) = query(Arc::clone(&api), true);
        logic.query(Pagination::first_page(30)).await.unwrap();

        let mut bob = User::new("bob");
        bob.online = true;
        let decision = logic
            .handle_event(
                &ChatEvent::global(EventPayload::UserPresenceChanged { user: bob }),
                None,
            )
            .await;

        assert_eq!(decision, EventHandlingResult::Skip);
        let channels = logic.channels();
        let a = channels.iter().find(|c| c.id == "a").unwrap();
        assert!(a.members["bob"].user.online);
        let b = channels.iter().find(|c| c.id == "b").unwrap();
        assert!(!b.members.contains_key("bob"));
    }
}
