//! Scriptable collaborators for unit tests.

use std::collections::{BTreeMap, HashSet, VecDeque};
use std::path::PathBuf;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use relais_shared::{
    Attachment, Channel, ChatError, ChatEvent, ChatResult, Cid, Message, Reaction, SyncStatus,
};
use relais_store::{Repository, SqliteRepository};
use tokio::sync::{watch, Mutex};
use tokio_util::sync::CancellationToken;

use crate::api::{ChatApi, QueryChannelsRequest};
use crate::config::ClientConfig;
use crate::context::ChatContext;
use crate::retry::DefaultRetryPolicy;
use crate::state::{ClientState, GlobalState, LogicRegistry};
use crate::upload::{AttachmentUploader, ProgressCallback, UploadJobs};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApiCall {
    CreateChannel(String),
    QueryChannels { offset: u32, limit: u32 },
    WatchChannel(String),
    SendMessage(String),
    UpdateMessage(String),
    /// Message id and whether the delete is hard.
    DeleteMessage(String, bool),
    SendReaction(String, String),
    DeleteReaction(String, String),
    SyncHistory(Vec<String>),
}

/// In-memory backend. Queued errors are returned by the next calls, in order.
#[derive(Default)]
pub struct FakeApi {
    calls: StdMutex<Vec<ApiCall>>,
    errors: StdMutex<VecDeque<ChatError>>,
    channels: StdMutex<BTreeMap<String, Channel>>,
    history: StdMutex<Vec<ChatEvent>>,
}

impl FakeApi {
    pub fn add_channels(&self, channels: Vec<Channel>) {
        let mut stored = self.channels.lock().unwrap();
        for channel in channels {
            stored.insert(channel.cid.clone(), channel);
        }
    }

    /// Events served by `sync_history`.
    pub fn add_history(&self, events: Vec<ChatEvent>) {
        self.history.lock().unwrap().extend(events);
    }

    pub fn push_error(&self, error: ChatError) {
        self.errors.lock().unwrap().push_back(error);
    }

    pub fn calls(&self) -> Vec<ApiCall> {
        self.calls.lock().unwrap().clone()
    }

    /// Poll until `call` was made, for work finished by background tasks.
    pub async fn wait_for_call(&self, call: ApiCall) -> bool {
        for _ in 0..200 {
            if self.calls().contains(&call) {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        false
    }

    fn record(&self, call: ApiCall) -> ChatResult<()> {
        self.calls.lock().unwrap().push(call);
        match self.errors.lock().unwrap().pop_front() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl ChatApi for FakeApi {
    async fn create_channel(&self, channel: &Channel) -> ChatResult<Channel> {
        self.record(ApiCall::CreateChannel(channel.cid.clone()))?;
        let mut created = channel.clone();
        created.created_at.get_or_insert_with(Utc::now);
        created.sync_status = SyncStatus::Completed;
        self.add_channels(vec![created.clone()]);
        Ok(created)
    }

    async fn query_channels(&self, request: &QueryChannelsRequest) -> ChatResult<Vec<Channel>> {
        self.record(ApiCall::QueryChannels {
            offset: request.offset,
            limit: request.limit,
        })?;
        let mut matching: Vec<Channel> = self
            .channels
            .lock()
            .unwrap()
            .values()
            .filter(|c| request.filter.matches(c))
            .cloned()
            .collect();
        request.sort.sort(&mut matching);
        Ok(matching
            .into_iter()
            .skip(request.offset as usize)
            .take(request.limit as usize)
            .collect())
    }

    async fn watch_channel(&self, cid: &Cid, _message_limit: u32) -> ChatResult<Channel> {
        self.record(ApiCall::WatchChannel(cid.to_string()))?;
        self.channels
            .lock()
            .unwrap()
            .get(&cid.to_string())
            .cloned()
            .ok_or_else(|| ChatError::server(404, 16, "channel not found"))
    }

    async fn send_message(&self, message: &Message) -> ChatResult<Message> {
        self.record(ApiCall::SendMessage(message.id.clone()))?;
        let mut sent = message.clone();
        sent.created_at = Some(Utc::now());
        Ok(sent)
    }

    async fn update_message(&self, message: &Message) -> ChatResult<Message> {
        self.record(ApiCall::UpdateMessage(message.id.clone()))?;
        let mut updated = message.clone();
        updated.updated_at = Some(Utc::now());
        Ok(updated)
    }

    async fn delete_message(&self, message_id: &str, hard: bool) -> ChatResult<Message> {
        self.record(ApiCall::DeleteMessage(message_id.to_string(), hard))?;
        Ok(Message {
            id: message_id.to_string(),
            deleted_at: Some(Utc::now()),
            ..Default::default()
        })
    }

    async fn send_reaction(&self, reaction: &Reaction, _enforce_unique: bool) -> ChatResult<Reaction> {
        self.record(ApiCall::SendReaction(
            reaction.message_id.clone(),
            reaction.reaction_type.clone(),
        ))?;
        let mut sent = reaction.clone();
        sent.created_at = Some(Utc::now());
        Ok(sent)
    }

    async fn delete_reaction(&self, message_id: &str, reaction_type: &str) -> ChatResult<Message> {
        self.record(ApiCall::DeleteReaction(
            message_id.to_string(),
            reaction_type.to_string(),
        ))?;
        Ok(Message {
            id: message_id.to_string(),
            ..Default::default()
        })
    }

    async fn sync_history(&self, cids: &[String], since: DateTime<Utc>) -> ChatResult<Vec<ChatEvent>> {
        self.record(ApiCall::SyncHistory(cids.to_vec()))?;
        Ok(self
            .history
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.created_at > since)
            .filter(|e| e.cid.as_ref().map_or(true, |cid| cids.contains(cid)))
            .cloned()
            .collect())
    }
}

struct UploaderInner {
    failing: Mutex<HashSet<PathBuf>>,
    gate: watch::Sender<bool>,
}

/// Uploader that succeeds unless told otherwise. `hold` parks every upload
/// until `release`.
#[derive(Clone)]
pub struct FakeUploader {
    inner: Arc<UploaderInner>,
}

impl Default for FakeUploader {
    fn default() -> Self {
        let (gate, _) = watch::channel(false);
        Self {
            inner: Arc::new(UploaderInner {
                failing: Mutex::new(HashSet::new()),
                gate,
            }),
        }
    }
}

impl FakeUploader {
    pub async fn fail_path(&self, path: &str) {
        self.inner.failing.lock().await.insert(PathBuf::from(path));
    }

    pub async fn hold(&self) {
        self.inner.gate.send_replace(true);
    }

    pub async fn release(&self) {
        self.inner.gate.send_replace(false);
    }
}

#[async_trait]
impl AttachmentUploader for FakeUploader {
    async fn upload(&self, _cid: &Cid, attachment: &Attachment, progress: ProgressCallback) -> ChatResult<String> {
        let mut gate = self.inner.gate.subscribe();
        gate.wait_for(|held| !*held)
            .await
            .map_err(|_| ChatError::Cancelled)?;

        let path = attachment.upload.clone().unwrap_or_default();
        if self.inner.failing.lock().await.contains(&path) {
            return Err(ChatError::network(
                relais_shared::NetworkErrorKind::Io,
                format!("cannot read {}", path.display()),
            ));
        }
        progress(attachment.file_size, attachment.file_size);
        Ok(format!("https://cdn.test/{}", path.display()))
    }
}

/// Default configuration with a fast retry policy.
pub fn test_config() -> ClientConfig {
    ClientConfig {
        retry_base_delay_ms: 1,
        retry_max_delay_ms: 5,
        ..ClientConfig::default()
    }
}

pub async fn test_context(api: Arc<FakeApi>, uploader: FakeUploader) -> Arc<ChatContext> {
    test_context_with_config(api, uploader, test_config()).await
}

/// Context over an in-memory store.
pub async fn test_context_with_config(
    api: Arc<FakeApi>,
    uploader: FakeUploader,
    config: ClientConfig,
) -> Arc<ChatContext> {
    let repository: Arc<dyn Repository> = Arc::new(SqliteRepository::open_in_memory().unwrap());
    let retry_policy = Arc::new(DefaultRetryPolicy::from_config(&config));
    Arc::new(ChatContext {
        uploads: UploadJobs::new(Arc::new(uploader), Arc::clone(&repository)),
        config,
        repository,
        api,
        retry_policy,
        client_state: Arc::new(ClientState::new()),
        global_state: Arc::new(GlobalState::new()),
        registry: Arc::new(LogicRegistry::new()),
        shutdown: CancellationToken::new(),
    })
}
