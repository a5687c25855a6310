//! Fakes shared by the integration tests.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use relais_client::{AttachmentUploader, ChatApi, ClientConfig, ProgressCallback, QueryChannelsRequest};
use relais_shared::{
    Attachment, Channel, ChatError, ChatEvent, ChatResult, Cid, Message, Reaction, SyncStatus,
};

/// Backend holding channels in memory. Sent messages are appended to their
/// channel, like the real server does.
#[derive(Default)]
pub struct InMemoryBackend {
    channels: Mutex<BTreeMap<String, Channel>>,
    sent: Mutex<Vec<String>>,
    rejected: Mutex<Vec<String>>,
}

impl InMemoryBackend {
    pub fn with_channel(channel: Channel) -> Arc<Self> {
        let backend = Self::default();
        backend
            .channels
            .lock()
            .unwrap()
            .insert(channel.cid.clone(), channel);
        Arc::new(backend)
    }

    /// Reject any message with this text.
    pub fn reject_text(&self, text: &str) {
        self.rejected.lock().unwrap().push(text.to_string());
    }

    pub fn sent_ids(&self) -> Vec<String> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl ChatApi for InMemoryBackend {
    async fn create_channel(&self, channel: &Channel) -> ChatResult<Channel> {
        let mut created = channel.clone();
        created.sync_status = SyncStatus::Completed;
        self.channels
            .lock()
            .unwrap()
            .insert(created.cid.clone(), created.clone());
        Ok(created)
    }

    async fn query_channels(&self, request: &QueryChannelsRequest) -> ChatResult<Vec<Channel>> {
        let mut channels: Vec<Channel> = self
            .channels
            .lock()
            .unwrap()
            .values()
            .filter(|c| request.filter.matches(c))
            .cloned()
            .collect();
        request.sort.sort(&mut channels);
        Ok(channels
            .into_iter()
            .skip(request.offset as usize)
            .take(request.limit as usize)
            .collect())
    }

    async fn watch_channel(&self, cid: &Cid, _message_limit: u32) -> ChatResult<Channel> {
        self.channels
            .lock()
            .unwrap()
            .get(&cid.to_string())
            .cloned()
            .ok_or_else(|| ChatError::server(404, 16, "channel not found"))
    }

    async fn send_message(&self, message: &Message) -> ChatResult<Message> {
        if self.rejected.lock().unwrap().contains(&message.text) {
            return Err(ChatError::server(400, 4, "message rejected"));
        }
        let mut sent = message.clone();
        sent.created_at = Some(Utc::now());
        sent.sync_status = SyncStatus::Completed;
        self.sent.lock().unwrap().push(sent.id.clone());
        if let Some(channel) = self.channels.lock().unwrap().get_mut(&sent.cid) {
            channel.last_message_at = sent.created_at;
            channel.messages.push(sent.clone());
        }
        Ok(sent)
    }

    async fn update_message(&self, message: &Message) -> ChatResult<Message> {
        let mut updated = message.clone();
        updated.updated_at = Some(Utc::now());
        Ok(updated)
    }

    async fn delete_message(&self, message_id: &str, _hard: bool) -> ChatResult<Message> {
        Ok(Message {
            id: message_id.to_string(),
            deleted_at: Some(Utc::now()),
            ..Default::default()
        })
    }

    async fn send_reaction(&self, reaction: &Reaction, _enforce_unique: bool) -> ChatResult<Reaction> {
        Ok(reaction.clone())
    }

    async fn delete_reaction(&self, message_id: &str, _reaction_type: &str) -> ChatResult<Message> {
        Ok(Message {
            id: message_id.to_string(),
            ..Default::default()
        })
    }

    async fn sync_history(&self, _cids: &[String], _since: DateTime<Utc>) -> ChatResult<Vec<ChatEvent>> {
        Ok(Vec::new())
    }
}

/// Every upload succeeds immediately.
pub struct InstantUploader;

#[async_trait]
impl AttachmentUploader for InstantUploader {
    async fn upload(&self, _cid: &Cid, attachment: &Attachment, progress: ProgressCallback) -> ChatResult<String> {
        progress(attachment.file_size, attachment.file_size);
        Ok(format!("https://cdn.test/{}", attachment.name.clone().unwrap_or_default()))
    }
}

pub fn fast_config() -> ClientConfig {
    ClientConfig {
        retry_base_delay_ms: 1,
        retry_max_delay_ms: 5,
        ..ClientConfig::default()
    }
}
