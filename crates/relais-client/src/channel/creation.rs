//! Creating channels locally first, then on the server.

use std::sync::Arc;

use chrono::Utc;
use relais_shared::{Channel, ChatError, ChatResult, Cid, Member, SyncStatus, User};
use tracing::{debug, info, warn};

use crate::context::ChatContext;

pub struct ChannelCreationService {
    ctx: Arc<ChatContext>,
}

impl ChannelCreationService {
    pub fn new(ctx: Arc<ChatContext>) -> Self {
        Self { ctx }
    }

    /// Store the channel, then ask the server to create it.
    ///
    /// The creator becomes a member. Like message sends, a transient failure
    /// leaves the channel `SYNC_NEEDED` for the next sweep.
    pub async fn create(&self, channel: Channel) -> ChatResult<Channel> {
        let user_id = self
            .ctx
            .current_user_id()
            .ok_or_else(|| ChatError::Validation("no connected user".into()))?;

        let mut channel = channel;
        let cid = if channel.cid.is_empty() {
            if channel.channel_type.is_empty() || channel.id.is_empty() {
                return Err(ChatError::Validation("channel type and id are required".into()));
            }
            Cid::new(channel.channel_type.clone(), channel.id.clone())
        } else {
            Cid::parse(&channel.cid)?
        };
        channel.cid = cid.to_string();
        channel.channel_type = cid.channel_type.clone();
        channel.id = cid.id.clone();
        channel.created_by = Some(user_id.clone());
        channel.created_at.get_or_insert_with(Utc::now);
        if !channel.members.contains_key(&user_id) {
            channel.upsert_member(Member::new(User::new(user_id)));
        }
        channel.member_count = channel.member_count.max(channel.members.len() as u32);
        channel.sync_status = if self.ctx.is_online() {
            SyncStatus::InProgress
        } else {
            SyncStatus::SyncNeeded
        };
        self.store(&channel).await?;
        debug!(cid = %channel.cid, status = %channel.sync_status, "Channel stored locally");

        if !self.ctx.is_online() {
            return Ok(channel);
        }

        let api = Arc::clone(&self.ctx.api);
        let result = self
            .ctx
            .with_retry(|| {
                let api = Arc::clone(&api);
                let channel = channel.clone();
                async move { api.create_channel(&channel).await }
            })
            .await;
        self.settle(channel, result).await
    }

    /// One attempt at creating a pending channel from the sweep.
    pub async fn retry_channel(&self, channel: Channel) -> ChatResult<Channel> {
        debug!(cid = %channel.cid, "Retrying channel creation");
        let result = self.ctx.api.create_channel(&channel).await;
        self.settle(channel, result).await
    }

    async fn settle(&self, local: Channel, result: ChatResult<Channel>) -> ChatResult<Channel> {
        match result {
            Ok(mut created) => {
                created.sync_status = SyncStatus::Completed;
                self.store(&created).await?;
                info!(cid = %created.cid, "Channel created");
                Ok(created)
            }
            Err(e) if e.is_permanent() => {
                let mut failed = local;
                failed.sync_status = SyncStatus::FailedPermanently;
                self.store(&failed).await?;
                warn!(cid = %failed.cid, error = %e, "Channel rejected by server");
                Err(e)
            }
            Err(e) => {
                let mut pending = local;
                pending.sync_status = SyncStatus::SyncNeeded;
                self.store(&pending).await?;
                debug!(cid = %pending.cid, error = %e, "Channel left for the next sweep");
                Ok(pending)
            }
        }
    }

    async fn store(&self, channel: &Channel) -> ChatResult<()> {
        self.ctx
            .repository
            .store_channels_with_messages(std::slice::from_ref(channel))
            .await?;
        if let Some(logic) = self.ctx.registry.active_channel_str(&channel.cid).await {
            logic.update_data_from_channel(channel.clone()).await;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{test_context, ApiCall, FakeApi, FakeUploader};

    async fn service(api: Arc<FakeApi>, online: bool) -> ChannelCreationService {
        let ctx = test_context(api, FakeUploader::default()).await;
        ctx.client_state.set_user(User::new("alice"));
        if online {
            ctx.client_state.set_connected("conn-1");
        }
        ChannelCreationService::new(ctx)
    }

    #[tokio::test]
    async fn offline_creation_is_stored_pending() {
        let api = Arc::new(FakeApi::default());
        let service = service(Arc::clone(&api), false).await;

        let created = service.create(Channel::new("messaging", "team")).await.unwrap();
        assert_eq!(created.sync_status, SyncStatus::SyncNeeded);
        assert!(created.members.contains_key("alice"));
        assert!(api.calls().is_empty());

        let stored = service.ctx.repository.select_channel("messaging:team").await.unwrap().unwrap();
        assert_eq!(stored.sync_status, SyncStatus::SyncNeeded);
    }

    #[tokio::test]
    async fn transient_failure_is_retried_then_completes() {
        let api = Arc::new(FakeApi::default());
        api.push_error(ChatError::server(429, 9, "slow down"));
        let service = service(Arc::clone(&api), true).await;

        let created = service.create(Channel::new("messaging", "team")).await.unwrap();
        assert_eq!(created.sync_status, SyncStatus::Completed);
        assert_eq!(
            api.calls(),
            vec![
                ApiCall::CreateChannel("messaging:team".into()),
                ApiCall::CreateChannel("messaging:team".into()),
            ]
        );
    }

    #[tokio::test]
    async fn missing_identity_is_rejected() {
        let service = service(Arc::new(FakeApi::default()), true).await;
        let mut channel = Channel::new("messaging", "x");
        channel.cid = "broken".into();
        assert!(matches!(
            service.create(channel).await,
            Err(ChatError::Validation(_))
        ));
    }
}
