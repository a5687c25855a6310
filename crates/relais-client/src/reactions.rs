//! Reaction add/remove pipeline.

use std::sync::Arc;

use chrono::Utc;
use relais_shared::{ChatError, ChatResult, Message, Reaction, SyncStatus};
use tracing::{debug, info, warn};

use crate::context::ChatContext;

pub struct ReactionSyncService {
    ctx: Arc<ChatContext>,
}

impl ReactionSyncService {
    pub fn new(ctx: Arc<ChatContext>) -> Self {
        Self { ctx }
    }

    /// Add a reaction. With `enforce_unique` the user's other reactions on
    /// the message are dropped first.
    pub async fn add(&self, reaction: Reaction, enforce_unique: bool) -> ChatResult<Reaction> {
        let mut reaction = self.prepare(reaction)?;
        reaction.enforce_unique = enforce_unique;
        reaction.created_locally_at = Some(Utc::now());
        reaction.deleted_at = None;

        if enforce_unique {
            self.soft_delete_other_reactions(&reaction).await?;
        }
        self.ctx.repository.insert_reaction(&reaction).await?;
        self.update_message_aggregates(&reaction, false).await?;

        if !self.ctx.is_online() {
            return Ok(reaction);
        }
        let api = Arc::clone(&self.ctx.api);
        let result = self
            .ctx
            .with_retry(|| {
                let api = Arc::clone(&api);
                let reaction = reaction.clone();
                async move { api.send_reaction(&reaction, enforce_unique).await }
            })
            .await
            .map(|_| ());
        self.settle(reaction, result).await
    }

    pub async fn remove(&self, reaction: Reaction) -> ChatResult<Reaction> {
        let mut reaction = self.prepare(reaction)?;
        reaction.deleted_at = Some(Utc::now());

        self.ctx.repository.insert_reaction(&reaction).await?;
        self.update_message_aggregates(&reaction, true).await?;

        if !self.ctx.is_online() {
            return Ok(reaction);
        }
        let api = Arc::clone(&self.ctx.api);
        let result = self
            .ctx
            .with_retry(|| {
                let api = Arc::clone(&api);
                let message_id = reaction.message_id.clone();
                let reaction_type = reaction.reaction_type.clone();
                async move { api.delete_reaction(&message_id, &reaction_type).await }
            })
            .await
            .map(|_| ());
        self.settle(reaction, result).await
    }

    /// One attempt at syncing a pending reaction from the sweep.
    pub async fn retry_reaction(&self, reaction: Reaction) -> ChatResult<Reaction> {
        let result = if reaction.deleted_at.is_some() {
            debug!(message_id = %reaction.message_id, kind = %reaction.reaction_type, "Retrying reaction delete");
            self.ctx
                .api
                .delete_reaction(&reaction.message_id, &reaction.reaction_type)
                .await
                .map(|_| ())
        } else {
            debug!(message_id = %reaction.message_id, kind = %reaction.reaction_type, "Retrying reaction send");
            self.ctx
                .api
                .send_reaction(&reaction, reaction.enforce_unique)
                .await
                .map(|_| ())
        };
        self.settle(reaction, result).await
    }

    fn prepare(&self, mut reaction: Reaction) -> ChatResult<Reaction> {
        if reaction.message_id.is_empty() {
            return Err(ChatError::Validation("reaction message id is empty".into()));
        }
        if reaction.reaction_type.is_empty() {
            return Err(ChatError::Validation("reaction type is empty".into()));
        }
        reaction.user_id = self
            .ctx
            .current_user_id()
            .ok_or_else(|| ChatError::Validation("no connected user".into()))?;
        reaction.sync_status = if self.ctx.is_online() {
            SyncStatus::InProgress
        } else {
            SyncStatus::SyncNeeded
        };
        Ok(reaction)
    }

    async fn soft_delete_other_reactions(&self, reaction: &Reaction) -> ChatResult<()> {
        let existing = self
            .ctx
            .repository
            .select_user_reactions_to_message(&reaction.message_id, &reaction.user_id)
            .await?;
        let now = Utc::now();
        for mut old in existing {
            if old.reaction_type == reaction.reaction_type || old.deleted_at.is_some() {
                continue;
            }
            old.deleted_at = Some(now);
            self.ctx.repository.insert_reaction(&old).await?;
            debug!(message_id = %old.message_id, kind = %old.reaction_type, "Replaced by unique reaction");
        }
        Ok(())
    }

    /// Recompute the parent message's aggregates, preferring the live copy.
    async fn update_message_aggregates(&self, reaction: &Reaction, removed: bool) -> ChatResult<()> {
        let live = match self.ctx.repository.select_message(&reaction.message_id).await? {
            Some(stored) => self.ctx.registry.active_channel_str(&stored.cid).await,
            None => {
                debug!(message_id = %reaction.message_id, "Reaction to unknown message, no aggregates");
                return Ok(());
            }
        };

        let updated: Option<Message> = match live {
            Some(logic) => logic.apply_reaction(reaction, removed).await,
            None => None,
        };
        let updated = match updated {
            Some(message) => message,
            None => {
                let Some(mut stored) = self.ctx.repository.select_message(&reaction.message_id).await? else {
                    return Ok(());
                };
                if removed {
                    stored.remove_reaction(reaction);
                } else {
                    stored.add_reaction(reaction, true, reaction.enforce_unique);
                }
                stored
            }
        };
        self.ctx.repository.insert_message(&updated).await?;
        Ok(())
    }

    async fn settle(&self, mut reaction: Reaction, result: ChatResult<()>) -> ChatResult<Reaction> {
        match result {
            Ok(()) => {
                reaction.sync_status = SyncStatus::Completed;
                self.ctx.repository.insert_reaction(&reaction).await?;
                info!(message_id = %reaction.message_id, kind = %reaction.reaction_type, "Reaction synced");
                Ok(reaction)
            }
            Err(e) if e.is_permanent() => {
                reaction.sync_status = SyncStatus::FailedPermanently;
                self.ctx.repository.insert_reaction(&reaction).await?;
                warn!(message_id = %reaction.message_id, error = %e, "Reaction rejected by server");
                Err(e)
            }
            Err(e) => {
                reaction.sync_status = SyncStatus::SyncNeeded;
                self.ctx.repository.insert_reaction(&reaction).await?;
                debug!(message_id = %reaction.message_id, error = %e, "Reaction left for the next sweep");
                Ok(reaction)
            }
        }
    }
}
