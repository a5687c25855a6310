//! Message send, edit and delete pipelines.
//!
//! Every change is written to the store and to the channel's live state
//! before the network is touched. Network failures end up in the message's
//! sync status; only a permanent failure on the first online attempt is
//! returned to the caller. Nothing reaches the server while one of the
//! message's attachments is not uploaded.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::Utc;
use regex::Regex;
use relais_shared::{
    generate_id, ChatError, ChatResult, Cid, Message, MessageType, SyncStatus, UploadState,
};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::context::ChatContext;

/// `/word` at the start of the text.
const COMMAND_PATTERN: &str = r"^/\w+";

struct WaitTask {
    generation: u64,
    cancel: CancellationToken,
}

pub struct MessageSendingService {
    ctx: Arc<ChatContext>,
    command_pattern: Regex,
    wait_tasks: Mutex<HashMap<String, WaitTask>>,
    generation: AtomicU64,
}

/// Outcome of one network attempt, folded into the message's status.
enum Attempt {
    Confirmed(Message),
    Pending(Message),
}

impl MessageSendingService {
    pub fn new(ctx: Arc<ChatContext>) -> ChatResult<Arc<Self>> {
        let command_pattern = Regex::new(COMMAND_PATTERN)
            .map_err(|e| ChatError::Validation(format!("invalid command pattern: {e}")))?;
        Ok(Arc::new(Self {
            ctx,
            command_pattern,
            wait_tasks: Mutex::new(HashMap::new()),
            generation: AtomicU64::new(0),
        }))
    }

    // -----------------------------------------------------------------------
    // Send
    // -----------------------------------------------------------------------

    /// Send a new message to `cid`.
    ///
    /// Returns the locally stored message. With attachments still to upload
    /// the body is sent later, once every upload succeeded.
    pub async fn send(self: &Arc<Self>, cid: &Cid, message: Message) -> ChatResult<Message> {
        let message = self.prepare(cid, message)?;
        self.store(&message).await?;
        debug!(
            message_id = %message.id,
            cid = %message.cid,
            status = %message.sync_status,
            "Message stored locally"
        );

        if message.sync_status == SyncStatus::AwaitingAttachments {
            self.wait_for_attachments(&message).await;
            return Ok(message);
        }
        if !self.ctx.is_online() {
            return Ok(message);
        }
        self.send_online(message).await
    }

    fn prepare(&self, cid: &Cid, mut message: Message) -> ChatResult<Message> {
        let user_id = self
            .ctx
            .current_user_id()
            .ok_or_else(|| ChatError::Validation("no connected user".into()))?;

        if message.id.is_empty() {
            message.id = generate_id();
        }
        if message.cid.is_empty() {
            message.cid = cid.to_string();
        } else {
            Cid::parse(&message.cid)?;
        }
        message.user_id = user_id;
        message.created_locally_at = Some(Utc::now());
        init_upload_states(&mut message);

        let pending = message.has_pending_attachments();
        message.message_type = if pending || self.command_pattern.is_match(&message.text) {
            MessageType::Ephemeral
        } else {
            MessageType::Regular
        };
        message.sync_status = if pending {
            SyncStatus::AwaitingAttachments
        } else if self.ctx.is_online() {
            SyncStatus::InProgress
        } else {
            SyncStatus::SyncNeeded
        };
        Ok(message)
    }

    async fn send_online(&self, message: Message) -> ChatResult<Message> {
        let api = Arc::clone(&self.ctx.api);
        let result = self
            .ctx
            .with_retry(|| {
                let api = Arc::clone(&api);
                let message = message.clone();
                async move { api.send_message(&message).await }
            })
            .await;
        match self.settle(message, result).await? {
            Attempt::Confirmed(sent) => {
                info!(message_id = %sent.id, cid = %sent.cid, "Message sent");
                Ok(sent)
            }
            Attempt::Pending(pending) => Ok(pending),
        }
    }

    async fn update_online(&self, message: Message) -> ChatResult<Message> {
        let api = Arc::clone(&self.ctx.api);
        let result = self
            .ctx
            .with_retry(|| {
                let api = Arc::clone(&api);
                let message = message.clone();
                async move { api.update_message(&message).await }
            })
            .await;
        match self.settle(message, result).await? {
            Attempt::Confirmed(m) | Attempt::Pending(m) => Ok(m),
        }
    }

    /// A message the server already has is updated; any other is sent.
    async fn push_online(&self, message: Message) -> ChatResult<Message> {
        if message.created_at.is_some() {
            self.update_online(message).await
        } else {
            self.send_online(message).await
        }
    }

    // -----------------------------------------------------------------------
    // Attachments
    // -----------------------------------------------------------------------

    /// Start the upload job and a task that sends the body once it is done.
    /// A second call for the same message supersedes the first task.
    async fn wait_for_attachments(self: &Arc<Self>, message: &Message) {
        let cid = match Cid::parse(&message.cid) {
            Ok(cid) => cid,
            Err(e) => {
                warn!(message_id = %message.id, error = %e, "Cannot upload for malformed cid");
                return;
            }
        };

        // Subscribe before anything else so no update is missed.
        let updates = self.ctx.uploads.subscribe();

        let generation = self.generation.fetch_add(1, Ordering::SeqCst);
        let cancel = self.ctx.shutdown.child_token();
        let previous = self.wait_tasks.lock().await.insert(
            message.id.clone(),
            WaitTask {
                generation,
                cancel: cancel.clone(),
            },
        );
        if let Some(previous) = previous {
            debug!(message_id = %message.id, "Superseding attachment wait");
            previous.cancel.cancel();
        }

        self.ctx.uploads.enqueue(cid, message.id.clone()).await;

        let service = Arc::clone(self);
        let message_id = message.id.clone();
        tokio::spawn(async move {
            service.await_uploads(&message_id, updates, cancel).await;
            service.finish_wait(&message_id, generation).await;
        });
    }

    async fn await_uploads(
        &self,
        message_id: &str,
        mut updates: broadcast::Receiver<Message>,
        cancel: CancellationToken,
    ) {
        // Uploads that finished before the subscription send no further
        // update, so start from the stored copy.
        let mut snapshot = match self.ctx.repository.select_message(message_id).await {
            Ok(Some(stored)) => Some(stored),
            Ok(None) => return,
            Err(e) => {
                warn!(message_id, error = %e, "Cannot read message awaiting uploads");
                None
            }
        };

        loop {
            if let Some(current) = snapshot.take() {
                if cancel.is_cancelled() {
                    return;
                }
                match self.on_attachments_changed(current).await {
                    Ok(true) => return,
                    Ok(false) => {}
                    Err(e) => {
                        warn!(message_id, error = %e, "Attachment wait failed");
                        return;
                    }
                }
            }

            let update = tokio::select! {
                _ = cancel.cancelled() => {
                    debug!(message_id, "Attachment wait cancelled");
                    return;
                }
                update = updates.recv() => update,
            };
            snapshot = match update {
                Ok(update) if update.id == message_id => Some(update),
                Ok(_) => None,
                Err(RecvError::Lagged(skipped)) => {
                    debug!(message_id, skipped, "Upload updates lagged");
                    self.ctx.repository.select_message(message_id).await.ok().flatten()
                }
                Err(RecvError::Closed) => return,
            };
        }
    }

    /// Returns whether waiting is over.
    async fn on_attachments_changed(&self, snapshot: Message) -> ChatResult<bool> {
        if snapshot.has_failed_attachments() {
            let mut failed = snapshot;
            failed.sync_status = SyncStatus::FailedPermanently;
            self.store(&failed).await?;
            warn!(message_id = %failed.id, "Attachment upload failed, message will not be sent");
            return Ok(true);
        }

        if snapshot.has_pending_attachments() {
            // Progress only; show it.
            self.publish(&snapshot).await;
            return Ok(false);
        }

        let mut ready = snapshot;
        if !self.command_pattern.is_match(&ready.text) {
            ready.message_type = MessageType::Regular;
        }
        ready.sync_status = if self.ctx.is_online() {
            SyncStatus::InProgress
        } else {
            SyncStatus::SyncNeeded
        };
        self.store(&ready).await?;
        debug!(message_id = %ready.id, "Attachments uploaded");

        if ready.sync_status == SyncStatus::InProgress {
            if let Err(e) = self.push_online(ready).await {
                warn!(error = %e, "Message rejected after upload");
            }
        }
        Ok(true)
    }

    async fn finish_wait(&self, message_id: &str, generation: u64) {
        let mut tasks = self.wait_tasks.lock().await;
        if tasks.get(message_id).map(|t| t.generation) == Some(generation) {
            tasks.remove(message_id);
        }
    }

    async fn cancel_wait(&self, message_id: &str) {
        if let Some(task) = self.wait_tasks.lock().await.remove(message_id) {
            debug!(message_id, "Attachment wait cancelled by delete");
            task.cancel.cancel();
        }
    }

    pub async fn has_wait_task(&self, message_id: &str) -> bool {
        self.wait_tasks.lock().await.contains_key(message_id)
    }

    /// Park a message until its uploads finish. Returns it as stored.
    async fn park_until_uploaded(self: &Arc<Self>, mut message: Message) -> ChatResult<Message> {
        message.sync_status = SyncStatus::AwaitingAttachments;
        self.store(&message).await?;
        if !self.has_wait_task(&message.id).await {
            self.wait_for_attachments(&message).await;
        }
        debug!(message_id = %message.id, "Waiting for attachments before syncing");
        Ok(message)
    }

    // -----------------------------------------------------------------------
    // Edit / delete
    // -----------------------------------------------------------------------

    pub async fn update(self: &Arc<Self>, message: Message) -> ChatResult<Message> {
        if message.id.is_empty() {
            return Err(ChatError::Validation("message id is empty".into()));
        }
        Cid::parse(&message.cid)?;

        let mut message = message;
        if let Some(stored) = self.ctx.repository.select_message(&message.id).await? {
            carry_upload_progress(&stored, &mut message);
        }
        init_upload_states(&mut message);
        message.updated_locally_at = Some(Utc::now());

        if message.has_pending_attachments() {
            return self.park_until_uploaded(message).await;
        }

        message.sync_status = if self.ctx.is_online() {
            SyncStatus::InProgress
        } else {
            SyncStatus::SyncNeeded
        };
        self.store(&message).await?;
        if !self.ctx.is_online() {
            return Ok(message);
        }
        self.update_online(message).await
    }

    /// Delete a message. One that never reached the server is removed
    /// locally; anything else is soft-deleted and synced.
    pub async fn delete(&self, message_id: &str, hard: bool) -> ChatResult<Message> {
        self.cancel_wait(message_id).await;

        let Some(mut message) = self.ctx.repository.select_message(message_id).await? else {
            return Err(ChatError::Validation(format!("unknown message '{message_id}'")));
        };

        if message.created_at.is_none() && message.sync_status != SyncStatus::InProgress {
            self.remove_locally(&message).await?;
            message.deleted_at = Some(Utc::now());
            info!(message_id, "Unsent message deleted locally");
            return Ok(message);
        }

        message.deleted_at = Some(Utc::now());
        message.hard_delete = hard;
        message.sync_status = if self.ctx.is_online() {
            SyncStatus::InProgress
        } else {
            SyncStatus::SyncNeeded
        };
        self.store(&message).await?;
        if !self.ctx.is_online() {
            return Ok(message);
        }

        let api = Arc::clone(&self.ctx.api);
        let id = message.id.clone();
        let result = self
            .ctx
            .with_retry(|| {
                let api = Arc::clone(&api);
                let id = id.clone();
                async move { api.delete_message(&id, hard).await }
            })
            .await;
        self.finish_delete(message, result).await
    }

    async fn finish_delete(&self, message: Message, result: ChatResult<Message>) -> ChatResult<Message> {
        match self.settle(message, result).await? {
            Attempt::Confirmed(deleted) => {
                if deleted.hard_delete {
                    self.remove_locally(&deleted).await?;
                }
                Ok(deleted)
            }
            Attempt::Pending(m) => Ok(m),
        }
    }

    // -----------------------------------------------------------------------
    // Retry sweep
    // -----------------------------------------------------------------------

    /// One attempt at syncing a pending message, chosen by what changed
    /// locally: a deletion, an edit, or the initial send.
    pub async fn retry_message(self: &Arc<Self>, message: Message) -> ChatResult<Message> {
        if message.deleted_at.is_none() {
            if message.has_failed_attachments() {
                let mut failed = message;
                failed.sync_status = SyncStatus::FailedPermanently;
                self.store(&failed).await?;
                return Ok(failed);
            }
            if message.has_pending_attachments() {
                // The upload job may have died with the previous process.
                return self.park_until_uploaded(message).await;
            }
        }

        let api = &self.ctx.api;
        if message.deleted_at.is_some() {
            debug!(message_id = %message.id, hard = message.hard_delete, "Retrying delete");
            let result = api.delete_message(&message.id, message.hard_delete).await;
            return self.finish_delete(message, result).await;
        }

        let result = if message.updated_locally_at.is_some() && message.created_at.is_some() {
            debug!(message_id = %message.id, "Retrying update");
            api.update_message(&message).await
        } else {
            debug!(message_id = %message.id, "Retrying send");
            let mut regular = message.clone();
            if !self.command_pattern.is_match(&regular.text) {
                regular.message_type = MessageType::Regular;
            }
            api.send_message(&regular).await
        };

        match self.settle(message, result).await? {
            Attempt::Confirmed(m) | Attempt::Pending(m) => Ok(m),
        }
    }

    // -----------------------------------------------------------------------
    // Helpers
    // -----------------------------------------------------------------------

    /// Fold a network result into the stored message.
    async fn settle(&self, local: Message, result: ChatResult<Message>) -> ChatResult<Attempt> {
        match result {
            Ok(remote) => {
                let merged = merge_server_copy(&local, remote);
                self.store(&merged).await?;
                Ok(Attempt::Confirmed(merged))
            }
            Err(e) if e.is_permanent() => {
                let mut failed = local;
                failed.sync_status = SyncStatus::FailedPermanently;
                self.store(&failed).await?;
                warn!(message_id = %failed.id, error = %e, "Message rejected by server");
                Err(e)
            }
            Err(e) => {
                let mut pending = local;
                pending.sync_status = SyncStatus::SyncNeeded;
                self.store(&pending).await?;
                debug!(message_id = %pending.id, error = %e, "Message left for the next sweep");
                Ok(Attempt::Pending(pending))
            }
        }
    }

    async fn store(&self, message: &Message) -> ChatResult<()> {
        self.ctx.repository.insert_message(message).await?;
        self.publish(message).await;
        Ok(())
    }

    async fn publish(&self, message: &Message) {
        if let Some(logic) = self.ctx.registry.active_channel_str(&message.cid).await {
            logic.upsert_message(message.clone()).await;
        }
    }

    pub(crate) async fn remove_locally(&self, message: &Message) -> ChatResult<()> {
        self.ctx.repository.delete_message(&message.id).await?;
        if let Some(logic) = self.ctx.registry.active_channel_str(&message.cid).await {
            logic.remove_message(&message.id).await;
        }
        Ok(())
    }
}

/// Give new attachments an upload id and their first state: idle when a
/// local file has to be uploaded, success when the asset is already remote.
fn init_upload_states(message: &mut Message) {
    for attachment in &mut message.attachments {
        if attachment.upload_id.is_some() && attachment.upload_state.is_some() {
            continue;
        }
        attachment.upload_id.get_or_insert_with(generate_id);
        attachment.upload_state = Some(if attachment.upload.is_some() {
            UploadState::Idle
        } else {
            UploadState::Success
        });
    }
}

/// The caller's copy of an edited message may predate upload progress.
fn carry_upload_progress(stored: &Message, message: &mut Message) {
    for attachment in &mut message.attachments {
        let Some(known) = stored
            .attachments
            .iter()
            .find(|a| a.upload_id.is_some() && a.upload_id == attachment.upload_id)
        else {
            continue;
        };
        attachment.upload_state = known.upload_state.clone();
        attachment.asset_url = known.asset_url.clone();
        attachment.upload = known.upload.clone();
    }
}


/// The server's copy wins, except for fields only the client knows.
fn merge_server_copy(local: &Message, mut remote: Message) -> Message {
    remote.sync_status = SyncStatus::Completed;
    if remote.id.is_empty() {
        remote.id = local.id.clone();
    }
    if remote.cid.is_empty() {
        remote.cid = local.cid.clone();
    }
    remote.created_locally_at = local.created_locally_at;
    remote.updated_locally_at = local.updated_locally_at;
    remote.hard_delete = local.hard_delete;
    if remote.own_reactions.is_empty() {
        remote.own_reactions = local.own_reactions.clone();
    }
    remote
}
