//! Attachment upload jobs.
//!
//! A job is keyed by `(cid, message_id)` and drives every attachment of the
//! message that is not uploaded yet. All progress lands in the repository,
//! so a job interrupted by a restart is simply enqueued again and resumes
//! from the stored attachment states.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use relais_shared::{Attachment, ChatError, ChatResult, Cid, Message, UploadState};
use relais_store::Repository;
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, info, trace, warn};

/// Progress sink handed to uploaders: `(bytes_uploaded, total_bytes)`.
pub type ProgressCallback = Arc<dyn Fn(u64, u64) + Send + Sync>;

/// Transfer collaborator: moves one local file to the backend's CDN.
#[async_trait]
pub trait AttachmentUploader: Send + Sync {
    /// Returns the remote asset URL.
    async fn upload(
        &self,
        cid: &Cid,
        attachment: &Attachment,
        progress: ProgressCallback,
    ) -> ChatResult<String>;
}

/// Runs upload jobs and broadcasts message snapshots as attachments change.
pub struct UploadJobs {
    uploader: Arc<dyn AttachmentUploader>,
    repository: Arc<dyn Repository>,
    updates: broadcast::Sender<Message>,
    running: Mutex<HashSet<String>>,
}

impl UploadJobs {
    pub fn new(uploader: Arc<dyn AttachmentUploader>, repository: Arc<dyn Repository>) -> Arc<Self> {
        let (updates, _) = broadcast::channel(64);
        Arc::new(Self {
            uploader,
            repository,
            updates,
            running: Mutex::new(HashSet::new()),
        })
    }

    /// Receive every message whose attachment states changed.
    pub fn subscribe(&self) -> broadcast::Receiver<Message> {
        self.updates.subscribe()
    }

    /// Start the job for `message_id` unless it is already running.
    pub async fn enqueue(self: &Arc<Self>, cid: Cid, message_id: String) {
        if !self.running.lock().await.insert(message_id.clone()) {
            debug!(message_id = %message_id, "Upload job already running");
            return;
        }

        let jobs = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(e) = jobs.run(&cid, &message_id).await {
                warn!(message_id = %message_id, error = %e, "Upload job aborted");
            }
            jobs.running.lock().await.remove(&message_id);
        });
    }

    async fn run(&self, cid: &Cid, message_id: &str) -> ChatResult<()> {
        let Some(message) = self.repository.select_message(message_id).await? else {
            debug!(message_id, "Message gone, nothing to upload");
            return Ok(());
        };

        let pending: Vec<usize> = message
            .attachments
            .iter()
            .enumerate()
            .filter(|(_, a)| !a.is_uploaded() && !a.is_failed())
            .map(|(i, _)| i)
            .collect();

        info!(message_id, attachments = pending.len(), channel = %cid, "Uploading attachments");

        for index in pending {
            let Some(attachment) = message.attachments.get(index).cloned() else {
                continue;
            };
            let total = attachment.file_size;
            let started = UploadState::InProgress {
                bytes_uploaded: 0,
                total_bytes: total,
            };
            self.set_state(message_id, index, started, None).await?;

            let upload_id = attachment.upload_id.clone().unwrap_or_default();
            let progress: ProgressCallback = Arc::new(move |sent, total| {
                trace!(upload_id = %upload_id, sent, total, "Upload progress");
            });

            match self.uploader.upload(cid, &attachment, progress).await {
                Ok(url) => {
                    self.set_state(message_id, index, UploadState::Success, Some(url))
                        .await?;
                }
                Err(e) => {
                    warn!(message_id, index, error = %e, "Attachment upload failed");
                    let failed = UploadState::Failed {
                        error: e.to_string(),
                    };
                    self.set_state(message_id, index, failed, None).await?;
                    // One failure fails the message; the rest would be wasted.
                    break;
                }
            }
        }
        Ok(())
    }

    /// Re-read, patch one attachment and persist, so concurrent edits to the
    /// message body are not overwritten with a stale copy.
    async fn set_state(
        &self,
        message_id: &str,
        index: usize,
        state: UploadState,
        asset_url: Option<String>,
    ) -> ChatResult<()> {
        let mut message = self
            .repository
            .select_message(message_id)
            .await?
            .ok_or(ChatError::Cancelled)?;
        let Some(attachment) = message.attachments.get_mut(index) else {
            return Ok(());
        };
        attachment.upload_state = Some(state);
        if let Some(url) = asset_url {
            attachment.asset_url = Some(url);
            attachment.upload = None;
        }
        self.repository.insert_message(&message).await?;
        // No subscribers is fine: nobody is waiting on this message.
        let _ = self.updates.send(message);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use relais_shared::SyncStatus;
    use relais_store::SqliteRepository;

    use super::*;
    use crate::testing::FakeUploader;

    fn message_with_uploads(files: &[&str]) -> Message {
        Message {
            id: "m1".into(),
            cid: "messaging:a".into(),
            user_id: "alice".into(),
            sync_status: SyncStatus::AwaitingAttachments,
            attachments: files
                .iter()
                .map(|f| Attachment {
                    upload_id: Some(format!("up-{f}")),
                    upload: Some(PathBuf::from(f)),
                    file_size: 10,
                    upload_state: Some(UploadState::Idle),
                    ..Default::default()
                })
                .collect(),
            ..Default::default()
        }
    }

    async fn settled(rx: &mut broadcast::Receiver<Message>) -> Message {
        loop {
            let msg = rx.recv().await.unwrap();
            if msg.attachments.iter().all(|a| a.is_uploaded() || a.is_failed()) {
                return msg;
            }
        }
    }

    #[tokio::test]
    async fn uploads_every_pending_attachment() {
        let repo: Arc<dyn Repository> = Arc::new(SqliteRepository::open_in_memory().unwrap());
        repo.insert_message(&message_with_uploads(&["a.png", "b.png"]))
            .await
            .unwrap();
        let jobs = UploadJobs::new(Arc::new(FakeUploader::default()), Arc::clone(&repo));
        let mut rx = jobs.subscribe();

        jobs.enqueue(Cid::new("messaging", "a"), "m1".into()).await;
        let done = settled(&mut rx).await;

        assert!(done.attachments.iter().all(Attachment::is_uploaded));
        let stored = repo.select_message("m1").await.unwrap().unwrap();
        assert!(stored.attachments.iter().all(|a| a.asset_url.is_some()));
    }

    #[tokio::test]
    async fn failure_marks_attachment_failed() {
        let repo: Arc<dyn Repository> = Arc::new(SqliteRepository::open_in_memory().unwrap());
        repo.insert_message(&message_with_uploads(&["broken.bin"]))
            .await
            .unwrap();
        let uploader = FakeUploader::default();
        uploader.fail_path("broken.bin").await;
        let jobs = UploadJobs::new(Arc::new(uploader), Arc::clone(&repo));
        let mut rx = jobs.subscribe();

        jobs.enqueue(Cid::new("messaging", "a"), "m1".into()).await;
        let done = settled(&mut rx).await;

        assert!(done.has_failed_attachments());
    }
}
