//! Shared dependencies of every service in a session.
//!
//! A [`ChatContext`] is built once by [`ChatSession`](crate::ChatSession)
//! and handed to each component as `Arc<ChatContext>`.

use std::sync::Arc;

use relais_shared::ChatResult;
use relais_store::Repository;
use tokio_util::sync::CancellationToken;

use crate::api::ChatApi;
use crate::config::ClientConfig;
use crate::retry::{run_and_retry, RetryPolicy};
use crate::state::{ClientState, GlobalState, LogicRegistry};
use crate::upload::UploadJobs;

pub struct ChatContext {
    pub config: ClientConfig,
    pub repository: Arc<dyn Repository>,
    pub api: Arc<dyn ChatApi>,
    pub uploads: Arc<UploadJobs>,
    pub retry_policy: Arc<dyn RetryPolicy>,
    pub client_state: Arc<ClientState>,
    pub global_state: Arc<GlobalState>,
    pub registry: Arc<LogicRegistry>,
    /// Cancelled when the session shuts down.
    pub shutdown: CancellationToken,
}

impl ChatContext {
    pub fn is_online(&self) -> bool {
        self.client_state.is_online()
    }

    pub fn current_user_id(&self) -> Option<String> {
        self.client_state.current_user_id()
    }

    /// Run a network call through the session's retry policy.
    pub async fn with_retry<T, F, Fut>(&self, op: F) -> ChatResult<T>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = ChatResult<T>>,
    {
        run_and_retry(self.retry_policy.as_ref(), &self.shutdown, op).await
    }
}
