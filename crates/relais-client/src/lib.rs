//! # relais-client
//!
//! Offline-first synchronization engine for a chat backend. Local writes
//! land in the store before any network call; realtime events are applied
//! in receipt order; reconnects trigger a bounded recovery pass.
//!
//! Everything hangs off one [`ChatSession`] per logged-in user.

pub mod api;
pub mod channel;
pub mod config;
pub mod context;
pub mod error;
pub mod events;
pub mod observable;
pub mod query_channels;
pub mod reactions;
pub mod retry;
pub mod sending;
pub mod session;
pub mod state;
pub mod sync;
pub mod upload;

#[cfg(test)]
mod testing;

use tracing_subscriber::{fmt, EnvFilter};

pub use api::{ChatApi, QueryChannelsRequest};
pub use channel::ChannelLogic;
pub use config::ClientConfig;
pub use error::{Result, SyncError};
pub use query_channels::{EventHandlingResult, QueryChannelsLogic, QueryState};
pub use retry::{run_and_retry, DefaultRetryPolicy, RetryPolicy};
pub use session::ChatSession;
pub use state::ConnectionState;
pub use upload::{AttachmentUploader, ProgressCallback};

/// Default filter when `RUST_LOG` is unset.
pub const DEFAULT_LOG_DIRECTIVES: &str = "relais_client=debug,relais_store=info,warn";

/// Install the fmt subscriber. `RUST_LOG` wins over `default_directives`.
///
/// Safe to call more than once; only the first call installs anything.
pub fn init_logging(default_directives: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directives));

    let installed = fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .try_init()
        .is_ok();

    if installed {
        tracing::info!("Logging initialised");
    }
}
