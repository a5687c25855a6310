use relais_shared::ChatError;
use relais_store::StoreError;
use thiserror::Error;

/// Errors raised while wiring or driving a [`ChatSession`](crate::ChatSession).
#[derive(Error, Debug)]
pub enum SyncError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error(transparent)]
    Chat(#[from] ChatError),

    /// An operation needs a connected user and there is none.
    #[error("No user is connected")]
    NoCurrentUser,

    /// The event sequencer has shut down.
    #[error("Event sequencer is closed")]
    SequencerClosed,
}

pub type Result<T> = std::result::Result<T, SyncError>;
