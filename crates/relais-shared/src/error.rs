use thiserror::Error;

use crate::constants::{HTTP_INTERNAL_SERVER_ERROR, HTTP_REQUEST_TIMEOUT, HTTP_TOO_MANY_REQUESTS};

/// Transport-level failure kinds. None of them is ever permanent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkErrorKind {
    ConnectionLost,
    Timeout,
    UnknownHost,
    Io,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ChatError {
    /// Connectivity lost, socket/IO failure, DNS failure or a client-side timeout.
    #[error("Network error ({kind:?}): {message}")]
    Network {
        kind: NetworkErrorKind,
        message: String,
    },

    /// Error returned by the backend. `code` is the backend's own error code.
    #[error("Server error {status} (code {code:?}): {message}")]
    Server {
        status: u16,
        code: Option<i32>,
        message: String,
    },

    /// Rejected locally before any network attempt.
    #[error("Validation error: {0}")]
    Validation(String),

    /// The local store failed; fatal for the operation that hit it.
    #[error("Storage error: {0}")]
    Storage(String),

    /// The same request is already running.
    #[error("{0} already in progress")]
    InProgress(String),

    #[error("Operation cancelled")]
    Cancelled,
}

impl ChatError {
    pub fn network(kind: NetworkErrorKind, message: impl Into<String>) -> Self {
        Self::Network {
            kind,
            message: message.into(),
        }
    }

    pub fn server(status: u16, code: i32, message: impl Into<String>) -> Self {
        Self::Server {
            status,
            code: Some(code),
            message: message.into(),
        }
    }

    /// Whether retrying the same request can never succeed.
    ///
    /// Rate limiting, request timeouts and internal server errors are
    /// temporary even though the server produced them. Any other server
    /// error that carries a backend error code is permanent.
    pub fn is_permanent(&self) -> bool {
        match self {
            Self::Network { .. } | Self::InProgress(_) | Self::Cancelled => false,
            Self::Server { status, code, .. } => {
                if matches!(
                    *status,
                    HTTP_TOO_MANY_REQUESTS | HTTP_REQUEST_TIMEOUT | HTTP_INTERNAL_SERVER_ERROR
                ) {
                    return false;
                }
                code.is_some()
            }
            Self::Validation(_) | Self::Storage(_) => true,
        }
    }
}

pub type ChatResult<T> = std::result::Result<T, ChatError>;
