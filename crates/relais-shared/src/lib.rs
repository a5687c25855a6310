//! # relais-shared
//!
//! Domain vocabulary shared by the store and the sync engine: identifiers,
//! persisted models, the channel filter/sort language, realtime events and
//! the classified error type.

pub mod constants;
pub mod error;
pub mod filter;
pub mod models;
pub mod protocol;
pub mod types;

pub use error::{ChatError, ChatResult, NetworkErrorKind};
pub use filter::{FilterObject, QuerySort, SortDirection};
pub use models::*;
pub use protocol::{ChatEvent, EventPayload, UnreadCounts};
pub use types::{generate_id, Cid};
