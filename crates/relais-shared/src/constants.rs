/// Page size used for channel list queries when the caller gives none.
pub const DEFAULT_CHANNEL_LIMIT: u32 = 30;

/// Number of messages requested per channel in a channel list query.
pub const DEFAULT_MESSAGE_LIMIT: u32 = 1;

/// Number of members requested per channel in a channel list query.
pub const DEFAULT_MEMBER_LIMIT: u32 = 30;

/// Maximum channel list queries re-run by a single recovery sweep.
pub const QUERIES_TO_RECOVER: usize = 3;

/// Maximum channels re-fetched by id in a single recovery sweep.
pub const CHANNELS_TO_RECOVER: usize = 30;

/// Pending local mutations older than this are dropped instead of resent (12 hours).
pub const SYNC_MAX_THRESHOLD_SECS: u64 = 12 * 60 * 60;

/// HTTP status codes the backend uses for errors that may succeed on retry.
pub const HTTP_TOO_MANY_REQUESTS: u16 = 429;
pub const HTTP_REQUEST_TIMEOUT: u16 = 408;
pub const HTTP_INTERNAL_SERVER_ERROR: u16 = 500;

/// Reaction score used when the caller does not provide one.
pub const DEFAULT_REACTION_SCORE: u32 = 1;

/// Number of reactions kept in a message's `latest_reactions` list.
pub const LATEST_REACTIONS_LIMIT: usize = 10;
