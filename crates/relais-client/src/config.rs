//! Client configuration loaded from environment variables.
//!
//! Every setting has a default, so a session can start with zero
//! configuration.

use std::time::Duration;

use relais_shared::constants::{
    CHANNELS_TO_RECOVER, DEFAULT_CHANNEL_LIMIT, QUERIES_TO_RECOVER, SYNC_MAX_THRESHOLD_SECS,
};

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Attempts made by the retry loop before giving up.
    /// Env: `RELAIS_RETRY_MAX_ATTEMPTS`
    /// Default: `3`
    pub retry_max_attempts: u32,

    /// Backoff base; attempt `n` waits `base * 2^(n-1)`.
    /// Env: `RELAIS_RETRY_BASE_DELAY_MS`
    /// Default: `1000`
    pub retry_base_delay_ms: u64,

    /// Env: `RELAIS_RETRY_MAX_DELAY_MS`
    /// Default: `30000`
    pub retry_max_delay_ms: u64,

    /// Pending entities older than this are dropped instead of resent.
    /// Env: `RELAIS_SYNC_MAX_THRESHOLD_SECS`
    /// Default: 12 hours.
    pub sync_max_threshold: Duration,

    /// Channel list queries refreshed per recovery pass.
    /// Env: `RELAIS_QUERIES_TO_RECOVER`
    /// Default: `3`
    pub queries_to_recover: usize,

    /// Channels re-fetched per recovery pass.
    /// Env: `RELAIS_CHANNELS_TO_RECOVER`
    /// Default: `30`
    pub channels_to_recover: usize,

    /// Page size of channel list queries.
    /// Env: `RELAIS_CHANNEL_LIMIT`
    /// Default: `30`
    pub channel_limit: u32,

    /// Env: `RELAIS_MESSAGE_CACHE_CAPACITY`
    /// Default: `1000`
    pub message_cache_capacity: usize,

    /// Env: `RELAIS_CHANNEL_CACHE_CAPACITY`
    /// Default: `100`
    pub channel_cache_capacity: usize,

    /// Ask the server for presence updates of channel members.
    /// Env: `RELAIS_USER_PRESENCE` (true/false)
    /// Default: `true`
    pub user_presence: bool,

    /// Capacity of the event sequencer's queue.
    /// Env: `RELAIS_EVENT_BUFFER`
    /// Default: `256`
    pub event_buffer: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            retry_max_attempts: 3,
            retry_base_delay_ms: 1_000,
            retry_max_delay_ms: 30_000,
            sync_max_threshold: Duration::from_secs(SYNC_MAX_THRESHOLD_SECS),
            queries_to_recover: QUERIES_TO_RECOVER,
            channels_to_recover: CHANNELS_TO_RECOVER,
            channel_limit: DEFAULT_CHANNEL_LIMIT,
            message_cache_capacity: 1_000,
            channel_cache_capacity: 100,
            user_presence: true,
            event_buffer: 256,
        }
    }
}

impl ClientConfig {
    /// Load configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        parse_into(&lookup, "RELAIS_RETRY_MAX_ATTEMPTS", &mut config.retry_max_attempts);
        parse_into(&lookup, "RELAIS_RETRY_BASE_DELAY_MS", &mut config.retry_base_delay_ms);
        parse_into(&lookup, "RELAIS_RETRY_MAX_DELAY_MS", &mut config.retry_max_delay_ms);

        let mut threshold_secs = config.sync_max_threshold.as_secs();
        parse_into(&lookup, "RELAIS_SYNC_MAX_THRESHOLD_SECS", &mut threshold_secs);
        config.sync_max_threshold = Duration::from_secs(threshold_secs);

        parse_into(&lookup, "RELAIS_QUERIES_TO_RECOVER", &mut config.queries_to_recover);
        parse_into(&lookup, "RELAIS_CHANNELS_TO_RECOVER", &mut config.channels_to_recover);
        parse_into(&lookup, "RELAIS_CHANNEL_LIMIT", &mut config.channel_limit);
        parse_into(&lookup, "RELAIS_MESSAGE_CACHE_CAPACITY", &mut config.message_cache_capacity);
        parse_into(&lookup, "RELAIS_CHANNEL_CACHE_CAPACITY", &mut config.channel_cache_capacity);
        parse_into(&lookup, "RELAIS_EVENT_BUFFER", &mut config.event_buffer);

        if let Some(val) = lookup("RELAIS_USER_PRESENCE") {
            config.user_presence = val != "false" && val != "0";
        }

        // RUST_LOG is handled directly by tracing-subscriber's EnvFilter.

        config
    }
}

fn parse_into<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    slot: &mut T,
) {
    let Some(raw) = lookup(key) else {
        return;
    };
    match raw.trim().parse::<T>() {
        Ok(value) => *slot = value,
        Err(_) => tracing::warn!(key, value = %raw, "Invalid value, using default"),
    }
}
