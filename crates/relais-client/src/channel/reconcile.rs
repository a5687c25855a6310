//! Pure merge rules shared by the channel reconciler.

use chrono::{DateTime, Utc};
use relais_shared::{ChannelUserRead, Message};

/// Whether `incoming` should replace `current` as the channel's last message.
///
/// Only a strictly newer message wins, except an edit of the message that
/// already is the last one, which always replaces it.
pub fn should_replace_last_message(current: Option<&Message>, incoming: &Message) -> bool {
    let Some(current) = current else {
        return true;
    };
    if current.id == incoming.id {
        return true;
    }
    match (incoming.effective_created_at(), current.effective_created_at()) {
        (Some(new), Some(old)) => new > old,
        (Some(_), None) => true,
        (None, _) => false,
    }
}

/// A message that counts towards the current user's unread total.
fn counts_as_unread(message: &Message, current_user_id: &str) -> bool {
    message.user_id != current_user_id && !message.is_deleted() && !message.silent && !message.shadowed
}

/// Unread count of `current_user_id` over the loaded message window.
///
/// With at most one loaded message the server's count is trusted as is.
pub fn compute_unread_count(
    current_user_id: &str,
    read: Option<&ChannelUserRead>,
    messages: &[Message],
    server_count: u32,
) -> u32 {
    if messages.len() <= 1 {
        return server_count;
    }

    let last_read: Option<DateTime<Utc>> = read.and_then(|r| r.last_read);
    messages
        .iter()
        .filter(|m| counts_as_unread(m, current_user_id))
        .filter(|m| match (last_read, m.effective_created_at()) {
            (None, _) => true,
            (Some(read_at), Some(created)) => created > read_at,
            (Some(_), None) => false,
        })
        .count() as u32
}

/// Whether a freshly received message bumps the current user's unread count.
pub fn should_increment_unread(
    message: &Message,
    current_user_id: &str,
    read: Option<&ChannelUserRead>,
) -> bool {
    if !counts_as_unread(message, current_user_id) {
        return false;
    }
    match (read.and_then(|r| r.last_read), message.effective_created_at()) {
        (Some(read_at), Some(created)) => created > read_at,
        _ => true,
    }
}
