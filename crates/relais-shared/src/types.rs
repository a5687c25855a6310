use serde::{Deserialize, Serialize};

use crate::error::{ChatError, ChatResult};

/// Composite channel identifier, `"{channel_type}:{channel_id}"`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Cid {
    pub channel_type: String,
    pub id: String,
}

impl Cid {
    pub fn new(channel_type: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            channel_type: channel_type.into(),
            id: id.into(),
        }
    }

    /// Parse a `type:id` string. Both halves must be non-empty.
    pub fn parse(raw: &str) -> ChatResult<Self> {
        let (channel_type, id) = raw
            .split_once(':')
            .ok_or_else(|| ChatError::Validation(format!("malformed cid '{raw}'")))?;
        if channel_type.is_empty() || id.is_empty() {
            return Err(ChatError::Validation(format!("malformed cid '{raw}'")));
        }
        Ok(Self::new(channel_type, id))
    }
}

impl std::fmt::Display for Cid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.channel_type, self.id)
    }
}

impl std::str::FromStr for Cid {
    type Err = ChatError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// Generate a fresh identifier for a locally composed entity.
pub fn generate_id() -> String {
    uuid::Uuid::new_v4().to_string()
}
