//! Channel filter and sort vocabulary.
//!
//! Filters are evaluated locally to decide whether a channel touched by an
//! event still belongs to a materialized query result.

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::models::Channel;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum FilterObject {
    And { filters: Vec<FilterObject> },
    Or { filters: Vec<FilterObject> },
    Nor { filters: Vec<FilterObject> },
    Eq { field: String, value: Value },
    Ne { field: String, value: Value },
    Gt { field: String, value: Value },
    Gte { field: String, value: Value },
    Lt { field: String, value: Value },
    Lte { field: String, value: Value },
    In { field: String, values: Vec<Value> },
    Nin { field: String, values: Vec<Value> },
    Exists { field: String },
    NotExists { field: String },
    /// Matches when an array field contains the value (e.g. `members`).
    Contains { field: String, value: Value },
    /// Matches every channel.
    Neutral,
}

impl FilterObject {
    pub fn eq(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::Eq {
            field: field.into(),
            value: value.into(),
        }
    }

    pub fn in_values<V: Into<Value>>(field: impl Into<String>, values: impl IntoIterator<Item = V>) -> Self {
        Self::In {
            field: field.into(),
            values: values.into_iter().map(Into::into).collect(),
        }
    }

    pub fn contains(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::Contains {
            field: field.into(),
            value: value.into(),
        }
    }

    pub fn and(filters: Vec<FilterObject>) -> Self {
        Self::And { filters }
    }

    pub fn or(filters: Vec<FilterObject>) -> Self {
        Self::Or { filters }
    }

    /// Evaluate the filter against a channel snapshot.
    pub fn matches(&self, channel: &Channel) -> bool {
        match self {
            Self::And { filters } => filters.iter().all(|f| f.matches(channel)),
            Self::Or { filters } => filters.iter().any(|f| f.matches(channel)),
            Self::Nor { filters } => !filters.iter().any(|f| f.matches(channel)),
            Self::Eq { field, value } => field_value(channel, field).as_ref() == Some(value),
            Self::Ne { field, value } => field_value(channel, field).as_ref() != Some(value),
            Self::Gt { field, value } => compare_field(channel, field, value) == Some(Ordering::Greater),
            Self::Gte { field, value } => matches!(
                compare_field(channel, field, value),
                Some(Ordering::Greater | Ordering::Equal)
            ),
            Self::Lt { field, value } => compare_field(channel, field, value) == Some(Ordering::Less),
            Self::Lte { field, value } => matches!(
                compare_field(channel, field, value),
                Some(Ordering::Less | Ordering::Equal)
            ),
            Self::In { field, values } => field_value(channel, field)
                .map(|v| values.contains(&v))
                .unwrap_or(false),
            Self::Nin { field, values } => field_value(channel, field)
                .map(|v| !values.contains(&v))
                .unwrap_or(true),
            Self::Exists { field } => field_value(channel, field).is_some(),
            Self::NotExists { field } => field_value(channel, field).is_none(),
            Self::Contains { field, value } => match field_value(channel, field) {
                Some(Value::Array(items)) => items.contains(value),
                _ => false,
            },
            Self::Neutral => true,
        }
    }
}

/// Resolve a filterable field on a channel. Unknown names fall through to
/// the channel's custom `extra` data.
fn field_value(channel: &Channel, field: &str) -> Option<Value> {
    match field {
        "cid" => Some(Value::from(channel.cid.clone())),
        "type" => Some(Value::from(channel.channel_type.clone())),
        "id" => Some(Value::from(channel.id.clone())),
        "name" => channel.name.clone().map(Value::from),
        "created_by" | "created_by_id" => channel.created_by.clone().map(Value::from),
        "members" => Some(Value::Array(
            channel.members.keys().cloned().map(Value::from).collect(),
        )),
        "member_count" => Some(Value::from(channel.member_count)),
        "hidden" => Some(Value::from(channel.hidden)),
        "frozen" => Some(Value::from(channel.frozen)),
        "created_at" => channel.created_at.map(|t| Value::from(t.to_rfc3339())),
        "updated_at" => channel.updated_at.map(|t| Value::from(t.to_rfc3339())),
        "last_message_at" => channel.last_message_at.map(|t| Value::from(t.to_rfc3339())),
        other => channel.extra.get(other).cloned(),
    }
}

fn compare_field(channel: &Channel, field: &str, value: &Value) -> Option<Ordering> {
    field_value(channel, field).and_then(|v| compare_values(&v, value))
}

fn compare_values(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64()?.partial_cmp(&y.as_f64()?),
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        _ => None,
    }
}

// ---------------------------------------------------------------------------
// Sort
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SortDirection {
    Ascending,
    Descending,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SortSpec {
    pub field: String,
    pub direction: SortDirection,
}

/// Ordered list of sort keys; earlier keys win.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct QuerySort {
    pub specs: Vec<SortSpec>,
}

impl QuerySort {
    pub fn asc(mut self, field: impl Into<String>) -> Self {
        self.specs.push(SortSpec {
            field: field.into(),
            direction: SortDirection::Ascending,
        });
        self
    }

    pub fn desc(mut self, field: impl Into<String>) -> Self {
        self.specs.push(SortSpec {
            field: field.into(),
            direction: SortDirection::Descending,
        });
        self
    }

    /// Default channel list order: most recent activity first.
    pub fn by_last_message() -> Self {
        Self::default().desc("last_message_at")
    }

    /// Compare two channels. Missing values sort last regardless of direction.
    pub fn compare(&self, a: &Channel, b: &Channel) -> Ordering {
        for spec in &self.specs {
            let ordering = match (field_value(a, &spec.field), field_value(b, &spec.field)) {
                (None, None) => Ordering::Equal,
                (Some(_), None) => Ordering::Less,
                (None, Some(_)) => Ordering::Greater,
                (Some(x), Some(y)) => {
                    let natural = compare_values(&x, &y).unwrap_or(Ordering::Equal);
                    match spec.direction {
                        SortDirection::Ascending => natural,
                        SortDirection::Descending => natural.reverse(),
                    }
                }
            };
            if ordering != Ordering::Equal {
                return ordering;
            }
        }
        Ordering::Equal
    }

    pub fn sort(&self, channels: &mut [Channel]) {
        channels.sort_by(|a, b| self.compare(a, b));
    }
}
