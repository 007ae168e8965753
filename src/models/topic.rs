//! Notification topic.

use serde::{Deserialize, Serialize};

/// Longest accepted topic name, in characters.
pub const MAX_TOPIC_NAME_LENGTH: usize = 255;

/// A deduplicated topic, created the first time a notification names it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Topic {
    pub topic_id: i64,
    pub topic_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub creation_date: String,
}
