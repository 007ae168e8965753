//! Notification record and its delivery status.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// A parsed notification, as produced by the exchange-file parser.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Notification {
    pub topic: String,
    pub metadata: HashMap<String, String>,
    pub message: String,
}

/// Delivery status lifecycle: `Input` is the only non-terminal state.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "UPPERCASE")]
pub enum NotificationStatus {
    Input,
    Sent,
    Error,
}

impl NotificationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationStatus::Input => "INPUT",
            NotificationStatus::Sent => "SENT",
            NotificationStatus::Error => "ERROR",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "INPUT" => Some(NotificationStatus::Input),
            "SENT" => Some(NotificationStatus::Sent),
            "ERROR" => Some(NotificationStatus::Error),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, NotificationStatus::Input)
    }
}

/// A persisted notification joined with its topic name.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct StoredNotification {
    pub notification_id: i64,
    pub topic_id: i64,
    pub topic_name: String,
    pub timestamp: String,
    pub message: String,
    pub metadata: HashMap<String, String>,
    pub status: NotificationStatus,
}
