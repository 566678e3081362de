//! Message-related models

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Chat message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    #[serde(alias = "_id", alias = "messageId")]
    pub id: String,
    #[serde(default, alias = "conversationId")]
    pub chat_id: Option<String>,
    #[serde(default, alias = "sender")]
    pub sender_id: Option<String>,
    #[serde(default)]
    pub sender_name: Option<String>,
    #[serde(default, alias = "text")]
    pub content: String,
    #[serde(default, alias = "timestamp")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub read: bool,
}

/// Outgoing message
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NewMessage<'a> {
    pub chat_id: &'a str,
    pub content: &'a str,
}
