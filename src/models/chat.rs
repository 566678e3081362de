//! Chat-related models

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::message::ChatMessage;

/// Chat type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatKind {
    Direct,
    Group,
}

/// Chat participant
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Participant {
    #[serde(alias = "_id")]
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
}

/// Chat entity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Chat {
    #[serde(alias = "_id")]
    pub id: String,
    #[serde(default, alias = "topic")]
    pub name: Option<String>,
    #[serde(default, alias = "type")]
    pub kind: Option<ChatKind>,
    #[serde(default)]
    pub participants: Vec<Participant>,
    #[serde(default)]
    pub last_message: Option<ChatMessage>,
    #[serde(default)]
    pub unread_count: u32,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

impl Chat {
    /// Display name: the chat name, else the other participants.
    pub fn display_name(&self, me: Option<&str>) -> String {
        if let Some(ref name) = self.name {
            if !name.is_empty() {
                return name.clone();
            }
        }
        let others: Vec<&str> = self
            .participants
            .iter()
            .filter(|p| Some(p.id.as_str()) != me)
            .map(|p| p.name.as_deref().unwrap_or(p.id.as_str()))
            .collect();
        if others.is_empty() {
            "(unnamed chat)".to_string()
        } else {
            others.join(", ")
        }
    }
}
