//! Typed client for the chat backend
//!
//! Reads go through the response cache; writes go straight through the gate
//! and invalidate whatever they made stale.

use serde::de::DeserializeOwned;
use serde_json::json;
use std::sync::Arc;

use super::gate::RequestGate;
use crate::cache::{self, ResponseCache};
use crate::error::SyncError;
use crate::models::{decode, Chat, ChatMessage, Contact, NewMessage, Profile};

const CHATS: &str = "getChats";
const MESSAGES: &str = "getMessages";
const CONTACTS: &str = "getContacts";
const ME: &str = "getMe";

/// Cache key substring shared by every cached read of one conversation.
pub fn conversation_pattern(chat_id: &str) -> String {
    format!("{}:{{\"chatId\":{}", MESSAGES, json!(chat_id))
}

/// Cache key substring matching every cached chat list page.
pub fn chat_list_pattern() -> &'static str {
    CHATS
}

fn segment(id: &str) -> Result<String, SyncError> {
    if id.trim().is_empty() {
        return Err(SyncError::Validation("id must not be empty".to_string()));
    }
    Ok(url::form_urlencoded::byte_serialize(id.as_bytes()).collect())
}

pub struct DeskClient {
    gate: Arc<RequestGate>,
    cache: Arc<ResponseCache>,
}

impl DeskClient {
    pub fn new(gate: Arc<RequestGate>, cache: Arc<ResponseCache>) -> Self {
        Self { gate, cache }
    }

    pub fn gate(&self) -> &RequestGate {
        &self.gate
    }

    /// Cached GET of `path`, decoded as `T`.
    async fn cached<T>(&self, key: String, path: String) -> Result<T, SyncError>
    where
        T: DeserializeOwned + Clone + Send + Sync + 'static,
    {
        let gate = self.gate.clone();
        self.cache
            .get_or_fetch(&key, move || async move { decode(gate.get(&path).await?) })
            .await
    }

    /// One page of the chat list, most recent first.
    pub async fn chats(&self, page: u32, limit: u32) -> Result<Vec<Chat>, SyncError> {
        let key = cache::key(CHATS, &json!({ "page": page, "limit": limit }));
        self.cached(key, format!("/chats?page={}&limit={}", page, limit))
            .await
    }

    pub async fn messages(&self, chat_id: &str, limit: u32) -> Result<Vec<ChatMessage>, SyncError> {
        let id = segment(chat_id)?;
        let key = cache::key(MESSAGES, &json!({ "chatId": chat_id, "limit": limit }));
        self.cached(key, format!("/chats/{}/messages?limit={}", id, limit))
            .await
    }

    pub async fn contacts(&self) -> Result<Vec<Contact>, SyncError> {
        self.cached(cache::key(CONTACTS, &serde_json::Value::Null), "/contacts".to_string())
            .await
    }

    pub async fn me(&self) -> Result<Profile, SyncError> {
        self.cached(cache::key(ME, &serde_json::Value::Null), "/auth/me".to_string())
            .await
    }

    pub async fn send_message(&self, chat_id: &str, content: &str) -> Result<ChatMessage, SyncError> {
        let id = segment(chat_id)?;
        if content.trim().is_empty() {
            return Err(SyncError::Validation("message is empty".to_string()));
        }

        let body = serde_json::to_value(NewMessage { chat_id, content })?;
        let sent = decode(self.gate.post(&format!("/chats/{}/messages", id), &body).await?)?;

        self.cache.invalidate_pattern(&conversation_pattern(chat_id));
        self.cache.invalidate_pattern(chat_list_pattern());
        Ok(sent)
    }

    /// Open a chat with the given participants. The backend returns the
    /// existing chat for a direct conversation that already exists.
    pub async fn start_chat(
        &self,
        participant_ids: &[String],
        name: Option<&str>,
    ) -> Result<Chat, SyncError> {
        if participant_ids.is_empty() {
            return Err(SyncError::Validation(
                "a chat needs at least one participant".to_string(),
            ));
        }

        let mut body = json!({ "participantIds": participant_ids });
        if let Some(name) = name {
            body["name"] = json!(name);
        }
        let chat = decode(self.gate.post("/chats", &body).await?)?;

        self.cache.invalidate_pattern(chat_list_pattern());
        Ok(chat)
    }

    pub async fn mark_read(&self, chat_id: &str) -> Result<(), SyncError> {
        let id = segment(chat_id)?;
        self.gate
            .put(&format!("/chats/{}/read", id), &json!({}))
            .await?;

        self.cache.invalidate_pattern(&conversation_pattern(chat_id));
        self.cache.invalidate_pattern(chat_list_pattern());
        Ok(())
    }
}
