//! desk-sync: session-aware sync layer for a chat backend
//!
//! Owns the session credential and refreshes it single-flight, gates every
//! HTTP request on it, keeps a realtime channel authenticated as the
//! credential rotates, and caches read responses with in-flight coalescing.
//!
//! [`SyncLayer`] wires the pieces together. Each piece is usable on its own
//! with any implementation of the collaborator traits.

pub mod api;
pub mod auth;
pub mod cache;
pub mod config;
pub mod error;
pub mod models;
pub mod realtime;

pub use error::{Result, SyncError};

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use api::{DeskClient, RequestGate};
use auth::{
    Credential, CredentialProvider, LoginRequest, PersistentStore, SessionSink, StorageKeys,
    TokenState,
};
use cache::ResponseCache;
use config::Config;
use realtime::events::{kinds, Envelope};
use realtime::transport::RealtimeTransport;
use realtime::{ConnectionManager, RealtimeSettings};

/// Composition root. Constructing it restores any persisted session and
/// starts the cache sweeper and event-driven invalidation, so it must be
/// built inside a tokio runtime.
pub struct SyncLayer {
    config: Config,
    provider: Arc<dyn CredentialProvider>,
    tokens: Arc<TokenState>,
    cache: Arc<ResponseCache>,
    client: DeskClient,
    realtime: Arc<ConnectionManager>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    realtime_following: AtomicBool,
}

impl SyncLayer {
    pub fn new(
        config: Config,
        provider: Arc<dyn CredentialProvider>,
        store: Arc<dyn PersistentStore>,
        transport: Arc<dyn RealtimeTransport>,
        sink: Arc<dyn SessionSink>,
    ) -> Result<Self> {
        let tokens = TokenState::new(
            provider.clone(),
            store,
            sink,
            StorageKeys::with_prefix(&config.storage_prefix),
            config.refresh_buffer(),
            config.request_timeout(),
        );

        let gate = Arc::new(RequestGate::from_config(&config, tokens.clone())?);
        let cache = Arc::new(ResponseCache::new(config.cache_ttl()));
        cache.start_sweeper(config.cache_sweep_interval());
        let client = DeskClient::new(gate, cache.clone());

        let realtime = ConnectionManager::new(
            tokens.clone(),
            transport,
            RealtimeSettings::from_config(&config),
        );

        tokens.restore();

        let mut tasks = Vec::new();
        for event_type in [
            kinds::NEW_MESSAGE,
            kinds::CHAT_UPDATED,
            kinds::CHAT_STARTED,
            kinds::MESSAGE_READ,
        ] {
            tasks.push(tokio::spawn(invalidate_on_events(
                cache.clone(),
                realtime.subscribe(event_type),
            )));
        }

        Ok(Self {
            config,
            provider,
            tokens,
            cache,
            client,
            realtime,
            tasks: Mutex::new(tasks),
            realtime_following: AtomicBool::new(false),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn tokens(&self) -> &Arc<TokenState> {
        &self.tokens
    }

    pub fn client(&self) -> &DeskClient {
        &self.client
    }

    pub fn cache(&self) -> &ResponseCache {
        &self.cache
    }

    pub fn realtime(&self) -> &Arc<ConnectionManager> {
        &self.realtime
    }

    /// Keep the realtime channel tied to the session from now on: connected
    /// while a credential exists, disconnected otherwise. Idempotent.
    pub fn start_realtime(&self) {
        let mut tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
        if self.realtime_following.swap(true, Ordering::SeqCst) {
            return;
        }
        tasks.push(self.realtime.follow_session());
    }

    /// Start a session. If realtime was started, the channel connects on
    /// its own once the credential is installed.
    pub async fn login(&self, email: &str, password: &str) -> Result<Arc<Credential>> {
        let request = LoginRequest {
            email: email.to_string(),
            password: password.to_string(),
        };
        let credential = self.provider.login(&request).await?;

        // Nothing cached under a previous session is valid for this one.
        self.cache.clear();
        Ok(self.tokens.install(credential))
    }

    /// End the session voluntarily. The server-side logout is best effort;
    /// local state is cleared either way and the session sink is not
    /// notified.
    pub async fn logout(&self) {
        if let Some(credential) = self.tokens.current() {
            if let Err(e) = self.provider.logout(&credential).await {
                tracing::warn!("Server logout failed: {}", e);
            }
        }
        self.tokens.invalidate();
        self.cache.clear();
        self.realtime.disconnect();
        tracing::info!("Logged out");
    }

    /// Stop background work. Further calls on the layer still work but the
    /// cache is no longer swept and realtime follows no session.
    pub fn shutdown(&self) {
        let tasks = std::mem::take(&mut *self.tasks.lock().unwrap_or_else(|e| e.into_inner()));
        for task in tasks {
            task.abort();
        }
        self.realtime_following.store(false, Ordering::SeqCst);
        self.realtime.disconnect();
        self.cache.shutdown();
    }
}

impl Drop for SyncLayer {
    fn drop(&mut self) {
        for task in self.tasks.get_mut().unwrap_or_else(|e| e.into_inner()).drain(..) {
            task.abort();
        }
    }
}

/// Drop cached reads that an inbound realtime event made stale.
pub fn invalidate_for_event(cache: &ResponseCache, envelope: &Envelope) -> usize {
    let mut removed = cache.invalidate_pattern(api::chat_list_pattern());
    if envelope.event_type != kinds::CHAT_STARTED {
        if let Some(chat_id) = envelope.conversation_id() {
            removed += cache.invalidate_pattern(&api::conversation_pattern(chat_id));
        }
    }
    tracing::debug!(
        "{} event invalidated {} cache entries",
        envelope.event_type,
        removed
    );
    removed
}

async fn invalidate_on_events(cache: Arc<ResponseCache>, mut events: broadcast::Receiver<Envelope>) {
    loop {
        match events.recv().await {
            Ok(envelope) => {
                invalidate_for_event(&cache, &envelope);
            }
            Err(broadcast::error::RecvError::Lagged(n)) => {
                tracing::warn!("Missed {} realtime events, dropping chat caches", n);
                cache.invalidate_pattern(api::chat_list_pattern());
                cache.invalidate_pattern("getMessages");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;

    #[tokio::test]
    async fn test_new_message_invalidates_conversation_and_list() {
        let cache = ResponseCache::new(Duration::from_secs(60));
        cache.set(&cache::key("getChats", &json!({ "page": 1, "limit": 20 })), 1u32);
        cache.set(&cache::key("getMessages", &json!({ "chatId": "c1", "limit": 50 })), 2u32);
        cache.set(&cache::key("getMessages", &json!({ "chatId": "c2", "limit": 50 })), 3u32);
        cache.set(&cache::key("getContacts", &serde_json::Value::Null), 4u32);

        let event = Envelope::new(kinds::NEW_MESSAGE, json!({ "id": "m1", "chatId": "c1" }));
        assert_eq!(invalidate_for_event(&cache, &event), 2);

        let stats = cache.stats();
        assert_eq!(stats.entries, 2);
        assert!(cache
            .get::<u32>(&cache::key("getMessages", &json!({ "chatId": "c2", "limit": 50 })))
            .is_some());
    }
}
