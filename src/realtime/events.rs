//! Realtime event envelopes and subscriber fan-out

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;
use tokio::sync::broadcast;

/// Event types the backend pushes for chat traffic.
pub mod kinds {
    pub const NEW_MESSAGE: &str = "new_message";
    pub const MESSAGE_READ: &str = "message_read";
    pub const CHAT_UPDATED: &str = "chat_updated";
    pub const CHAT_STARTED: &str = "chat_started";
    pub const TYPING: &str = "typing";
    pub const JOIN_CHAT: &str = "join_chat";
    pub const LEAVE_CHAT: &str = "leave_chat";
}

/// JSON event envelope: `{"type", "data", "timestamp"}` plus an optional
/// ack id for acknowledged requests.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(default)]
    pub data: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ack_id: Option<u64>,
}

impl Envelope {
    pub fn new(event_type: &str, data: serde_json::Value) -> Self {
        Self {
            event_type: event_type.to_string(),
            data,
            timestamp: Some(Utc::now()),
            ack_id: None,
        }
    }

    /// Conversation this event belongs to, if the payload names one.
    pub fn conversation_id(&self) -> Option<&str> {
        ["chatId", "conversationId", "roomId"]
            .iter()
            .find_map(|k| self.data.get(*k).and_then(|v| v.as_str()))
    }
}

/// Where a published event went.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Sent on the event type's own channel to this many receivers.
    Dedicated(usize),
    /// Sent on the catch-all channel to this many receivers.
    CatchAll(usize),
}

/// Per-type channels plus a catch-all for types nobody subscribed to
/// specifically. An event goes to exactly one of the two.
pub struct EventBus {
    dedicated: Mutex<HashMap<String, broadcast::Sender<Envelope>>>,
    catch_all: broadcast::Sender<Envelope>,
    capacity: usize,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (catch_all, _) = broadcast::channel(capacity);
        Self {
            dedicated: Mutex::new(HashMap::new()),
            catch_all,
            capacity,
        }
    }

    /// Receive events of one type. Dropping the receiver unsubscribes.
    pub fn subscribe(&self, event_type: &str) -> broadcast::Receiver<Envelope> {
        let mut dedicated = self.dedicated.lock().unwrap_or_else(|e| e.into_inner());
        dedicated
            .entry(event_type.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .subscribe()
    }

    /// Receive events that have no dedicated subscriber.
    pub fn subscribe_all(&self) -> broadcast::Receiver<Envelope> {
        self.catch_all.subscribe()
    }

    pub fn publish(&self, envelope: Envelope) -> Delivery {
        let mut dedicated = self.dedicated.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(tx) = dedicated.get(&envelope.event_type) {
            if tx.receiver_count() > 0 {
                let n = tx.send(envelope).unwrap_or(0);
                return Delivery::Dedicated(n);
            }
            // Every dedicated subscriber has gone away.
            dedicated.remove(&envelope.event_type);
        }
        drop(dedicated);

        Delivery::CatchAll(self.catch_all.send(envelope).unwrap_or(0))
    }

    /// Event types that currently have a dedicated subscriber.
    pub fn dedicated_types(&self) -> Vec<String> {
        let dedicated = self.dedicated.lock().unwrap_or_else(|e| e.into_inner());
        let mut types: Vec<String> = dedicated
            .iter()
            .filter(|(_, tx)| tx.receiver_count() > 0)
            .map(|(k, _)| k.clone())
            .collect();
        types.sort();
        types
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_envelope_wire_format() {
        let raw = r#"{"type":"new_message","data":{"id":"m1","chatId":"c1"},"timestamp":"2024-05-01T10:00:00Z"}"#;
        let env: Envelope = serde_json::from_str(raw).unwrap();
        assert_eq!(env.event_type, "new_message");
        assert_eq!(env.conversation_id(), Some("c1"));
        assert_eq!(env.ack_id, None);

        let out = serde_json::to_value(&env).unwrap();
        assert_eq!(out["type"], "new_message");
        assert!(out.get("ackId").is_none());
    }

    #[tokio::test]
    async fn test_dedicated_events_skip_catch_all() {
        let bus = EventBus::new(16);
        let mut messages = bus.subscribe(kinds::NEW_MESSAGE);
        let mut everything = bus.subscribe_all();

        let delivery = bus.publish(Envelope::new(kinds::NEW_MESSAGE, json!({"id": "m1"})));
        assert_eq!(delivery, Delivery::Dedicated(1));
        let delivery = bus.publish(Envelope::new(kinds::TYPING, json!({"chatId": "c1"})));
        assert_eq!(delivery, Delivery::CatchAll(1));

        assert_eq!(messages.recv().await.unwrap().event_type, kinds::NEW_MESSAGE);
        assert_eq!(everything.recv().await.unwrap().event_type, kinds::TYPING);
        assert!(everything.try_recv().is_err());
        assert_eq!(bus.dedicated_types(), vec![kinds::NEW_MESSAGE.to_string()]);
    }

    #[test]
    fn test_dropped_subscriber_falls_back_to_catch_all() {
        let bus = EventBus::new(16);
        let messages = bus.subscribe(kinds::NEW_MESSAGE);
        let mut everything = bus.subscribe_all();
        drop(messages);

        let delivery = bus.publish(Envelope::new(kinds::NEW_MESSAGE, json!({"id": "m1"})));
        assert_eq!(delivery, Delivery::CatchAll(1));
        assert!(everything.try_recv().is_ok());
        assert!(bus.dedicated_types().is_empty());
    }
}
