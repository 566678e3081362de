//! Payload types for the chat backend

mod chat;
mod message;
mod user;

pub use chat::*;
pub use message::*;
pub use user::*;

use serde::de::DeserializeOwned;

use crate::error::SyncError;

/// Decode a response body, unwrapping a `{"data": ...}` envelope if present.
pub fn decode<T: DeserializeOwned>(body: serde_json::Value) -> Result<T, SyncError> {
    let inner = match body {
        serde_json::Value::Object(mut map) if map.contains_key("data") => {
            map.remove("data").unwrap_or_default()
        }
        other => other,
    };
    serde_json::from_value(inner)
        .map_err(|e| SyncError::Protocol(format!("unexpected response shape: {}", e)))
}
