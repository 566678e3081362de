//! HTTP side of the sync layer: the request gate and the typed client

pub mod client;
pub mod gate;

pub use client::{chat_list_pattern, conversation_pattern, DeskClient};
pub use gate::RequestGate;
