//! Persistent key/value store used to keep the credential across restarts

use std::collections::HashMap;
use std::sync::Mutex;

use crate::error::SyncError;

/// String key/value storage with no schema.
pub trait PersistentStore: Send + Sync {
    fn get(&self, key: &str) -> Option<String>;
    fn set(&self, key: &str, value: &str) -> Result<(), SyncError>;
    fn remove(&self, key: &str) -> Result<(), SyncError>;
}

/// In-memory store; nothing survives the process.
#[derive(Default)]
pub struct MemoryStore {
    values: Mutex<HashMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl PersistentStore for MemoryStore {
    fn get(&self, key: &str) -> Option<String> {
        self.values.lock().ok()?.get(key).cloned()
    }

    fn set(&self, key: &str, value: &str) -> Result<(), SyncError> {
        self.values
            .lock()
            .map_err(|_| SyncError::Storage("store lock poisoned".to_string()))?
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), SyncError> {
        self.values
            .lock()
            .map_err(|_| SyncError::Storage("store lock poisoned".to_string()))?
            .remove(key);
        Ok(())
    }
}
