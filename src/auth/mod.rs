//! Authentication state
//!
//! Owns the current credential, coordinates single-flight refresh and
//! persists the session across restarts.

pub mod provider;
pub mod sink;
pub mod state;
pub mod store;
pub mod tokens;

pub use provider::{CredentialProvider, HttpCredentialProvider, LoginRequest};
pub use sink::{LogSink, SessionSink};
pub use state::{RefreshOperation, StorageKeys, TokenState};
pub use store::{MemoryStore, PersistentStore};
pub use tokens::{Credential, UserRef};
