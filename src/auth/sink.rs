//! Session lifecycle sink

use crate::error::SyncError;

/// Told when a session ends involuntarily (expired or rejected). Expected to
/// send the user back to a login surface; the sync layer never does that
/// itself.
pub trait SessionSink: Send + Sync {
    fn session_ended(&self, reason: &SyncError);
}

impl<F> SessionSink for F
where
    F: Fn(&SyncError) + Send + Sync,
{
    fn session_ended(&self, reason: &SyncError) {
        self(reason)
    }
}

/// Sink that only logs.
pub struct LogSink;

impl SessionSink for LogSink {
    fn session_ended(&self, reason: &SyncError) {
        tracing::warn!("Session ended: {}", reason);
    }
}
