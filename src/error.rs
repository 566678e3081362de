//! Error taxonomy for the sync layer
//!
//! Every failure that crosses a component boundary is a [`SyncError`]. The
//! type is `Clone` so one failure can be handed to every waiter of a shared
//! in-flight operation.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, SyncError>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SyncError {
    /// Bad input. Never retried.
    #[error("invalid request: {0}")]
    Validation(String),

    /// Login rejected the supplied credentials. No session was started.
    #[error("authentication failed: {0}")]
    Authentication(String),

    /// The refresh token was missing or rejected.
    #[error("session expired: {0}")]
    SessionExpired(String),

    /// The server rejected an authenticated call.
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("rate limited: {0}")]
    RateLimited(String),

    /// Network failure or timeout.
    #[error("server unreachable: {0}")]
    Unreachable(String),

    /// 5xx from the backend.
    #[error("server error ({status}): {message}")]
    ServerFault { status: u16, message: String },

    /// Malformed payload or wire frame.
    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("cached value for '{key}' has a different type")]
    TypeMismatch { key: String },

    #[error("storage error: {0}")]
    Storage(String),
}

/// Which call produced a status code. A 401 means different things to login,
/// refresh and ordinary authenticated requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallKind {
    Login,
    Refresh,
    Authenticated,
}

impl SyncError {
    /// Classify a non-success HTTP status.
    pub fn from_status(status: u16, body: &str, kind: CallKind) -> Self {
        let message = if body.trim().is_empty() {
            format!("HTTP {}", status)
        } else {
            extract_message(body).unwrap_or_else(|| format!("HTTP {}: {}", status, body.trim()))
        };

        match status {
            400 | 422 => SyncError::Validation(message),
            401 => match kind {
                CallKind::Login => SyncError::Authentication(message),
                CallKind::Refresh => SyncError::SessionExpired(message),
                CallKind::Authenticated => SyncError::Unauthorized(message),
            },
            403 => SyncError::Forbidden(message),
            404 => SyncError::NotFound(message),
            429 => SyncError::RateLimited(message),
            s if s >= 500 => SyncError::ServerFault { status: s, message },
            // Anything else unexpected (3xx without redirect, odd 4xx) is a
            // caller-side problem.
            _ => SyncError::Validation(message),
        }
    }

    /// Errors that end the session and must trigger invalidation.
    pub fn is_session_ending(&self) -> bool {
        matches!(
            self,
            SyncError::SessionExpired(_) | SyncError::Unauthorized(_)
        )
    }

    /// Network-level failure; the realtime channel treats these as transient.
    pub fn is_transient(&self) -> bool {
        matches!(self, SyncError::Unreachable(_))
    }
}

/// Pull a human-readable message out of a JSON error body
/// (`{"message": ...}` or `{"error": ...}`).
fn extract_message(body: &str) -> Option<String> {
    let v: serde_json::Value = serde_json::from_str(body).ok()?;
    v.get("message")
        .or_else(|| v.get("error"))
        .and_then(|m| m.as_str())
        .map(String::from)
}

impl From<reqwest::Error> for SyncError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            return SyncError::Protocol(format!("failed to decode response: {}", e));
        }
        if let Some(status) = e.status() {
            return SyncError::from_status(status.as_u16(), "", CallKind::Authenticated);
        }
        SyncError::Unreachable(e.to_string())
    }
}

impl From<tokio::time::error::Elapsed> for SyncError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        SyncError::Unreachable("request timed out".to_string())
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(e: serde_json::Error) -> Self {
        SyncError::Protocol(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_classification() {
        assert!(matches!(
            SyncError::from_status(400, "", CallKind::Authenticated),
            SyncError::Validation(_)
        ));
        assert!(matches!(
            SyncError::from_status(403, "", CallKind::Authenticated),
            SyncError::Forbidden(_)
        ));
        assert!(matches!(
            SyncError::from_status(404, "", CallKind::Authenticated),
            SyncError::NotFound(_)
        ));
        assert!(matches!(
            SyncError::from_status(429, "", CallKind::Authenticated),
            SyncError::RateLimited(_)
        ));
        assert_eq!(
            SyncError::from_status(503, "", CallKind::Authenticated),
            SyncError::ServerFault {
                status: 503,
                message: "HTTP 503".to_string()
            }
        );
    }

    #[test]
    fn test_401_depends_on_call_kind() {
        assert!(matches!(
            SyncError::from_status(401, "", CallKind::Login),
            SyncError::Authentication(_)
        ));
        assert!(matches!(
            SyncError::from_status(401, "", CallKind::Refresh),
            SyncError::SessionExpired(_)
        ));
        assert!(matches!(
            SyncError::from_status(401, "", CallKind::Authenticated),
            SyncError::Unauthorized(_)
        ));
    }

    #[test]
    fn test_message_extracted_from_json_body() {
        let err = SyncError::from_status(
            400,
            r#"{"message":"email is required"}"#,
            CallKind::Login,
        );
        assert_eq!(err, SyncError::Validation("email is required".to_string()));
    }

    #[test]
    fn test_session_ending() {
        assert!(SyncError::Unauthorized("x".into()).is_session_ending());
        assert!(SyncError::SessionExpired("x".into()).is_session_ending());
        assert!(!SyncError::Unreachable("x".into()).is_session_ending());
        assert!(!SyncError::Authentication("x".into()).is_session_ending());
    }
}
