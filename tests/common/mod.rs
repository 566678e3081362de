//! In-memory collaborators for integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

use desk_sync::auth::{Credential, CredentialProvider, LoginRequest, SessionSink, UserRef};
use desk_sync::realtime::events::Envelope;
use desk_sync::realtime::transport::{
    InboundFrame, RealtimeTransport, TransportAuth, TransportConnection,
};
use desk_sync::SyncError;

pub fn user() -> UserRef {
    UserRef {
        id: "u1".to_string(),
        email: Some("agent@example.com".to_string()),
        name: Some("Agent".to_string()),
    }
}

pub fn credential(token: &str, expires_in: ChronoDuration) -> Credential {
    Credential::new(
        token.to_string(),
        format!("{}-refresh", token),
        Some(Utc::now() + expires_in),
        user(),
    )
}

/// Credential provider whose refresh takes `delay` and then either rotates
/// the token or fails with `refresh_error`.
pub struct FakeProvider {
    pub refresh_calls: AtomicUsize,
    pub logout_calls: AtomicUsize,
    pub delay: Duration,
    pub refresh_error: Option<SyncError>,
}

impl FakeProvider {
    pub fn new(delay: Duration) -> Self {
        Self {
            refresh_calls: AtomicUsize::new(0),
            logout_calls: AtomicUsize::new(0),
            delay,
            refresh_error: None,
        }
    }

    pub fn failing(delay: Duration, error: SyncError) -> Self {
        Self {
            refresh_error: Some(error),
            ..Self::new(delay)
        }
    }

    pub fn refreshes(&self) -> usize {
        self.refresh_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CredentialProvider for FakeProvider {
    async fn login(&self, request: &LoginRequest) -> Result<Credential, SyncError> {
        if request.password != "secret" {
            return Err(SyncError::Authentication("Invalid credentials".to_string()));
        }
        Ok(credential("login-token", ChronoDuration::hours(1)))
    }

    async fn refresh(&self, _previous: &Credential) -> Result<Credential, SyncError> {
        let n = self.refresh_calls.fetch_add(1, Ordering::SeqCst) + 1;
        tokio::time::sleep(self.delay).await;
        match self.refresh_error {
            Some(ref e) => Err(e.clone()),
            None => Ok(credential(&format!("fresh-{}", n), ChronoDuration::hours(1))),
        }
    }

    async fn logout(&self, _credential: &Credential) -> Result<(), SyncError> {
        self.logout_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Session sink that counts notifications.
#[derive(Default)]
pub struct CountingSink {
    pub calls: AtomicUsize,
    pub last: Mutex<Option<SyncError>>,
}

impl CountingSink {
    pub fn count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl SessionSink for CountingSink {
    fn session_ended(&self, reason: &SyncError) {
        self.calls.fetch_add(1, Ordering::SeqCst);
        *self.last.lock().unwrap() = Some(reason.clone());
    }
}

/// Server side of one fake realtime connection.
pub struct Peer {
    pub inbound: mpsc::UnboundedSender<Result<Option<InboundFrame>, SyncError>>,
    pub sent: Arc<Mutex<Vec<Envelope>>>,
}

impl Peer {
    pub fn push(&self, envelope: Envelope) {
        let _ = self.inbound.send(Ok(Some(InboundFrame::Event(envelope))));
    }
}

struct FakeConnection {
    inbound: mpsc::UnboundedReceiver<Result<Option<InboundFrame>, SyncError>>,
    sent: Arc<Mutex<Vec<Envelope>>>,
}

#[async_trait]
impl TransportConnection for FakeConnection {
    async fn recv(&mut self) -> Result<Option<InboundFrame>, SyncError> {
        match self.inbound.recv().await {
            Some(frame) => frame,
            None => Ok(None),
        }
    }

    async fn send(&mut self, envelope: &Envelope) -> Result<(), SyncError> {
        self.sent.lock().unwrap().push(envelope.clone());
        Ok(())
    }

    async fn update_auth(&mut self, _token: &str) -> Result<(), SyncError> {
        Ok(())
    }

    async fn close(&mut self) {}
}

/// Transport that always connects and hands the server side to the test.
#[derive(Default)]
pub struct FakeTransport {
    pub peers: Mutex<Vec<Peer>>,
    pub tokens: Mutex<Vec<String>>,
}

impl FakeTransport {
    /// Server side of the most recent connection.
    pub fn latest(&self) -> Option<Peer> {
        self.peers.lock().unwrap().pop()
    }
}

#[async_trait]
impl RealtimeTransport for FakeTransport {
    async fn open(&self, auth: &TransportAuth) -> Result<Box<dyn TransportConnection>, SyncError> {
        self.tokens.lock().unwrap().push(auth.token.clone());
        let (tx, rx) = mpsc::unbounded_channel();
        let sent = Arc::new(Mutex::new(Vec::new()));
        self.peers.lock().unwrap().push(Peer {
            inbound: tx,
            sent: sent.clone(),
        });
        Ok(Box::new(FakeConnection { inbound: rx, sent }))
    }
}
