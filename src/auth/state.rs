//! Token state: the single owner of the current credential
//!
//! Refresh is single-flight. While one refresh is outstanding every caller
//! gets a clone of the same shared future, so N concurrent callers cost one
//! network round-trip and all observe the same result.

use futures::future::{BoxFuture, FutureExt, Shared};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::watch;

use super::provider::CredentialProvider;
use super::sink::SessionSink;
use super::store::PersistentStore;
use super::tokens::{Credential, UserRef};
use crate::error::SyncError;

/// An in-flight refresh shared by every caller that asked for one while it
/// was outstanding.
pub type RefreshOperation = Shared<BoxFuture<'static, Result<Arc<Credential>, SyncError>>>;

/// Keys under which the credential is persisted.
#[derive(Debug, Clone)]
pub struct StorageKeys {
    pub access_token: String,
    pub refresh_token: String,
    pub user: String,
}

impl StorageKeys {
    pub fn with_prefix(prefix: &str) -> Self {
        Self {
            access_token: format!("{}auth_token", prefix),
            refresh_token: format!("{}refresh_token", prefix),
            user: format!("{}user", prefix),
        }
    }
}

struct Inner {
    credential: Option<Arc<Credential>>,
    refreshing: Option<(u64, RefreshOperation)>,
    next_op_id: u64,
    /// Bumped whenever the credential is replaced or cleared. A refresh that
    /// settles under a different epoch lost a race and is discarded.
    epoch: u64,
    /// The sink has already been told about the current logged-out state.
    escalated: bool,
}

pub struct TokenState {
    inner: Mutex<Inner>,
    provider: Arc<dyn CredentialProvider>,
    store: Arc<dyn PersistentStore>,
    sink: Arc<dyn SessionSink>,
    keys: StorageKeys,
    buffer: Duration,
    timeout: Duration,
    changes: watch::Sender<Option<Arc<Credential>>>,
}

impl TokenState {
    pub fn new(
        provider: Arc<dyn CredentialProvider>,
        store: Arc<dyn PersistentStore>,
        sink: Arc<dyn SessionSink>,
        keys: StorageKeys,
        buffer: Duration,
        timeout: Duration,
    ) -> Arc<Self> {
        let (changes, _) = watch::channel(None);
        Arc::new(Self {
            inner: Mutex::new(Inner {
                credential: None,
                refreshing: None,
                next_op_id: 0,
                epoch: 0,
                escalated: false,
            }),
            provider,
            store,
            sink,
            keys,
            buffer,
            timeout,
            changes,
        })
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Current credential, if any.
    pub fn current(&self) -> Option<Arc<Credential>> {
        self.lock().credential.clone()
    }

    /// Default refresh buffer this state was configured with.
    pub fn buffer(&self) -> Duration {
        self.buffer
    }

    /// True if there is no credential, or it expires within `buffer`.
    pub fn is_near_expiry(&self, buffer: Duration) -> bool {
        match self.current() {
            Some(cred) => cred.is_near_expiry(buffer),
            None => true,
        }
    }

    /// Watch the credential. The receiver sees `None` after logout,
    /// invalidation or a failed refresh. Dropping it unsubscribes.
    pub fn subscribe(&self) -> watch::Receiver<Option<Arc<Credential>>> {
        self.changes.subscribe()
    }

    /// Install a freshly obtained credential (after login) and persist it.
    pub fn install(&self, credential: Credential) -> Arc<Credential> {
        let credential = Arc::new(credential);
        {
            let mut inner = self.lock();
            inner.credential = Some(credential.clone());
            inner.refreshing = None;
            inner.epoch += 1;
            inner.escalated = false;
        }
        self.persist(&credential);
        self.changes.send_replace(Some(credential.clone()));
        tracing::info!("Session started for user {}", credential.subject().id);
        credential
    }

    /// Restore a persisted credential, if there is one.
    pub fn restore(&self) -> Option<Arc<Credential>> {
        let access = self.store.get(&self.keys.access_token)?;
        let refresh = self.store.get(&self.keys.refresh_token).unwrap_or_default();
        let subject = self
            .store
            .get(&self.keys.user)
            .and_then(|raw| serde_json::from_str::<UserRef>(&raw).ok())
            .unwrap_or(UserRef {
                id: String::new(),
                email: None,
                name: None,
            });

        let credential = Arc::new(Credential::from_tokens(access, refresh, subject));
        {
            let mut inner = self.lock();
            inner.credential = Some(credential.clone());
            inner.epoch += 1;
            inner.escalated = false;
        }
        self.changes.send_replace(Some(credential.clone()));

        if credential.expires_at().is_none() {
            tracing::warn!("Restored token has no readable expiry; it will be refreshed");
        } else {
            tracing::info!("Restored session for user {}", credential.subject().id);
        }
        Some(credential)
    }

    /// Start a refresh, or join the one already in flight.
    ///
    /// The network call runs on its own task, so it completes (and updates
    /// state) even if every caller stops waiting.
    pub fn refresh(self: &Arc<Self>) -> RefreshOperation {
        let mut inner = self.lock();

        if let Some((_, ref op)) = inner.refreshing {
            tracing::debug!("Joining in-flight token refresh");
            return op.clone();
        }

        let Some(previous) = inner.credential.clone() else {
            return futures::future::ready(Err(SyncError::SessionExpired(
                "no credential to refresh".to_string(),
            )))
            .boxed()
            .shared();
        };

        let op_id = inner.next_op_id;
        inner.next_op_id += 1;
        let epoch = inner.epoch;

        tracing::info!("Refreshing access token...");

        let this = Arc::clone(self);
        let task = tokio::spawn(async move {
            let result = match tokio::time::timeout(this.timeout, this.provider.refresh(&previous))
                .await
            {
                Ok(result) => result,
                Err(elapsed) => Err(elapsed.into()),
            };
            this.settle_refresh(op_id, epoch, result)
        });

        let op = async move {
            task.await.unwrap_or_else(|e| {
                Err(SyncError::Unreachable(format!("refresh task failed: {}", e)))
            })
        }
        .boxed()
        .shared();

        inner.refreshing = Some((op_id, op.clone()));
        op
    }

    fn settle_refresh(
        &self,
        op_id: u64,
        epoch: u64,
        result: Result<Credential, SyncError>,
    ) -> Result<Arc<Credential>, SyncError> {
        let mut inner = self.lock();
        if matches!(inner.refreshing, Some((id, _)) if id == op_id) {
            inner.refreshing = None;
        }

        if inner.epoch != epoch {
            tracing::debug!("Discarding refresh result: session changed while in flight");
            return Err(SyncError::SessionExpired(
                "session changed during refresh".to_string(),
            ));
        }

        match result {
            Ok(credential) => {
                let credential = Arc::new(credential);
                inner.credential = Some(credential.clone());
                inner.epoch += 1;
                drop(inner);

                self.persist(&credential);
                self.changes.send_replace(Some(credential.clone()));
                tracing::info!("Token refreshed");
                Ok(credential)
            }
            Err(e) => {
                tracing::warn!("Token refresh failed: {}", e);
                drop(inner);
                self.end_session(&e);
                Err(e)
            }
        }
    }

    /// Clear the credential and any in-flight refresh. Idempotent. Returns
    /// whether anything was cleared.
    pub fn invalidate(&self) -> bool {
        let had_session = {
            let mut inner = self.lock();
            let had = inner.credential.is_some() || inner.refreshing.is_some();
            inner.credential = None;
            inner.refreshing = None;
            inner.epoch += 1;
            had
        };

        for key in [&self.keys.access_token, &self.keys.refresh_token, &self.keys.user] {
            if let Err(e) = self.store.remove(key) {
                tracing::warn!("Failed to remove persisted {}: {}", key, e);
            }
        }

        if had_session {
            self.changes.send_replace(None);
            tracing::info!("Session invalidated");
        }
        had_session
    }

    /// Invalidate because the session ended involuntarily, and tell the
    /// session sink. The sink hears about each logged-out period once, no
    /// matter how many requests fail with it.
    pub fn end_session(&self, reason: &SyncError) {
        self.invalidate();

        let notify = {
            let mut inner = self.lock();
            let first = !inner.escalated;
            inner.escalated = true;
            first
        };

        if notify {
            self.sink.session_ended(reason);
        }
    }

    fn persist(&self, credential: &Credential) {
        let mut writes = vec![
            (&self.keys.access_token, credential.access_token().to_string()),
            (&self.keys.refresh_token, credential.refresh_token().to_string()),
        ];
        match serde_json::to_string(credential.subject()) {
            Ok(user) => writes.push((&self.keys.user, user)),
            Err(e) => tracing::warn!("Failed to serialize user: {}", e),
        }

        for (key, value) in writes {
            if let Err(e) = self.store.set(key, &value) {
                tracing::warn!("Failed to persist {}: {}", key, e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::provider::LoginRequest;
    use crate::auth::store::MemoryStore;
    use crate::auth::tokens::fake_jwt;
    use async_trait::async_trait;
    use chrono::{Duration as ChronoDuration, Utc};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FakeProvider {
        calls: AtomicUsize,
        delay: Duration,
        fail_with: Option<SyncError>,
    }

    impl FakeProvider {
        fn ok(delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                delay,
                fail_with: None,
            })
        }

        fn failing(err: SyncError) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                delay: Duration::from_millis(50),
                fail_with: Some(err),
            })
        }
    }

    #[async_trait]
    impl CredentialProvider for FakeProvider {
        async fn login(&self, _request: &LoginRequest) -> Result<Credential, SyncError> {
            unimplemented!()
        }

        async fn refresh(&self, previous: &Credential) -> Result<Credential, SyncError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            tokio::time::sleep(self.delay).await;
            if let Some(ref e) = self.fail_with {
                return Err(e.clone());
            }
            Ok(Credential::new(
                format!("access-{}", n),
                previous.refresh_token().to_string(),
                Some(Utc::now() + ChronoDuration::hours(1)),
                previous.subject().clone(),
            ))
        }

        async fn logout(&self, _credential: &Credential) -> Result<(), SyncError> {
            Ok(())
        }
    }

    fn expiring_credential() -> Credential {
        Credential::new(
            "access-0".to_string(),
            "refresh-0".to_string(),
            Some(Utc::now() + ChronoDuration::minutes(4)),
            UserRef {
                id: "u1".to_string(),
                email: None,
                name: None,
            },
        )
    }

    fn state_with(
        provider: Arc<dyn CredentialProvider>,
        store: Arc<MemoryStore>,
        sink_calls: Arc<AtomicUsize>,
    ) -> Arc<TokenState> {
        let sink = move |_: &SyncError| {
            sink_calls.fetch_add(1, Ordering::SeqCst);
        };
        TokenState::new(
            provider,
            store,
            Arc::new(sink),
            StorageKeys::with_prefix("test_"),
            Duration::from_secs(300),
            Duration::from_secs(10),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_refresh_is_single_flight() {
        let provider = FakeProvider::ok(Duration::from_millis(100));
        let state = state_with(
            provider.clone(),
            Arc::new(MemoryStore::new()),
            Arc::new(AtomicUsize::new(0)),
        );
        state.install(expiring_credential());
        assert!(state.is_near_expiry(state.buffer()));

        let ops: Vec<_> = (0..10).map(|_| state.refresh()).collect();
        let results = futures::future::join_all(ops).await;

        assert_eq!(provider.calls.load(Ordering::SeqCst), 1);
        let first = results[0].as_ref().unwrap();
        for r in &results {
            assert!(Arc::ptr_eq(first, r.as_ref().unwrap()));
        }
        assert_eq!(state.current().unwrap().access_token(), "access-1");
        assert!(!state.is_near_expiry(state.buffer()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_refresh_after_settle_starts_new_operation() {
        let provider = FakeProvider::ok(Duration::from_millis(10));
        let state = state_with(
            provider.clone(),
            Arc::new(MemoryStore::new()),
            Arc::new(AtomicUsize::new(0)),
        );
        state.install(expiring_credential());

        state.refresh().await.unwrap();
        let second = state.refresh().await.unwrap();
        assert_eq!(provider.calls.load(Ordering::SeqCst), 2);
        assert_eq!(second.access_token(), "access-2");
    }

    #[tokio::test(start_paused = true)]
    async fn test_refresh_failure_ends_session_once() {
        let provider = FakeProvider::failing(SyncError::SessionExpired("revoked".into()));
        let store = Arc::new(MemoryStore::new());
        let sink_calls = Arc::new(AtomicUsize::new(0));
        let state = state_with(provider.clone(), store.clone(), sink_calls.clone());
        state.install(expiring_credential());
        let mut rx = state.subscribe();

        let results = futures::future::join_all((0..5).map(|_| state.refresh())).await;

        assert_eq!(provider.calls.load(Ordering::SeqCst), 1);
        for r in results {
            assert_eq!(r.unwrap_err(), SyncError::SessionExpired("revoked".into()));
        }
        assert!(state.current().is_none());
        assert!(store.get("test_auth_token").is_none());
        assert_eq!(sink_calls.load(Ordering::SeqCst), 1);

        rx.changed().await.unwrap();
        assert!(rx.borrow().is_none());

        // Later rejections in the same logged-out period stay quiet.
        state.end_session(&SyncError::Unauthorized("again".into()));
        assert_eq!(sink_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalidate_during_refresh_discards_result() {
        let provider = FakeProvider::ok(Duration::from_millis(100));
        let state = state_with(
            provider.clone(),
            Arc::new(MemoryStore::new()),
            Arc::new(AtomicUsize::new(0)),
        );
        state.install(expiring_credential());

        let op = state.refresh();
        assert!(state.invalidate());
        assert!(!state.invalidate());

        assert!(matches!(op.await, Err(SyncError::SessionExpired(_))));
        assert!(state.current().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_refresh_timeout_is_unreachable() {
        let provider = FakeProvider::ok(Duration::from_secs(60));
        let state = state_with(
            provider,
            Arc::new(MemoryStore::new()),
            Arc::new(AtomicUsize::new(0)),
        );
        state.install(expiring_credential());

        let err = state.refresh().await.unwrap_err();
        assert!(matches!(err, SyncError::Unreachable(_)));
        assert!(state.current().is_none());
    }

    #[tokio::test]
    async fn test_refresh_without_credential() {
        let provider = FakeProvider::ok(Duration::ZERO);
        let state = state_with(
            provider.clone(),
            Arc::new(MemoryStore::new()),
            Arc::new(AtomicUsize::new(0)),
        );
        assert!(state.is_near_expiry(Duration::ZERO));
        assert!(state.refresh().await.is_err());
        assert_eq!(provider.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_persist_and_restore() {
        let store = Arc::new(MemoryStore::new());
        let state = state_with(
            FakeProvider::ok(Duration::ZERO),
            store.clone(),
            Arc::new(AtomicUsize::new(0)),
        );
        let access = fake_jwt(Utc::now().timestamp() + 3600);
        state.install(Credential::from_tokens(
            access.clone(),
            "refresh-0".to_string(),
            UserRef {
                id: "u1".to_string(),
                email: Some("agent@example.com".to_string()),
                name: None,
            },
        ));

        let restored_state = state_with(
            FakeProvider::ok(Duration::ZERO),
            store.clone(),
            Arc::new(AtomicUsize::new(0)),
        );
        let restored = restored_state.restore().unwrap();
        assert_eq!(restored.access_token(), access);
        assert_eq!(restored.refresh_token(), "refresh-0");
        assert_eq!(restored.subject().email.as_deref(), Some("agent@example.com"));
        assert!(!restored_state.is_near_expiry(Duration::from_secs(300)));
    }
}
