//! Realtime connection manager
//!
//! Keeps one duplex connection open while a session exists, authenticated
//! with the current credential. Reconnects with exponential backoff up to a
//! fixed number of attempts, pushes rotated credentials into the live
//! connection, and drops duplicate inbound events before they reach
//! subscribers.

pub mod dedup;
pub mod events;
pub mod state;
pub mod transport;

use chrono::Utc;
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};

use crate::auth::{Credential, TokenState};
use crate::config::Config;
use crate::error::SyncError;
use dedup::{Admission, Fingerprint, RecentMessageWindow};
use events::{kinds, Envelope, EventBus};
use state::{ConnectionState, Phase};
use transport::{InboundFrame, RealtimeTransport, TransportAuth, TransportConnection};

/// Tunables for the connection manager.
#[derive(Debug, Clone)]
pub struct RealtimeSettings {
    pub max_attempts: u32,
    pub reconnect_delay: Duration,
    pub reconnect_delay_max: Duration,
    pub dedup_window: Duration,
    pub window_cap: usize,
    /// Bounds the handshake and acknowledged requests.
    pub timeout: Duration,
    pub channel_capacity: usize,
}

impl RealtimeSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            max_attempts: config.reconnect_max_attempts.max(1),
            reconnect_delay: config.reconnect_delay(),
            reconnect_delay_max: config.reconnect_delay_max(),
            dedup_window: config.dedup_window(),
            window_cap: config.recent_window_cap,
            timeout: config.request_timeout(),
            channel_capacity: 256,
        }
    }

    /// Delay before the next attempt: base * 2^(failures-1), capped. A
    /// retry after a drop, with no failed open yet, waits the base delay.
    fn backoff(&self, failures: u32) -> Duration {
        let factor = 2u32.saturating_pow(failures.saturating_sub(1));
        self.reconnect_delay
            .saturating_mul(factor)
            .min(self.reconnect_delay_max)
    }
}

impl Default for RealtimeSettings {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

/// Point-in-time view of the manager for status output and debugging.
#[derive(Debug, Clone)]
pub struct Diagnostics {
    pub state: ConnectionState,
    pub client_id: String,
    pub recent_window: usize,
    pub accepted: u64,
    pub retransmits_dropped: u64,
    pub reordered_dropped: u64,
    pub pending_acks: usize,
    pub rooms: Vec<String>,
    pub dedicated_types: Vec<String>,
}

enum Command {
    Emit(Envelope),
    Request(Envelope, oneshot::Sender<Result<serde_json::Value, SyncError>>),
}

/// Why a live connection ended.
enum ConnectionEnd {
    Shutdown,
    CredentialCleared,
    Dropped(SyncError),
    /// The credential changed and could not be updated in place.
    Reauthenticate(SyncError),
}

struct Driver {
    run_id: u64,
    commands: mpsc::UnboundedSender<Command>,
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

#[derive(Default)]
struct Counters {
    accepted: AtomicU64,
    retransmits: AtomicU64,
    reordered: AtomicU64,
    pending_acks: AtomicUsize,
}

struct Shared {
    tokens: Arc<TokenState>,
    transport: Arc<dyn RealtimeTransport>,
    settings: RealtimeSettings,
    client_id: String,
    state: watch::Sender<ConnectionState>,
    /// Run currently allowed to write `state`. Runs that were disconnected
    /// keep going briefly but their updates are ignored.
    active_run: Mutex<Option<u64>>,
    window: Mutex<RecentMessageWindow>,
    rooms: Mutex<BTreeSet<String>>,
    bus: EventBus,
    counters: Counters,
    next_ack: AtomicU64,
}

impl Shared {
    fn is_active(&self, run_id: u64) -> bool {
        *lock(&self.active_run) == Some(run_id)
    }

    fn update_state(&self, run_id: u64, f: impl FnOnce(&mut ConnectionState)) {
        let active = lock(&self.active_run);
        if *active != Some(run_id) {
            return;
        }
        self.state.send_modify(f);
    }

    /// Dedup an inbound application event and publish it if it is new.
    fn handle_inbound(&self, envelope: Envelope) {
        let fingerprint = Fingerprint::of(&envelope);
        let admission = lock(&self.window).admit(&fingerprint, Instant::now());

        match admission {
            Admission::Accepted => {
                self.counters.accepted.fetch_add(1, Ordering::Relaxed);
                let delivery = self.bus.publish(envelope);
                tracing::debug!("Event {} delivered: {:?}", fingerprint.event_id, delivery);
            }
            Admission::Retransmit => {
                self.counters.retransmits.fetch_add(1, Ordering::Relaxed);
                tracing::debug!("Dropped retransmitted event {}", fingerprint.event_id);
            }
            Admission::Reordered => {
                self.counters.reordered.fetch_add(1, Ordering::Relaxed);
                tracing::debug!("Dropped duplicate event {}", fingerprint.event_id);
            }
        }
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

pub struct ConnectionManager {
    shared: Arc<Shared>,
    driver: Mutex<Option<Driver>>,
    next_run: AtomicU64,
}

impl ConnectionManager {
    pub fn new(
        tokens: Arc<TokenState>,
        transport: Arc<dyn RealtimeTransport>,
        settings: RealtimeSettings,
    ) -> Arc<Self> {
        let (state, _) = watch::channel(ConnectionState::default());
        let window = RecentMessageWindow::new(settings.dedup_window, settings.window_cap);
        let bus = EventBus::new(settings.channel_capacity);
        Arc::new(Self {
            shared: Arc::new(Shared {
                tokens,
                transport,
                settings,
                client_id: uuid::Uuid::new_v4().to_string(),
                state,
                active_run: Mutex::new(None),
                window: Mutex::new(window),
                rooms: Mutex::new(BTreeSet::new()),
                bus,
                counters: Counters::default(),
                next_ack: AtomicU64::new(1),
            }),
            driver: Mutex::new(None),
            next_run: AtomicU64::new(1),
        })
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.state.borrow().clone()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state.subscribe()
    }

    /// Events of one type. Dropping the receiver unsubscribes.
    pub fn subscribe(&self, event_type: &str) -> broadcast::Receiver<Envelope> {
        self.shared.bus.subscribe(event_type)
    }

    /// Events with no dedicated subscriber.
    pub fn subscribe_all(&self) -> broadcast::Receiver<Envelope> {
        self.shared.bus.subscribe_all()
    }

    /// Open the connection with the current credential. No-op if already
    /// running; records an error and stays disconnected without a
    /// credential.
    pub fn connect(&self) {
        let mut driver = lock(&self.driver);
        if let Some(ref d) = *driver {
            if !d.handle.is_finished() {
                return;
            }
        }

        if self.shared.tokens.current().is_none() {
            tracing::warn!("Realtime connect skipped: no credential");
            self.shared.state.send_modify(|s| {
                s.phase = Phase::Disconnected;
                s.last_error = Some("no credential".to_string());
            });
            return;
        }

        let run_id = self.next_run.fetch_add(1, Ordering::Relaxed);
        *lock(&self.shared.active_run) = Some(run_id);
        self.shared.state.send_modify(|s| {
            s.phase = Phase::Connecting;
            s.last_error = None;
            s.reconnect_attempts = 0;
        });

        let (commands, command_rx) = mpsc::unbounded_channel();
        let (shutdown, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(run(
            self.shared.clone(),
            run_id,
            command_rx,
            shutdown_rx,
        ));

        *driver = Some(Driver {
            run_id,
            commands,
            shutdown,
            handle,
        });
    }

    /// Close the connection and forget recent events. Idempotent.
    pub fn disconnect(&self) {
        let driver = lock(&self.driver).take();
        *lock(&self.shared.active_run) = None;

        if let Some(d) = driver {
            tracing::info!("Disconnecting realtime channel (run {})", d.run_id);
            let _ = d.shutdown.send(true);
        }

        lock(&self.shared.window).clear();
        self.shared.state.send_modify(|s| {
            s.phase = Phase::Disconnected;
            s.reconnect_attempts = 0;
        });
    }

    /// Fire-and-forget event.
    pub fn emit(&self, event_type: &str, data: serde_json::Value) -> Result<(), SyncError> {
        self.send_command(Command::Emit(Envelope::new(event_type, data)))
    }

    /// Acknowledged request; resolves with the ack payload.
    pub async fn request(
        &self,
        event_type: &str,
        data: serde_json::Value,
    ) -> Result<serde_json::Value, SyncError> {
        let mut envelope = Envelope::new(event_type, data);
        envelope.ack_id = Some(self.shared.next_ack.fetch_add(1, Ordering::Relaxed));

        let (tx, rx) = oneshot::channel();
        self.send_command(Command::Request(envelope, tx))?;

        match time::timeout(self.shared.settings.timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(SyncError::Unreachable(
                "connection lost before acknowledgement".to_string(),
            )),
            Err(elapsed) => Err(elapsed.into()),
        }
    }

    fn send_command(&self, command: Command) -> Result<(), SyncError> {
        if !self.state().is_connected() {
            return Err(SyncError::Unreachable(
                "realtime channel not connected".to_string(),
            ));
        }
        let driver = lock(&self.driver);
        let d = driver.as_ref().ok_or_else(|| {
            SyncError::Unreachable("realtime channel not connected".to_string())
        })?;
        d.commands
            .send(command)
            .map_err(|_| SyncError::Unreachable("realtime channel closed".to_string()))
    }

    /// Join a conversation room. Remembered and re-joined after reconnects.
    pub fn join_conversation(&self, chat_id: &str) {
        let added = lock(&self.shared.rooms).insert(chat_id.to_string());
        if added && self.state().is_connected() {
            if let Err(e) = self.emit(kinds::JOIN_CHAT, serde_json::json!({ "chatId": chat_id })) {
                tracing::debug!("Join for {} deferred until reconnect: {}", chat_id, e);
            }
        }
    }

    pub fn leave_conversation(&self, chat_id: &str) {
        let removed = lock(&self.shared.rooms).remove(chat_id);
        if removed && self.state().is_connected() {
            if let Err(e) = self.emit(kinds::LEAVE_CHAT, serde_json::json!({ "chatId": chat_id })) {
                tracing::debug!("Leave for {} not sent: {}", chat_id, e);
            }
        }
    }

    pub fn diagnostics(&self) -> Diagnostics {
        let counters = &self.shared.counters;
        Diagnostics {
            state: self.state(),
            client_id: self.shared.client_id.clone(),
            recent_window: lock(&self.shared.window).len(),
            accepted: counters.accepted.load(Ordering::Relaxed),
            retransmits_dropped: counters.retransmits.load(Ordering::Relaxed),
            reordered_dropped: counters.reordered.load(Ordering::Relaxed),
            pending_acks: counters.pending_acks.load(Ordering::Relaxed),
            rooms: lock(&self.shared.rooms).iter().cloned().collect(),
            dedicated_types: self.shared.bus.dedicated_types(),
        }
    }

    /// Tie the connection to the session: connect whenever a credential
    /// appears, disconnect when it goes away. Runs until the token state is
    /// dropped.
    pub fn follow_session(self: &Arc<Self>) -> JoinHandle<()> {
        let this = Arc::downgrade(self);
        let mut creds = self.shared.tokens.subscribe();
        tokio::spawn(async move {
            loop {
                let present = creds.borrow_and_update().is_some();
                let Some(manager) = this.upgrade() else {
                    break;
                };
                if present {
                    manager.connect();
                } else if manager.state().phase != Phase::Disconnected {
                    manager.disconnect();
                }
                drop(manager);

                if creds.changed().await.is_err() {
                    break;
                }
            }
        })
    }

    /// Feed an event as if it arrived from the transport.
    #[cfg(test)]
    fn inject(&self, envelope: Envelope) {
        self.shared.handle_inbound(envelope);
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        if let Some(d) = self.driver.get_mut().unwrap_or_else(|e| e.into_inner()).take() {
            let _ = d.shutdown.send(true);
        }
    }
}

/// Connection loop for one `connect()`..`disconnect()` run.
async fn run(
    shared: Arc<Shared>,
    run_id: u64,
    mut commands: mpsc::UnboundedReceiver<Command>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut failures: u32 = 0;
    let mut creds = shared.tokens.subscribe();

    loop {
        let Some(credential) = shared.tokens.current() else {
            tracing::info!("Realtime: credential gone, disconnecting");
            shared.update_state(run_id, |s| {
                s.phase = Phase::Disconnected;
                s.last_error = Some("session ended".to_string());
            });
            break;
        };

        let auth = TransportAuth {
            token: credential.access_token().to_string(),
            client_id: shared.client_id.clone(),
        };

        let opened = tokio::select! {
            r = time::timeout(shared.settings.timeout, shared.transport.open(&auth)) => {
                r.unwrap_or_else(|elapsed| Err(elapsed.into()))
            }
            _ = shutdown.changed() => break,
        };

        match opened {
            Ok(mut conn) => {
                failures = 0;
                shared.update_state(run_id, |s| {
                    s.phase = Phase::Connected;
                    s.last_connected_at = Some(Utc::now());
                    s.last_error = None;
                    s.reconnect_attempts = 0;
                });
                tracing::info!("Realtime connected");

                let end = serve(
                    &shared,
                    run_id,
                    conn.as_mut(),
                    &credential,
                    &mut commands,
                    &mut creds,
                    &mut shutdown,
                )
                .await;

                match end {
                    ConnectionEnd::Shutdown => {
                        conn.close().await;
                        break;
                    }
                    ConnectionEnd::CredentialCleared => {
                        conn.close().await;
                        tracing::info!("Realtime: session ended, disconnecting");
                        if shared.is_active(run_id) {
                            lock(&shared.window).clear();
                        }
                        shared.update_state(run_id, |s| {
                            s.phase = Phase::Disconnected;
                            s.last_error = Some("session ended".to_string());
                        });
                        break;
                    }
                    ConnectionEnd::Reauthenticate(e) => {
                        conn.close().await;
                        tracing::info!("Realtime: reconnecting with new credential ({})", e);
                        shared.update_state(run_id, |s| {
                            s.phase = Phase::Reconnecting;
                            s.last_error = Some(e.to_string());
                        });
                        continue;
                    }
                    ConnectionEnd::Dropped(e) => {
                        tracing::warn!("Realtime connection dropped: {}", e);
                        shared.update_state(run_id, |s| {
                            s.phase = Phase::Reconnecting;
                            s.last_error = Some(e.to_string());
                        });
                        if matches!(e, SyncError::Unauthorized(_)) {
                            renew_credential(&shared).await;
                        }
                    }
                }
            }
            Err(e) => {
                failures += 1;
                tracing::warn!(
                    "Realtime connect failed (attempt {}/{}): {}",
                    failures,
                    shared.settings.max_attempts,
                    e
                );
                shared.update_state(run_id, |s| {
                    s.phase = Phase::Reconnecting;
                    s.last_error = Some(e.to_string());
                    s.reconnect_attempts = failures;
                });
                if matches!(e, SyncError::Unauthorized(_)) {
                    renew_credential(&shared).await;
                }
                if failures >= shared.settings.max_attempts {
                    tracing::warn!("Realtime: giving up after {} attempts", failures);
                    shared.update_state(run_id, |s| {
                        s.phase = Phase::Disconnected;
                        s.last_error = Some(format!(
                            "gave up after {} attempts: {}",
                            failures, e
                        ));
                    });
                    break;
                }
            }
        }

        let delay = shared.settings.backoff(failures);
        tracing::debug!("Realtime: next attempt in {:?}", delay);
        let deadline = time::sleep(delay);
        tokio::pin!(deadline);
        loop {
            tokio::select! {
                _ = &mut deadline => break,
                _ = shutdown.changed() => return,
                cmd = commands.recv() => match cmd {
                    Some(cmd) => reject(cmd),
                    None => return,
                },
            }
        }
    }
}

/// Ask the token state for a fresh credential after the realtime endpoint
/// rejected ours. A failed refresh ends the session, which stops this run.
async fn renew_credential(shared: &Shared) {
    if let Err(e) = shared.tokens.refresh().await {
        tracing::warn!("Realtime: credential renewal failed: {}", e);
    }
}

fn reject(command: Command) {
    match command {
        Command::Emit(env) => {
            tracing::debug!("Dropping {} while disconnected", env.event_type);
        }
        Command::Request(_, tx) => {
            let _ = tx.send(Err(SyncError::Unreachable(
                "realtime channel not connected".to_string(),
            )));
        }
    }
}

/// Pump one live connection until it ends.
async fn serve(
    shared: &Shared,
    run_id: u64,
    conn: &mut dyn TransportConnection,
    credential: &Credential,
    commands: &mut mpsc::UnboundedReceiver<Command>,
    creds: &mut watch::Receiver<Option<Arc<Credential>>>,
    shutdown: &mut watch::Receiver<bool>,
) -> ConnectionEnd {
    let mut pending: HashMap<u64, oneshot::Sender<Result<serde_json::Value, SyncError>>> =
        HashMap::new();
    let mut current_token = credential.access_token().to_string();

    // The credential may have changed while the handshake was in flight.
    creds.borrow_and_update();

    let rooms: Vec<String> = lock(&shared.rooms).iter().cloned().collect();
    for room in rooms {
        let join = Envelope::new(kinds::JOIN_CHAT, serde_json::json!({ "chatId": room }));
        if let Err(e) = conn.send(&join).await {
            return ConnectionEnd::Dropped(e);
        }
    }

    let end = loop {
        tokio::select! {
            biased;

            _ = shutdown.changed() => break ConnectionEnd::Shutdown,
            frame = conn.recv() => match frame {
                // A disconnected run must not refill the cleared window.
                Ok(Some(InboundFrame::Event(_))) if !shared.is_active(run_id) => {
                    break ConnectionEnd::Shutdown;
                }
                Ok(Some(InboundFrame::Event(envelope))) => shared.handle_inbound(envelope),
                Ok(Some(InboundFrame::Ack { id, result })) => {
                    match pending.remove(&id) {
                        Some(tx) => {
                            let _ = tx.send(result);
                        }
                        None => tracing::debug!("Ack {} has no waiter", id),
                    }
                }
                Ok(None) => break ConnectionEnd::Dropped(
                    SyncError::Unreachable("closed by server".to_string()),
                ),
                Err(e) => break ConnectionEnd::Dropped(e),
            },
            cmd = commands.recv() => match cmd {
                Some(Command::Emit(envelope)) => {
                    if let Err(e) = conn.send(&envelope).await {
                        break ConnectionEnd::Dropped(e);
                    }
                }
                Some(Command::Request(envelope, tx)) => {
                    let Some(id) = envelope.ack_id else {
                        let _ = tx.send(Err(SyncError::Validation("request without ack id".to_string())));
                        continue;
                    };
                    if let Err(e) = conn.send(&envelope).await {
                        let _ = tx.send(Err(e.clone()));
                        break ConnectionEnd::Dropped(e);
                    }
                    pending.insert(id, tx);
                }
                None => break ConnectionEnd::Shutdown,
            },
            changed = creds.changed() => {
                if changed.is_err() {
                    break ConnectionEnd::Shutdown;
                }
                let next = creds.borrow_and_update().clone();
                match next {
                    None => break ConnectionEnd::CredentialCleared,
                    Some(c) if c.access_token() != current_token => {
                        match conn.update_auth(c.access_token()).await {
                            Ok(()) => {
                                tracing::info!("Realtime credential updated in place");
                                current_token = c.access_token().to_string();
                            }
                            Err(e) => break ConnectionEnd::Reauthenticate(e),
                        }
                    }
                    Some(_) => {}
                }
            }
        }
        shared
            .counters
            .pending_acks
            .store(pending.len(), Ordering::Relaxed);
    };

    // Waiters on `pending` see their sender dropped and fail as Unreachable.
    shared.counters.pending_acks.store(0, Ordering::Relaxed);
    end
}
