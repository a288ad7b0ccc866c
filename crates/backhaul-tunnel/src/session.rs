//! Session management
//!
//! The proxy keeps at most one active session. A newly accepted session
//! replaces the previous one, which is closed before the new one becomes
//! visible. Teardown is identity-checked so a session is torn down once.

use backhaul_transport::TransportConnection;
use chrono::{DateTime, Utc};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::{watch, RwLock};
use tokio::task::AbortHandle;
use tracing::{debug, info};

/// Lifecycle of a session, shared by both roles
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Established,
    /// The peer stopped sending probes
    TimedOut,
    /// The transport reported the connection closed
    TransportError,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Disconnected => "disconnected",
            SessionState::Connecting => "connecting",
            SessionState::Established => "established",
            SessionState::TimedOut => "timed-out",
            SessionState::TransportError => "transport-error",
        };
        f.write_str(name)
    }
}

/// Observable session state
#[derive(Debug)]
pub struct StateTracker {
    tx: watch::Sender<SessionState>,
}

impl StateTracker {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(SessionState::Disconnected);
        Self { tx }
    }

    pub fn set(&self, state: SessionState) {
        let previous = self.tx.send_replace(state);
        if previous != state {
            debug!(from = %previous, to = %state, "Session state changed");
        }
    }

    pub fn get(&self) -> SessionState {
        *self.tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.tx.subscribe()
    }
}

impl Default for StateTracker {
    fn default() -> Self {
        Self::new()
    }
}

/// Time of the last valid probe
#[derive(Debug)]
pub struct LivenessState {
    last_probe: Mutex<Instant>,
}

impl LivenessState {
    pub fn new() -> Self {
        Self {
            last_probe: Mutex::new(Instant::now()),
        }
    }

    pub fn touch(&self) {
        let mut last = self.last_probe.lock().unwrap_or_else(|e| e.into_inner());
        *last = Instant::now();
    }

    pub fn last_probe(&self) -> Instant {
        *self.last_probe.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Time since the last probe (or since the session was installed)
    pub fn silence(&self) -> Duration {
        self.last_probe().elapsed()
    }
}

impl Default for LivenessState {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug)]
struct HeartbeatHandle {
    stream_id: u64,
    task: AbortHandle,
}

/// The active session and everything it owns
#[derive(Debug)]
pub struct ActiveSession<C> {
    id: u64,
    connection: C,
    established_at: DateTime<Utc>,
    liveness: LivenessState,
    heartbeat: Mutex<Option<HeartbeatHandle>>,
    closed: AtomicBool,
}

impl<C: TransportConnection> ActiveSession<C> {
    fn new(id: u64, connection: C) -> Self {
        Self {
            id,
            connection,
            established_at: Utc::now(),
            liveness: LivenessState::new(),
            heartbeat: Mutex::new(None),
            closed: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn connection(&self) -> &C {
        &self.connection
    }

    pub fn established_at(&self) -> DateTime<Utc> {
        self.established_at
    }

    pub fn liveness(&self) -> &LivenessState {
        &self.liveness
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst) || self.connection.is_closed()
    }

    /// Stream id of the installed heartbeat stream, if any
    pub fn heartbeat_stream_id(&self) -> Option<u64> {
        self.heartbeat
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .map(|handle| handle.stream_id)
    }

    /// Attach the task reading this session's heartbeat stream
    ///
    /// A previously installed heartbeat task is aborted, which drops its
    /// stream. Returns false (and aborts `task`) if the session is closed.
    pub fn install_heartbeat(&self, stream_id: u64, task: AbortHandle) -> bool {
        let mut slot = self.heartbeat.lock().unwrap_or_else(|e| e.into_inner());
        if self.closed.load(Ordering::SeqCst) {
            task.abort();
            return false;
        }
        if let Some(previous) = slot.replace(HeartbeatHandle { stream_id, task }) {
            debug!(
                session_id = self.id,
                stream_id = previous.stream_id,
                "Replacing heartbeat stream"
            );
            previous.task.abort();
        }
        true
    }

    /// Close the heartbeat stream and then the connection, once
    async fn close(&self, reason: &str) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        let heartbeat = self
            .heartbeat
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(handle) = heartbeat {
            handle.task.abort();
        }

        self.connection.close(0, reason).await;

        info!(
            session_id = self.id,
            peer = %self.connection.remote_address(),
            reason = %reason,
            uptime_secs = (Utc::now() - self.established_at).num_seconds(),
            "Session closed"
        );
    }
}

/// Holds the single active session of a proxy
#[derive(Debug)]
pub struct SessionManager<C> {
    slot: RwLock<Option<Arc<ActiveSession<C>>>>,
    next_id: AtomicU64,
    state: StateTracker,
}

impl<C: TransportConnection> SessionManager<C> {
    pub fn new() -> Self {
        Self {
            slot: RwLock::new(None),
            next_id: AtomicU64::new(1),
            state: StateTracker::new(),
        }
    }

    /// Install a new session, closing the previous one first
    pub async fn install(&self, connection: C) -> Arc<ActiveSession<C>> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let session = Arc::new(ActiveSession::new(id, connection));

        let mut slot = self.slot.write().await;
        if let Some(previous) = slot.take() {
            info!(
                session_id = previous.id(),
                new_session_id = id,
                "Replacing active session"
            );
            previous.close("superseded by a new session").await;
        }
        *slot = Some(session.clone());
        // State changes happen under the slot lock so they land in slot order
        self.state.set(SessionState::Established);
        drop(slot);

        info!(
            session_id = id,
            peer = %session.connection().remote_address(),
            connection_id = %session.connection().connection_id(),
            "Session established"
        );

        session
    }

    pub async fn current(&self) -> Option<Arc<ActiveSession<C>>> {
        self.slot.read().await.clone()
    }

    /// Tear down `session` if it is still the active one
    ///
    /// Returns true if this call did the teardown.
    pub async fn teardown_if_current(
        &self,
        session: &ActiveSession<C>,
        outcome: SessionState,
    ) -> bool {
        let mut slot = self.slot.write().await;
        let is_current = slot
            .as_ref()
            .map(|current| current.id() == session.id())
            .unwrap_or(false);
        if !is_current {
            return false;
        }

        if let Some(current) = slot.take() {
            current.close(&outcome.to_string()).await;
        }
        self.state.set(outcome);
        self.state.set(SessionState::Disconnected);
        true
    }

    /// Close whatever session is active
    pub async fn shutdown(&self, reason: &str) {
        let mut slot = self.slot.write().await;
        if let Some(session) = slot.take() {
            session.close(reason).await;
            self.state.set(SessionState::Disconnected);
        }
    }

    pub fn state(&self) -> SessionState {
        self.state.get()
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }
}

impl<C: TransportConnection> Default for SessionManager<C> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use backhaul_transport::mock::MockConnection;

    fn idle_task() -> tokio::task::JoinHandle<()> {
        tokio::spawn(std::future::pending::<()>())
    }

    #[tokio::test]
    async fn test_install_makes_session_current() {
        let manager = SessionManager::new();
        assert!(manager.current().await.is_none());
        assert_eq!(manager.state(), SessionState::Disconnected);

        let (conn, _peer) = MockConnection::pair();
        let session = manager.install(conn).await;

        let current = manager.current().await.unwrap();
        assert_eq!(current.id(), session.id());
        assert_eq!(manager.state(), SessionState::Established);
        assert!(!session.is_closed());
    }

    #[tokio::test]
    async fn test_last_accepted_session_wins() {
        let manager = SessionManager::new();

        let (first_conn, first_peer) = MockConnection::pair();
        let first = manager.install(first_conn).await;
        let heartbeat = idle_task();
        assert!(first.install_heartbeat(0, heartbeat.abort_handle()));

        let (second_conn, _second_peer) = MockConnection::pair();
        let second = manager.install(second_conn).await;

        assert!(first.is_closed());
        assert!(first_peer.is_closed());
        assert_eq!(
            first_peer.close_reason().as_deref(),
            Some("superseded by a new session")
        );
        assert!(heartbeat.await.unwrap_err().is_cancelled());

        assert!(!second.is_closed());
        assert_eq!(manager.current().await.unwrap().id(), second.id());
    }

    #[tokio::test]
    async fn test_teardown_happens_once() {
        let manager = SessionManager::new();
        let (conn, peer) = MockConnection::pair();
        let session = manager.install(conn).await;

        assert!(
            manager
                .teardown_if_current(&session, SessionState::TimedOut)
                .await
        );
        assert!(
            !manager
                .teardown_if_current(&session, SessionState::TimedOut)
                .await
        );

        assert!(manager.current().await.is_none());
        assert!(peer.is_closed());
        assert_eq!(peer.close_reason().as_deref(), Some("timed-out"));
        assert_eq!(manager.state(), SessionState::Disconnected);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_state_follows_slot_when_teardown_races_install() {
        let manager = Arc::new(SessionManager::new());

        for _ in 0..200 {
            let (old_conn, _old_peer) = MockConnection::pair();
            let old = manager.install(old_conn).await;
            let (new_conn, _new_peer) = MockConnection::pair();

            let tearing = manager.clone();
            let teardown = tokio::spawn(async move {
                tearing
                    .teardown_if_current(&old, SessionState::TimedOut)
                    .await
            });
            let installing = manager.clone();
            let install = tokio::spawn(async move { installing.install(new_conn).await });
            teardown.await.unwrap();
            install.await.unwrap();

            let expected = match manager.current().await {
                Some(_) => SessionState::Established,
                None => SessionState::Disconnected,
            };
            assert_eq!(manager.state(), expected);
        }
    }

    #[tokio::test]
    async fn test_stale_teardown_leaves_new_session_alone() {
        let manager = SessionManager::new();
        let (old_conn, _old_peer) = MockConnection::pair();
        let old = manager.install(old_conn).await;
        let (new_conn, new_peer) = MockConnection::pair();
        let new = manager.install(new_conn).await;

        assert!(
            !manager
                .teardown_if_current(&old, SessionState::TimedOut)
                .await
        );
        assert_eq!(manager.current().await.unwrap().id(), new.id());
        assert!(!new_peer.is_closed());
    }

    #[tokio::test]
    async fn test_replacing_heartbeat_aborts_previous_reader() {
        let manager = SessionManager::new();
        let (conn, _peer) = MockConnection::pair();
        let session = manager.install(conn).await;

        let first = idle_task();
        let second = idle_task();
        assert!(session.install_heartbeat(0, first.abort_handle()));
        assert!(session.install_heartbeat(4, second.abort_handle()));

        assert!(first.await.unwrap_err().is_cancelled());
        assert_eq!(session.heartbeat_stream_id(), Some(4));

        manager.shutdown("test over").await;
        assert!(second.await.unwrap_err().is_cancelled());
    }

    #[tokio::test]
    async fn test_heartbeat_rejected_after_close() {
        let manager = SessionManager::new();
        let (conn, _peer) = MockConnection::pair();
        let session = manager.install(conn).await;
        manager.shutdown("stopping").await;

        let late = idle_task();
        assert!(!session.install_heartbeat(0, late.abort_handle()));
        assert!(late.await.unwrap_err().is_cancelled());
    }

    #[tokio::test]
    async fn test_liveness_touch_resets_silence() {
        let liveness = LivenessState::new();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(liveness.silence() >= Duration::from_millis(50));
        liveness.touch();
        assert!(liveness.silence() < Duration::from_millis(50));
    }

    #[tokio::test]
    async fn test_state_subscribers_see_transitions() {
        let manager = SessionManager::new();
        let mut states = manager.subscribe();

        let (conn, _peer) = MockConnection::pair();
        manager.install(conn).await;
        states.changed().await.unwrap();
        assert_eq!(*states.borrow_and_update(), SessionState::Established);

        manager.shutdown("done").await;
        states.changed().await.unwrap();
        assert_eq!(*states.borrow_and_update(), SessionState::Disconnected);
    }
}
