//! Connection facade: session lifecycle, hooks and request/response probes.
//!
//! [`Connection`] is the owned replacement for ambient per-client state. It
//! tracks the current [`SocketSession`], the connected/logged-in gates, the
//! last server timestamp and the message counter, and it runs the two probe
//! exchanges the keepalive loop is built on:
//!
//! - [`Connection::send_keepalive`]: the cheap timestamp ping
//! - [`Connection::admin_test`]: the end-to-end liveness probe, deduplicated
//!   through a [`ProbeCoordinator`]

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::SystemTime;

use tokio::sync::mpsc;

use crate::config::KeepaliveConfig;
use crate::error::{FatalEvent, KeepaliveError, KeepaliveResult, LockResultExt, ProbeFailure};
use crate::listener::ListenerRegistry;
use crate::probe::{ProbeCoordinator, ProbeVerdict};
use crate::session::SocketSession;
use crate::transport::{FrameType, Transport};
use crate::wire::{KEEPALIVE_FRAME, KEEPALIVE_TAG, MessageTag, admin_test_frame, parse_pong};

pub type FatalHook = Arc<dyn Fn(FatalEvent) + Send + Sync>;
pub type TimeoutHook = Arc<dyn Fn(u32) + Send + Sync>;
pub type ProbeResultHook = Arc<dyn Fn(&KeepaliveResult<()>) + Send + Sync>;

/// Callbacks invoked by the keepalive machinery.
///
/// Hooks run inline on the task that detected the event and must not block;
/// hand work off to a channel or a spawned task if it can take time.
#[derive(Clone, Default)]
pub struct Hooks {
    fatal: Option<FatalHook>,
    timeout: Option<TimeoutHook>,
    probe_result: Option<ProbeResultHook>,
}

impl Hooks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Called once per fatal condition; the connection must be re-established.
    pub fn on_fatal(mut self, hook: impl Fn(FatalEvent) + Send + Sync + 'static) -> Self {
        self.fatal = Some(Arc::new(hook));
        self
    }

    /// Called on every counted timeout with the updated consecutive count.
    pub fn on_timeout(mut self, hook: impl Fn(u32) + Send + Sync + 'static) -> Self {
        self.timeout = Some(Arc::new(hook));
        self
    }

    /// Called with the outcome of every non-suppressed liveness probe.
    pub fn on_probe_result(
        mut self,
        hook: impl Fn(&KeepaliveResult<()>) + Send + Sync + 'static,
    ) -> Self {
        self.probe_result = Some(Arc::new(hook));
        self
    }
}

impl fmt::Debug for Hooks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Hooks")
            .field("fatal", &self.fatal.is_some())
            .field("timeout", &self.timeout.is_some())
            .field("probe_result", &self.probe_result.is_some())
            .finish()
    }
}

/// Per-client connection state shared by the keepalive loop and callers.
pub struct Connection {
    config: KeepaliveConfig,
    hooks: Hooks,
    listeners: Arc<ListenerRegistry>,
    session: Mutex<Option<Arc<SocketSession>>>,
    connected: AtomicBool,
    logged_in: AtomicBool,
    last_seen: Mutex<Option<SystemTime>>,
    message_counter: AtomicU64,
    active_probe: Mutex<Option<Arc<ProbeCoordinator>>>,
}

impl Connection {
    pub fn new(config: KeepaliveConfig, hooks: Hooks) -> Self {
        Self {
            config,
            hooks,
            listeners: Arc::new(ListenerRegistry::new()),
            session: Mutex::new(None),
            connected: AtomicBool::new(false),
            logged_in: AtomicBool::new(false),
            last_seen: Mutex::new(None),
            message_counter: AtomicU64::new(0),
            active_probe: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &KeepaliveConfig {
        &self.config
    }

    /// Registry the socket read loop routes tagged replies through.
    pub fn listeners(&self) -> &Arc<ListenerRegistry> {
        &self.listeners
    }

    /// Attach a freshly connected socket and make it the current session.
    ///
    /// A previous session, if any, is torn down first.
    pub fn open_session(&self, transport: Arc<dyn Transport>) -> Arc<SocketSession> {
        let session = Arc::new(SocketSession::new(transport));
        session.plan_extra_probes(self.config.extra_probes);

        let previous = self
            .session
            .lock()
            .recover_poison("Connection::open_session")
            .replace(session.clone());
        if let Some(previous) = previous {
            log::debug!(
                target: "pulsewire::connection",
                "Replacing session {} with {}",
                previous.id(),
                session.id()
            );
            previous.close();
        }
        self.connected.store(true, Ordering::Release);
        session
    }

    /// Tear down the current session, releasing every wait on it.
    pub fn close_session(&self) {
        let session = self.session.lock().recover_poison("Connection::close_session").take();
        self.connected.store(false, Ordering::Release);
        self.logged_in.store(false, Ordering::Release);
        if let Some(session) = session {
            log::debug!(
                target: "pulsewire::connection",
                "Closing session {}",
                session.id()
            );
            session.close();
        }
    }

    pub fn current_session(&self) -> Option<Arc<SocketSession>> {
        self.session.lock().recover_poison("Connection::current_session").clone()
    }

    pub(crate) fn is_current(&self, session: &Arc<SocketSession>) -> bool {
        self.session.lock().recover_poison("Connection::is_current")
            .as_ref()
            .is_some_and(|current| Arc::ptr_eq(current, session))
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    pub fn set_logged_in(&self, logged_in: bool) {
        self.logged_in.store(logged_in, Ordering::Release);
    }

    pub fn is_logged_in(&self) -> bool {
        self.logged_in.load(Ordering::Acquire)
    }

    /// Server time reported by the last successful keepalive.
    pub fn last_seen(&self) -> Option<SystemTime> {
        *self.last_seen.lock().recover_poison("Connection::last_seen")
    }

    /// Record one timeout against the current session and report it.
    ///
    /// No-op without a session.
    pub fn count_timeout(&self) {
        if let Some(session) = self.current_session() {
            self.record_timeout(&session);
        }
    }

    /// Count a failure on `session` and report the new count to the timeout hook.
    pub(crate) fn record_timeout(&self, session: &SocketSession) -> u32 {
        let count = session.count_failure();
        if let Some(hook) = &self.hooks.timeout {
            hook(count);
        }
        count
    }

    pub(crate) fn fire_fatal(&self, event: FatalEvent) {
        log::warn!(
            target: "pulsewire::connection",
            "Fatal connection event: {}",
            event
        );
        if let Some(hook) = &self.hooks.fatal {
            hook(event);
        }
    }

    /// Send a keepalive ping on `session` and wait for the timestamp reply.
    ///
    /// Teardown during the wait is not a failure and returns `Ok(())`.
    pub async fn send_keepalive(&self, session: &SocketSession) -> KeepaliveResult<()> {
        let (tx, mut rx) = mpsc::channel(1);
        self.listeners.register(KEEPALIVE_TAG, tx, true);

        if let Err(source) = session
            .transport()
            .write(FrameType::Text, KEEPALIVE_FRAME.as_bytes().to_vec())
        {
            self.listeners.unregister(KEEPALIVE_TAG);
            return Err(KeepaliveError::write(source));
        }

        tokio::select! {
            Some(body) = rx.recv() => {
                let seen = parse_pong(&body)?;
                *self.last_seen.lock().recover_poison("Connection::send_keepalive") = Some(seen);
                Ok(())
            }
            _ = tokio::time::sleep(self.config.message_timeout.as_duration()) => {
                self.listeners.unregister(KEEPALIVE_TAG);
                Err(KeepaliveError::ConnectionTimeout)
            }
            _ = session.cancelled() => {
                self.listeners.unregister(KEEPALIVE_TAG);
                Ok(())
            }
        }
    }

    /// Probe end-to-end liveness and report the outcome to the probe hook.
    pub async fn admin_test(&self) -> KeepaliveResult<()> {
        self.admin_test_with_suppress(false).await
    }

    /// Probe end-to-end liveness; `suppress_hook` skips the probe result hook.
    ///
    /// Fails with `NotConnected`/`NotLoggedIn` without any I/O when the gates
    /// are not open. Concurrent callers share one probe and get the same result.
    pub async fn admin_test_with_suppress(&self, suppress_hook: bool) -> KeepaliveResult<()> {
        let session = self.current_session().ok_or(KeepaliveError::NotConnected)?;
        self.probe_session(&session, true, suppress_hook).await
    }

    /// Gate checks, probe and hook for a specific session.
    pub(crate) async fn probe_session(
        &self,
        session: &SocketSession,
        count_timeouts: bool,
        suppress_hook: bool,
    ) -> KeepaliveResult<()> {
        if !self.is_connected() {
            return Err(KeepaliveError::NotConnected);
        }
        if !self.is_logged_in() {
            return Err(KeepaliveError::NotLoggedIn);
        }

        let result = self.send_admin_test(session, count_timeouts).await;
        if !suppress_hook && let Some(hook) = &self.hooks.probe_result {
            hook(&result);
        }
        result
    }

    /// Join the active probe, or allocate a new one if none is usable.
    ///
    /// Returns the coordinator and whether this caller created it (and so is
    /// responsible for sending the frame). A new coordinator reserves the next
    /// message counter value for its tag.
    fn join_probe(&self, session: &SocketSession) -> (Arc<ProbeCoordinator>, bool) {
        let mut active = self.active_probe.lock().recover_poison("Connection::join_probe");
        if let Some(coordinator) = active.as_ref()
            && !coordinator.is_spent()
        {
            return (coordinator.clone(), false);
        }
        let tag = MessageTag::now(self.message_counter.fetch_add(1, Ordering::AcqRel));
        let coordinator = ProbeCoordinator::spawn(
            session.cancel_token().child_token(),
            self.listeners.clone(),
            tag,
        );
        *active = Some(coordinator.clone());
        (coordinator, true)
    }

    /// Send-and-correlate for the liveness probe.
    ///
    /// `count_timeouts` decides whether a timeout observed by this caller is
    /// recorded against the session; the keepalive loop's opportunistic
    /// probes pass `false` so they never move the failure counter. A probe
    /// timeout is recorded at most once, by the first counting caller that
    /// sees it.
    pub(crate) async fn send_admin_test(
        &self,
        session: &SocketSession,
        count_timeouts: bool,
    ) -> KeepaliveResult<()> {
        let (coordinator, leader) = self.join_probe(session);

        if leader {
            log::debug!(
                target: "pulsewire::probe",
                "Sending admin test request with tag {}",
                coordinator.tag()
            );
            let frame = admin_test_frame(coordinator.tag()).into_bytes();
            if let Err(source) = session.transport().write(FrameType::Text, frame) {
                let (verdict, _) = coordinator.resolve(Err(ProbeFailure::Write(source)));
                return verdict.map_err(KeepaliveError::from);
            }
        } else {
            log::debug!(
                target: "pulsewire::probe",
                "Joining in-flight admin test {}",
                coordinator.tag()
            );
        }

        self.await_verdict(&coordinator, session, count_timeouts)
            .await
            .map_err(KeepaliveError::from)
    }

    async fn await_verdict(
        &self,
        coordinator: &ProbeCoordinator,
        session: &SocketSession,
        count_timeouts: bool,
    ) -> ProbeVerdict {
        let subscription = coordinator.subscribe();
        let verdict = tokio::select! {
            verdict = subscription => {
                // A dropped subscription means the session was torn down.
                verdict.unwrap_or(Ok(()))
            }
            _ = tokio::time::sleep(self.config.message_timeout.as_duration()) => {
                let already_failing = session.failure_count() > 0;
                let (verdict, _) =
                    coordinator.resolve(Err(ProbeFailure::TimedOut { already_failing }));
                verdict
            }
            _ = session.cancelled() => return Ok(()),
        };
        if count_timeouts && coordinator.claim_timeout() {
            self.record_timeout(session);
        }
        verdict
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("config", &self.config)
            .field("hooks", &self.hooks)
            .field("connected", &self.is_connected())
            .field("logged_in", &self.is_logged_in())
            .field("last_seen", &self.last_seen())
            .field("message_counter", &self.message_counter.load(Ordering::Relaxed))
            .finish()
    }
}
