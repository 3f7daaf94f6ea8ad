//! Keepalive loop for one socket session.
//!
//! The loop pings the remote with the timestamp probe, sleeps a jittered
//! interval and repeats until one of three exits:
//!
//! - more than [`MAX_CONSECUTIVE_FAILURES`] failures in a row: the fatal hook
//!   fires with [`FatalEvent::KeepaliveFailed`]
//! - the socket refuses writes because it already sent its close frame
//! - the session is cancelled
//!
//! Timeouts are retried immediately, without sleeping. While the session has
//! opportunistic probes planned, every round also fires a detached admin
//! liveness probe; those never touch the failure counter.

use std::sync::Arc;

use log::{debug, error, info, warn};
use tokio::task::JoinHandle;

use crate::connection::Connection;
use crate::error::{FatalEvent, KeepaliveError};
use crate::session::SocketSession;

/// Consecutive failures tolerated before the connection is declared dead.
///
/// The fatal event fires on the failure after this many.
pub const MAX_CONSECUTIVE_FAILURES: u32 = 4;

/// Why a keepalive loop returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeepaliveExit {
    /// Failure threshold crossed; the fatal hook was invoked.
    Fatal,
    /// The socket was already closing.
    Closing,
    /// The session was torn down.
    Cancelled,
}

/// Handle to a running keepalive loop.
pub struct KeepaliveTaskHandle {
    join_handle: JoinHandle<KeepaliveExit>,
    session: Arc<SocketSession>,
}

impl KeepaliveTaskHandle {
    pub fn session(&self) -> &Arc<SocketSession> {
        &self.session
    }

    pub fn is_finished(&self) -> bool {
        self.join_handle.is_finished()
    }

    /// Wait for the loop to return.
    ///
    /// A panicked or aborted loop is reported as `Cancelled`.
    pub async fn join(self) -> KeepaliveExit {
        match self.join_handle.await {
            Ok(exit) => exit,
            Err(e) => {
                warn!(
                    target: "pulsewire::keepalive",
                    "Keepalive task for session {} did not complete: {}",
                    self.session.id(),
                    e
                );
                KeepaliveExit::Cancelled
            }
        }
    }
}

impl Connection {
    /// Spawn the keepalive loop for `session`.
    pub fn spawn_keepalive(self: &Arc<Self>, session: Arc<SocketSession>) -> KeepaliveTaskHandle {
        let join_handle = tokio::spawn(keepalive_loop(self.clone(), session.clone()));
        KeepaliveTaskHandle {
            join_handle,
            session,
        }
    }
}

async fn keepalive_loop(connection: Arc<Connection>, session: Arc<SocketSession>) -> KeepaliveExit {
    debug!(
        target: "pulsewire::keepalive",
        "Keepalive loop starting for session {}",
        session.id()
    );
    let exit = run_rounds(&connection, &session).await;
    debug!(
        target: "pulsewire::keepalive",
        "Keepalive loop exiting for session {}: {:?}",
        session.id(),
        exit
    );
    exit
}

async fn run_rounds(connection: &Arc<Connection>, session: &Arc<SocketSession>) -> KeepaliveExit {
    let interval = connection.config().interval;
    session.reset_failures();

    loop {
        if session.planned_extra_probes() > 0 {
            tokio::spawn(extra_probe(connection.clone(), session.clone()));
        }

        match connection.send_keepalive(session).await {
            Ok(()) => {
                let previous = session.reset_failures();
                if previous > 0 {
                    debug!(
                        target: "pulsewire::keepalive",
                        "Keepalive for session {} is working again after {} errors",
                        session.id(),
                        previous
                    );
                }
            }
            Err(err) if err.is_clean_shutdown() => return KeepaliveExit::Closing,
            Err(err) => {
                let count = connection.record_timeout(session);
                error!(
                    target: "pulsewire::keepalive",
                    "Keepalive for session {} failed (error #{}): {}",
                    session.id(),
                    count,
                    err
                );
                if count > MAX_CONSECUTIVE_FAILURES {
                    connection.fire_fatal(FatalEvent::KeepaliveFailed);
                    return KeepaliveExit::Fatal;
                }
                if err.is_timeout() {
                    continue;
                }
            }
        }

        let pause = interval.sample();
        tokio::select! {
            biased;
            _ = session.cancelled() => return KeepaliveExit::Cancelled,
            _ = session.woken() => {}
            _ = tokio::time::sleep(pause) => {}
        }
    }
}

/// Opportunistic liveness probe fired from the loop.
///
/// Only ever decrements the planned-probe countdown (on success) or raises
/// the fatal hook (on explicit rejection).
async fn extra_probe(connection: Arc<Connection>, session: Arc<SocketSession>) {
    if !connection.is_current(&session) {
        warn!(
            target: "pulsewire::keepalive",
            "Admin test requested for stale session {}",
            session.id()
        );
        return;
    }

    let result = connection.probe_session(&session, false, false).await;
    if session.is_closed() {
        return;
    }

    match result {
        Ok(()) => {
            let remaining = session.complete_extra_probe();
            if remaining == 0 {
                info!(
                    target: "pulsewire::keepalive",
                    "Keepalive admin test successful, not pinging anymore"
                );
            } else {
                info!(
                    target: "pulsewire::keepalive",
                    "Keepalive admin test successful, stopping pings after {} more successes",
                    remaining
                );
            }
        }
        Err(KeepaliveError::PingRejected) => {
            warn!(
                target: "pulsewire::keepalive",
                "Keepalive admin test rejected by server"
            );
            if connection.is_current(&session) {
                connection.fire_fatal(FatalEvent::PingRejected);
            }
        }
        Err(err) => {
            warn!(
                target: "pulsewire::keepalive",
                "Keepalive admin test failed: {}",
                err
            );
        }
    }
}
