//! Error types for keepalive and liveness probing.
//!
//! Transient failures (timeouts, write errors, malformed replies) are returned
//! to the immediate caller and counted by the keepalive loop. Only
//! [`FatalEvent`]s cross over to the fatal hook.

use std::num::ParseIntError;
use std::sync::LockResult;

use thiserror::Error;

/// Errors raised by the transport when a frame cannot be queued.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// The socket already sent its close frame; writes are refused from now on.
    #[error("websocket close already sent")]
    CloseSent,

    /// The outbound queue is at capacity.
    #[error("outbound queue is full")]
    QueueFull,

    /// The writer side of the connection is gone.
    #[error("transport closed")]
    Closed,
}

/// Failed outcome of one liveness probe.
///
/// This is the value a probe coordinator fans out to every subscriber, so it
/// must be cheap to clone and comparable.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProbeFailure {
    /// The remote answered `[marker, false]`.
    #[error("remote rejected the liveness probe")]
    Rejected,

    /// The reply did not have the `[marker, bool]` shape.
    #[error("unexpected liveness probe reply: {0}")]
    Malformed(String),

    /// The probe frame could not be sent.
    #[error("error sending admin test: {0}")]
    Write(TransportError),

    /// No reply within the message timeout. `already_failing` records whether
    /// the session had outstanding keepalive failures when the wait expired.
    #[error("liveness probe timed out")]
    TimedOut { already_failing: bool },
}

/// Comprehensive error type for keepalive and probe operations
#[derive(Debug, Error)]
pub enum KeepaliveError {
    /// No socket session is attached
    #[error("not connected")]
    NotConnected,

    /// Session is connected but not authenticated yet
    #[error("not logged in")]
    NotLoggedIn,

    /// No reply arrived within the message timeout
    #[error("connection timed out")]
    ConnectionTimeout,

    /// A timeout observed while earlier consecutive failures were still
    /// outstanding, or the loop's failure threshold being crossed.
    #[error("websocket keepalive failed")]
    KeepaliveFailed,

    /// The remote explicitly answered the liveness probe negatively
    #[error("server responded to ping with false")]
    PingRejected,

    /// Liveness probe reply could not be decoded
    #[error("malformed probe reply: {reason}")]
    MalformedReply { reason: String },

    /// Keepalive reply was not a decimal millisecond timestamp
    #[error("invalid keepalive timestamp {body:?}: {source}")]
    InvalidTimestamp {
        body: String,
        #[source]
        source: ParseIntError,
    },

    /// The transport refused the frame
    #[error("error sending frame: {source}")]
    Write {
        #[source]
        source: TransportError,
    },
}

/// Result type for keepalive operations
pub type KeepaliveResult<T> = Result<T, KeepaliveError>;

impl KeepaliveError {
    /// Create a write error
    pub fn write(source: TransportError) -> Self {
        KeepaliveError::Write { source }
    }

    /// True when the socket refused the write because it is already closing.
    ///
    /// This is the expected shutdown path and never counts as a failure.
    pub fn is_clean_shutdown(&self) -> bool {
        matches!(
            self,
            KeepaliveError::Write {
                source: TransportError::CloseSent
            }
        )
    }

    /// True for both flavours of "no reply within budget".
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            KeepaliveError::ConnectionTimeout | KeepaliveError::KeepaliveFailed
        )
    }
}

impl From<ProbeFailure> for KeepaliveError {
    fn from(err: ProbeFailure) -> Self {
        match err {
            ProbeFailure::Rejected => KeepaliveError::PingRejected,
            ProbeFailure::Malformed(reason) => KeepaliveError::MalformedReply { reason },
            ProbeFailure::Write(source) => KeepaliveError::Write { source },
            ProbeFailure::TimedOut {
                already_failing: true,
            } => KeepaliveError::KeepaliveFailed,
            ProbeFailure::TimedOut {
                already_failing: false,
            } => KeepaliveError::ConnectionTimeout,
        }
    }
}

/// Conditions after which the connection must be considered dead.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FatalEvent {
    /// Consecutive keepalive failures crossed the threshold
    KeepaliveFailed,
    /// The remote rejected an opportunistic liveness probe
    PingRejected,
}

impl std::fmt::Display for FatalEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FatalEvent::KeepaliveFailed => f.write_str("websocket keepalive failed"),
            FatalEvent::PingRejected => f.write_str("server responded to ping with false"),
        }
    }
}

/// Poison recovery for std lock results.
pub(crate) trait LockResultExt<T> {
    /// Take the guard even if a previous holder panicked, logging the recovery.
    ///
    /// Everything behind these locks is plain values and handles that stay
    /// consistent across a panic. `context` names the operation that hit the
    /// poisoned lock.
    fn recover_poison(self, context: &str) -> T;
}

impl<T> LockResultExt<T> for LockResult<T> {
    fn recover_poison(self, context: &str) -> T {
        match self {
            Ok(guard) => guard,
            Err(poisoned) => {
                log::warn!(
                    target: "pulsewire::lock_recovery",
                    "Recovered from poisoned lock in {}",
                    context
                );
                poisoned.into_inner()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn probe_failure_converts_to_distinct_variants() {
        assert!(matches!(
            KeepaliveError::from(ProbeFailure::Rejected),
            KeepaliveError::PingRejected
        ));
        match KeepaliveError::from(ProbeFailure::Malformed("[1]".into())) {
            KeepaliveError::MalformedReply { reason } => assert_eq!(reason, "[1]"),
            other => panic!("expected MalformedReply, got {other:?}"),
        }
        assert!(
            KeepaliveError::from(ProbeFailure::Write(TransportError::CloseSent))
                .is_clean_shutdown()
        );
    }

    #[test]
    fn timed_out_probe_maps_by_prior_failures() {
        assert!(matches!(
            KeepaliveError::from(ProbeFailure::TimedOut {
                already_failing: false
            }),
            KeepaliveError::ConnectionTimeout
        ));
        assert!(matches!(
            KeepaliveError::from(ProbeFailure::TimedOut {
                already_failing: true
            }),
            KeepaliveError::KeepaliveFailed
        ));
    }

    #[test]
    fn only_close_sent_is_clean_shutdown() {
        assert!(KeepaliveError::write(TransportError::CloseSent).is_clean_shutdown());
        assert!(!KeepaliveError::write(TransportError::QueueFull).is_clean_shutdown());
        assert!(!KeepaliveError::ConnectionTimeout.is_clean_shutdown());
    }

    #[test]
    fn both_timeout_flavours_are_timeouts() {
        assert!(KeepaliveError::ConnectionTimeout.is_timeout());
        assert!(KeepaliveError::KeepaliveFailed.is_timeout());
        assert!(!KeepaliveError::PingRejected.is_timeout());
        assert!(!KeepaliveError::write(TransportError::Closed).is_timeout());
    }

    #[test]
    fn recover_poison_survives_poisoned_mutex() {
        let mutex = std::sync::Arc::new(std::sync::Mutex::new(7));
        let clone = mutex.clone();
        let _ = std::thread::spawn(move || {
            let _guard = clone.lock().unwrap();
            panic!("poison the lock");
        })
        .join();

        assert!(mutex.is_poisoned());
        assert_eq!(*mutex.lock().recover_poison("test"), 7);
    }
}
