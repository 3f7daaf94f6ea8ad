//! Per-socket keepalive state.
//!
//! A [`SocketSession`] lives exactly as long as one physical connection. It
//! owns the consecutive failure counter, the countdown of opportunistic
//! liveness probes, and the wake/cancel signals every blocking wait in this
//! crate selects on.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::transport::Transport;

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// State of one physical connection.
pub struct SocketSession {
    id: u64,
    transport: Arc<dyn Transport>,
    consecutive_failures: AtomicU32,
    planned_extra_probes: AtomicU32,
    wake: Notify,
    cancel: CancellationToken,
}

impl SocketSession {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            id: NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed),
            transport,
            consecutive_failures: AtomicU32::new(0),
            planned_extra_probes: AtomicU32::new(0),
            wake: Notify::new(),
            cancel: CancellationToken::new(),
        }
    }

    /// Process-unique id, for log lines.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn transport(&self) -> &dyn Transport {
        self.transport.as_ref()
    }

    /// Record one failure and return the updated count.
    pub fn count_failure(&self) -> u32 {
        self.consecutive_failures.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Reset the failure counter, returning the count it had.
    pub fn reset_failures(&self) -> u32 {
        self.consecutive_failures.swap(0, Ordering::AcqRel)
    }

    pub fn failure_count(&self) -> u32 {
        self.consecutive_failures.load(Ordering::Acquire)
    }

    /// Ask the keepalive loop to run `count` opportunistic liveness probes.
    pub fn plan_extra_probes(&self, count: u32) {
        self.planned_extra_probes.store(count, Ordering::Release);
    }

    pub fn planned_extra_probes(&self) -> u32 {
        self.planned_extra_probes.load(Ordering::Acquire)
    }

    /// Consume one planned probe after a success; saturates at zero.
    ///
    /// Returns the number still planned.
    pub(crate) fn complete_extra_probe(&self) -> u32 {
        let previous = self
            .planned_extra_probes
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .unwrap_or(0);
        previous.saturating_sub(1)
    }

    /// Cut the keepalive loop's current sleep short.
    pub fn wake(&self) {
        self.wake.notify_one();
    }

    pub(crate) async fn woken(&self) {
        self.wake.notified().await
    }

    /// Tear the session down. Fires the cancel signal exactly once; later
    /// calls are no-ops.
    pub fn close(&self) {
        self.cancel.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolves once the session is torn down.
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }

    pub(crate) fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }
}

impl std::fmt::Debug for SocketSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SocketSession")
            .field("id", &self.id)
            .field("consecutive_failures", &self.failure_count())
            .field("planned_extra_probes", &self.planned_extra_probes())
            .field("closed", &self.is_closed())
            .finish()
    }
}
