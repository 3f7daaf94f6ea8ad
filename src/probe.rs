//! Single-flight coordination of admin liveness probes.
//!
//! Concurrent callers asking "is the connection alive?" share one coordinator
//! and therefore one probe on the wire. The caller that allocates the
//! coordinator sends the tagged frame; everybody else subscribes to the same
//! pending verdict.
//!
//! # Resolution
//!
//! A coordinator resolves at most once, either from the decoded reply or from
//! a caller publishing a send failure or timeout. Resolution stores the
//! verdict and drains the pending subscribers under one lock; a subscription
//! taken after that point reads the stored verdict. Every subscriber therefore
//! sees the same value, and nobody waits past resolution.
//!
//! The coordinator owns the listener registration for its tag. The entry is
//! removed when the coordinator resolves or its session is torn down, no
//! matter which caller, if any, is still waiting.
//!
//! A coordinator is single-use. Once resolved (or once its session is torn
//! down) the connection allocates a fresh one for the next probe.

use std::sync::{Arc, Mutex};

use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::error::{LockResultExt, ProbeFailure};
use crate::listener::ListenerRegistry;
use crate::wire::{MessageTag, parse_admin_test_reply};

/// Outcome of one liveness probe, shared by every caller that joined it.
pub type ProbeVerdict = Result<(), ProbeFailure>;

/// Registry entry for a probe tag; unregisters on drop.
struct TagRegistration {
    listeners: Arc<ListenerRegistry>,
    tag: MessageTag,
}

impl Drop for TagRegistration {
    fn drop(&mut self) {
        self.listeners.unregister(self.tag.as_str());
    }
}

struct CoordinatorState {
    subscribers: Vec<oneshot::Sender<ProbeVerdict>>,
    result: Option<ProbeVerdict>,
    registration: Option<TagRegistration>,
    timeout_counted: bool,
}

/// Shared, resolve-once liveness probe result.
pub struct ProbeCoordinator {
    tag: MessageTag,
    state: Arc<Mutex<CoordinatorState>>,
    cancel: CancellationToken,
}

impl ProbeCoordinator {
    /// Register `tag` in `listeners` and spawn the task that waits for its reply.
    ///
    /// The task exits on the first delivered reply or when `cancel` fires.
    /// Cancellation without a verdict abandons the coordinator: pending
    /// subscribers observe a closed channel.
    pub fn spawn(
        cancel: CancellationToken,
        listeners: Arc<ListenerRegistry>,
        tag: MessageTag,
    ) -> Arc<Self> {
        let (input, input_rx) = mpsc::channel(1);
        listeners.register(tag.as_str(), input, false);

        let state = Arc::new(Mutex::new(CoordinatorState {
            subscribers: Vec::new(),
            result: None,
            registration: Some(TagRegistration {
                listeners,
                tag: tag.clone(),
            }),
            timeout_counted: false,
        }));

        tokio::spawn(wait_for_reply(input_rx, state.clone(), cancel.clone()));

        Arc::new(Self { tag, state, cancel })
    }

    /// Tag the probe frame must carry.
    pub fn tag(&self) -> &MessageTag {
        &self.tag
    }

    pub fn is_resolved(&self) -> bool {
        self.state
            .lock()
            .recover_poison("ProbeCoordinator::is_resolved")
            .result
            .is_some()
    }

    /// A coordinator that resolved or lost its session must not be reused.
    pub fn is_spent(&self) -> bool {
        self.cancel.is_cancelled() || self.is_resolved()
    }

    /// Subscribe to the verdict.
    ///
    /// After resolution the receiver is already filled with the stored
    /// verdict. If the coordinator is abandoned by teardown the sender is
    /// dropped and the receiver yields `RecvError`.
    pub fn subscribe(&self) -> oneshot::Receiver<ProbeVerdict> {
        let (tx, rx) = oneshot::channel();
        let mut state = self.state.lock().recover_poison("ProbeCoordinator::subscribe");
        match state.result.clone() {
            Some(result) => {
                let _ = tx.send(result);
            }
            None if self.cancel.is_cancelled() => drop(tx),
            None => state.subscribers.push(tx),
        }
        rx
    }

    /// Resolve with `verdict` unless a verdict already exists.
    ///
    /// Returns the verdict that actually stands, which is the earlier one if
    /// this call lost the race, and whether this call set it. Stops the reply
    /// task, so later replies are ignored.
    pub fn resolve(&self, verdict: ProbeVerdict) -> (ProbeVerdict, bool) {
        let outcome = publish(&self.state, verdict);
        self.cancel.cancel();
        outcome
    }

    /// Claim the right to count this probe's timeout against the session.
    ///
    /// Returns `true` exactly once, and only after the probe resolved as
    /// timed out. Callers that do not count timeouts never claim, so a
    /// timeout produced by one of them is still counted by the first counting
    /// caller that observes it.
    pub fn claim_timeout(&self) -> bool {
        let mut state = self.state.lock().recover_poison("ProbeCoordinator::claim_timeout");
        let timed_out = matches!(state.result, Some(Err(ProbeFailure::TimedOut { .. })));
        if !timed_out || state.timeout_counted {
            return false;
        }
        state.timeout_counted = true;
        true
    }

    #[cfg(test)]
    fn subscriber_count(&self) -> usize {
        self.state
            .lock()
            .recover_poison("ProbeCoordinator::subscriber_count")
            .subscribers
            .len()
    }
}

/// Store `verdict`, notify pending subscribers and release the tag, all
/// under one lock.
fn publish(state: &Mutex<CoordinatorState>, verdict: ProbeVerdict) -> (ProbeVerdict, bool) {
    let mut state = state.lock().recover_poison("ProbeCoordinator::publish");
    if let Some(existing) = &state.result {
        return (existing.clone(), false);
    }
    for subscriber in state.subscribers.drain(..) {
        let _ = subscriber.send(verdict.clone());
    }
    state.registration = None;
    state.result = Some(verdict.clone());
    (verdict, true)
}

async fn wait_for_reply(
    mut input: mpsc::Receiver<String>,
    state: Arc<Mutex<CoordinatorState>>,
    cancel: CancellationToken,
) {
    let body = tokio::select! {
        body = input.recv() => body,
        _ = cancel.cancelled() => None,
    };

    let Some(body) = body else {
        // Dropping the senders releases every pending subscriber.
        let mut state = state.lock().recover_poison("ProbeCoordinator::abandon");
        state.subscribers.clear();
        state.registration = None;
        return;
    };

    let (verdict, _) = publish(&state, parse_admin_test_reply(&body));
    log::debug!(
        target: "pulsewire::probe",
        "Liveness probe resolved: {:?}",
        verdict
    );
}
