//! Tag-based routing of inbound reply bodies.
//!
//! Before sending a tagged frame, register a channel for its tag. The socket
//! read loop calls [`ListenerRegistry::route`] for every tagged inbound frame,
//! and the waiter receives the raw textual body.
//!
//! Registrations are either one-shot (removed on first delivery) or
//! persistent (kept until [`ListenerRegistry::unregister`]). Persistent
//! registrations let several tags feed the same channel, which is how the
//! liveness probe coordinator collects replies for every caller sharing it.

use std::collections::HashMap;
use std::sync::Mutex;

use tokio::sync::mpsc;

use crate::error::LockResultExt;

struct Waiter {
    tx: mpsc::Sender<String>,
    one_shot: bool,
}

/// Routes reply bodies to waiting channels by tag.
pub struct ListenerRegistry {
    waiters: Mutex<HashMap<String, Waiter>>,
}

impl ListenerRegistry {
    pub fn new() -> Self {
        Self {
            waiters: Mutex::new(HashMap::new()),
        }
    }

    /// Register `tx` as the waiter for `tag`.
    ///
    /// Must be called before the frame is sent so the reply cannot race ahead
    /// of the registration. A previous waiter for the same tag is displaced;
    /// returns `true` in that case.
    pub fn register(&self, tag: &str, tx: mpsc::Sender<String>, one_shot: bool) -> bool {
        let mut waiters = self.waiters.lock().recover_poison("ListenerRegistry::register");
        let displaced = waiters
            .insert(tag.to_string(), Waiter { tx, one_shot })
            .is_some();
        if displaced {
            log::debug!(
                target: "pulsewire::listener",
                "Replaced pending waiter for tag {}",
                tag
            );
        }
        displaced
    }

    /// Remove the waiter for `tag` without delivering anything.
    ///
    /// Returns `true` if a waiter was registered.
    pub fn unregister(&self, tag: &str) -> bool {
        let mut waiters = self.waiters.lock().recover_poison("ListenerRegistry::unregister");
        waiters.remove(tag).is_some()
    }

    /// Deliver `body` to the waiter registered for `tag`.
    ///
    /// Returns `true` if the body was handed to a live channel. Delivery never
    /// blocks: a waiter whose channel is full or closed simply misses it.
    pub fn route(&self, tag: &str, body: impl Into<String>) -> bool {
        let mut waiters = self.waiters.lock().recover_poison("ListenerRegistry::route");
        let Some(waiter) = waiters.get(tag) else {
            log::debug!(
                target: "pulsewire::listener",
                "Reply for unknown tag {}, dropping",
                tag
            );
            return false;
        };

        let delivered = waiter.tx.try_send(body.into()).is_ok();
        if waiter.one_shot || waiter.tx.is_closed() {
            waiters.remove(tag);
        }
        delivered
    }

    /// Number of tags with a registered waiter.
    pub fn pending_count(&self) -> usize {
        self.waiters.lock().recover_poison("ListenerRegistry::pending_count").len()
    }
}

impl Default for ListenerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_registry_has_no_waiters() {
        assert_eq!(ListenerRegistry::new().pending_count(), 0);
    }

    #[tokio::test]
    async fn one_shot_waiter_is_removed_after_delivery() {
        let registry = ListenerRegistry::new();
        let (tx, mut rx) = mpsc::channel(1);
        registry.register("!", tx, true);

        assert!(registry.route("!", "1700000000000"));
        assert_eq!(rx.recv().await.as_deref(), Some("1700000000000"));
        assert_eq!(registry.pending_count(), 0);
        assert!(!registry.route("!", "again"), "second reply has no waiter");
    }

    #[tokio::test]
    async fn persistent_waiters_share_one_channel() {
        let registry = ListenerRegistry::new();
        let (tx, mut rx) = mpsc::channel(4);
        registry.register("1.--0", tx.clone(), false);
        registry.register("1.--1", tx, false);

        assert!(registry.route("1.--1", r#"["Pong",true]"#));
        assert_eq!(rx.recv().await.as_deref(), Some(r#"["Pong",true]"#));
        assert_eq!(registry.pending_count(), 2, "persistent waiters remain");

        assert!(registry.unregister("1.--0"));
        assert!(registry.unregister("1.--1"));
        assert_eq!(registry.pending_count(), 0);
    }

    #[test]
    fn route_unknown_tag_returns_false() {
        let registry = ListenerRegistry::new();
        assert!(!registry.route("missing", "body"));
    }

    #[test]
    fn unregister_unknown_tag_returns_false() {
        let registry = ListenerRegistry::new();
        assert!(!registry.unregister("missing"));
    }

    #[test]
    fn register_same_tag_displaces_previous_waiter() {
        let registry = ListenerRegistry::new();
        let (tx1, _rx1) = mpsc::channel(1);
        let (tx2, _rx2) = mpsc::channel(1);

        assert!(!registry.register("!", tx1, true));
        assert!(registry.register("!", tx2, true));
        assert_eq!(registry.pending_count(), 1);
    }

    #[test]
    fn route_to_dropped_receiver_cleans_up_waiter() {
        let registry = ListenerRegistry::new();
        let (tx, rx) = mpsc::channel(1);
        registry.register("tag", tx, false);
        drop(rx);

        assert!(!registry.route("tag", "body"));
        assert_eq!(registry.pending_count(), 0);
    }
}
