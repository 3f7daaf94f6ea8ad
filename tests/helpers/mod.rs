//! Shared fixtures for the integration tests: a scripted remote peer and a
//! recorder for hook invocations.

#![allow(dead_code)]

use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use pulsewire::wire::{ADMIN_TEST_PAYLOAD, KEEPALIVE_FRAME, KEEPALIVE_TAG};
use pulsewire::{
    Connection, FatalEvent, FrameReceiver, Hooks, KeepaliveConfig, MessageTimeout,
    ProbeInterval, QueuedTransport, SocketSession,
};
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// How the simulated remote answers.
#[derive(Debug, Clone)]
pub struct PeerScript {
    /// Leave this many keepalive pings unanswered before replying.
    pub unanswered_pings: u32,
    /// Body sent back for each keepalive ping.
    pub pong_body: &'static str,
    /// Body sent back for each admin test, or `None` to stay silent.
    pub admin_reply: Option<&'static str>,
}

impl Default for PeerScript {
    fn default() -> Self {
        Self {
            unanswered_pings: 0,
            pong_body: "1700000000000",
            admin_reply: Some(r#"["Pong",true]"#),
        }
    }
}

/// Remote endpoint reading the outbound queue and routing replies back.
pub struct Peer {
    pings: Arc<Mutex<Vec<Instant>>>,
    admin_tags: Arc<Mutex<Vec<String>>>,
    _handle: JoinHandle<()>,
}

impl Peer {
    pub fn spawn(connection: Arc<Connection>, mut rx: FrameReceiver, script: PeerScript) -> Self {
        let pings = Arc::new(Mutex::new(Vec::new()));
        let admin_tags = Arc::new(Mutex::new(Vec::new()));

        let handle = {
            let pings = pings.clone();
            let admin_tags = admin_tags.clone();
            tokio::spawn(async move {
                while let Some(frame) = rx.recv().await {
                    let Some(text) = frame.text() else { continue };
                    if text == KEEPALIVE_FRAME {
                        let seen = {
                            let mut pings = pings.lock().unwrap();
                            pings.push(Instant::now());
                            pings.len() as u32
                        };
                        if seen > script.unanswered_pings {
                            connection.listeners().route(KEEPALIVE_TAG, script.pong_body);
                        }
                    } else if let Some(tag) = text.strip_suffix(ADMIN_TEST_PAYLOAD) {
                        let tag = tag.trim_end_matches(',').to_string();
                        admin_tags.lock().unwrap().push(tag.clone());
                        if let Some(reply) = script.admin_reply {
                            connection.listeners().route(&tag, reply);
                        }
                    }
                }
            })
        };

        Self {
            pings,
            admin_tags,
            _handle: handle,
        }
    }

    pub fn pings(&self) -> Vec<Instant> {
        self.pings.lock().unwrap().clone()
    }

    pub fn admin_tags(&self) -> Vec<String> {
        self.admin_tags.lock().unwrap().clone()
    }
}

/// Records every hook invocation.
#[derive(Clone, Default)]
pub struct HookLog {
    fatal: Arc<Mutex<Vec<FatalEvent>>>,
    timeouts: Arc<Mutex<Vec<u32>>>,
    probes: Arc<Mutex<Vec<bool>>>,
}

impl HookLog {
    pub fn hooks(&self) -> Hooks {
        let fatal = self.fatal.clone();
        let timeouts = self.timeouts.clone();
        let probes = self.probes.clone();
        Hooks::new()
            .on_fatal(move |event| fatal.lock().unwrap().push(event))
            .on_timeout(move |count| timeouts.lock().unwrap().push(count))
            .on_probe_result(move |result| probes.lock().unwrap().push(result.is_ok()))
    }

    pub fn fatal(&self) -> Vec<FatalEvent> {
        self.fatal.lock().unwrap().clone()
    }

    pub fn timeouts(&self) -> Vec<u32> {
        self.timeouts.lock().unwrap().clone()
    }

    pub fn probes(&self) -> Vec<bool> {
        self.probes.lock().unwrap().clone()
    }
}

pub fn config(min_ms: u64, max_ms: u64, extra_probes: u32) -> KeepaliveConfig {
    KeepaliveConfig {
        message_timeout: MessageTimeout::default(),
        interval: ProbeInterval::from_millis(min_ms, max_ms).unwrap(),
        extra_probes,
    }
}

/// Connection with a fresh session and a scripted peer behind it.
pub fn connect(
    config: KeepaliveConfig,
    log: &HookLog,
    script: PeerScript,
) -> (Arc<Connection>, Arc<SocketSession>, QueuedTransport, Peer) {
    let connection = Arc::new(Connection::new(config, log.hooks()));
    let (transport, rx) = QueuedTransport::new();
    let session = connection.open_session(Arc::new(transport.clone()));
    let peer = Peer::spawn(connection.clone(), rx, script);
    (connection, session, transport, peer)
}

/// Poll `condition` every 10ms of (virtual) time, for at most `limit`.
pub async fn wait_until(limit: Duration, mut condition: impl FnMut() -> bool) {
    let polled = tokio::time::timeout(limit, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(polled.is_ok(), "condition not met within {limit:?}");
}

/// Await `future`, failing the test if it takes longer than `limit`.
pub async fn within<T>(limit: Duration, future: impl Future<Output = T>) -> T {
    tokio::time::timeout(limit, future)
        .await
        .unwrap_or_else(|_| panic!("did not complete within {limit:?}"))
}
