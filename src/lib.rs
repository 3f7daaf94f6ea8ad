//! Connection-health monitoring for a single-socket, multiplexed duplex client.
//!
//! Replies on the socket arrive asynchronously and in any order, so every
//! request expecting one is correlated by tag through a [`ListenerRegistry`]
//! and bounded by the message timeout. On top of that the crate runs a
//! jittered keepalive loop per socket session and offers a deduplicated
//! end-to-end liveness probe ([`Connection::admin_test`]).

pub mod config;
pub mod connection;
pub mod error;
pub mod keepalive;
pub mod listener;
pub mod probe;
pub mod session;
pub mod transport;
pub mod wire;

pub use config::{KeepaliveConfig, KeepaliveSettings, MessageTimeout, ProbeInterval};
pub use connection::{Connection, Hooks};
pub use error::{FatalEvent, KeepaliveError, KeepaliveResult, ProbeFailure, TransportError};
pub use keepalive::{KeepaliveExit, KeepaliveTaskHandle, MAX_CONSECUTIVE_FAILURES};
pub use listener::ListenerRegistry;
pub use session::SocketSession;
pub use transport::{Frame, FrameReceiver, FrameType, QueuedTransport, Transport};
