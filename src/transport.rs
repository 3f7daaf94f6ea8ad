//! Outbound side of the duplex socket.
//!
//! The keepalive machinery only needs a non-blocking "queue this frame" call.
//! [`QueuedTransport`] provides it over a bounded channel; whatever drives the
//! physical socket drains the matching [`FrameReceiver`].

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::mpsc;

use crate::error::TransportError;

/// Queue capacity for outbound frames.
///
/// Bounds memory and gives backpressure: a full queue fails the write instead
/// of blocking the caller.
pub const OUTBOUND_QUEUE_CAPACITY: usize = 256;

/// Kind of websocket frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameType {
    Text,
    Binary,
}

/// One queued outbound frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub frame_type: FrameType,
    pub payload: Vec<u8>,
}

impl Frame {
    /// Payload as UTF-8, for text frames.
    pub fn text(&self) -> Option<&str> {
        match self.frame_type {
            FrameType::Text => std::str::from_utf8(&self.payload).ok(),
            FrameType::Binary => None,
        }
    }
}

/// Non-blocking frame writer.
///
/// Implementations must not block: a write either queues the frame or fails
/// right away.
pub trait Transport: Send + Sync {
    fn write(&self, frame_type: FrameType, payload: Vec<u8>) -> Result<(), TransportError>;
}

/// Transport backed by a bounded outbound queue.
#[derive(Debug, Clone)]
pub struct QueuedTransport {
    tx: mpsc::Sender<Frame>,
    closing: Arc<AtomicBool>,
}

/// Receiving end of a [`QueuedTransport`].
pub type FrameReceiver = mpsc::Receiver<Frame>;

impl QueuedTransport {
    pub fn new() -> (Self, FrameReceiver) {
        Self::with_capacity(OUTBOUND_QUEUE_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> (Self, FrameReceiver) {
        let (tx, rx) = mpsc::channel(capacity);
        let transport = Self {
            tx,
            closing: Arc::new(AtomicBool::new(false)),
        };
        (transport, rx)
    }

    /// Mark the socket as closing; every later write fails with
    /// [`TransportError::CloseSent`].
    pub fn close(&self) {
        self.closing.store(true, Ordering::Release);
    }

    pub fn is_closing(&self) -> bool {
        self.closing.load(Ordering::Acquire)
    }
}

impl Transport for QueuedTransport {
    fn write(&self, frame_type: FrameType, payload: Vec<u8>) -> Result<(), TransportError> {
        if self.is_closing() {
            return Err(TransportError::CloseSent);
        }
        self.tx
            .try_send(Frame {
                frame_type,
                payload,
            })
            .map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => TransportError::QueueFull,
                mpsc::error::TrySendError::Closed(_) => TransportError::Closed,
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn write_queues_frame_for_receiver() {
        let (transport, mut rx) = QueuedTransport::new();
        transport
            .write(FrameType::Text, b"?,,".to_vec())
            .expect("write should queue");

        let frame = rx.recv().await.expect("frame should be queued");
        assert_eq!(frame.frame_type, FrameType::Text);
        assert_eq!(frame.text(), Some("?,,"));
    }

    #[test]
    fn write_after_close_is_close_sent() {
        let (transport, _rx) = QueuedTransport::new();
        transport.close();
        assert_eq!(
            transport.write(FrameType::Text, Vec::new()),
            Err(TransportError::CloseSent)
        );
    }

    #[test]
    fn full_queue_fails_without_blocking() {
        let (transport, _rx) = QueuedTransport::with_capacity(1);
        transport.write(FrameType::Text, b"a".to_vec()).unwrap();
        assert_eq!(
            transport.write(FrameType::Text, b"b".to_vec()),
            Err(TransportError::QueueFull)
        );
    }

    #[test]
    fn dropped_receiver_is_closed() {
        let (transport, rx) = QueuedTransport::new();
        drop(rx);
        assert_eq!(
            transport.write(FrameType::Text, b"a".to_vec()),
            Err(TransportError::Closed)
        );
    }

    #[test]
    fn binary_frame_has_no_text() {
        let frame = Frame {
            frame_type: FrameType::Binary,
            payload: b"abc".to_vec(),
        };
        assert_eq!(frame.text(), None);
    }
}
