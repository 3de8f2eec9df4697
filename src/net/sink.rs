//! Per-observer network sinks
//!
//! The dispatch stage never blocks on the network: it hands encoded bytes to
//! a [`NetworkSink`], typically the sending half of a channel drained by a
//! separate I/O task. Backpressure is a per-sink policy: an unbounded
//! channel buffers, a bounded one drops when full.

use crossbeam_channel::{Receiver, Sender, TrySendError};

/// Errors a sink can report back to the dispatch stage
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum SinkError {
    #[error("Sink disconnected")]
    Disconnected,
    #[error("Outbound queue full")]
    Full,
}

/// Non-blocking, best-effort outbound queue for one observer
pub trait NetworkSink: Send + Sync {
    fn send(&self, bytes: Vec<u8>) -> Result<(), SinkError>;
}

/// What to do when the outbound queue is full
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverflowPolicy {
    /// Unbounded queue, never drops
    Buffer,
    /// Bounded queue; messages beyond capacity are dropped
    Drop { capacity: usize },
}

impl OverflowPolicy {
    /// `0` means buffer, anything else is a bounded queue of that size
    pub fn from_capacity(capacity: usize) -> Self {
        if capacity == 0 {
            OverflowPolicy::Buffer
        } else {
            OverflowPolicy::Drop { capacity }
        }
    }
}

/// Sink backed by a crossbeam channel
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: Sender<Vec<u8>>,
}

impl ChannelSink {
    /// Create a sink and the receiver the I/O layer drains
    pub fn new(policy: OverflowPolicy) -> (Self, Receiver<Vec<u8>>) {
        let (tx, rx) = match policy {
            OverflowPolicy::Buffer => crossbeam_channel::unbounded(),
            OverflowPolicy::Drop { capacity } => crossbeam_channel::bounded(capacity),
        };
        (Self { tx }, rx)
    }

    pub fn unbounded() -> (Self, Receiver<Vec<u8>>) {
        Self::new(OverflowPolicy::Buffer)
    }

    pub fn bounded(capacity: usize) -> (Self, Receiver<Vec<u8>>) {
        Self::new(OverflowPolicy::Drop { capacity: capacity.max(1) })
    }
}

impl NetworkSink for ChannelSink {
    fn send(&self, bytes: Vec<u8>) -> Result<(), SinkError> {
        self.tx.try_send(bytes).map_err(|e| match e {
            TrySendError::Full(_) => SinkError::Full,
            TrySendError::Disconnected(_) => SinkError::Disconnected,
        })
    }
}
