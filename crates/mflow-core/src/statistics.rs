//! Receive-side byte and message counters

use serde::{Deserialize, Serialize};

/// Counters maintained by a frame reader.
///
/// `bytes_received` accumulates the frames of the message currently being
/// read and is always zero between messages. It is folded into
/// `total_bytes_received` only when a message completes successfully.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Statistics {
    /// Bytes read so far for the message in flight
    pub bytes_received: u64,
    /// Bytes of all successfully received messages
    pub total_bytes_received: u64,
    /// Number of successfully received messages
    pub messages_received: u64,
}

impl Statistics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Account for one frame of the message in flight
    pub fn record_frame(&mut self, len: usize) {
        self.bytes_received += len as u64;
    }

    /// Commit the message in flight
    pub fn commit(&mut self) {
        self.total_bytes_received += self.bytes_received;
        self.bytes_received = 0;
        self.messages_received += 1;
    }

    /// Drop the message in flight without touching the totals
    pub fn discard(&mut self) {
        self.bytes_received = 0;
    }
}
