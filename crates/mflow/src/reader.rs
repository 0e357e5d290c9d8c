//! Receive-side frame reader
//!
//! The reader sits between a receiving socket and the handlers. It sniffs
//! the type tag out of the header frame, hands frames to the decoder, counts
//! bytes, and after every message drains whatever the decoder left unread so
//! the next read starts on a header frame.

use async_trait::async_trait;
use bytes::Bytes;
use mflow_core::{htype_of, Error, FrameSource, Result, Statistics};
use mflow_transport::{RecvOutcome, Transport, TransportError};
use serde_json::Value;
use tracing::debug;

pub(crate) fn transport_error(e: TransportError) -> Error {
    Error::Transport(e.to_string())
}

/// Reads one logical message at a time from a receiving socket
pub struct FrameReader {
    transport: Box<dyn Transport>,
    /// Header frame read by [`header`](Self::header) and not yet handed out
    pending_header: Option<Bytes>,
    block: bool,
    /// Set once a frame of the current message has been read
    in_message: bool,
    statistics: Statistics,
}

impl FrameReader {
    pub fn new(transport: Box<dyn Transport>) -> Self {
        Self {
            transport,
            pending_header: None,
            block: true,
            in_message: false,
            statistics: Statistics::new(),
        }
    }

    pub fn set_block(&mut self, block: bool) {
        self.block = block;
    }

    pub fn block(&self) -> bool {
        self.block
    }

    pub fn statistics(&self) -> Statistics {
        self.statistics
    }

    pub fn transport(&self) -> &dyn Transport {
        self.transport.as_ref()
    }

    pub fn transport_mut(&mut self) -> &mut dyn Transport {
        self.transport.as_mut()
    }

    async fn read_frame(&mut self) -> Result<Option<Bytes>> {
        match self.transport.recv_frame(self.block).await.map_err(transport_error)? {
            RecvOutcome::Frame(frame) => {
                self.in_message = true;
                Ok(Some(frame))
            }
            RecvOutcome::WouldBlock => Ok(None),
        }
    }

    /// Read the header frame and return its type tag.
    ///
    /// `Ok(None)` when nothing arrived in time. The frame is kept and handed
    /// out again by the next call to [`next`](FrameSource::next).
    pub async fn header(&mut self) -> Result<Option<String>> {
        let Some(frame) = self.read_frame().await? else {
            return Ok(None);
        };
        self.pending_header = Some(frame.clone());

        let header: Value = serde_json::from_slice(&frame)?;
        Ok(Some(htype_of(&header)?.to_string()))
    }

    /// Finish the current message.
    ///
    /// Drains the frames the decoder left unread, then commits the message's
    /// byte count into the totals on success or discards it on failure.
    /// Must run exactly once after every receive attempt.
    pub async fn flush(&mut self, success: bool) {
        self.pending_header = None;

        let mut skipped = 0usize;
        while self.transport.has_more() {
            match self.transport.recv_frame(false).await {
                Ok(RecvOutcome::Frame(_)) => skipped += 1,
                Ok(RecvOutcome::WouldBlock) | Err(_) => break,
            }
        }
        if skipped > 0 {
            debug!("Skipped {} leftover frame(s)", skipped);
        }

        self.in_message = false;
        if success {
            self.statistics.commit();
        } else {
            self.statistics.discard();
        }
    }
}

#[async_trait]
impl FrameSource for FrameReader {
    /// The pending header frame if there is one, else a fresh read.
    ///
    /// Inside a message, reading past its last frame is a protocol error
    /// rather than a read of the next message's header.
    async fn next(&mut self) -> Result<Option<Bytes>> {
        let frame = match self.pending_header.take() {
            Some(frame) => Some(frame),
            None => {
                if self.in_message && !self.transport.has_more() {
                    return Err(Error::Protocol(
                        "read past the last frame of the message".to_string(),
                    ));
                }
                self.read_frame().await?
            }
        };

        if let Some(frame) = &frame {
            self.statistics.record_frame(frame.len());
        }
        Ok(frame)
    }

    /// Whether the frame last read announced a follower; a pending header
    /// does not count until it has been handed out
    fn has_more(&self) -> bool {
        self.transport.has_more()
    }
}

impl std::fmt::Debug for FrameReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameReader")
            .field("address", &self.transport.address())
            .field("block", &self.block)
            .field("statistics", &self.statistics)
            .finish()
    }
}
