//! Socket trait and the types shared by every transport

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use tokio::sync::broadcast;

use crate::error::{Result, TransportError};

/// Default per-peer and inbound queue depth, in messages
pub const DEFAULT_QUEUE_SIZE: usize = 100;

/// Default time a closing socket waits for queued outbound messages
pub const DEFAULT_LINGER: Duration = Duration::from_millis(1000);

/// Messaging pattern of a socket
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// Send side of a pipeline; messages are distributed round-robin
    Push,
    /// Receive side of a pipeline
    Pull,
    /// Fan-out to every subscriber; slow subscribers lose messages
    Pub,
    /// Receive side of fan-out
    Sub,
}

impl Mode {
    pub fn can_send(self) -> bool {
        matches!(self, Mode::Push | Mode::Pub)
    }

    pub fn can_receive(self) -> bool {
        matches!(self, Mode::Pull | Mode::Sub)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Mode::Push => "push",
            Mode::Pull => "pull",
            Mode::Pub => "pub",
            Mode::Sub => "sub",
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Mode {
    type Err = TransportError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "push" => Ok(Mode::Push),
            "pull" => Ok(Mode::Pull),
            "pub" => Ok(Mode::Pub),
            "sub" => Ok(Mode::Sub),
            other => Err(TransportError::InvalidOperation(format!("unknown mode '{}'", other))),
        }
    }
}

/// Whether a socket binds the address or connects to it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnType {
    Connect,
    Bind,
}

impl ConnType {
    pub fn as_str(self) -> &'static str {
        match self {
            ConnType::Connect => "connect",
            ConnType::Bind => "bind",
        }
    }
}

impl fmt::Display for ConnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ConnType {
    type Err = TransportError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "connect" => Ok(ConnType::Connect),
            "bind" => Ok(ConnType::Bind),
            other => Err(TransportError::InvalidOperation(format!(
                "unknown connection type '{}'",
                other
            ))),
        }
    }
}

/// Peer lifecycle events published by a socket
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SocketEvent {
    /// An outgoing connection was established
    Connected,
    /// A peer connected to a bound socket
    Accepted,
    /// A peer went away
    Disconnected,
    /// The socket itself was closed; no further events follow
    Closed,
}

/// Result of a frame read
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecvOutcome {
    Frame(Bytes),
    /// Nothing arrived in time (non-blocking read, or receive timeout)
    WouldBlock,
}

/// Result of a frame write
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    /// The frame was accepted (for a final frame: the whole message was queued)
    Sent,
    /// No peer could take the message in time; the message was dropped
    WouldBlock,
}

/// Options applied when a socket is opened
#[derive(Debug, Clone)]
pub struct SocketOptions {
    /// Queue depth in messages, for inbound and per-peer outbound queues
    pub queue_size: usize,
    /// How long `close` waits for queued outbound messages
    pub linger: Duration,
    /// Bound on a blocking read; `None` waits forever
    pub receive_timeout: Option<Duration>,
    /// Bound on a blocking write; `None` waits forever
    pub send_timeout: Option<Duration>,
}

impl Default for SocketOptions {
    fn default() -> Self {
        Self {
            queue_size: DEFAULT_QUEUE_SIZE,
            linger: DEFAULT_LINGER,
            receive_timeout: None,
            send_timeout: None,
        }
    }
}

/// A multi-part message socket.
///
/// Frames are written one at a time; a message is delivered to the peer
/// atomically once its final frame (`more == false`) has been written.
#[async_trait]
pub trait Transport: Send {
    /// Address the socket was opened with
    fn address(&self) -> &str;

    fn mode(&self) -> Mode;

    /// Queue one frame of the current outbound message
    async fn send_frame(&mut self, frame: Bytes, more: bool, block: bool) -> Result<SendOutcome>;

    /// Drop the frames of an outbound message that was never finished
    fn abort_message(&mut self);

    /// Read the next frame, starting a new message if the previous one was
    /// fully consumed
    async fn recv_frame(&mut self, block: bool) -> Result<RecvOutcome>;

    /// Whether the message currently being read has unread frames
    fn has_more(&self) -> bool;

    fn set_receive_timeout(&mut self, timeout: Option<Duration>);

    fn set_send_timeout(&mut self, timeout: Option<Duration>);

    /// Subscribe to peer lifecycle events.
    ///
    /// The first subscription also sees events raised while the socket was
    /// being opened, such as peers that were waiting for a bind.
    fn events(&self) -> broadcast::Receiver<SocketEvent>;

    /// Close the socket, waiting up to the linger period for queued messages
    async fn close(&mut self) -> Result<()>;
}
