//! Stream façade
//!
//! A [`Stream`] owns one socket. In a receiving mode the socket sits behind a
//! [`FrameReader`] and [`Stream::receive`] decodes one message per call; in a
//! sending mode [`Stream::send`] and [`Stream::forward`] write frames.
//!
//! Per-message faults never escape `receive` or `forward`: the message is
//! logged and dropped, and the reader is flushed so the next call starts on a
//! clean frame boundary.

use async_trait::async_trait;
use bytes::Bytes;
use mflow_core::handlers::RawHandler;
use mflow_core::{Error, FrameSink, Handler, HandlerRegistry, Message, Payload, Statistics};
use mflow_transport::{ConnType, Mode, SendOutcome, SocketEvent, Transport, TransportError};
use serde_json::Value;
use tracing::{debug, error, info, warn};

use crate::builder::StreamBuilder;
use crate::config::StreamConfig;
use crate::error::{Result, StreamError};
use crate::monitor::{ConnectionCountMonitor, EventListener, MonitorId};
use crate::reader::{transport_error, FrameReader};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Unconnected,
    Connected,
    Disconnected,
}

enum Socket {
    Receiver(FrameReader),
    Sender(Box<dyn Transport>),
}

impl Socket {
    fn transport(&self) -> &dyn Transport {
        match self {
            Socket::Receiver(reader) => reader.transport(),
            Socket::Sender(transport) => transport.as_ref(),
        }
    }

    fn transport_mut(&mut self) -> &mut dyn Transport {
        match self {
            Socket::Receiver(reader) => reader.transport_mut(),
            Socket::Sender(transport) => transport.as_mut(),
        }
    }
}

/// Writes handler output straight to a socket
struct FrameWriter<'a> {
    transport: &'a mut dyn Transport,
}

#[async_trait]
impl FrameSink for FrameWriter<'_> {
    async fn send(&mut self, frame: Bytes, more: bool, block: bool) -> mflow_core::Result<()> {
        match self
            .transport
            .send_frame(frame, more, block)
            .await
            .map_err(transport_error)?
        {
            SendOutcome::Sent => Ok(()),
            SendOutcome::WouldBlock if block => Err(Error::SendTimeout),
            SendOutcome::WouldBlock => Ok(()),
        }
    }
}

/// A multi-part message stream over one socket
pub struct Stream {
    state: State,
    socket: Option<Socket>,
    address: Option<String>,
    mode: Option<Mode>,
    registry: HandlerRegistry,
    listener: EventListener,
}

impl Stream {
    /// Unconnected stream with the default handler registry
    pub fn new() -> Self {
        Self {
            state: State::Unconnected,
            socket: None,
            address: None,
            mode: None,
            registry: HandlerRegistry::new(),
            listener: EventListener::default(),
        }
    }

    /// Create a builder
    pub fn builder(address: &str) -> StreamBuilder {
        StreamBuilder::new(address)
    }

    /// Open the socket described by `config`.
    ///
    /// The stream counts as connected even when opening the socket fails:
    /// the error is returned, and every later operation fails on its own
    /// with [`StreamError::NotConnected`].
    pub async fn connect(&mut self, config: &StreamConfig) -> Result<()> {
        match self.state {
            State::Unconnected => {}
            State::Connected => return Err(StreamError::AlreadyConnected),
            State::Disconnected => {
                return Err(StreamError::ConnectionFailed(
                    "stream was already disconnected".to_string(),
                ))
            }
        }

        self.state = State::Connected;
        self.address = Some(config.address.clone());
        self.mode = Some(config.mode);
        self.listener.set_poll_interval(config.monitor_poll());

        let transport = match mflow_transport::open(
            &config.address,
            config.conn_type,
            config.mode,
            config.socket_options(),
        )
        .await
        {
            Ok(transport) => transport,
            Err(e) => {
                error!("Unable to {} to {}: {}", config.conn_type, config.address, e);
                return Err(StreamError::ConnectionFailed(format!(
                    "unable to {} to {}: {}",
                    config.conn_type, config.address, e
                )));
            }
        };

        match config.conn_type {
            ConnType::Connect => info!("Connected to {}", config.address),
            ConnType::Bind => info!("Bound to {}", config.address),
        }
        if let Some(timeout) = config.receive_timeout() {
            info!("Receive timeout set: {:?}", timeout);
        }
        if let Some(timeout) = config.send_timeout() {
            info!("Send timeout set: {:?}", timeout);
        }

        if !self.listener.is_empty() {
            self.listener.start(transport.events());
        }

        self.socket = Some(if config.mode.can_receive() {
            Socket::Receiver(FrameReader::new(transport))
        } else {
            Socket::Sender(transport)
        });
        Ok(())
    }

    /// Stop the connection monitor, then close the socket.
    ///
    /// Calling it on a stream that is not connected only logs a warning.
    pub async fn disconnect(&mut self) {
        if self.state != State::Connected {
            warn!("Trying to close an already closed stream... ignore and return");
            return;
        }
        self.state = State::Disconnected;

        self.listener.stop().await;

        if let Some(mut socket) = self.socket.take() {
            match socket.transport_mut().close().await {
                Ok(()) => info!("Disconnected"),
                Err(e) => {
                    debug!("{}", e);
                    info!("Unable to disconnect properly");
                }
            }
        }
    }

    pub fn is_connected(&self) -> bool {
        self.state == State::Connected && self.socket.is_some()
    }

    pub fn address(&self) -> Option<&str> {
        self.address.as_deref()
    }

    pub fn mode(&self) -> Option<Mode> {
        self.mode
    }

    /// Current receive counters; zero for a sending stream
    pub fn statistics(&self) -> Statistics {
        match &self.socket {
            Some(Socket::Receiver(reader)) => reader.statistics(),
            _ => Statistics::default(),
        }
    }

    pub fn registry(&self) -> &HandlerRegistry {
        &self.registry
    }

    /// Register custom handlers here
    pub fn registry_mut(&mut self) -> &mut HandlerRegistry {
        &mut self.registry
    }

    /// Receive and decode one message, picking the handler by type tag.
    ///
    /// `Ok(None)` when nothing arrived in time or the message was dropped
    /// (malformed header, unknown type, decode failure). Errors are reserved
    /// for streams that cannot receive at all.
    pub async fn receive(&mut self, block: bool) -> Result<Option<Message>> {
        let reader = receiver(&mut self.socket)?;
        reader.set_block(block);

        let htype = match reader.header().await {
            Ok(Some(htype)) => htype,
            Ok(None) => {
                reader.flush(false).await;
                return Ok(None);
            }
            Err(e) => {
                warn!("Unable to read header - skipping: {}", e);
                reader.flush(false).await;
                return Ok(None);
            }
        };

        let handler = match self.registry.resolve(&htype) {
            Ok(handler) => handler,
            Err(_) => {
                warn!("htype {} not supported - skipping message", htype);
                reader.flush(false).await;
                return Ok(None);
            }
        };

        Ok(decode(reader, handler.as_mut()).await)
    }

    /// Receive one message with an explicit handler, bypassing the registry
    pub async fn receive_with(&mut self, handler: &mut dyn Handler, block: bool) -> Result<Option<Message>> {
        let reader = receiver(&mut self.socket)?;
        reader.set_block(block);
        Ok(decode(reader, handler).await)
    }

    /// Receive one message as `raw-1.0`, whatever its type tag
    pub async fn receive_raw(&mut self, block: bool) -> Result<Option<Message>> {
        let mut handler = RawHandler;
        self.receive_with(&mut handler, block).await
    }

    /// Send one frame; `more` announces that further frames of the same
    /// message follow.
    ///
    /// A message that cannot be queued is dropped silently when `block` is
    /// false and fails with [`StreamError::SendTimeout`] when it is true.
    pub async fn send(&mut self, frame: impl Into<Bytes>, more: bool, block: bool) -> Result<()> {
        let socket = self.socket.as_mut().ok_or(StreamError::NotConnected)?;
        match socket.transport_mut().send_frame(frame.into(), more, block).await? {
            SendOutcome::Sent => Ok(()),
            SendOutcome::WouldBlock if block => Err(StreamError::SendTimeout),
            SendOutcome::WouldBlock => Ok(()),
        }
    }

    /// Serialize `value` and send it as one frame
    pub async fn send_json(&mut self, value: &Value, more: bool, block: bool) -> Result<()> {
        let frame = serde_json::to_vec(value).map_err(|e| Error::Encode(e.to_string()))?;
        self.send(frame, more, block).await
    }

    /// Encode `message` with the handler registered for its type tag and
    /// send it.
    ///
    /// Returns `false` when the message was dropped (no type tag, unknown
    /// type, encode failure); the reason is logged.
    pub async fn forward(&mut self, message: &Payload, block: bool) -> bool {
        let Some(htype) = message.htype().map(str::to_string) else {
            warn!("Unable to read header - skipping");
            return false;
        };
        let Some(socket) = self.socket.as_mut() else {
            warn!("Unable to send message, stream is not connected - skipping");
            return false;
        };
        let handler = match self.registry.resolve(&htype) {
            Ok(handler) => handler,
            Err(_) => {
                warn!("htype {} not supported - skipping message", htype);
                return false;
            }
        };
        encode(socket.transport_mut(), handler.as_mut(), message, block).await
    }

    /// Encode and send `message` with an explicit handler
    pub async fn forward_with(&mut self, message: &Payload, handler: &mut dyn Handler, block: bool) -> bool {
        let Some(socket) = self.socket.as_mut() else {
            warn!("Unable to send message, stream is not connected - skipping");
            return false;
        };
        encode(socket.transport_mut(), handler, message, block).await
    }

    /// Register a callback for socket events (`None` on heartbeats).
    ///
    /// The first callback starts the connection monitor if the socket is
    /// already open; otherwise it starts on connect.
    pub fn register_monitor<F>(&mut self, callback: F) -> MonitorId
    where
        F: FnMut(Option<&SocketEvent>) + Send + 'static,
    {
        let id = self.listener.add(Box::new(callback));
        if self.state == State::Connected {
            if let Some(socket) = &self.socket {
                self.listener.start(socket.transport().events());
            }
        }
        id
    }

    /// Register a callback for the number of connected peers
    pub fn register_connection_monitor<F>(&mut self, callback: F) -> MonitorId
    where
        F: FnMut(usize) + Send + 'static,
    {
        let mut monitor = ConnectionCountMonitor::new(callback);
        self.register_monitor(move |event| monitor.observe(event))
    }

    /// Remove a monitor callback; removing the last one stops the monitor
    pub async fn remove_monitor(&mut self, id: MonitorId) {
        self.listener.remove(id);
        if self.listener.is_empty() {
            self.listener.stop().await;
        }
    }

    /// Whether the connection monitor task is running
    pub fn is_monitoring(&self) -> bool {
        self.listener.is_listening()
    }
}

impl Default for Stream {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Stream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stream")
            .field("state", &self.state)
            .field("address", &self.address)
            .field("mode", &self.mode)
            .field("registry", &self.registry)
            .field("listener", &self.listener)
            .finish()
    }
}

fn receiver(socket: &mut Option<Socket>) -> Result<&mut FrameReader> {
    match socket {
        Some(Socket::Receiver(reader)) => Ok(reader),
        Some(Socket::Sender(transport)) => Err(StreamError::Transport(
            TransportError::InvalidOperation(transport.mode().to_string()),
        )),
        None => Err(StreamError::NotConnected),
    }
}

/// Run `handler` over the next message and flush the reader exactly once
async fn decode(reader: &mut FrameReader, handler: &mut dyn Handler) -> Option<Message> {
    match handler.receive(reader).await {
        Ok(Some(payload)) => {
            reader.flush(true).await;
            Some(Message::new(reader.statistics(), payload))
        }
        Ok(None) => {
            reader.flush(false).await;
            None
        }
        Err(e) => {
            warn!("Unable to decode message - skipping: {}", e);
            reader.flush(false).await;
            None
        }
    }
}

async fn encode(transport: &mut dyn Transport, handler: &mut dyn Handler, message: &Payload, block: bool) -> bool {
    let result = {
        let mut writer = FrameWriter { transport: &mut *transport };
        handler.send(message, &mut writer, block).await
    };
    match result {
        Ok(()) => true,
        Err(e) => {
            transport.abort_message();
            warn!("Unable to send message - skipping: {}", e);
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_test::traced_test;

    async fn pair(name: &str) -> (Stream, Box<dyn Transport>) {
        let address = format!("inproc://stream-unit-{}", name);
        let mut config = StreamConfig::new(&address, Mode::Pull);
        config.conn_type = ConnType::Bind;
        let mut stream = Stream::new();
        stream.connect(&config).await.unwrap();

        let push = mflow_transport::open(&address, ConnType::Connect, Mode::Push, Default::default())
            .await
            .unwrap();
        (stream, push)
    }

    #[traced_test]
    #[tokio::test]
    async fn test_every_unknown_type_drop_is_a_warning() {
        let (mut stream, mut push) = pair("unknown-warn").await;
        for _ in 0..2 {
            push.send_frame(Bytes::from_static(br#"{"htype":"bogus-9.9"}"#), false, true)
                .await
                .unwrap();
        }

        assert!(stream.receive(true).await.unwrap().is_none());
        assert!(stream.receive(true).await.unwrap().is_none());
        assert!(stream.registry().is_blacklisted("bogus-9.9"));

        logs_assert(|lines: &[&str]| {
            let drops = lines
                .iter()
                .filter(|line| line.contains("WARN") && line.contains("htype bogus-9.9 not supported"))
                .count();
            match drops {
                2 => Ok(()),
                n => Err(format!("expected 2 warnings, found {}", n)),
            }
        });

        stream.disconnect().await;
    }
}
