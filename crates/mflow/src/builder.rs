//! Stream builder pattern

use mflow_core::{Handler, HandlerRegistry};
use mflow_transport::{ConnType, Mode};
use std::time::Duration;

use crate::config::StreamConfig;
use crate::monitor::{no_clients_timeout_notifier, DEFAULT_NO_CLIENT_TIMEOUT};
use crate::{Result, Stream};

type NoClientAction = Box<dyn FnMut() + Send>;

/// Builder for [`Stream`]
pub struct StreamBuilder {
    config: StreamConfig,
    registry: HandlerRegistry,
    no_client_action: Option<NoClientAction>,
    no_client_timeout: Duration,
}

impl StreamBuilder {
    /// Create a new builder; `tcp://*:port` binds, anything else connects
    pub fn new(address: &str) -> Self {
        Self::from_config(StreamConfig::new(address, Mode::Pull))
    }

    /// Start from an existing configuration
    pub fn from_config(config: StreamConfig) -> Self {
        Self {
            config,
            registry: HandlerRegistry::new(),
            no_client_action: None,
            no_client_timeout: DEFAULT_NO_CLIENT_TIMEOUT,
        }
    }

    pub fn conn_type(mut self, conn_type: ConnType) -> Self {
        self.config.conn_type = conn_type;
        self
    }

    pub fn mode(mut self, mode: Mode) -> Self {
        self.config.mode = mode;
        self
    }

    pub fn receive_timeout(mut self, timeout: Duration) -> Self {
        self.config.receive_timeout_ms = Some(timeout.as_millis() as u64);
        self
    }

    pub fn send_timeout(mut self, timeout: Duration) -> Self {
        self.config.send_timeout_ms = Some(timeout.as_millis() as u64);
        self
    }

    pub fn queue_size(mut self, queue_size: usize) -> Self {
        self.config.queue_size = queue_size;
        self
    }

    pub fn linger(mut self, linger: Duration) -> Self {
        self.config.linger_ms = linger.as_millis() as u64;
        self
    }

    /// Heartbeat interval of the connection monitor
    pub fn monitor_poll(mut self, interval: Duration) -> Self {
        self.config.monitor_poll_ms = interval.as_millis() as u64;
        self
    }

    /// Register a handler for a custom type tag
    pub fn handler(mut self, htype: &str, handler: Box<dyn Handler>) -> Self {
        self.registry.register(htype, handler);
        self
    }

    /// Replace the default handler registry
    pub fn registry(mut self, registry: HandlerRegistry) -> Self {
        self.registry = registry;
        self
    }

    /// Run `action` whenever no client has been connected for the no-client
    /// timeout (10 s unless set with [`no_client_timeout`](Self::no_client_timeout))
    pub fn no_client_action<F>(mut self, action: F) -> Self
    where
        F: FnMut() + Send + 'static,
    {
        self.no_client_action = Some(Box::new(action));
        self
    }

    pub fn no_client_timeout(mut self, timeout: Duration) -> Self {
        self.no_client_timeout = timeout;
        self
    }

    pub fn config(&self) -> &StreamConfig {
        &self.config
    }

    /// Build and connect
    pub async fn connect(self) -> Result<Stream> {
        let mut stream = Stream::new();
        *stream.registry_mut() = self.registry;

        if let Some(action) = self.no_client_action {
            stream.register_connection_monitor(no_clients_timeout_notifier(action, self.no_client_timeout));
        }

        stream.connect(&self.config).await?;
        Ok(stream)
    }
}
