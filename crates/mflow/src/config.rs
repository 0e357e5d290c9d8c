//! Stream configuration

use mflow_transport::{ConnType, Mode, SocketOptions, DEFAULT_LINGER, DEFAULT_QUEUE_SIZE};
use serde::{Deserialize, Deserializer, Serialize};
use std::fmt::Display;
use std::str::FromStr;
use std::time::Duration;

/// Default poll interval of the connection monitor
pub const DEFAULT_MONITOR_POLL: Duration = Duration::from_millis(100);

/// Everything needed to connect a [`Stream`](crate::Stream)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    /// `tcp://host:port` or `inproc://name`
    pub address: String,
    #[serde(deserialize_with = "case_insensitive")]
    pub conn_type: ConnType,
    #[serde(deserialize_with = "case_insensitive")]
    pub mode: Mode,
    /// Bound on blocking receives; `None` waits forever
    pub receive_timeout_ms: Option<u64>,
    /// Bound on blocking sends; `None` waits forever
    pub send_timeout_ms: Option<u64>,
    /// Queue depth in messages
    pub queue_size: usize,
    /// How long closing waits for unsent messages
    pub linger_ms: u64,
    /// Heartbeat interval of the connection monitor
    pub monitor_poll_ms: u64,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            address: "tcp://localhost:9999".to_string(),
            conn_type: ConnType::Connect,
            mode: Mode::Pull,
            receive_timeout_ms: None,
            send_timeout_ms: None,
            queue_size: DEFAULT_QUEUE_SIZE,
            linger_ms: DEFAULT_LINGER.as_millis() as u64,
            monitor_poll_ms: DEFAULT_MONITOR_POLL.as_millis() as u64,
        }
    }
}

impl StreamConfig {
    /// Config for `address` in `mode`; the connection type is inferred from
    /// the address
    pub fn new(address: impl Into<String>, mode: Mode) -> Self {
        let address = address.into();
        Self {
            conn_type: infer_conn_type(&address),
            address,
            mode,
            ..Default::default()
        }
    }

    pub fn receive_timeout(&self) -> Option<Duration> {
        self.receive_timeout_ms.map(Duration::from_millis)
    }

    pub fn send_timeout(&self) -> Option<Duration> {
        self.send_timeout_ms.map(Duration::from_millis)
    }

    pub fn linger(&self) -> Duration {
        Duration::from_millis(self.linger_ms)
    }

    pub fn monitor_poll(&self) -> Duration {
        Duration::from_millis(self.monitor_poll_ms)
    }

    /// Options handed to the transport when the socket is opened
    pub fn socket_options(&self) -> SocketOptions {
        SocketOptions {
            queue_size: self.queue_size,
            linger: self.linger(),
            receive_timeout: self.receive_timeout(),
            send_timeout: self.send_timeout(),
        }
    }
}

/// `bind` for wildcard hosts (`tcp://*:9999`), `connect` otherwise
pub fn infer_conn_type(address: &str) -> ConnType {
    let host = address
        .split_once("://")
        .map(|(_, rest)| rest)
        .unwrap_or(address);
    if host.starts_with('*') {
        ConnType::Bind
    } else {
        ConnType::Connect
    }
}

fn case_insensitive<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: FromStr,
    T::Err: Display,
{
    let value = String::deserialize(deserializer)?;
    value.parse().map_err(serde::de::Error::custom)
}
