//! mflow Stream Library
//!
//! Receive and send multi-part, self-describing messages over push/pull and
//! pub/sub sockets. The first frame of every message is a JSON header whose
//! `htype` field selects the handler that decodes (or encodes) the rest.
//!
//! # Example
//!
//! ```ignore
//! use mflow::{Mode, Stream};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let mut stream = Stream::builder("tcp://localhost:9999")
//!         .mode(Mode::Pull)
//!         .connect()
//!         .await?;
//!
//!     while let Some(message) = stream.receive(true).await? {
//!         println!("{:?} after {} messages", message.data().htype(),
//!             message.statistics().messages_received);
//!     }
//!
//!     stream.disconnect().await;
//!     Ok(())
//! }
//! ```

pub mod builder;
pub mod config;
pub mod error;
pub mod monitor;
pub mod reader;
pub mod stream;
pub mod tools;

pub use builder::StreamBuilder;
pub use config::{infer_conn_type, StreamConfig};
pub use error::{Result, StreamError};
pub use monitor::{
    no_clients_timeout_notifier, ConnectionCountMonitor, EventListener, IdleTimeoutNotifier, MonitorCallback,
    MonitorId,
};
pub use reader::FrameReader;
pub use stream::Stream;
pub use tools::{Merge, ReceiveStrategy, RoundRobin, ThroughputSample, ThroughputStatistics, ThroughputSummary};

pub use mflow_core::{handlers, Handler, HandlerRegistry, Message, Payload, Statistics};
pub use mflow_transport::{ConnType, Mode, SocketEvent};

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::builder::StreamBuilder;
    pub use crate::config::StreamConfig;
    pub use crate::error::{Result, StreamError};
    pub use crate::stream::Stream;
    pub use mflow_core::{Handler, Message, Payload};
    pub use mflow_transport::{ConnType, Mode};
}
