//! mflow Transport Layer
//!
//! Multi-part message sockets in four patterns (push, pull, pub, sub):
//! - In-process (`inproc://name`), for tests and in-process pipelines
//! - TCP (`tcp://host:port`), length-prefixed frames with a continuation flag
//!
//! Sockets are opened by address with [`open`], which picks the transport
//! from the address scheme.

pub mod error;
pub mod mem;
mod socket;
pub mod traits;

#[cfg(feature = "tcp")]
pub mod tcp;

pub use error::{Result, TransportError};
pub use mem::MemSocket;
pub use traits::{
    ConnType, Mode, RecvOutcome, SendOutcome, SocketEvent, SocketOptions, Transport, DEFAULT_LINGER,
    DEFAULT_QUEUE_SIZE,
};

#[cfg(feature = "tcp")]
pub use tcp::{TcpConfig, TcpSocket};

/// Scheme part of an address (`tcp` for `tcp://host:port`)
pub fn scheme(address: &str) -> Result<&str> {
    address
        .split_once("://")
        .map(|(scheme, _)| scheme)
        .filter(|scheme| !scheme.is_empty())
        .ok_or_else(|| TransportError::InvalidAddress(address.to_string()))
}

/// Open a socket on the transport named by the address scheme
pub async fn open(
    address: &str,
    conn_type: ConnType,
    mode: Mode,
    options: SocketOptions,
) -> Result<Box<dyn Transport>> {
    match scheme(address)? {
        mem::SCHEME => Ok(Box::new(MemSocket::open(address, conn_type, mode, options)?)),
        #[cfg(feature = "tcp")]
        tcp::SCHEME => {
            let config = TcpConfig::default();
            let socket = match conn_type {
                ConnType::Bind => TcpSocket::bind(address, mode, options, config).await?,
                ConnType::Connect => TcpSocket::connect(address, mode, options, config).await?,
            };
            Ok(Box::new(socket))
        }
        other => Err(TransportError::UnsupportedScheme(other.to_string())),
    }
}
