//! Stream error types

use thiserror::Error;

pub type Result<T> = std::result::Result<T, StreamError>;

#[derive(Error, Debug)]
pub enum StreamError {
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    #[error("not connected")]
    NotConnected,

    #[error("already connected")]
    AlreadyConnected,

    #[error("send timed out")]
    SendTimeout,

    #[error("protocol error: {0}")]
    Protocol(#[from] mflow_core::Error),

    #[error("transport error: {0}")]
    Transport(#[from] mflow_transport::TransportError),
}
