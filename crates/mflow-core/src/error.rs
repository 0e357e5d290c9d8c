//! Error types for mflow message handling

use thiserror::Error;

/// Result type alias for message handling
pub type Result<T> = std::result::Result<T, Error>;

/// Per-message errors.
///
/// Everything here is recoverable at the stream boundary: the message in
/// flight is dropped and the next one is read from a clean frame boundary.
#[derive(Error, Debug)]
pub enum Error {
    /// A frame expected to be JSON did not parse, or a required field is absent
    #[error("protocol error: {0}")]
    Protocol(String),

    /// No handler is registered or loadable for this type tag
    #[error("unknown message type: {0}")]
    UnknownType(String),

    /// Handler failed while consuming frames
    #[error("decode error: {0}")]
    Decode(String),

    /// Handler failed while producing frames
    #[error("encode error: {0}")]
    Encode(String),

    /// A blocking send did not complete within the send timeout
    #[error("send timed out")]
    SendTimeout,

    /// The underlying socket reported a failure
    #[error("transport error: {0}")]
    Transport(String),
}

impl Error {
    /// Shorthand for a missing header field
    pub fn missing_field(field: &str) -> Self {
        Error::Protocol(format!("missing field '{}'", field))
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Protocol(format!("invalid JSON frame: {}", e))
    }
}
