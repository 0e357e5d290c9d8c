//! mflow Core
//!
//! Protocol primitives for multi-part, self-describing data streams.
//!
//! This crate provides:
//! - Per-message errors ([`Error`])
//! - Receive counters ([`Statistics`])
//! - Decoded messages ([`Message`], [`Payload`])
//! - The frame seams handlers work against ([`FrameSource`], [`FrameSink`])
//! - The handler trait and type-tag registry ([`Handler`], [`HandlerRegistry`])
//! - Built-in handlers for the standard type tags ([`handlers`])

pub mod array;
pub mod error;
pub mod frame;
pub mod handler;
pub mod handlers;
pub mod message;
pub mod statistics;

pub use array::{DType, Endianness, NdArray};
pub use error::{Error, Result};
pub use frame::{htype_of, FrameBuffer, FrameSink, FrameSource, HTYPE_FIELD};
pub use handler::{Handler, HandlerLoader, HandlerRegistry};
pub use message::{Message, Payload};
pub use statistics::Statistics;
