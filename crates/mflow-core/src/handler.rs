//! Handler trait and the type-tag registry
//!
//! A handler knows the frame layout of one message type. The registry maps
//! type tags to handlers: built-in tags are registered up front, unknown tags
//! go through a loader once, and tags the loader cannot satisfy are
//! blacklisted so the lookup is never repeated.

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::fmt;
use tracing::debug;

use crate::error::{Error, Result};
use crate::frame::{FrameSink, FrameSource};
use crate::handlers;
use crate::message::Payload;

/// Decoder/encoder for one message type
#[async_trait]
pub trait Handler: Send {
    /// Pull the frames of one message from `source` and decode them.
    ///
    /// `Ok(None)` means the message carried nothing worth returning; the
    /// caller treats it as "no message" rather than an error.
    async fn receive(&mut self, source: &mut dyn FrameSource) -> Result<Option<Payload>>;

    /// Write `message` to `sink` as an ordered sequence of frames
    async fn send(&mut self, message: &Payload, sink: &mut dyn FrameSink, block: bool) -> Result<()> {
        let _ = (message, sink, block);
        Err(Error::Encode("handler does not support sending".to_string()))
    }
}

/// Fallback consulted when a tag has no registered handler
pub type HandlerLoader = Box<dyn Fn(&str) -> Option<Box<dyn Handler>> + Send + Sync>;

/// Type tag to handler mapping with negative-result caching
pub struct HandlerRegistry {
    handlers: HashMap<String, Box<dyn Handler>>,
    blacklist: HashSet<String>,
    loader: HandlerLoader,
}

impl HandlerRegistry {
    /// Registry with the built-in handlers and the family-fallback loader
    pub fn new() -> Self {
        let mut registry = Self::empty().with_loader(handlers::load_family);
        for tag in handlers::BUILTIN_TAGS {
            if let Some(handler) = handlers::builtin(tag) {
                registry.handlers.insert(tag.to_string(), handler);
            }
        }
        registry
    }

    /// Registry with no handlers and a loader that never finds anything
    pub fn empty() -> Self {
        Self {
            handlers: HashMap::new(),
            blacklist: HashSet::new(),
            loader: Box::new(|_| None),
        }
    }

    /// Replace the loader used for tags without a registered handler
    pub fn with_loader<F>(mut self, loader: F) -> Self
    where
        F: Fn(&str) -> Option<Box<dyn Handler>> + Send + Sync + 'static,
    {
        self.loader = Box::new(loader);
        self
    }

    /// Register (or replace) the handler for `htype`.
    ///
    /// A previously blacklisted tag becomes resolvable again.
    pub fn register(&mut self, htype: impl Into<String>, handler: Box<dyn Handler>) {
        let htype = htype.into();
        self.blacklist.remove(&htype);
        self.handlers.insert(htype, handler);
    }

    /// Look up the handler for `htype`, loading it on first use
    pub fn resolve(&mut self, htype: &str) -> Result<&mut Box<dyn Handler>> {
        if self.blacklist.contains(htype) {
            debug!("htype {} is blacklisted", htype);
            return Err(Error::UnknownType(htype.to_string()));
        }

        if !self.handlers.contains_key(htype) {
            match (self.loader)(htype) {
                Some(handler) => {
                    debug!("Loaded handler for htype {}", htype);
                    self.handlers.insert(htype.to_string(), handler);
                }
                None => {
                    debug!("No handler for htype {}, blacklisting it", htype);
                    self.blacklist.insert(htype.to_string());
                    return Err(Error::UnknownType(htype.to_string()));
                }
            }
        }

        self.handlers
            .get_mut(htype)
            .ok_or_else(|| Error::UnknownType(htype.to_string()))
    }

    /// Whether a handler is currently registered for `htype`
    pub fn contains(&self, htype: &str) -> bool {
        self.handlers.contains_key(htype)
    }

    /// Whether `htype` failed to resolve before
    pub fn is_blacklisted(&self, htype: &str) -> bool {
        self.blacklist.contains(htype)
    }

    /// Registered type tags, in no particular order
    pub fn tags(&self) -> impl Iterator<Item = &str> {
        self.handlers.keys().map(String::as_str)
    }
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut tags: Vec<&str> = self.tags().collect();
        tags.sort_unstable();
        f.debug_struct("HandlerRegistry")
            .field("handlers", &tags)
            .field("blacklist", &self.blacklist)
            .finish()
    }
}
