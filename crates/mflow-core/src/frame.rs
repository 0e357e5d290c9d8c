//! Frame-level seams between handlers and sockets
//!
//! A logical message is a sequence of frames. The first frame is always a
//! JSON object naming the message type in its `htype` field; what follows is
//! defined by that type. Handlers never see a socket directly: they pull
//! frames from a [`FrameSource`] and push frames into a [`FrameSink`].

use async_trait::async_trait;
use bytes::Bytes;
use serde_json::Value;
use std::collections::VecDeque;

use crate::error::{Error, Result};

/// Header field carrying the type tag
pub const HTYPE_FIELD: &str = "htype";

/// Extract the type tag from a parsed header frame
pub fn htype_of(header: &Value) -> Result<&str> {
    header
        .get(HTYPE_FIELD)
        .and_then(Value::as_str)
        .ok_or_else(|| Error::missing_field(HTYPE_FIELD))
}

/// Read side of a message.
#[async_trait]
pub trait FrameSource: Send {
    /// Next frame of the current message.
    ///
    /// Returns `Ok(None)` when a non-blocking read finds nothing available,
    /// so decoders can treat a timed-out part as absent data.
    async fn next(&mut self) -> Result<Option<Bytes>>;

    /// Whether more frames belong to the current message
    fn has_more(&self) -> bool;

    /// Next frame parsed as JSON
    async fn next_json(&mut self) -> Result<Option<Value>> {
        match self.next().await? {
            Some(frame) => Ok(Some(serde_json::from_slice(&frame)?)),
            None => Ok(None),
        }
    }

    /// Next frame, failing if it is absent
    async fn expect_frame(&mut self, part: &str) -> Result<Bytes> {
        self.next()
            .await?
            .ok_or_else(|| Error::Decode(format!("missing {} frame", part)))
    }

    /// Next frame parsed as JSON, failing if it is absent
    async fn expect_json(&mut self, part: &str) -> Result<Value> {
        self.next_json()
            .await?
            .ok_or_else(|| Error::Decode(format!("missing {} frame", part)))
    }
}

/// Write side of a message.
#[async_trait]
pub trait FrameSink: Send {
    /// Send one frame; `more` announces that further frames of the same
    /// message follow.
    async fn send(&mut self, frame: Bytes, more: bool, block: bool) -> Result<()>;

    /// Serialize `value` and send it as one frame
    async fn send_json(&mut self, value: &Value, more: bool, block: bool) -> Result<()> {
        let frame = serde_json::to_vec(value).map_err(|e| Error::Encode(e.to_string()))?;
        self.send(Bytes::from(frame), more, block).await
    }
}

/// In-memory frame queue.
///
/// Acts as a sink (recording frames and their continuation flags) and as a
/// source (replaying them), which makes it handy for exercising handlers
/// without a socket.
#[derive(Debug, Clone, Default)]
pub struct FrameBuffer {
    frames: VecDeque<(Bytes, bool)>,
    more: bool,
}

impl FrameBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue all `frames` as one message
    pub fn from_message<I, B>(frames: I) -> Self
    where
        I: IntoIterator<Item = B>,
        B: Into<Bytes>,
    {
        let mut buffer = Self::new();
        buffer.push_message(frames);
        buffer
    }

    /// Queue one frame
    pub fn push(&mut self, frame: impl Into<Bytes>, more: bool) {
        self.frames.push_back((frame.into(), more));
    }

    /// Queue `frames` as one message, flagging all but the last with `more`
    pub fn push_message<I, B>(&mut self, frames: I)
    where
        I: IntoIterator<Item = B>,
        B: Into<Bytes>,
    {
        let frames: Vec<Bytes> = frames.into_iter().map(Into::into).collect();
        let last = frames.len().saturating_sub(1);
        for (i, frame) in frames.into_iter().enumerate() {
            self.push(frame, i < last);
        }
    }

    /// Number of queued frames
    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// Queued frames with their continuation flags
    pub fn frames(&self) -> impl Iterator<Item = (&Bytes, bool)> {
        self.frames.iter().map(|(frame, more)| (frame, *more))
    }
}

#[async_trait]
impl FrameSource for FrameBuffer {
    async fn next(&mut self) -> Result<Option<Bytes>> {
        Ok(self.frames.pop_front().map(|(frame, more)| {
            self.more = more;
            frame
        }))
    }

    fn has_more(&self) -> bool {
        self.more
    }
}

#[async_trait]
impl FrameSink for FrameBuffer {
    async fn send(&mut self, frame: Bytes, more: bool, _block: bool) -> Result<()> {
        self.push(frame, more);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_htype_of() {
        let header = json!({"htype": "raw-1.0", "frame": 3});
        assert_eq!(htype_of(&header).unwrap(), "raw-1.0");

        let header = json!({"frame": 3});
        assert!(matches!(htype_of(&header), Err(Error::Protocol(_))));

        let header = json!({"htype": 7});
        assert!(htype_of(&header).is_err());
    }

    #[tokio::test]
    async fn test_buffer_tracks_continuation() {
        let mut buffer = FrameBuffer::from_message([&b"a"[..], &b"b"[..], &b"c"[..]]);
        assert_eq!(buffer.len(), 3);

        assert_eq!(buffer.next().await.unwrap().unwrap(), Bytes::from_static(b"a"));
        assert!(buffer.has_more());
        buffer.next().await.unwrap();
        assert!(buffer.has_more());
        buffer.next().await.unwrap();
        assert!(!buffer.has_more());
        assert!(buffer.next().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_next_json_rejects_garbage() {
        let mut buffer = FrameBuffer::from_message([&b"{not json"[..]]);
        let err = buffer.next_json().await.unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
    }

    #[tokio::test]
    async fn test_expect_json_missing() {
        let mut buffer = FrameBuffer::new();
        let err = buffer.expect_json("header").await.unwrap_err();
        assert!(err.to_string().contains("header"));
    }
}
