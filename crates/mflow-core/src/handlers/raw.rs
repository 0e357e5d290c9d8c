//! `raw-1.0`: a JSON header followed by opaque segments

use async_trait::async_trait;
use bytes::Bytes;
use serde_json::Value;

use crate::error::{Error, Result};
use crate::frame::{FrameSink, FrameSource};
use crate::handler::Handler;
use crate::message::Payload;

#[derive(Debug, Clone, PartialEq)]
pub struct RawData {
    pub header: Value,
    /// One entry per segment frame; empty frames are `None`
    pub data: Vec<Option<Bytes>>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RawHandler;

#[async_trait]
impl Handler for RawHandler {
    async fn receive(&mut self, source: &mut dyn FrameSource) -> Result<Option<Payload>> {
        let header = source.next_json().await?;

        let mut data = Vec::new();
        while source.has_more() {
            let segment = source.next().await?.filter(|frame| !frame.is_empty());
            data.push(segment);
        }

        match header {
            Some(header) => Ok(Some(Payload::Raw(RawData { header, data }))),
            None if !data.is_empty() => Ok(Some(Payload::Raw(RawData {
                header: Value::Null,
                data,
            }))),
            None => Ok(None),
        }
    }

    async fn send(&mut self, message: &Payload, sink: &mut dyn FrameSink, block: bool) -> Result<()> {
        let Payload::Raw(raw) = message else {
            return Err(Error::Encode("raw-1.0 handler expects a raw payload".to_string()));
        };

        sink.send_json(&raw.header, !raw.data.is_empty(), block).await?;

        let last = raw.data.len().saturating_sub(1);
        for (i, segment) in raw.data.iter().enumerate() {
            let frame = segment.clone().unwrap_or_default();
            sink.send(frame, i < last, block).await?;
        }
        Ok(())
    }
}
