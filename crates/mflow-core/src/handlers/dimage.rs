//! `dimage-1.0`: one detector image in four parts plus an optional appendix

use async_trait::async_trait;
use bytes::Bytes;
use serde_json::Value;

use crate::error::{Error, Result};
use crate::frame::{FrameSink, FrameSource};
use crate::handler::Handler;
use crate::message::Payload;

#[derive(Debug, Clone, PartialEq)]
pub struct DImageData {
    pub header: Value,
    /// Image description (shape, type, encoding)
    pub image_header: Value,
    pub image: Bytes,
    /// Timing trailer
    pub trailer: Value,
    pub appendix: Option<Value>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DImageHandler;

#[async_trait]
impl Handler for DImageHandler {
    async fn receive(&mut self, source: &mut dyn FrameSource) -> Result<Option<Payload>> {
        let header = source.expect_json("header").await?;
        let image_header = source.expect_json("image header").await?;
        let image = source.expect_frame("image").await?;
        let trailer = source.expect_json("trailer").await?;

        let appendix = if source.has_more() {
            source.next_json().await?
        } else {
            None
        };

        Ok(Some(Payload::DImage(DImageData {
            header,
            image_header,
            image,
            trailer,
            appendix,
        })))
    }

    async fn send(&mut self, message: &Payload, sink: &mut dyn FrameSink, block: bool) -> Result<()> {
        let Payload::DImage(data) = message else {
            return Err(Error::Encode("dimage-1.0 handler expects a dimage payload".to_string()));
        };

        sink.send_json(&data.header, true, block).await?;
        sink.send_json(&data.image_header, true, block).await?;
        sink.send(data.image.clone(), true, block).await?;
        sink.send_json(&data.trailer, data.appendix.is_some(), block).await?;
        if let Some(appendix) = &data.appendix {
            sink.send_json(appendix, false, block).await?;
        }
        Ok(())
    }
}
