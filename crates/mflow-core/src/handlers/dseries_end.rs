//! `dseries_end-1.0`: end-of-series marker, header only

use async_trait::async_trait;
use serde_json::Value;

use crate::error::{Error, Result};
use crate::frame::{FrameSink, FrameSource};
use crate::handler::Handler;
use crate::message::Payload;

#[derive(Debug, Clone, PartialEq)]
pub struct DSeriesEndData {
    pub header: Value,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DSeriesEndHandler;

#[async_trait]
impl Handler for DSeriesEndHandler {
    async fn receive(&mut self, source: &mut dyn FrameSource) -> Result<Option<Payload>> {
        let header = source.expect_json("header").await?;
        Ok(Some(Payload::DSeriesEnd(DSeriesEndData { header })))
    }

    async fn send(&mut self, message: &Payload, sink: &mut dyn FrameSink, block: bool) -> Result<()> {
        let Payload::DSeriesEnd(data) = message else {
            return Err(Error::Encode(
                "dseries_end-1.0 handler expects a dseries_end payload".to_string(),
            ));
        };
        sink.send_json(&data.header, false, block).await
    }
}
