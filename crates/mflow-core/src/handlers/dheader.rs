//! `dheader-1.0`: detector series header
//!
//! The `header_detail` field decides how much follows the header:
//! `none` nothing, `basic` the detector configuration, `all` the
//! configuration plus flatfield, pixel mask and count-rate table, each as a
//! JSON description followed by its raw bytes. A trailing JSON appendix is
//! allowed at every level.

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::str::FromStr;

use crate::error::{Error, Result};
use crate::frame::{FrameSink, FrameSource};
use crate::handler::Handler;
use crate::message::Payload;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HeaderDetail {
    All,
    Basic,
    None,
}

impl FromStr for HeaderDetail {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "all" => Ok(HeaderDetail::All),
            "basic" => Ok(HeaderDetail::Basic),
            "none" => Ok(HeaderDetail::None),
            other => Err(Error::Protocol(format!("unknown header_detail: {}", other))),
        }
    }
}

/// A JSON description followed by the raw table it describes
#[derive(Debug, Clone, PartialEq)]
pub struct DescribedBlob {
    pub description: Value,
    pub raw: Bytes,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DHeaderData {
    pub header: Value,
    pub detail: HeaderDetail,
    /// Present for `basic` and `all`
    pub config: Option<Value>,
    /// Present for `all`
    pub flatfield: Option<DescribedBlob>,
    pub pixel_mask: Option<DescribedBlob>,
    pub countrate_table: Option<DescribedBlob>,
    pub appendix: Option<Value>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DHeaderHandler;

async fn read_blob(source: &mut dyn FrameSource, part: &str) -> Result<DescribedBlob> {
    let description = source.expect_json(part).await?;
    let raw = source.expect_frame(part).await?;
    Ok(DescribedBlob { description, raw })
}

async fn write_blob(
    sink: &mut dyn FrameSink,
    blob: Option<&DescribedBlob>,
    part: &str,
    more: bool,
    block: bool,
) -> Result<()> {
    let blob = blob.ok_or_else(|| Error::Encode(format!("dheader-1.0 'all' is missing {}", part)))?;
    sink.send_json(&blob.description, true, block).await?;
    sink.send(blob.raw.clone(), more, block).await
}

#[async_trait]
impl Handler for DHeaderHandler {
    async fn receive(&mut self, source: &mut dyn FrameSource) -> Result<Option<Payload>> {
        let header = source.expect_json("header").await?;
        let detail: HeaderDetail = header
            .get("header_detail")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::missing_field("header_detail"))?
            .parse()?;

        let mut data = DHeaderData {
            header,
            detail,
            config: None,
            flatfield: None,
            pixel_mask: None,
            countrate_table: None,
            appendix: None,
        };

        if matches!(detail, HeaderDetail::All | HeaderDetail::Basic) {
            data.config = Some(source.expect_json("detector configuration").await?);
        }

        if detail == HeaderDetail::All {
            data.flatfield = Some(read_blob(source, "flatfield").await?);
            data.pixel_mask = Some(read_blob(source, "pixel mask").await?);
            data.countrate_table = Some(read_blob(source, "count-rate table").await?);
        }

        if source.has_more() {
            data.appendix = source.next_json().await?;
        }

        Ok(Some(Payload::DHeader(data)))
    }

    async fn send(&mut self, message: &Payload, sink: &mut dyn FrameSink, block: bool) -> Result<()> {
        let Payload::DHeader(data) = message else {
            return Err(Error::Encode("dheader-1.0 handler expects a dheader payload".to_string()));
        };
        let has_appendix = data.appendix.is_some();

        sink.send_json(&data.header, data.detail != HeaderDetail::None || has_appendix, block)
            .await?;

        if data.detail != HeaderDetail::None {
            let config = data
                .config
                .as_ref()
                .ok_or_else(|| Error::Encode("dheader-1.0 is missing the detector configuration".to_string()))?;
            let more = data.detail == HeaderDetail::All || has_appendix;
            sink.send_json(config, more, block).await?;
        }

        if data.detail == HeaderDetail::All {
            write_blob(sink, data.flatfield.as_ref(), "flatfield", true, block).await?;
            write_blob(sink, data.pixel_mask.as_ref(), "pixel mask", true, block).await?;
            write_blob(sink, data.countrate_table.as_ref(), "count-rate table", has_appendix, block)
                .await?;
        }

        if let Some(appendix) = &data.appendix {
            sink.send_json(appendix, false, block).await?;
        }
        Ok(())
    }
}
