//! `array-1.0`: a JSON header describing dtype and shape, followed by one
//! row-major array per frame

use async_trait::async_trait;
use serde_json::Value;

use crate::array::{DType, Endianness, NdArray};
use crate::error::{Error, Result};
use crate::frame::{FrameSink, FrameSource};
use crate::handler::Handler;
use crate::message::Payload;

#[derive(Debug, Clone, PartialEq)]
pub struct ArrayData {
    pub header: Value,
    pub dtype: DType,
    pub endianness: Endianness,
    pub shape: Vec<usize>,
    /// One entry per data frame; empty frames are `None`
    pub data: Vec<Option<NdArray>>,
}

impl ArrayData {
    /// Parse dtype, byte order and shape out of an array header
    pub fn describe(header: &Value) -> Result<(DType, Endianness, Vec<usize>)> {
        let dtype = header
            .get("type")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::missing_field("type"))?;
        let (dtype, code_order) = DType::parse(dtype)?;

        let shape = header
            .get("shape")
            .and_then(Value::as_array)
            .ok_or_else(|| Error::missing_field("shape"))?
            .iter()
            .map(|dim| {
                dim.as_u64()
                    .and_then(|d| usize::try_from(d).ok())
                    .ok_or_else(|| Error::Protocol(format!("invalid shape dimension: {}", dim)))
            })
            .collect::<Result<Vec<_>>>()?;

        let endianness = match header.get("endianness").and_then(Value::as_str) {
            Some(order) => order.parse()?,
            None => code_order.unwrap_or_default(),
        };

        Ok((dtype, endianness, shape))
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ArrayHandler;

#[async_trait]
impl Handler for ArrayHandler {
    async fn receive(&mut self, source: &mut dyn FrameSource) -> Result<Option<Payload>> {
        let header = source.expect_json("header").await?;
        let (dtype, endianness, shape) = ArrayData::describe(&header)?;

        let mut data = Vec::new();
        while source.has_more() {
            match source.next().await? {
                Some(frame) if !frame.is_empty() => {
                    data.push(Some(NdArray::new(dtype, endianness, shape.clone(), frame)?));
                }
                _ => data.push(None),
            }
        }

        Ok(Some(Payload::Array(ArrayData {
            header,
            dtype,
            endianness,
            shape,
            data,
        })))
    }

    async fn send(&mut self, message: &Payload, sink: &mut dyn FrameSink, block: bool) -> Result<()> {
        let Payload::Array(array) = message else {
            return Err(Error::Encode("array-1.0 handler expects an array payload".to_string()));
        };

        sink.send_json(&array.header, !array.data.is_empty(), block).await?;

        let last = array.data.len().saturating_sub(1);
        for (i, segment) in array.data.iter().enumerate() {
            let frame = segment
                .as_ref()
                .map(|a| a.data.clone())
                .unwrap_or_default();
            sink.send(frame, i < last, block).await?;
        }
        Ok(())
    }
}
