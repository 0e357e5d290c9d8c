//! `bsr_m-1.0`: beam-synchronous channel data
//!
//! A message is a main header (pulse id and the hash of the data header), a
//! data header describing the channels, then a value frame and a timestamp
//! frame per channel. Senders repeat the same data header on every message,
//! so the handler keeps the channel layout of the last hash it saw and only
//! parses the data header again when the hash changes.

use async_trait::async_trait;
use bytes::Bytes;
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::array::{DType, Endianness, NdArray};
use crate::error::{Error, Result};
use crate::frame::{FrameSink, FrameSource};
use crate::handler::Handler;
use crate::message::Payload;

const TIMESTAMP_LEN: usize = 16;

/// How the value frames of a channel are encoded
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelKind {
    Number(DType),
    String,
}

impl ChannelKind {
    /// Channel type name as found in data headers; unknown names decode as
    /// 64-bit floats
    pub fn parse(name: Option<&str>) -> Self {
        let Some(name) = name else {
            warn!("Channel without 'type' field, decoding as float64");
            return ChannelKind::Number(DType::Float64);
        };

        let dtype = match name.to_ascii_lowercase().as_str() {
            "string" => return ChannelKind::String,
            "double" | "float64" => DType::Float64,
            "float" | "float32" => DType::Float32,
            "integer" | "long" | "int32" => DType::Int32,
            "ulong" | "uint32" => DType::UInt32,
            "short" | "int16" => DType::Int16,
            "ushort" | "uint16" => DType::UInt16,
            "int8" => DType::Int8,
            "uint8" => DType::UInt8,
            "int64" => DType::Int64,
            "uint64" => DType::UInt64,
            other => {
                warn!("Unknown channel type '{}', decoding as float64", other);
                DType::Float64
            }
        };
        ChannelKind::Number(dtype)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Channel {
    pub name: Option<String>,
    pub kind: ChannelKind,
    pub endianness: Endianness,
}

impl Channel {
    fn from_json(channel: &Value) -> Self {
        let endianness = match channel.get("encoding").and_then(Value::as_str) {
            Some("big") => Endianness::Big,
            _ => Endianness::Little,
        };
        Self {
            name: channel.get("name").and_then(Value::as_str).map(str::to_string),
            kind: ChannelKind::parse(channel.get("type").and_then(Value::as_str)),
            endianness,
        }
    }

    fn decode(&self, frame: Bytes) -> Result<ChannelValue> {
        match self.kind {
            ChannelKind::String => Ok(ChannelValue::String(frame)),
            ChannelKind::Number(dtype) => {
                if frame.len() % dtype.itemsize() != 0 {
                    return Err(Error::Decode(format!(
                        "{} bytes is not a whole number of {} values",
                        frame.len(),
                        dtype
                    )));
                }
                let count = frame.len() / dtype.itemsize();
                NdArray::new(dtype, self.endianness, vec![count], frame).map(ChannelValue::Number)
            }
        }
    }
}

/// Parse the channel list of a data header
pub fn parse_channels(data_header: &Value) -> Result<Vec<Channel>> {
    let channels = data_header
        .get("channels")
        .and_then(Value::as_array)
        .ok_or_else(|| Error::missing_field("channels"))?;
    Ok(channels.iter().map(Channel::from_json).collect())
}

#[derive(Debug, Clone, PartialEq)]
pub enum ChannelValue {
    Number(NdArray),
    String(Bytes),
}

impl ChannelValue {
    fn bytes(&self) -> Bytes {
        match self {
            ChannelValue::Number(array) => array.data.clone(),
            ChannelValue::String(bytes) => bytes.clone(),
        }
    }
}

/// Seconds past the epoch and nanosecond offset of a channel value
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelTimestamp {
    pub sec: u64,
    pub ns: u64,
}

impl ChannelTimestamp {
    fn decode(frame: &[u8], endianness: Endianness) -> Result<Option<Self>> {
        if frame.is_empty() {
            return Ok(None);
        }
        if frame.len() != TIMESTAMP_LEN {
            return Err(Error::Decode(format!(
                "timestamp frame has {} bytes, expected {}",
                frame.len(),
                TIMESTAMP_LEN
            )));
        }

        let mut sec = [0u8; 8];
        let mut ns = [0u8; 8];
        sec.copy_from_slice(&frame[..8]);
        ns.copy_from_slice(&frame[8..]);
        Ok(Some(match endianness {
            Endianness::Little => Self {
                sec: u64::from_le_bytes(sec),
                ns: u64::from_le_bytes(ns),
            },
            Endianness::Big => Self {
                sec: u64::from_be_bytes(sec),
                ns: u64::from_be_bytes(ns),
            },
        }))
    }

    fn encode(&self, endianness: Endianness) -> Bytes {
        let mut frame = Vec::with_capacity(TIMESTAMP_LEN);
        match endianness {
            Endianness::Little => {
                frame.extend_from_slice(&self.sec.to_le_bytes());
                frame.extend_from_slice(&self.ns.to_le_bytes());
            }
            Endianness::Big => {
                frame.extend_from_slice(&self.sec.to_be_bytes());
                frame.extend_from_slice(&self.ns.to_be_bytes());
            }
        }
        Bytes::from(frame)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChannelReading {
    pub value: ChannelValue,
    pub timestamp: Option<ChannelTimestamp>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BsrMData {
    pub header: Value,
    pub pulse_id: u64,
    /// Data header the channels were decoded with
    pub data_header: Option<Value>,
    /// Whether this message carried a data header with a new hash
    pub header_changed: bool,
    /// The data header lists no channels; no readings were decoded
    pub no_channels: bool,
    /// One entry per channel; channels without data are `None`
    pub readings: Vec<Option<ChannelReading>>,
    /// Bytes of channel data, timestamps excluded
    pub size: usize,
}

/// Stateful: remembers the channel layout of the last data header hash
#[derive(Debug, Clone, Default)]
pub struct BsrMHandler {
    header_hash: Option<Value>,
    data_header: Option<Value>,
    channels: Vec<Channel>,
}

impl BsrMHandler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Hash of the data header currently cached
    pub fn header_hash(&self) -> Option<&Value> {
        self.header_hash.as_ref()
    }

    pub fn channels(&self) -> &[Channel] {
        &self.channels
    }
}

#[async_trait]
impl Handler for BsrMHandler {
    async fn receive(&mut self, source: &mut dyn FrameSource) -> Result<Option<Payload>> {
        let header = source.expect_json("header").await?;
        let pulse_id = header
            .get("pulse_id")
            .and_then(Value::as_u64)
            .ok_or_else(|| Error::missing_field("pulse_id"))?;
        let hash = header
            .get("hash")
            .cloned()
            .ok_or_else(|| Error::missing_field("hash"))?;

        let mut header_changed = false;
        if source.has_more() {
            if self.header_hash.as_ref() == Some(&hash) {
                source.next().await?;
            } else {
                let data_header = source.expect_json("data header").await?;
                self.channels = parse_channels(&data_header)?;
                debug!("Data header changed, {} channel(s)", self.channels.len());
                self.header_hash = Some(hash);
                self.data_header = Some(data_header);
                header_changed = true;
            }
        }

        if self.data_header.is_some() && self.channels.is_empty() {
            while source.has_more() {
                source.next().await?;
            }
            return Ok(Some(Payload::BsrM(BsrMData {
                header,
                pulse_id,
                data_header: self.data_header.clone(),
                header_changed,
                no_channels: true,
                readings: Vec::new(),
                size: 0,
            })));
        }

        let mut readings = Vec::new();
        let mut size = 0;
        while source.has_more() {
            let frame = source.next().await?.unwrap_or_default();
            size += frame.len();

            let channel = self.channels.get(readings.len()).ok_or_else(|| {
                Error::Decode(format!(
                    "value frame {} has no channel in the data header",
                    readings.len()
                ))
            })?;
            let timestamp = if source.has_more() {
                source.next().await?.unwrap_or_default()
            } else {
                Bytes::new()
            };

            if frame.is_empty() {
                readings.push(None);
            } else {
                readings.push(Some(ChannelReading {
                    value: channel.decode(frame)?,
                    timestamp: ChannelTimestamp::decode(&timestamp, channel.endianness)?,
                }));
            }
        }

        Ok(Some(Payload::BsrM(BsrMData {
            header,
            pulse_id,
            data_header: self.data_header.clone(),
            header_changed,
            no_channels: false,
            readings,
            size,
        })))
    }

    async fn send(&mut self, message: &Payload, sink: &mut dyn FrameSink, block: bool) -> Result<()> {
        let Payload::BsrM(data) = message else {
            return Err(Error::Encode("bsr_m-1.0 handler expects a bsr_m payload".to_string()));
        };

        let data_header = data
            .data_header
            .clone()
            .unwrap_or_else(|| json!({ "channels": [] }));
        let channels = parse_channels(&data_header)?;

        sink.send_json(&data.header, true, block).await?;
        sink.send_json(&data_header, !data.readings.is_empty(), block).await?;

        let last = data.readings.len().saturating_sub(1);
        for (i, reading) in data.readings.iter().enumerate() {
            let endianness = channels
                .get(i)
                .map(|channel| channel.endianness)
                .unwrap_or_default();
            let (value, timestamp) = match reading {
                Some(reading) => (
                    reading.value.bytes(),
                    reading
                        .timestamp
                        .map(|ts| ts.encode(endianness))
                        .unwrap_or_default(),
                ),
                None => (Bytes::new(), Bytes::new()),
            };
            sink.send(value, true, block).await?;
            sink.send(timestamp, i < last, block).await?;
        }
        Ok(())
    }
}
