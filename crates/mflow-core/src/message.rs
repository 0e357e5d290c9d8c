//! Decoded messages

use serde_json::Value;

use crate::frame::htype_of;
use crate::handlers::{ArrayData, BsrMData, DHeaderData, DImageData, DSeriesEndData, RawData};
use crate::statistics::Statistics;

/// Decoded body of a message, one variant per built-in type
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Raw(RawData),
    Array(ArrayData),
    DHeader(DHeaderData),
    DImage(DImageData),
    DSeriesEnd(DSeriesEndData),
    BsrM(BsrMData),
    /// Free-form result of a user handler. If it has a `header` object, that
    /// is taken as the message header, otherwise the value itself is.
    Json(Value),
}

impl Payload {
    /// The header frame of the message
    pub fn header(&self) -> &Value {
        match self {
            Payload::Raw(data) => &data.header,
            Payload::Array(data) => &data.header,
            Payload::DHeader(data) => &data.header,
            Payload::DImage(data) => &data.header,
            Payload::DSeriesEnd(data) => &data.header,
            Payload::BsrM(data) => &data.header,
            Payload::Json(value) => match value.get("header") {
                Some(header) if header.is_object() => header,
                _ => value,
            },
        }
    }

    /// Type tag declared by the header, if any
    pub fn htype(&self) -> Option<&str> {
        htype_of(self.header()).ok()
    }
}

/// A received message: the decoded payload plus the reader's counters at
/// the moment it was accepted
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    statistics: Statistics,
    data: Payload,
}

impl Message {
    pub fn new(statistics: Statistics, data: Payload) -> Self {
        Self { statistics, data }
    }

    pub fn statistics(&self) -> &Statistics {
        &self.statistics
    }

    pub fn data(&self) -> &Payload {
        &self.data
    }

    pub fn into_data(self) -> Payload {
        self.data
    }
}
