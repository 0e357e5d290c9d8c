//! Flat numeric arrays carried as row-major frames
//!
//! The element type travels in the JSON header as a dtype name (`"int32"`,
//! `"float64"`, …) or a numpy-style code (`"<i4"`, `">f8"`, `"u2"`).

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{Error, Result};

/// Byte order of array elements
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Endianness {
    #[default]
    Little,
    Big,
}

impl FromStr for Endianness {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "little" | "<" => Ok(Endianness::Little),
            "big" | ">" => Ok(Endianness::Big),
            other => Err(Error::Protocol(format!("unknown endianness: {}", other))),
        }
    }
}

/// Element type of an array
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DType {
    Int8,
    UInt8,
    Int16,
    UInt16,
    Int32,
    UInt32,
    Int64,
    UInt64,
    Float32,
    Float64,
}

impl DType {
    /// Size of one element in bytes
    pub fn itemsize(&self) -> usize {
        match self {
            DType::Int8 | DType::UInt8 => 1,
            DType::Int16 | DType::UInt16 => 2,
            DType::Int32 | DType::UInt32 | DType::Float32 => 4,
            DType::Int64 | DType::UInt64 | DType::Float64 => 8,
        }
    }

    /// Canonical name as written in headers
    pub fn name(&self) -> &'static str {
        match self {
            DType::Int8 => "int8",
            DType::UInt8 => "uint8",
            DType::Int16 => "int16",
            DType::UInt16 => "uint16",
            DType::Int32 => "int32",
            DType::UInt32 => "uint32",
            DType::Int64 => "int64",
            DType::UInt64 => "uint64",
            DType::Float32 => "float32",
            DType::Float64 => "float64",
        }
    }

    /// Parse a dtype, returning the byte order if the code carries one
    pub fn parse(s: &str) -> Result<(Self, Option<Endianness>)> {
        let (order, code) = match s.chars().next() {
            Some('<') => (Some(Endianness::Little), &s[1..]),
            Some('>') => (Some(Endianness::Big), &s[1..]),
            Some('=') | Some('|') => (None, &s[1..]),
            _ => (None, s),
        };

        let dtype = match code.to_ascii_lowercase().as_str() {
            "int8" | "i1" => DType::Int8,
            "uint8" | "u1" => DType::UInt8,
            "int16" | "i2" => DType::Int16,
            "uint16" | "u2" => DType::UInt16,
            "int32" | "i4" => DType::Int32,
            "uint32" | "u4" => DType::UInt32,
            "int64" | "i8" => DType::Int64,
            "uint64" | "u8" => DType::UInt64,
            "float32" | "f4" => DType::Float32,
            "float64" | "f8" => DType::Float64,
            _ => return Err(Error::Protocol(format!("unsupported dtype: {}", s))),
        };

        Ok((dtype, order))
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for DType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        DType::parse(s).map(|(dtype, _)| dtype)
    }
}

/// Rust types that can be read out of an [`NdArray`]
pub trait Element: Sized + Copy {
    const DTYPE: DType;

    fn from_le(bytes: &[u8]) -> Self;
    fn from_be(bytes: &[u8]) -> Self;
}

macro_rules! impl_element {
    ($($ty:ty => $dtype:ident),* $(,)?) => {
        $(
            impl Element for $ty {
                const DTYPE: DType = DType::$dtype;

                fn from_le(bytes: &[u8]) -> Self {
                    let mut raw = [0u8; std::mem::size_of::<$ty>()];
                    raw.copy_from_slice(bytes);
                    <$ty>::from_le_bytes(raw)
                }

                fn from_be(bytes: &[u8]) -> Self {
                    let mut raw = [0u8; std::mem::size_of::<$ty>()];
                    raw.copy_from_slice(bytes);
                    <$ty>::from_be_bytes(raw)
                }
            }
        )*
    };
}

impl_element! {
    i8 => Int8,
    u8 => UInt8,
    i16 => Int16,
    u16 => UInt16,
    i32 => Int32,
    u32 => UInt32,
    i64 => Int64,
    u64 => UInt64,
    f32 => Float32,
    f64 => Float64,
}

/// A row-major array backed by the frame it arrived in
#[derive(Debug, Clone, PartialEq)]
pub struct NdArray {
    pub dtype: DType,
    pub endianness: Endianness,
    pub shape: Vec<usize>,
    pub data: Bytes,
}

impl NdArray {
    /// Wrap `data`, checking its length against dtype and shape
    pub fn new(dtype: DType, endianness: Endianness, shape: Vec<usize>, data: Bytes) -> Result<Self> {
        let expected = element_count(&shape)
            .and_then(|count| count.checked_mul(dtype.itemsize()))
            .ok_or_else(|| Error::Protocol(format!("array of {} {:?} is too large", dtype, shape)))?;
        if data.len() != expected {
            return Err(Error::Decode(format!(
                "array of {} {:?} needs {} bytes, frame has {}",
                dtype,
                shape,
                expected,
                data.len()
            )));
        }

        Ok(Self {
            dtype,
            endianness,
            shape,
            data,
        })
    }

    /// Build a little-endian array from typed values
    pub fn from_values<T: Element + ToBytes>(shape: Vec<usize>, values: &[T]) -> Result<Self> {
        let mut data = Vec::with_capacity(values.len() * T::DTYPE.itemsize());
        for value in values {
            data.extend_from_slice(value.to_le_vec().as_slice());
        }
        Self::new(T::DTYPE, Endianness::Little, shape, Bytes::from(data))
    }

    /// Number of elements
    pub fn len(&self) -> usize {
        self.shape.iter().fold(1usize, |count, dim| count.saturating_mul(*dim))
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Decode the elements, failing if `T` does not match the dtype
    pub fn to_vec<T: Element>(&self) -> Result<Vec<T>> {
        if T::DTYPE != self.dtype {
            return Err(Error::Decode(format!(
                "array holds {}, requested {}",
                self.dtype,
                T::DTYPE
            )));
        }

        let values = self
            .data
            .chunks_exact(self.dtype.itemsize())
            .map(|chunk| match self.endianness {
                Endianness::Little => T::from_le(chunk),
                Endianness::Big => T::from_be(chunk),
            })
            .collect();
        Ok(values)
    }
}

/// Number of elements in `shape`, or `None` if it does not fit in a `usize`
pub fn element_count(shape: &[usize]) -> Option<usize> {
    shape.iter().try_fold(1usize, |count, dim| count.checked_mul(*dim))
}

/// Little-endian encoding for [`NdArray::from_values`]
pub trait ToBytes {
    fn to_le_vec(&self) -> Vec<u8>;
}

macro_rules! impl_to_bytes {
    ($($ty:ty),*) => {
        $(
            impl ToBytes for $ty {
                fn to_le_vec(&self) -> Vec<u8> {
                    self.to_le_bytes().to_vec()
                }
            }
        )*
    };
}

impl_to_bytes!(i8, u8, i16, u16, i32, u32, i64, u64, f32, f64);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_dtype_names_and_codes() {
        assert_eq!(DType::parse("int32").unwrap(), (DType::Int32, None));
        assert_eq!(DType::parse("<f8").unwrap(), (DType::Float64, Some(Endianness::Little)));
        assert_eq!(DType::parse(">u2").unwrap(), (DType::UInt16, Some(Endianness::Big)));
        assert_eq!("UINT8".parse::<DType>().unwrap(), DType::UInt8);
        assert!(DType::parse("complex128").is_err());
    }

    #[test]
    fn test_size_mismatch_is_decode_error() {
        let err = NdArray::new(DType::Int32, Endianness::Little, vec![10], Bytes::from(vec![0u8; 39]))
            .unwrap_err();
        assert!(matches!(err, Error::Decode(_)));
    }

    #[test]
    fn test_oversized_shape_is_protocol_error() {
        let shape = vec![1usize << 62, 8];
        assert_eq!(element_count(&shape), None);

        let err = NdArray::new(DType::UInt64, Endianness::Little, shape, Bytes::from(vec![0u8; 8])).unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));

        // Element count fits, byte count does not.
        let err = NdArray::new(DType::Float64, Endianness::Little, vec![usize::MAX / 4], Bytes::new()).unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
    }

    #[test]
    fn test_big_endian_values() {
        let data = Bytes::from(vec![0x00, 0x01, 0x01, 0x00]);
        let array = NdArray::new(DType::UInt16, Endianness::Big, vec![2], data).unwrap();
        assert_eq!(array.to_vec::<u16>().unwrap(), vec![1, 256]);
    }

    #[test]
    fn test_from_values() {
        let array = NdArray::from_values(vec![2, 2], &[1.5f32, -2.0, 0.0, 8.25]).unwrap();
        assert_eq!(array.len(), 4);
        assert_eq!(array.data.len(), 16);
        assert_eq!(array.to_vec::<f32>().unwrap(), vec![1.5, -2.0, 0.0, 8.25]);
        assert!(array.to_vec::<i32>().is_err());
    }
}
