// rust/collector-core/src/datatype.rs

//! Element types stored in datasets and attributes.

use std::fmt;

use bytemuck::Pod;
use serde::{Deserialize, Serialize};

use crate::dimensions::Dimensions;
use crate::error::{CollectorError, Result};

/// Type tag of a dataset or attribute element.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DataType {
    Bool,
    Int8,
    Int16,
    Int32,
    Int64,
    UInt8,
    UInt16,
    UInt32,
    UInt64,
    Float32,
    Float64,
    /// A [`Dimensions`] triple (three `u64`).
    Dims,
}

impl DataType {
    /// Size of one element in bytes.
    pub const fn size(&self) -> usize {
        match self {
            DataType::Bool | DataType::Int8 | DataType::UInt8 => 1,
            DataType::Int16 | DataType::UInt16 => 2,
            DataType::Int32 | DataType::UInt32 | DataType::Float32 => 4,
            DataType::Int64 | DataType::UInt64 | DataType::Float64 => 8,
            DataType::Dims => 24,
        }
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DataType::Bool => "bool",
            DataType::Int8 => "int8",
            DataType::Int16 => "int16",
            DataType::Int32 => "int32",
            DataType::Int64 => "int64",
            DataType::UInt8 => "uint8",
            DataType::UInt16 => "uint16",
            DataType::UInt32 => "uint32",
            DataType::UInt64 => "uint64",
            DataType::Float32 => "float32",
            DataType::Float64 => "float64",
            DataType::Dims => "dims",
        };
        f.write_str(name)
    }
}

/// A Rust type that can be stored as a dataset or attribute element.
pub trait Element: Pod {
    const DATA_TYPE: DataType;
}

macro_rules! impl_element {
    ($($ty:ty => $tag:ident),* $(,)?) => {
        $(impl Element for $ty {
            const DATA_TYPE: DataType = DataType::$tag;
        })*
    };
}

impl_element! {
    i8 => Int8,
    i16 => Int16,
    i32 => Int32,
    i64 => Int64,
    u8 => UInt8,
    u16 => UInt16,
    u32 => UInt32,
    u64 => UInt64,
    f32 => Float32,
    f64 => Float64,
    Dimensions => Dims,
}

/// A typed attribute value: scalar or small array, stored as raw bytes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attribute {
    pub dtype: DataType,
    pub bytes: Vec<u8>,
}

impl Attribute {
    /// Builds an attribute from raw bytes, checking the length against the type.
    pub fn from_bytes(dtype: DataType, bytes: &[u8]) -> Result<Self> {
        if bytes.is_empty() || bytes.len() % dtype.size() != 0 {
            return Err(CollectorError::geometry(format!(
                "attribute of type {dtype} needs a non-empty multiple of {} bytes, got {}",
                dtype.size(),
                bytes.len()
            )));
        }
        Ok(Self {
            dtype,
            bytes: bytes.to_vec(),
        })
    }

    pub fn from_values<T: Element>(values: &[T]) -> Result<Self> {
        Self::from_bytes(T::DATA_TYPE, bytemuck::cast_slice(values))
    }

    /// Boolean attributes are stored as a single byte each.
    pub fn from_bool(value: bool) -> Self {
        Self {
            dtype: DataType::Bool,
            bytes: vec![u8::from(value)],
        }
    }

    /// Number of elements in this attribute.
    pub fn len(&self) -> usize {
        self.bytes.len() / self.dtype.size()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Decodes the attribute as values of `T`, failing on a type mismatch.
    pub fn values<T: Element>(&self, name: &str) -> Result<Vec<T>> {
        if self.dtype != T::DATA_TYPE {
            return Err(CollectorError::schema(
                name,
                format!("attribute has type {}, requested {}", self.dtype, T::DATA_TYPE),
            ));
        }
        Ok(bytemuck::pod_collect_to_vec(&self.bytes))
    }

    pub fn as_bool(&self, name: &str) -> Result<bool> {
        if self.dtype != DataType::Bool {
            return Err(CollectorError::schema(
                name,
                format!("attribute has type {}, requested bool", self.dtype),
            ));
        }
        Ok(self.bytes.first().copied().unwrap_or(0) != 0)
    }
}
