//! Type id dispatch for data block payloads
//!
//! A [`Registry`] maps the one-byte type id that follows `START_DATA` to a
//! [`TypeHandler`]. The table is fixed once built: extra ids are added through
//! [`RegistryBuilder`] before the registry is handed to a parser, never while
//! decoding.

use std::collections::BTreeMap;

use byteorder::{ByteOrder, LittleEndian};
use serde::Serialize;

use crate::string::{self, StringEncoding};
use crate::{Error, Result, TYPE_FLOAT32, TYPE_FLOAT64, TYPE_INT32, TYPE_INT64, TYPE_STRING};

/// Decode `count` elements from an exactly-sized payload
pub type DecodeFn = fn(&[u8], u32, &DecodeContext) -> Result<Values>;

/// Encode values back into payload bytes
pub type EncodeFn = fn(&Values, StringEncoding) -> Result<Vec<u8>>;

/// Per-element payload size
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElementSize {
    /// Every element is this many bytes
    Fixed(usize),
    /// Every element carries its own length prefix (string layouts)
    Prefixed,
}

/// Caller-supplied context for one decode
#[derive(Debug, Clone, Copy, Default)]
pub struct DecodeContext {
    /// Encoding of string payloads
    pub encoding: StringEncoding,
    /// Absolute offset of the payload, for error reporting
    pub offset: usize,
}

/// One registry entry
#[derive(Debug, Clone, Copy)]
pub struct TypeHandler {
    pub id: u8,
    pub name: &'static str,
    pub size: ElementSize,
    pub decode: DecodeFn,
    pub encode: EncodeFn,
}

impl TypeHandler {
    /// Bytes taken by `count` elements at the start of `area`.
    ///
    /// Fixed sizes are computed in u64 so a hostile count cannot overflow.
    pub fn payload_len(&self, area: &[u8], count: u32, ctx: &DecodeContext) -> Result<u64> {
        match self.size {
            ElementSize::Fixed(size) => Ok(u64::from(count) * size as u64),
            ElementSize::Prefixed => {
                string::measure(area, 0, count, ctx.encoding, ctx.offset).map(|n| n as u64)
            }
        }
    }
}

/// Element type of a decoded array
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DType {
    Float64,
    Float32,
    Int32,
    Int64,
    String,
}

/// Decoded array contents
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Values {
    Float64(Vec<f64>),
    Float32(Vec<f32>),
    Int32(Vec<i32>),
    Int64(Vec<i64>),
    String(Vec<String>),
}

impl Values {
    pub fn dtype(&self) -> DType {
        match self {
            Values::Float64(_) => DType::Float64,
            Values::Float32(_) => DType::Float32,
            Values::Int32(_) => DType::Int32,
            Values::Int64(_) => DType::Int64,
            Values::String(_) => DType::String,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Values::Float64(v) => v.len(),
            Values::Float32(v) => v.len(),
            Values::Int32(v) => v.len(),
            Values::Int64(v) => v.len(),
            Values::String(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Append `other` if it has the same dtype.
    ///
    /// Returns `other` back unchanged on a dtype mismatch.
    pub fn append(&mut self, other: Values) -> std::result::Result<(), Values> {
        match (self, other) {
            (Values::Float64(a), Values::Float64(b)) => a.extend(b),
            (Values::Float32(a), Values::Float32(b)) => a.extend(b),
            (Values::Int32(a), Values::Int32(b)) => a.extend(b),
            (Values::Int64(a), Values::Int64(b)) => a.extend(b),
            (Values::String(a), Values::String(b)) => a.extend(b),
            (_, other) => return Err(other),
        }
        Ok(())
    }

    /// Float view of numeric arrays
    pub fn as_f64(&self) -> Option<Vec<f64>> {
        match self {
            Values::Float64(v) => Some(v.clone()),
            Values::Float32(v) => Some(v.iter().map(|&x| f64::from(x)).collect()),
            Values::Int32(v) => Some(v.iter().map(|&x| f64::from(x)).collect()),
            Values::Int64(v) => Some(v.iter().map(|&x| x as f64).collect()),
            Values::String(_) => None,
        }
    }
}

/// How a decoded array is identified before name resolution
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ColumnKey {
    /// Hex column id from a column header
    Id(String),
    /// No header seen yet: ordinal within the file
    Position(usize),
}

/// One decoded data block
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedArray {
    pub key: ColumnKey,
    pub values: Values,
}

impl DecodedArray {
    pub fn dtype(&self) -> DType {
        self.values.dtype()
    }
}

/// Immutable type id table
#[derive(Debug, Clone)]
pub struct Registry {
    handlers: BTreeMap<u8, TypeHandler>,
}

impl Registry {
    /// The five known NGB type ids
    pub fn standard() -> Self {
        Self {
            handlers: standard_handlers()
                .into_iter()
                .map(|h| (h.id, h))
                .collect(),
        }
    }

    /// Builder pre-populated with the standard ids
    pub fn builder() -> RegistryBuilder {
        RegistryBuilder {
            handlers: Self::standard().handlers,
        }
    }

    pub fn get(&self, type_id: u8) -> Option<&TypeHandler> {
        self.handlers.get(&type_id)
    }

    pub fn contains(&self, type_id: u8) -> bool {
        self.handlers.contains_key(&type_id)
    }

    pub fn ids(&self) -> impl Iterator<Item = u8> + '_ {
        self.handlers.keys().copied()
    }

    /// Decode a payload for `type_id`
    pub fn decode(
        &self,
        type_id: u8,
        payload: &[u8],
        count: u32,
        ctx: &DecodeContext,
    ) -> Result<Values> {
        let handler = self.get(type_id).ok_or(Error::UnsupportedDataType {
            type_id,
            offset: ctx.offset,
        })?;
        (handler.decode)(payload, count, ctx)
    }

    /// Encode values as the payload of `type_id`
    pub fn encode(
        &self,
        type_id: u8,
        values: &Values,
        encoding: StringEncoding,
    ) -> Result<Vec<u8>> {
        let handler = self
            .get(type_id)
            .ok_or(Error::UnsupportedDataType { type_id, offset: 0 })?;
        (handler.encode)(values, encoding)
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::standard()
    }
}

/// Construction-time registry extension
#[derive(Debug, Clone, Default)]
pub struct RegistryBuilder {
    handlers: BTreeMap<u8, TypeHandler>,
}

impl RegistryBuilder {
    /// Builder with no ids at all
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a handler. An id can only be registered once.
    pub fn register(mut self, handler: TypeHandler) -> Result<Self> {
        if self.handlers.contains_key(&handler.id) {
            return Err(Error::Configuration(format!(
                "type id 0x{:02x} is already registered",
                handler.id
            )));
        }
        if handler.size == ElementSize::Fixed(0) {
            return Err(Error::Configuration(format!(
                "type id 0x{:02x} has a zero element size",
                handler.id
            )));
        }
        self.handlers.insert(handler.id, handler);
        Ok(self)
    }

    pub fn build(self) -> Registry {
        Registry {
            handlers: self.handlers,
        }
    }
}

// ============================================================================
// Standard handlers
// ============================================================================

fn standard_handlers() -> [TypeHandler; 5] {
    [
        TypeHandler {
            id: TYPE_INT32,
            name: "int32",
            size: ElementSize::Fixed(4),
            decode: decode_i32,
            encode: encode_i32,
        },
        TypeHandler {
            id: TYPE_INT64,
            name: "int64",
            size: ElementSize::Fixed(8),
            decode: decode_i64,
            encode: encode_i64,
        },
        TypeHandler {
            id: TYPE_FLOAT32,
            name: "float32",
            size: ElementSize::Fixed(4),
            decode: decode_f32,
            encode: encode_f32,
        },
        TypeHandler {
            id: TYPE_FLOAT64,
            name: "float64",
            size: ElementSize::Fixed(8),
            decode: decode_f64,
            encode: encode_f64,
        },
        TypeHandler {
            id: TYPE_STRING,
            name: "string",
            size: ElementSize::Prefixed,
            decode: decode_strings,
            encode: encode_strings,
        },
    ]
}

/// Payload must be exactly `count * size` bytes
fn check_fixed(payload: &[u8], count: u32, size: usize, ctx: &DecodeContext) -> Result<usize> {
    let count = count as usize;
    if count.checked_mul(size) != Some(payload.len()) {
        return Err(Error::corrupted_at(
            ctx.offset,
            format!(
                "payload is {} bytes, expected {} elements of {} bytes",
                payload.len(),
                count,
                size
            ),
        ));
    }
    Ok(count)
}

fn decode_i32(payload: &[u8], count: u32, ctx: &DecodeContext) -> Result<Values> {
    let mut out = vec![0i32; check_fixed(payload, count, 4, ctx)?];
    LittleEndian::read_i32_into(payload, &mut out);
    Ok(Values::Int32(out))
}

fn decode_i64(payload: &[u8], count: u32, ctx: &DecodeContext) -> Result<Values> {
    let mut out = vec![0i64; check_fixed(payload, count, 8, ctx)?];
    LittleEndian::read_i64_into(payload, &mut out);
    Ok(Values::Int64(out))
}

fn decode_f32(payload: &[u8], count: u32, ctx: &DecodeContext) -> Result<Values> {
    let mut out = vec![0f32; check_fixed(payload, count, 4, ctx)?];
    LittleEndian::read_f32_into(payload, &mut out);
    Ok(Values::Float32(out))
}

fn decode_f64(payload: &[u8], count: u32, ctx: &DecodeContext) -> Result<Values> {
    let mut out = vec![0f64; check_fixed(payload, count, 8, ctx)?];
    LittleEndian::read_f64_into(payload, &mut out);
    Ok(Values::Float64(out))
}

fn decode_strings(payload: &[u8], count: u32, ctx: &DecodeContext) -> Result<Values> {
    let mut out = Vec::with_capacity((count as usize).min(payload.len()));
    let mut pos = 0;
    for _ in 0..count {
        let (s, next) = string::read(payload, pos, ctx.encoding, ctx.offset)?;
        out.push(s);
        pos = next;
    }
    if pos != payload.len() {
        return Err(Error::corrupted_at(
            ctx.offset + pos,
            format!("{} trailing bytes after {} strings", payload.len() - pos, count),
        ));
    }
    Ok(Values::String(out))
}

fn mismatch(expected: DType, values: &Values) -> Error {
    Error::Configuration(format!(
        "cannot encode {:?} values as {:?}",
        values.dtype(),
        expected
    ))
}

fn encode_i32(values: &Values, _: StringEncoding) -> Result<Vec<u8>> {
    let Values::Int32(v) = values else {
        return Err(mismatch(DType::Int32, values));
    };
    let mut out = vec![0u8; v.len() * 4];
    LittleEndian::write_i32_into(v, &mut out);
    Ok(out)
}

fn encode_i64(values: &Values, _: StringEncoding) -> Result<Vec<u8>> {
    let Values::Int64(v) = values else {
        return Err(mismatch(DType::Int64, values));
    };
    let mut out = vec![0u8; v.len() * 8];
    LittleEndian::write_i64_into(v, &mut out);
    Ok(out)
}

fn encode_f32(values: &Values, _: StringEncoding) -> Result<Vec<u8>> {
    let Values::Float32(v) = values else {
        return Err(mismatch(DType::Float32, values));
    };
    let mut out = vec![0u8; v.len() * 4];
    LittleEndian::write_f32_into(v, &mut out);
    Ok(out)
}

fn encode_f64(values: &Values, _: StringEncoding) -> Result<Vec<u8>> {
    let Values::Float64(v) = values else {
        return Err(mismatch(DType::Float64, values));
    };
    let mut out = vec![0u8; v.len() * 8];
    LittleEndian::write_f64_into(v, &mut out);
    Ok(out)
}

fn encode_strings(values: &Values, encoding: StringEncoding) -> Result<Vec<u8>> {
    let Values::String(v) = values else {
        return Err(mismatch(DType::String, values));
    };
    let mut out = Vec::new();
    for s in v {
        out.extend(string::encode(s, encoding)?);
    }
    Ok(out)
}
