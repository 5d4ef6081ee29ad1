//! Decoder for NGB thermal-analysis data files
//!
//! An NGB file is a package of named binary streams (`Streams/stream_1.table`,
//! `Streams/stream_2.table`, ...). Opening the package is left to the caller;
//! this crate decodes the stream buffers into columns plus a metadata map.
//!
//! # Format Overview
//!
//! ## Streams
//!
//! Each stream is a sequence of tables separated by `FF FE FF 04`. Empty
//! tables (back-to-back separators) carry nothing and are dropped.
//!
//! ## Data blocks
//!
//! Inside a table, every data block starts with `00 00 08 80 07`:
//! - Byte 0: Type id (`0x08` i32, `0x09` i64, `0x0A` f32, `0x0B` f64, `0x1F` string)
//! - Bytes 1-4: Element count (little-endian u32)
//! - Bytes 5+: `count * element_size` bytes of payload
//!
//! Scanning stops at `FF FE FF 00 00` (end of table).
//!
//! ## Metadata
//!
//! Metadata fields are not framed. They are located by configured byte
//! brackets (prefix ... suffix) and decoded by the kind the configuration
//! names. Column headers are recognised by anchored signatures that carry the
//! hex column id.
//!
//! Most fields use the typed layout
//! `id .. 17 FC FF FF <type id> 80 01 <value> 01 00 00 00 02 00 01 00 00`.
//!
//! # Example
//!
//! ```
//! use std::collections::HashMap;
//! use ngb::{Parser, ParserConfig};
//!
//! let parser = Parser::new(ParserConfig::default()).unwrap();
//! let streams: HashMap<String, Vec<u8>> = HashMap::new();
//!
//! // stream_1 is required by the default configuration
//! assert!(matches!(parser.parse(&streams), Err(ngb::Error::StreamNotFound(_))));
//! ```

pub mod assemble;
pub mod block;
pub mod columns;
pub mod config;
mod hash;
pub mod metadata;
mod parser;
pub mod pattern;
pub mod registry;
pub mod source;
pub mod split;
pub mod string;

// Re-export main types
pub use assemble::{Column, ParsedTable, SegmentOutput, TableAssembler};
pub use block::{BlockLocator, DataBlock, UnknownTypePolicy};
pub use columns::{ColumnInfo, ColumnMap};
pub use config::{HexBytes, Limits, ParserConfig, StreamSpec, VersionSignature};
pub use hash::{content_hash, HASH_METHOD};
pub use metadata::{FileMetadata, MetadataValue};
pub use parser::Parser;
pub use pattern::{
    ColumnHeader, ColumnSignature, Context, Lookback, MetadataPattern, PatternMatcher, Placement,
    ValueKind,
};
pub use registry::{
    ColumnKey, DType, DecodeContext, DecodedArray, ElementSize, Registry, RegistryBuilder,
    TypeHandler, Values,
};
pub use source::StreamSource;
pub use split::{split_tables, split_tables_limited};
pub use string::StringEncoding;

/// Data block start marker
pub const START_DATA: [u8; 5] = [0x00, 0x00, 0x08, 0x80, 0x07];

/// End of table marker
pub const END_TABLE: [u8; 5] = [0xff, 0xfe, 0xff, 0x00, 0x00];

/// Table boundary inside a stream
pub const TABLE_SEPARATOR: [u8; 4] = [0xff, 0xfe, 0xff, 0x04];

/// Bracket opening an FFFEFF string
pub const FFFEFF: [u8; 3] = [0xff, 0xfe, 0xff];

/// Between a typed metadata field's id and its type byte
pub const TYPE_PREFIX: [u8; 4] = [0x17, 0xfc, 0xff, 0xff];

/// Between a typed metadata field's type byte and its value
pub const TYPE_SEPARATOR: [u8; 2] = [0x80, 0x01];

/// Terminates a typed metadata field
pub const END_FIELD: [u8; 9] = [0x01, 0x00, 0x00, 0x00, 0x02, 0x00, 0x01, 0x00, 0x00];

/// Type id: little-endian i32
pub const TYPE_INT32: u8 = 0x08;

/// Type id: little-endian i64
pub const TYPE_INT64: u8 = 0x09;

/// Type id: little-endian f32 array
pub const TYPE_FLOAT32: u8 = 0x0a;

/// Type id: little-endian f64 array
pub const TYPE_FLOAT64: u8 = 0x0b;

/// Type id: length-prefixed strings
pub const TYPE_STRING: u8 = 0x1f;

/// Errors from NGB decoding
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("Corrupted file{}: {reason}", at_offset(.offset))]
    Corrupted {
        offset: Option<usize>,
        reason: String,
    },

    #[error("Unsupported format version: {0}")]
    UnsupportedVersion(String),

    #[error("Unsupported data type 0x{type_id:02x} at offset 0x{offset:x}")]
    UnsupportedDataType { type_id: u8, offset: usize },

    #[error("Stream not found: {0}")]
    StreamNotFound(String),

    #[error("Missing required metadata: {}", .missing.join(", "))]
    MetadataExtraction { missing: Vec<String> },

    #[error("Resource limit exceeded: {what} is {actual}, limit is {limit}")]
    ResourceLimit {
        what: &'static str,
        limit: u64,
        actual: u64,
    },

    #[error("Invalid configuration: {0}")]
    Configuration(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Corruption at a known byte offset
    pub fn corrupted_at(offset: usize, reason: impl Into<String>) -> Self {
        Self::Corrupted {
            offset: Some(offset),
            reason: reason.into(),
        }
    }

    /// Corruption not tied to a single offset (e.g. a row-count mismatch)
    pub fn corrupted(reason: impl Into<String>) -> Self {
        Self::Corrupted {
            offset: None,
            reason: reason.into(),
        }
    }
}

fn at_offset(offset: &Option<usize>) -> String {
    match offset {
        Some(o) => format!(" at offset 0x{:x}", o),
        None => String::new(),
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_marker_constants() {
        assert_eq!(START_DATA, [0x00, 0x00, 0x08, 0x80, 0x07]);
        assert_eq!(END_TABLE[..3], FFFEFF);
        assert_eq!(TABLE_SEPARATOR[..3], FFFEFF);
        assert_eq!(TABLE_SEPARATOR[3], 0x04);
    }

    #[test]
    fn test_type_id_constants() {
        assert_eq!(TYPE_INT32, 0x08);
        assert_eq!(TYPE_INT64, 0x09);
        assert_eq!(TYPE_FLOAT32, 0x0a);
        assert_eq!(TYPE_FLOAT64, 0x0b);
        assert_eq!(TYPE_STRING, 0x1f);
    }

    #[test]
    fn test_error_display() {
        let err = Error::corrupted_at(0x20, "payload overruns buffer");
        assert_eq!(
            err.to_string(),
            "Corrupted file at offset 0x20: payload overruns buffer"
        );

        let err = Error::corrupted("row count mismatch");
        assert_eq!(err.to_string(), "Corrupted file: row count mismatch");

        let err = Error::UnsupportedDataType {
            type_id: 0xff,
            offset: 0x10,
        };
        assert!(err.to_string().contains("0xff"));
        assert!(err.to_string().contains("0x10"));

        let err = Error::MetadataExtraction {
            missing: vec!["instrument".into(), "sample_name".into()],
        };
        assert!(err.to_string().contains("instrument, sample_name"));

        let err = Error::ResourceLimit {
            what: "tables per stream",
            limit: 10,
            actual: 11,
        };
        assert!(err.to_string().contains("tables per stream"));

        let err = Error::StreamNotFound("Streams/stream_1.table".into());
        assert!(err.to_string().contains("stream_1"));
    }
}
