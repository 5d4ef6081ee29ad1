//! Parser configuration
//!
//! A [`ParserConfig`] is a plain snapshot: column map, metadata patterns,
//! column header signatures, stream roles and resource limits. It can be
//! written by hand, loaded from YAML or JSON, and adjusted from the
//! environment. Once handed to a [`crate::Parser`] it is never mutated.
//!
//! The default patterns cover the typed fields `instrument`, `sample_name`,
//! `sample_mass` and `operator` only. Sections, temperature program stages,
//! timestamps and crucible records have to be configured. A `metadata` list
//! replaces the defaults, so repeat any default field that is still wanted.
//! The ids and signatures below are placeholders; real ones depend on the
//! instrument software.
//!
//! ```
//! use ngb::{Lookback, ParserConfig, Placement, ValueKind};
//!
//! let yaml = r#"
//! metadata:
//!   - field: date_performed
//!     category: "72 17"
//!     prefix: "28 08"
//!     value_start: "80 01"
//!     suffix: "01 00 00 00 02 00 01 00 00"
//!     kind: timestamp
//!   - field: heating_rate
//!     prefix: "3f 08"
//!     value_start: "80 01"
//!     suffix: "01 00 00 00 02 00 01 00 00"
//!     kind: float
//!     placement: { kind: stages, name: temperature_program }
//!   - field: p0
//!     prefix: "4c 04"
//!     value_start: "80 01"
//!     suffix: "01 00 00 00 02 00 01 00 00"
//!     kind: float
//!     placement: { kind: section, name: calibration_constants }
//!   ## Crucible records: the signature ahead of the mass tells sample from reference
//!   - field: crucible_mass
//!     prefix: "7e 08"
//!     value_start: "80 01"
//!     suffix: "01 00 00 00 02 00 01 00 00"
//!     kind: float
//!     preceded_by: { signature: "e1 01", window: 64 }
//!   - field: reference_crucible_mass
//!     prefix: "7e 08"
//!     value_start: "80 01"
//!     suffix: "01 00 00 00 02 00 01 00 00"
//!     kind: float
//!     preceded_by: { signature: "e2 01", window: 64 }
//!   ## The field stored just before the reference crucible
//!   - field: reference_mass
//!     prefix: "7e 08"
//!     value_start: "80 01"
//!     suffix: "01 00 00 00 02 00 01 00 00"
//!     kind: float
//!     preceded_by: { signature: "e2 01", window: 64 }
//!     lookback: { window: 256 }
//!   - field: crucible_mass
//!     prefix: "7e 08"
//!     value_start: "80 01"
//!     suffix: "01 00 00 00 02 00 01 00 00"
//!     kind: float
//!     fallback: true
//!   - field: reference_crucible_mass
//!     prefix: "7e 08"
//!     value_start: "80 01"
//!     suffix: "01 00 00 00 02 00 01 00 00"
//!     kind: float
//!     zero_only: true
//!     fallback: true
//! "#;
//!
//! let config = ParserConfig::from_yaml_str(yaml).unwrap();
//! config.validate().unwrap();
//!
//! assert_eq!(config.metadata[0].kind, ValueKind::Timestamp);
//! assert_eq!(
//!     config.metadata[1].placement,
//!     Placement::Stages("temperature_program".into())
//! );
//! assert_eq!(config.metadata[5].lookback, Some(Lookback::default()));
//! assert!(config.metadata[7].zero_only && config.metadata[7].fallback);
//! ```

use std::fmt;
use std::ops::Deref;
use std::path::Path;

use serde::de::{self, Deserializer};
use serde::ser::Serializer;
use serde::{Deserialize, Serialize};

use crate::block::UnknownTypePolicy;
use crate::columns::ColumnMap;
use crate::pattern::{ColumnSignature, MetadataPattern, ValueKind};
use crate::string::StringEncoding;
use crate::{Error, Result, END_FIELD, TYPE_SEPARATOR};

/// Metadata stream
pub const STREAM_METADATA: &str = "Streams/stream_1.table";

/// Primary measurement stream
pub const STREAM_DATA: &str = "Streams/stream_2.table";

/// Secondary measurement stream
pub const STREAM_EXTRA_DATA: &str = "Streams/stream_3.table";

const MIB: u64 = 1024 * 1024;

/// Byte string written as hex in config files
#[derive(Clone, Default, PartialEq, Eq, Hash)]
pub struct HexBytes(pub Vec<u8>);

impl HexBytes {
    /// Parse hex, ignoring whitespace (`"ff fe ff"` is accepted)
    pub fn from_hex(s: &str) -> Result<Self> {
        let compact: String = s.chars().filter(|c| !c.is_whitespace()).collect();
        hex::decode(&compact)
            .map(Self)
            .map_err(|e| Error::Configuration(format!("invalid hex {:?}: {}", s, e)))
    }
}

impl fmt::Debug for HexBytes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "HexBytes({})", hex::encode(&self.0))
    }
}

impl Deref for HexBytes {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.0
    }
}

impl AsRef<[u8]> for HexBytes {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl From<&[u8]> for HexBytes {
    fn from(bytes: &[u8]) -> Self {
        Self(bytes.to_vec())
    }
}

impl<const N: usize> From<[u8; N]> for HexBytes {
    fn from(bytes: [u8; N]) -> Self {
        Self(bytes.to_vec())
    }
}

impl From<Vec<u8>> for HexBytes {
    fn from(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }
}

impl Serialize for HexBytes {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(&self.0))
    }
}

impl<'de> Deserialize<'de> for HexBytes {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        HexBytes::from_hex(&s).map_err(de::Error::custom)
    }
}

/// Resource guards for one file decode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Limits {
    /// Sum of all stream buffer sizes
    pub max_file_bytes: u64,
    /// Element count accepted in a single block header
    pub max_elements_per_block: u32,
    /// Table segments accepted in a single stream
    pub max_tables_per_stream: usize,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_file_bytes: 1000 * MIB,
            max_elements_per_block: 50_000_000,
            max_tables_per_stream: 100_000,
        }
    }
}

/// Role of one named stream
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamSpec {
    pub name: String,
    /// Absence fails the parse with `StreamNotFound`
    #[serde(default)]
    pub required: bool,
    /// Decode data blocks into columns
    #[serde(default)]
    pub blocks: bool,
    /// Run the metadata patterns
    #[serde(default)]
    pub metadata: bool,
}

impl StreamSpec {
    /// Stream scanned for metadata only
    pub fn metadata_only(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            required: false,
            blocks: false,
            metadata: true,
        }
    }

    /// Stream holding column data; metadata patterns are not run on it
    pub fn data(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            required: false,
            blocks: true,
            metadata: false,
        }
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }
}

/// Format signature that is recognised but not decodable
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionSignature {
    pub label: String,
    /// Leading bytes of a stream
    pub bytes: HexBytes,
}

/// Complete parser configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ParserConfig {
    pub columns: ColumnMap,
    pub metadata: Vec<MetadataPattern>,
    pub column_signatures: Vec<ColumnSignature>,
    pub streams: Vec<StreamSpec>,
    pub required_fields: Vec<String>,
    pub string_encoding: StringEncoding,
    pub unknown_types: UnknownTypePolicy,
    pub unsupported_versions: Vec<VersionSignature>,
    pub limits: Limits,
}

impl Default for ParserConfig {
    fn default() -> Self {
        Self {
            columns: ColumnMap::standard(),
            metadata: default_patterns(),
            column_signatures: default_signatures(),
            streams: vec![
                StreamSpec::metadata_only(STREAM_METADATA).required(),
                StreamSpec::data(STREAM_DATA),
                StreamSpec::data(STREAM_EXTRA_DATA),
            ],
            required_fields: vec![
                "instrument".to_string(),
                "sample_name".to_string(),
                "file_hash".to_string(),
            ],
            string_encoding: StringEncoding::Standard,
            unknown_types: UnknownTypePolicy::Abort,
            unsupported_versions: Vec::new(),
            limits: Limits::default(),
        }
    }
}

/// Typed field layout: `category .. field .. TYPE_PREFIX type 80 01 value END_FIELD`
fn typed_field(name: &str, category: [u8; 2], field: [u8; 2], kind: ValueKind) -> MetadataPattern {
    MetadataPattern::new(name, field, END_FIELD, kind)
        .category(category)
        .value_start(TYPE_SEPARATOR)
}

fn default_patterns() -> Vec<MetadataPattern> {
    vec![
        typed_field("instrument", [0x75, 0x17], [0x59, 0x10], ValueKind::String),
        typed_field("sample_name", [0x30, 0x75], [0x40, 0x08], ValueKind::String),
        typed_field("sample_mass", [0x30, 0x75], [0x9e, 0x0c], ValueKind::Float),
        typed_field("operator", [0x72, 0x17], [0x35, 0x08], ValueKind::String),
    ]
}

fn default_signatures() -> Vec<ColumnSignature> {
    vec![
        // stream_3: id byte, marker at 22
        ColumnSignature::new("extended_header", [0x80, 0x22, 0x2b], 22, 0, 1),
        // stream_2: id byte, then 0x17
        ColumnSignature::new("data_header", [0x17u8], 1, 0, 1),
    ]
}

impl ParserConfig {
    pub fn from_yaml_str(s: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(s)?)
    }

    pub fn from_json_str(s: &str) -> Result<Self> {
        Ok(serde_json::from_str(s)?)
    }

    /// Load from a file, picking JSON for `.json` and YAML otherwise
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;
        match path.extension().and_then(|e| e.to_str()) {
            Some("json") => Self::from_json_str(&text),
            _ => Self::from_yaml_str(&text),
        }
    }

    pub fn to_yaml(&self) -> Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }

    /// Apply `NGB_MAX_FILE_SIZE_MB`, `NGB_MAX_TABLES_PER_STREAM` and
    /// `NGB_MAX_ELEMENTS_PER_BLOCK` from the process environment
    pub fn with_env_overrides(self) -> Result<Self> {
        self.with_overrides(|key| std::env::var(key).ok())
    }

    fn with_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        fn parse<T: std::str::FromStr>(key: &str, raw: &str) -> Result<T> {
            raw.trim()
                .parse()
                .map_err(|_| Error::Configuration(format!("{}={:?} is not a number", key, raw)))
        }

        if let Some(raw) = lookup("NGB_MAX_FILE_SIZE_MB") {
            let mb: u64 = parse("NGB_MAX_FILE_SIZE_MB", &raw)?;
            self.limits.max_file_bytes = mb.saturating_mul(MIB);
        }
        if let Some(raw) = lookup("NGB_MAX_TABLES_PER_STREAM") {
            self.limits.max_tables_per_stream = parse("NGB_MAX_TABLES_PER_STREAM", &raw)?;
        }
        if let Some(raw) = lookup("NGB_MAX_ELEMENTS_PER_BLOCK") {
            self.limits.max_elements_per_block = parse("NGB_MAX_ELEMENTS_PER_BLOCK", &raw)?;
        }
        Ok(self)
    }

    /// Check everything that cannot be checked by the type system
    pub fn validate(&self) -> Result<()> {
        let limits = &self.limits;
        if limits.max_file_bytes == 0
            || limits.max_elements_per_block == 0
            || limits.max_tables_per_stream == 0
        {
            return Err(Error::Configuration("limits must be positive".into()));
        }

        if self.streams.is_empty() {
            return Err(Error::Configuration("no streams configured".into()));
        }
        for (i, stream) in self.streams.iter().enumerate() {
            if self.streams[..i].iter().any(|s| s.name == stream.name) {
                return Err(Error::Configuration(format!(
                    "stream {} is listed twice",
                    stream.name
                )));
            }
        }

        for pattern in &self.metadata {
            pattern.validate()?;
        }
        for signature in &self.column_signatures {
            signature.validate()?;
        }
        for version in &self.unsupported_versions {
            if version.bytes.is_empty() {
                return Err(Error::Configuration(format!(
                    "version signature {} is empty",
                    version.label
                )));
            }
        }
        if self.required_fields.iter().any(String::is_empty) {
            return Err(Error::Configuration("empty required field name".into()));
        }

        Ok(())
    }
}
