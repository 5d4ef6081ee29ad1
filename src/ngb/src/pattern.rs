//! Metadata pattern matching
//!
//! Metadata fields have no framing of their own. Each one is found by a
//! configured byte bracket:
//!
//! ```text
//! [category ..] prefix [.. value_start] VALUE suffix
//! ```
//!
//! The suffix must appear within `window` bytes of the prefix, otherwise the
//! field is treated as absent. Absence is never an error here; required
//! fields are checked once per file by the assembler.
//!
//! A pattern with a [`Lookback`] keeps the bracket only as an anchor and
//! reports the value of the nearest complete typed field before it. Crucible
//! records use this: the reference and sample masses are the fields stored
//! just ahead of the matching crucible mass.
//!
//! Fallback patterns run separately and only fill fields that no other
//! pattern resolved anywhere in the file.
//!
//! Column headers are recognised separately by anchored signatures that carry
//! the hex column id at a fixed offset from the table start.

use memchr::memmem;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::columns::{ColumnInfo, ColumnMap};
use crate::config::HexBytes;
use crate::metadata::{FileMetadata, MetadataValue};
use crate::string::{self, StringEncoding, LENGTH_PREFIX_SIZE};
use crate::{
    Error, Result, END_FIELD, FFFEFF, TYPE_FLOAT32, TYPE_FLOAT64, TYPE_INT32, TYPE_INT64,
    TYPE_PREFIX, TYPE_SEPARATOR,
};

/// Below this magnitude a value counts as zero
const ZERO_TOLERANCE: f64 = 1e-12;

/// How the bytes between the brackets are decoded
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueKind {
    String,
    /// 8-byte f64 or 4-byte f32, little-endian
    Float,
    /// 2, 4 or 8-byte signed integer, little-endian
    Integer,
    /// Integer unix seconds, stored as RFC 3339 UTC
    Timestamp,
}

/// Where a matched value lands in [`FileMetadata`]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "name", rename_all = "snake_case")]
pub enum Placement {
    /// `field`
    #[default]
    Top,
    /// `name.field`
    Section(String),
    /// `name.stage_<i>.field`, one entry per occurrence
    Stages(String),
}

/// Signature that must precede the prefix
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Context {
    pub signature: HexBytes,
    /// Bytes before the prefix searched for the signature
    #[serde(default = "default_context_window")]
    pub window: usize,
}

fn default_context_window() -> usize {
    64
}

fn default_window() -> usize {
    4096
}

/// Reads the typed field `type_prefix <type id> .. separator VALUE end`
/// that ends closest before a match
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lookback {
    #[serde(default = "typed_prefix")]
    pub type_prefix: HexBytes,
    #[serde(default = "typed_separator")]
    pub separator: HexBytes,
    #[serde(default = "typed_end")]
    pub end: HexBytes,
    /// Bytes before the prefix searched
    #[serde(default = "default_lookback_window")]
    pub window: usize,
}

fn typed_prefix() -> HexBytes {
    TYPE_PREFIX.into()
}

fn typed_separator() -> HexBytes {
    TYPE_SEPARATOR.into()
}

fn typed_end() -> HexBytes {
    END_FIELD.into()
}

fn default_lookback_window() -> usize {
    256
}

impl Lookback {
    /// Standard typed-field markers
    pub fn typed(window: usize) -> Self {
        Self {
            type_prefix: typed_prefix(),
            separator: typed_separator(),
            end: typed_end(),
            window,
        }
    }
}

impl Default for Lookback {
    fn default() -> Self {
        Self::typed(default_lookback_window())
    }
}

/// Rule for one metadata field
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetadataPattern {
    pub field: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<HexBytes>,
    pub prefix: HexBytes,
    pub suffix: HexBytes,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value_start: Option<HexBytes>,
    pub kind: ValueKind,
    #[serde(default)]
    pub placement: Placement,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preceded_by: Option<Context>,
    /// Max distance from the end of the prefix to the end of the suffix
    #[serde(default = "default_window")]
    pub window: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lookback: Option<Lookback>,
    /// Only matches whose own value is zero
    #[serde(default)]
    pub zero_only: bool,
    /// Fill the field only when nothing else set it in the file
    #[serde(default)]
    pub fallback: bool,
}

impl MetadataPattern {
    pub fn new(
        field: impl Into<String>,
        prefix: impl Into<HexBytes>,
        suffix: impl Into<HexBytes>,
        kind: ValueKind,
    ) -> Self {
        Self {
            field: field.into(),
            category: None,
            prefix: prefix.into(),
            suffix: suffix.into(),
            value_start: None,
            kind,
            placement: Placement::Top,
            preceded_by: None,
            window: default_window(),
            lookback: None,
            zero_only: false,
            fallback: false,
        }
    }

    pub fn category(mut self, bytes: impl Into<HexBytes>) -> Self {
        self.category = Some(bytes.into());
        self
    }

    pub fn value_start(mut self, bytes: impl Into<HexBytes>) -> Self {
        self.value_start = Some(bytes.into());
        self
    }

    pub fn placement(mut self, placement: Placement) -> Self {
        self.placement = placement;
        self
    }

    pub fn preceded_by(mut self, signature: impl Into<HexBytes>, window: usize) -> Self {
        self.preceded_by = Some(Context {
            signature: signature.into(),
            window,
        });
        self
    }

    pub fn window(mut self, window: usize) -> Self {
        self.window = window;
        self
    }

    pub fn lookback(mut self, lookback: Lookback) -> Self {
        self.lookback = Some(lookback);
        self
    }

    pub fn zero_only(mut self) -> Self {
        self.zero_only = true;
        self
    }

    pub fn fallback(mut self) -> Self {
        self.fallback = true;
        self
    }

    /// Whether matches that yield nothing let later occurrences be tried
    fn filtered(&self) -> bool {
        self.preceded_by.is_some() || self.zero_only || self.lookback.is_some()
    }

    pub fn validate(&self) -> Result<()> {
        let fail = |what: &str| {
            Err(Error::Configuration(format!(
                "metadata pattern {:?}: {}",
                self.field, what
            )))
        };

        if self.field.is_empty() {
            return fail("empty field name");
        }
        if self.prefix.is_empty() || self.suffix.is_empty() {
            return fail("prefix and suffix must be non-empty");
        }
        if self.window == 0 {
            return fail("window must be positive");
        }
        if self.category.as_ref().is_some_and(|c| c.is_empty())
            || self.value_start.as_ref().is_some_and(|v| v.is_empty())
        {
            return fail("empty category or value_start");
        }
        if let Some(context) = &self.preceded_by {
            if context.signature.is_empty() || context.window == 0 {
                return fail("preceded_by needs a signature and a window");
            }
        }
        let numeric = matches!(self.kind, ValueKind::Float | ValueKind::Integer);
        if let Some(lookback) = &self.lookback {
            if lookback.type_prefix.is_empty()
                || lookback.separator.is_empty()
                || lookback.end.is_empty()
                || lookback.window == 0
            {
                return fail("lookback needs markers and a window");
            }
            if !numeric {
                return fail("lookback reads numbers only");
            }
        }
        if self.zero_only && !numeric {
            return fail("zero_only needs a numeric kind");
        }
        match &self.placement {
            Placement::Section(name) | Placement::Stages(name) if name.is_empty() => {
                fail("empty placement name")
            }
            _ => Ok(()),
        }
    }

    /// Whether this field already has a value in `meta`
    fn resolved_in(&self, meta: &FileMetadata) -> bool {
        match &self.placement {
            Placement::Top => meta.contains(&self.field),
            Placement::Section(name) => meta
                .get_path(&[name.as_str(), self.field.as_str()])
                .is_some(),
            Placement::Stages(name) => meta.get(name).is_some_and(|v| {
                v.as_object()
                    .into_iter()
                    .flat_map(|stages| stages.values())
                    .any(|stage| stage.as_object().is_some_and(|s| s.contains_key(&self.field)))
            }),
        }
    }
}

/// Anchored column header: `marker` at `marker_offset`, id at `id_offset`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnSignature {
    pub label: String,
    pub marker: HexBytes,
    pub marker_offset: usize,
    pub id_offset: usize,
    pub id_len: usize,
}

impl ColumnSignature {
    pub fn new(
        label: impl Into<String>,
        marker: impl Into<HexBytes>,
        marker_offset: usize,
        id_offset: usize,
        id_len: usize,
    ) -> Self {
        Self {
            label: label.into(),
            marker: marker.into(),
            marker_offset,
            id_offset,
            id_len,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.marker.is_empty() || self.id_len == 0 {
            return Err(Error::Configuration(format!(
                "column signature {:?} needs a marker and a non-empty id",
                self.label
            )));
        }
        Ok(())
    }

    /// Hex id if the table starts with this header
    fn match_table(&self, table: &[u8]) -> Option<String> {
        let marker_end = self.marker_offset.checked_add(self.marker.len())?;
        if table.get(self.marker_offset..marker_end)? != &self.marker[..] {
            return None;
        }
        let id_end = self.id_offset.checked_add(self.id_len)?;
        table.get(self.id_offset..id_end).map(hex::encode)
    }
}

/// Column id found at the start of a table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnHeader {
    /// Lower-case hex
    pub id: String,
    /// Label of the signature that matched
    pub signature: String,
    pub info: ColumnInfo,
}

/// Runs the configured patterns over table buffers
#[derive(Debug, Clone, Copy)]
pub struct PatternMatcher<'c> {
    patterns: &'c [MetadataPattern],
    signatures: &'c [ColumnSignature],
    columns: &'c ColumnMap,
}

impl<'c> PatternMatcher<'c> {
    pub fn new(
        patterns: &'c [MetadataPattern],
        signatures: &'c [ColumnSignature],
        columns: &'c ColumnMap,
    ) -> Self {
        Self {
            patterns,
            signatures,
            columns,
        }
    }

    /// Extract every field whose brackets are found in `table`.
    ///
    /// Patterns run in order; the first one to resolve a field wins.
    /// Fallback patterns are skipped.
    pub fn extract(&self, table: &[u8]) -> FileMetadata {
        self.run(table, false)
    }

    /// Same as [`Self::extract`] for the fallback patterns only
    pub fn extract_fallbacks(&self, table: &[u8]) -> FileMetadata {
        self.run(table, true)
    }

    fn run(&self, table: &[u8], fallback: bool) -> FileMetadata {
        let mut meta = FileMetadata::new();

        for pattern in self.patterns.iter().filter(|p| p.fallback == fallback) {
            if pattern.resolved_in(&meta) {
                continue;
            }

            let mut stage = 0;
            for value in values(pattern, table) {
                match &pattern.placement {
                    Placement::Top => meta.insert(pattern.field.clone(), value),
                    Placement::Section(name) => {
                        meta.insert_path(&[name.as_str(), pattern.field.as_str()], value)
                    }
                    Placement::Stages(name) => {
                        let key = format!("stage_{}", stage);
                        let path = [name.as_str(), key.as_str(), pattern.field.as_str()];
                        meta.insert_path(&path, value);
                        stage += 1;
                    }
                }
            }
        }

        meta
    }

    /// Column id of `table`, if it starts with a known header signature.
    ///
    /// Ids missing from the column map keep their hex id as the name.
    pub fn column_header(&self, table: &[u8]) -> Option<ColumnHeader> {
        self.signatures.iter().find_map(|signature| {
            let id = signature.match_table(table)?;
            let info = self.columns.resolve(&id);
            if self.columns.get(&id).is_none() {
                debug!("Column id {} has no mapping, keeping raw id", id);
            }
            Some(ColumnHeader {
                id,
                signature: signature.label.clone(),
                info,
            })
        })
    }
}

/// Decoded values for `pattern` in `table`.
///
/// One value at most, except for `Stages` which yields every occurrence.
fn values(pattern: &MetadataPattern, table: &[u8]) -> Vec<MetadataValue> {
    let start = match &pattern.category {
        Some(category) => match memmem::find(table, category) {
            Some(pos) => pos + category.len(),
            None => {
                debug!("Category for {} not present", pattern.field);
                return Vec::new();
            }
        },
        None => 0,
    };

    let all = matches!(pattern.placement, Placement::Stages(_));
    let mut out = Vec::new();

    for hit in memmem::find_iter(&table[start..], &pattern.prefix[..]) {
        let prefix_pos = start + hit;
        if let Some(context) = &pattern.preceded_by {
            let from = prefix_pos.saturating_sub(context.window);
            if memmem::find(&table[from..prefix_pos], &context.signature).is_none() {
                continue;
            }
        }

        if let Some(value) = occurrence(pattern, table, prefix_pos) {
            out.push(value);
        }

        // Unfiltered patterns only consider the first occurrence
        if !all && (!pattern.filtered() || !out.is_empty()) {
            break;
        }
    }

    out
}

/// Value reported for the match at `prefix_pos`
fn occurrence(pattern: &MetadataPattern, table: &[u8], prefix_pos: usize) -> Option<MetadataValue> {
    let Some(span) = bracketed(pattern, table, prefix_pos + pattern.prefix.len()) else {
        debug!(
            "No suffix for {} within {} bytes of offset {:#x}",
            pattern.field, pattern.window, prefix_pos
        );
        return None;
    };

    let Some(value) = decode_value(pattern.kind, span) else {
        debug!(
            "Undecodable {:?} value for {} ({} bytes)",
            pattern.kind,
            pattern.field,
            span.len()
        );
        return None;
    };

    if pattern.zero_only && !value.as_f64().is_some_and(|v| v.abs() < ZERO_TOLERANCE) {
        return None;
    }

    let Some(lookback) = &pattern.lookback else {
        return Some(value);
    };
    let found = typed_before(table, prefix_pos, lookback, pattern.kind);
    if found.is_none() {
        debug!(
            "No typed field for {} within {} bytes before offset {:#x}",
            pattern.field, lookback.window, prefix_pos
        );
    }
    found
}

/// Last complete typed field ending before `pos` whose value fits `kind`.
///
/// Fields are walked from the nearest end marker backwards; one that does
/// not parse is skipped.
fn typed_before(
    table: &[u8],
    pos: usize,
    lookback: &Lookback,
    kind: ValueKind,
) -> Option<MetadataValue> {
    let region = &table[pos.saturating_sub(lookback.window)..pos];
    let mut limit = region.len();

    while let Some(end) = memmem::rfind(&region[..limit], &lookback.end) {
        limit = end;
        let field = &region[..end];

        let Some(type_pos) = memmem::rfind(field, &lookback.type_prefix) else {
            continue;
        };
        let id_pos = type_pos + lookback.type_prefix.len();
        let Some(&type_id) = field.get(id_pos) else {
            continue;
        };
        let Some(sep) = memmem::find(&field[id_pos + 1..], &lookback.separator) else {
            continue;
        };

        let raw = &field[id_pos + 1 + sep + lookback.separator.len()..];
        if let Some(value) = typed_number(type_id, raw, kind) {
            return Some(value);
        }
    }

    None
}

/// Numeric typed value converted to `kind`; floats never become integers
fn typed_number(type_id: u8, raw: &[u8], kind: ValueKind) -> Option<MetadataValue> {
    let value = match type_id {
        TYPE_INT32 => MetadataValue::Integer(i64::from(i32::from_le_bytes(raw.try_into().ok()?))),
        TYPE_INT64 => MetadataValue::Integer(i64::from_le_bytes(raw.try_into().ok()?)),
        TYPE_FLOAT32 => MetadataValue::Float(f64::from(f32::from_le_bytes(raw.try_into().ok()?))),
        TYPE_FLOAT64 => MetadataValue::Float(f64::from_le_bytes(raw.try_into().ok()?)),
        _ => return None,
    };

    match (kind, value) {
        (ValueKind::Float, value) => value.as_f64().map(MetadataValue::Float),
        (ValueKind::Integer, MetadataValue::Integer(i)) => Some(MetadataValue::Integer(i)),
        _ => None,
    }
}

/// Value bytes after the prefix, if the suffix closes them within the window
fn bracketed<'a>(pattern: &MetadataPattern, table: &'a [u8], from: usize) -> Option<&'a [u8]> {
    let limit = from.saturating_add(pattern.window).min(table.len());
    let region = table.get(from..limit)?;
    let end = memmem::find(region, &pattern.suffix)?;
    let span = &region[..end];

    match &pattern.value_start {
        Some(marker) => {
            let pos = memmem::find(span, marker)?;
            Some(&span[pos + marker.len()..])
        }
        None => Some(span),
    }
}

/// Decode raw value bytes; `None` when the bytes do not fit the kind
pub fn decode_value(kind: ValueKind, bytes: &[u8]) -> Option<MetadataValue> {
    match kind {
        ValueKind::Float => match bytes.len() {
            8 => Some(MetadataValue::Float(f64::from_le_bytes(bytes.try_into().ok()?))),
            4 => Some(MetadataValue::Float(f64::from(f32::from_le_bytes(
                bytes.try_into().ok()?,
            )))),
            _ => None,
        },
        ValueKind::Integer => integer(bytes).map(MetadataValue::Integer),
        ValueKind::Timestamp => {
            let secs = integer(bytes)?;
            let time = chrono::DateTime::<chrono::Utc>::from_timestamp(secs, 0)?;
            Some(MetadataValue::String(time.to_rfc3339()))
        }
        ValueKind::String => text(bytes).map(MetadataValue::String),
    }
}

fn integer(bytes: &[u8]) -> Option<i64> {
    match bytes.len() {
        2 => Some(i64::from(i16::from_le_bytes(bytes.try_into().ok()?))),
        4 => Some(i64::from(i32::from_le_bytes(bytes.try_into().ok()?))),
        8 => Some(i64::from_le_bytes(bytes.try_into().ok()?)),
        _ => None,
    }
}

/// FFFEFF-bracketed, then length-prefixed, then raw UTF-8 without NULs
fn text(bytes: &[u8]) -> Option<String> {
    if bytes.starts_with(&FFFEFF) {
        return string::decode(bytes, StringEncoding::Fffeff).ok();
    }

    if let Some(s) = length_prefixed(bytes) {
        return Some(s);
    }

    let stripped: Vec<u8> = bytes.iter().copied().filter(|&b| b != 0).collect();
    String::from_utf8(stripped).ok()
}

fn length_prefixed(bytes: &[u8]) -> Option<String> {
    let prefix: [u8; LENGTH_PREFIX_SIZE] = bytes.get(..LENGTH_PREFIX_SIZE)?.try_into().ok()?;
    let end = LENGTH_PREFIX_SIZE.checked_add(u32::from_le_bytes(prefix) as usize)?;
    let padding = bytes.get(end..)?;
    if padding.iter().any(|&b| b != 0) {
        return None;
    }
    string::decode(bytes, StringEncoding::Standard).ok()
}
