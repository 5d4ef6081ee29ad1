//! Table assembly
//!
//! Collects the decoded arrays and partial metadata of every table segment of
//! one file, then resolves column names and checks the result is a proper
//! table: unique names, one row count.

use std::collections::HashMap;

use serde::Serialize;
use tracing::debug;

use crate::columns::ColumnMap;
use crate::metadata::FileMetadata;
use crate::registry::{ColumnKey, DType, DecodedArray, Values};
use crate::{Error, Result};

/// Everything decoded from one table segment
#[derive(Debug, Clone, Default)]
pub struct SegmentOutput {
    /// Index of the stream the segment came from
    pub stream: usize,
    pub arrays: Vec<DecodedArray>,
    pub metadata: FileMetadata,
    /// Values of fallback patterns
    pub fallback: FileMetadata,
}

/// One named output column
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Column {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
    /// Hex id from the column header
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_id: Option<String>,
    pub values: Values,
}

impl Column {
    pub fn dtype(&self) -> DType {
        self.values.dtype()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// Decoded file: ordered equal-length columns plus metadata
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ParsedTable {
    pub columns: Vec<Column>,
    pub metadata: FileMetadata,
}

impl ParsedTable {
    pub fn num_rows(&self) -> usize {
        self.columns.first().map_or(0, Column::len)
    }

    pub fn num_columns(&self) -> usize {
        self.columns.len()
    }

    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn column_names(&self) -> Vec<&str> {
        self.columns.iter().map(|c| c.name.as_str()).collect()
    }

    /// Metadata serialized as a JSON object
    pub fn metadata_json(&self) -> Result<String> {
        Ok(self.metadata.to_json()?)
    }
}

struct Pending {
    key: ColumnKey,
    stream: usize,
    values: Values,
}

/// Accumulates segment outputs for one file
pub struct TableAssembler<'c> {
    columns: &'c ColumnMap,
    pending: Vec<Pending>,
    index: HashMap<ColumnKey, usize>,
    metadata: FileMetadata,
    fallback: FileMetadata,
}

impl<'c> TableAssembler<'c> {
    pub fn new(columns: &'c ColumnMap) -> Self {
        Self {
            columns,
            pending: Vec::new(),
            index: HashMap::new(),
            metadata: FileMetadata::new(),
            fallback: FileMetadata::new(),
        }
    }

    /// Add one segment.
    ///
    /// Arrays with a key already seen are appended to it. The key must come
    /// from the same stream and keep its dtype, otherwise the file is corrupt.
    pub fn add_segment(&mut self, segment: SegmentOutput) -> Result<()> {
        self.metadata.merge(segment.metadata);
        // Earliest table wins for fallbacks
        self.fallback.fill(segment.fallback);

        for array in segment.arrays {
            let Some(&i) = self.index.get(&array.key) else {
                self.index.insert(array.key.clone(), self.pending.len());
                self.pending.push(Pending {
                    key: array.key,
                    stream: segment.stream,
                    values: array.values,
                });
                continue;
            };

            let existing = &mut self.pending[i];
            if existing.stream != segment.stream {
                return Err(Error::corrupted(format!(
                    "column {} appears in streams {} and {}",
                    describe(&existing.key),
                    existing.stream,
                    segment.stream
                )));
            }
            let expected = existing.values.dtype();
            if let Err(values) = existing.values.append(array.values) {
                return Err(Error::corrupted(format!(
                    "column {} changes type from {:?} to {:?}",
                    describe(&existing.key),
                    expected,
                    values.dtype()
                )));
            }
        }

        Ok(())
    }

    /// Merge metadata not tied to a segment (e.g. the content hash)
    pub fn add_metadata(&mut self, metadata: FileMetadata) {
        self.metadata.merge(metadata);
    }

    /// Resolve names and check the table shape.
    ///
    /// Fallback values fill the fields still absent. Fails with
    /// `MetadataExtraction` if any `required` field is absent after that.
    pub fn finish(self, required: &[String]) -> Result<ParsedTable> {
        let mut metadata = self.metadata;
        metadata.fill(self.fallback);

        let mut columns: Vec<Column> = Vec::with_capacity(self.pending.len());

        for pending in self.pending {
            let column = match pending.key {
                ColumnKey::Id(id) => {
                    let info = self.columns.resolve(&id);
                    Column {
                        name: info.name,
                        unit: info.unit,
                        source_id: Some(id),
                        values: pending.values,
                    }
                }
                ColumnKey::Position(n) => Column {
                    name: format!("column_{}", n),
                    unit: None,
                    source_id: None,
                    values: pending.values,
                },
            };

            if columns.iter().any(|c| c.name == column.name) {
                return Err(Error::corrupted(format!(
                    "column name {} resolves from more than one id",
                    column.name
                )));
            }
            columns.push(column);
        }

        if let Some(first) = columns.first() {
            if let Some(other) = columns.iter().find(|c| c.len() != first.len()) {
                return Err(Error::corrupted(format!(
                    "row count mismatch: {} has {} rows, {} has {}",
                    first.name,
                    first.len(),
                    other.name,
                    other.len()
                )));
            }
        }

        let missing = metadata.missing(required);
        if !missing.is_empty() {
            return Err(Error::MetadataExtraction { missing });
        }

        debug!(
            "Assembled {} columns x {} rows, {} metadata fields",
            columns.len(),
            columns.first().map_or(0, Column::len),
            metadata.len()
        );

        Ok(ParsedTable { columns, metadata })
    }
}

fn describe(key: &ColumnKey) -> String {
    match key {
        ColumnKey::Id(id) => id.clone(),
        ColumnKey::Position(n) => format!("#{}", n),
    }
}
