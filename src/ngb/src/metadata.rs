//! File-level metadata values
//!
//! Metadata is collected per table segment and merged into one map per file.
//! On key collision the later segment wins; differing values are logged.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// One metadata value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetadataValue {
    Integer(i64),
    Float(f64),
    String(String),
    Object(BTreeMap<String, MetadataValue>),
}

impl MetadataValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            MetadataValue::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            MetadataValue::Float(f) => Some(*f),
            MetadataValue::Integer(i) => Some(*i as f64),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            MetadataValue::Integer(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_object(&self) -> Option<&BTreeMap<String, MetadataValue>> {
        match self {
            MetadataValue::Object(map) => Some(map),
            _ => None,
        }
    }
}

impl From<String> for MetadataValue {
    fn from(s: String) -> Self {
        MetadataValue::String(s)
    }
}

impl From<&str> for MetadataValue {
    fn from(s: &str) -> Self {
        MetadataValue::String(s.to_string())
    }
}

impl From<f64> for MetadataValue {
    fn from(f: f64) -> Self {
        MetadataValue::Float(f)
    }
}

impl From<i64> for MetadataValue {
    fn from(i: i64) -> Self {
        MetadataValue::Integer(i)
    }
}

/// Field name -> value
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FileMetadata {
    fields: BTreeMap<String, MetadataValue>,
}

impl FileMetadata {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, field: &str) -> Option<&MetadataValue> {
        self.fields.get(field)
    }

    pub fn get_str(&self, field: &str) -> Option<&str> {
        self.get(field).and_then(MetadataValue::as_str)
    }

    pub fn get_f64(&self, field: &str) -> Option<f64> {
        self.get(field).and_then(MetadataValue::as_f64)
    }

    /// Follow nested objects, e.g. `["temperature_program", "stage_0", "heating_rate"]`
    pub fn get_path(&self, path: &[&str]) -> Option<&MetadataValue> {
        let (first, rest) = path.split_first()?;
        let mut value = self.fields.get(*first)?;
        for key in rest {
            value = value.as_object()?.get(*key)?;
        }
        Some(value)
    }

    pub fn contains(&self, field: &str) -> bool {
        self.fields.contains_key(field)
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &MetadataValue)> {
        self.fields.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn insert(&mut self, field: impl Into<String>, value: impl Into<MetadataValue>) {
        self.fields.insert(field.into(), value.into());
    }

    /// Insert under nested objects, creating them as needed.
    ///
    /// A non-object value in the way is replaced by an object.
    pub fn insert_path(&mut self, path: &[&str], value: MetadataValue) {
        let Some((last, parents)) = path.split_last() else {
            return;
        };

        let mut map = &mut self.fields;
        for key in parents {
            let slot = map
                .entry((*key).to_string())
                .or_insert_with(|| MetadataValue::Object(BTreeMap::new()));
            if !matches!(slot, MetadataValue::Object(_)) {
                debug!("Replacing scalar metadata {:?} with an object", key);
                *slot = MetadataValue::Object(BTreeMap::new());
            }
            let MetadataValue::Object(inner) = slot else {
                return;
            };
            map = inner;
        }
        map.insert((*last).to_string(), value);
    }

    /// Merge `other` into `self`; `other` wins on collision.
    ///
    /// Objects merge key by key. A collision with a different value is
    /// logged, never an error.
    pub fn merge(&mut self, other: FileMetadata) {
        merge_maps(&mut self.fields, other.fields, "");
    }

    /// Add the fields of `other` that `self` lacks; `self` wins on collision.
    ///
    /// Objects are filled key by key.
    pub fn fill(&mut self, other: FileMetadata) {
        fill_maps(&mut self.fields, other.fields);
    }

    /// Required fields that are absent
    pub fn missing(&self, required: &[String]) -> Vec<String> {
        required
            .iter()
            .filter(|field| !self.contains(field))
            .cloned()
            .collect()
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

fn merge_maps(
    into: &mut BTreeMap<String, MetadataValue>,
    from: BTreeMap<String, MetadataValue>,
    path: &str,
) {
    for (key, value) in from {
        let field = if path.is_empty() {
            key.clone()
        } else {
            format!("{}.{}", path, key)
        };

        match (into.get_mut(&key), value) {
            (Some(MetadataValue::Object(existing)), MetadataValue::Object(incoming)) => {
                merge_maps(existing, incoming, &field);
            }
            (Some(existing), incoming) => {
                if *existing != incoming {
                    warn!(
                        "Metadata field {} differs between tables: {:?} replaced by {:?}",
                        field, existing, incoming
                    );
                }
                *existing = incoming;
            }
            (None, incoming) => {
                into.insert(key, incoming);
            }
        }
    }
}

fn fill_maps(into: &mut BTreeMap<String, MetadataValue>, from: BTreeMap<String, MetadataValue>) {
    for (key, value) in from {
        match (into.get_mut(&key), value) {
            (Some(MetadataValue::Object(existing)), MetadataValue::Object(incoming)) => {
                fill_maps(existing, incoming);
            }
            (Some(_), _) => {}
            (None, incoming) => {
                into.insert(key, incoming);
            }
        }
    }
}
