//! Column id to name/unit mapping
//!
//! Column headers carry a short hex id (`"8d"`, `"02bc"`, ...). The map turns
//! it into a semantic name and unit. Ids without an entry keep their hex form
//! as the column name so the data is not lost.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Name and unit for one column id
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnInfo {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
}

impl ColumnInfo {
    pub fn new(name: impl Into<String>, unit: Option<&str>) -> Self {
        Self {
            name: name.into(),
            unit: unit.map(str::to_string),
        }
    }
}

/// Hex column id -> column info
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ColumnMap {
    entries: BTreeMap<String, ColumnInfo>,
}

impl ColumnMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Columns found in STA measurement streams
    pub fn standard() -> Self {
        Self::new()
            .with("8d", "time", Some("min"))
            .with("8e", "sample_temperature", Some("°C"))
            .with("9c", "dsc_signal", Some("µV"))
            .with("9d", "purge_flow_1", Some("ml/min"))
            .with("9e", "purge_flow_2", Some("ml/min"))
            .with("90", "protective_flow", Some("ml/min"))
            .with("87", "mass", Some("mg"))
            .with("30", "furnace_temperature", Some("°C"))
            .with("32", "furnace_power", Some("W"))
            .with("33", "h_foil_temperature", Some("°C"))
            .with("34", "uc_module", Some("mV"))
            .with("35", "env_pressure", Some("mbar"))
            .with("36", "env_accel_x", Some("g"))
            .with("37", "env_accel_y", Some("g"))
            .with("38", "env_accel_z", Some("g"))
    }

    /// Copy with one more entry (replacing any existing one)
    pub fn with(mut self, id: &str, name: &str, unit: Option<&str>) -> Self {
        self.entries
            .insert(id.to_ascii_lowercase(), ColumnInfo::new(name, unit));
        self
    }

    pub fn get(&self, id: &str) -> Option<&ColumnInfo> {
        match self.entries.get(id) {
            Some(info) => Some(info),
            None => self.entries.get(&id.to_ascii_lowercase()),
        }
    }

    /// Info for `id`, falling back to the raw id with no unit
    pub fn resolve(&self, id: &str) -> ColumnInfo {
        self.get(id)
            .cloned()
            .unwrap_or_else(|| ColumnInfo::new(id, None))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &ColumnInfo)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Lower-case every key and check it is non-empty, even-length hex
    pub(crate) fn normalized(self) -> Result<Self> {
        let mut entries = BTreeMap::new();
        for (id, info) in self.entries {
            let key = id.to_ascii_lowercase();
            if key.is_empty() || hex::decode(&key).is_err() {
                return Err(Error::Configuration(format!(
                    "column id {:?} is not a hex byte string",
                    id
                )));
            }
            if info.name.is_empty() {
                return Err(Error::Configuration(format!("column {} has an empty name", key)));
            }
            if entries.insert(key.clone(), info).is_some() {
                return Err(Error::Configuration(format!(
                    "column id {} is listed twice",
                    key
                )));
            }
        }
        Ok(Self { entries })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_known() {
        let map = ColumnMap::standard();
        let info = map.resolve("8d");
        assert_eq!(info.name, "time");
        assert_eq!(info.unit.as_deref(), Some("min"));
    }

    #[test]
    fn test_resolve_unknown_keeps_id() {
        let info = ColumnMap::standard().resolve("02bc");
        assert_eq!(info.name, "02bc");
        assert!(info.unit.is_none());
    }

    #[test]
    fn test_lookup_is_case_insensitive() {
        let map = ColumnMap::new().with("02BC", "heat_flow", Some("mW"));
        assert_eq!(map.get("02bc").unwrap().name, "heat_flow");
        assert_eq!(map.get("02BC").unwrap().name, "heat_flow");
    }

    #[test]
    fn test_normalized_rejects_bad_ids() {
        let map: ColumnMap = serde_json::from_str(r#"{"zz": {"name": "bad"}}"#).unwrap();
        assert!(map.normalized().is_err());

        let map: ColumnMap = serde_json::from_str(r#"{"abc": {"name": "odd"}}"#).unwrap();
        assert!(map.normalized().is_err());
    }

    #[test]
    fn test_normalized_rejects_case_duplicates() {
        let map: ColumnMap =
            serde_json::from_str(r#"{"8D": {"name": "a"}, "8d": {"name": "b"}}"#).unwrap();
        assert!(map.normalized().is_err());
    }

    #[test]
    fn test_deserialize_without_unit() {
        let map: ColumnMap = serde_json::from_str(r#"{"8D": {"name": "time"}}"#).unwrap();
        let map = map.normalized().unwrap();
        assert_eq!(map.resolve("8d"), ColumnInfo::new("time", None));
    }
}
