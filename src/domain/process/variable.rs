//! Named variables scoped to (instance, object), grouped per writer

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::ids::InstanceId;

/// Object id for instance-wide variables (start parameters, script output)
pub const PROCESS_OBJECT: &str = "process";

/// One named value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Variable {
    pub key: String,
    pub value: Value,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,

    /// Principals allowed to read; `None` means everyone
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub visibility: Option<Vec<String>>,

    /// Survives revoke/sendback cleanup
    #[serde(default)]
    pub durable: bool,
}

impl Variable {
    pub fn new(key: impl Into<String>, value: Value) -> Self {
        Self {
            key: key.into(),
            value,
            label: None,
            visibility: None,
            durable: false,
        }
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    pub fn visible_only_to(mut self, principals: Vec<String>) -> Self {
        self.visibility = Some(principals);
        self
    }

    pub fn durable(mut self) -> Self {
        self.durable = true;
        self
    }

    /// Build plain variables from a key/value map
    pub fn from_map(values: &BTreeMap<String, Value>) -> Vec<Self> {
        values
            .iter()
            .map(|(k, v)| Self::new(k.clone(), v.clone()))
            .collect()
    }
}

/// Everything one writer wrote on one object; replaced wholesale on write
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VariableRecord {
    pub instance_id: InstanceId,
    pub object_id: String,
    pub writer: String,

    /// Write order, assigned by the store
    #[serde(default)]
    pub seq: u64,

    pub variables: Vec<Variable>,
    pub written_at: DateTime<Utc>,
}

impl VariableRecord {
    pub fn new(
        instance_id: InstanceId,
        object_id: impl Into<String>,
        writer: impl Into<String>,
        variables: Vec<Variable>,
    ) -> Self {
        Self {
            instance_id,
            object_id: object_id.into(),
            writer: writer.into(),
            seq: 0,
            variables,
            written_at: Utc::now(),
        }
    }

    /// Whether the record belongs to (instance, object, writer)
    pub fn matches(&self, instance_id: &InstanceId, object_id: &str, writer: &str) -> bool {
        &self.instance_id == instance_id && self.object_id == object_id && self.writer == writer
    }
}

/// Whether `viewer` may read a variable written by `writer`
pub fn is_visible(variable: &Variable, writer: &str, viewer: Option<&str>) -> bool {
    match (&variable.visibility, viewer) {
        (None, _) => true,
        // Engine-internal reads see everything
        (Some(_), None) => true,
        (Some(allowed), Some(viewer)) => viewer == writer || allowed.iter().any(|p| p == viewer),
    }
}

/// Merge records by write order; the latest write of a key wins
pub fn merge_records<'a>(
    records: impl IntoIterator<Item = &'a VariableRecord>,
    viewer: Option<&str>,
) -> BTreeMap<String, Variable> {
    let mut ordered: Vec<&VariableRecord> = records.into_iter().collect();
    ordered.sort_by_key(|r| r.seq);

    let mut merged = BTreeMap::new();
    for record in ordered {
        for variable in &record.variables {
            if is_visible(variable, &record.writer, viewer) {
                merged.insert(variable.key.clone(), variable.clone());
            }
        }
    }
    merged
}

/// Flatten merged variables to plain values
pub fn to_values(merged: &BTreeMap<String, Variable>) -> BTreeMap<String, Value> {
    merged
        .iter()
        .map(|(k, v)| (k.clone(), v.value.clone()))
        .collect()
}
