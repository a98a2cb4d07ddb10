//! Entity and draft values.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

use crate::error::{EntigraphError, Result};

/// A persisted (or persistable) record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    #[serde(rename = "$id")]
    pub id: String,
    #[serde(rename = "$type")]
    pub entity_type: String,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl Entity {
    pub fn new(entity_type: impl Into<String>, id: impl Into<String>, fields: Map<String, Value>) -> Self {
        Self {
            id: id.into(),
            entity_type: entity_type.into(),
            fields,
        }
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.fields.get(field)
    }

    pub fn get_str(&self, field: &str) -> Option<&str> {
        self.fields.get(field).and_then(Value::as_str)
    }

    pub fn set(&mut self, field: impl Into<String>, value: Value) {
        self.fields.insert(field.into(), value);
    }

    /// Ids stored in a relationship field (single id or array of ids).
    pub fn ids(&self, field: &str) -> Vec<String> {
        self.fields.get(field).map(value_strings).unwrap_or_default()
    }

    /// Text used for semantic matching: every string value except timestamps.
    pub fn searchable_text(&self) -> String {
        let mut parts = Vec::new();
        for (key, value) in &self.fields {
            if key == "createdAt" || key == "updatedAt" {
                continue;
            }
            parts.extend(value_strings(value));
        }
        parts.join(" ")
    }
}

/// Collect string members of a value: a string, or the strings of an array.
pub fn value_strings(value: &Value) -> Vec<String> {
    match value {
        Value::String(s) => vec![s.clone()],
        Value::Array(items) => items
            .iter()
            .filter_map(|v| v.as_str().map(str::to_string))
            .collect(),
        _ => Vec::new(),
    }
}

/// Lifecycle of a draft. `Draft -> Resolved` is the only transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Draft,
    Resolved,
}

/// Per-field bookkeeping for an unresolved relationship placeholder.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldRef {
    pub target_type: String,
    pub resolved: bool,
    pub description: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub resolved_ids: Vec<String>,
}

/// An unpersisted, generated entity whose relationship fields hold
/// natural-language placeholders until resolved.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Draft {
    #[serde(rename = "$id")]
    pub id: String,
    #[serde(rename = "$type")]
    pub entity_type: String,
    #[serde(rename = "$phase")]
    pub phase: Phase,
    #[serde(rename = "$refs")]
    pub refs: BTreeMap<String, FieldRef>,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl Draft {
    pub fn is_draft(&self) -> bool {
        self.phase == Phase::Draft
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.fields.get(field)
    }

    /// Overwrite a field, typically a placeholder with an id or a better hint.
    pub fn set(&mut self, field: impl Into<String>, value: Value) {
        self.fields.insert(field.into(), value);
    }

    pub fn placeholder(&self, field: &str) -> Option<&str> {
        if self.refs.get(field).map(|r| r.resolved).unwrap_or(true) {
            return None;
        }
        self.fields.get(field).and_then(Value::as_str)
    }

    /// Committed view of a resolved draft.
    pub fn to_entity(&self) -> Result<Entity> {
        if self.is_draft() {
            return Err(EntigraphError::ResolveState(format!(
                "{}/{} is still a draft",
                self.entity_type, self.id
            )));
        }
        Ok(Entity::new(
            self.entity_type.clone(),
            self.id.clone(),
            self.fields.clone(),
        ))
    }
}
