use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Unix epoch timestamp in seconds.
pub fn now_unix() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// The field map of a stored document.
pub type Document = serde_json::Map<String, Value>;

/// A document read from a collection, together with its id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentSnapshot {
    pub id: String,
    pub data: Document,
}

impl DocumentSnapshot {
    pub fn new(id: impl Into<String>, data: Document) -> Self {
        Self {
            id: id.into(),
            data,
        }
    }

    /// Look up a top-level field.
    pub fn get(&self, field: &str) -> Option<&Value> {
        self.data.get(field)
    }

    /// Look up a top-level field holding a string.
    pub fn get_str(&self, field: &str) -> Option<&str> {
        self.data.get(field).and_then(Value::as_str)
    }
}

/// A single entry of a partial update.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    /// Overwrite the field with this value (null included).
    Set(Value),
    /// Remove the field, leaving the rest of the document untouched.
    Delete,
}

impl From<Value> for FieldValue {
    fn from(value: Value) -> Self {
        Self::Set(value)
    }
}

impl From<&str> for FieldValue {
    fn from(value: &str) -> Self {
        Self::Set(Value::String(value.to_string()))
    }
}

impl From<String> for FieldValue {
    fn from(value: String) -> Self {
        Self::Set(Value::String(value))
    }
}

/// Field path -> new value. Dotted paths (`settings.theme`) address nested maps.
pub type FieldUpdates = BTreeMap<String, FieldValue>;
