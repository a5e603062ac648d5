//! Document representation
//!
//! A Document is one keyed record in the store, addressed by a `/`-delimited
//! path that alternates collection names and document IDs.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A document in the store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    /// Unique identifier within its collection (last path segment)
    pub id: String,

    /// Full document path
    pub path: String,

    /// Field values
    pub fields: Fields,

    /// Metadata about the document
    #[serde(skip)]
    pub meta: DocumentMeta,
}

/// Field values that can be stored in a document
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    Array(Vec<Value>),
    Object(BTreeMap<String, Value>),
}

impl Value {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&Vec<Value>> {
        match self {
            Value::Array(a) => Some(a),
            _ => None,
        }
    }

    pub fn as_object(&self) -> Option<&BTreeMap<String, Value>> {
        match self {
            Value::Object(o) => Some(o),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Array of strings, ignoring non-string items
    pub fn string_items(&self) -> Vec<String> {
        self.as_array()
            .map(|items| {
                items
                    .iter()
                    .filter_map(|v| v.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default()
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Value::Float(f)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<Vec<String>> for Value {
    fn from(items: Vec<String>) -> Self {
        Value::Array(items.into_iter().map(Value::String).collect())
    }
}

impl From<Fields> for Value {
    fn from(fields: Fields) -> Self {
        Value::Object(fields)
    }
}

impl From<serde_json::Value> for Value {
    fn from(v: serde_json::Value) -> Self {
        match v {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(b),
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Value::Int(i)
                } else if let Some(f) = n.as_f64() {
                    Value::Float(f)
                } else {
                    Value::Null
                }
            }
            serde_json::Value::String(s) => Value::String(s),
            serde_json::Value::Array(items) => {
                Value::Array(items.into_iter().map(Value::from).collect())
            }
            serde_json::Value::Object(map) => {
                Value::Object(map.into_iter().map(|(k, v)| (k, Value::from(v))).collect())
            }
        }
    }
}

impl From<&Value> for serde_json::Value {
    fn from(value: &Value) -> Self {
        match value {
            Value::Null => serde_json::Value::Null,
            Value::Bool(b) => serde_json::Value::Bool(*b),
            Value::Int(i) => serde_json::Value::Number((*i).into()),
            Value::Float(f) => serde_json::Number::from_f64(*f)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            Value::String(s) => serde_json::Value::String(s.clone()),
            Value::Array(arr) => serde_json::Value::Array(arr.iter().map(Into::into).collect()),
            Value::Object(obj) => serde_json::Value::Object(
                obj.iter().map(|(k, v)| (k.clone(), v.into())).collect(),
            ),
        }
    }
}

/// A map of field names to values
pub type Fields = BTreeMap<String, Value>;

/// Metadata about a document (maintained by the store, not part of the data)
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DocumentMeta {
    /// Store revision at read time; used for optimistic transactions
    pub revision: u64,
}

impl Document {
    /// Create a new, empty document at `path`
    pub fn new(path: impl Into<String>) -> Self {
        let path = path.into();
        let id = crate::paths::doc_id(&path).to_string();
        Self {
            id,
            path,
            fields: Fields::new(),
            meta: DocumentMeta::default(),
        }
    }

    /// Set a field value
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<Value>) -> &mut Self {
        self.fields.insert(key.into(), value.into());
        self
    }

    /// Get a top-level field value
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    /// Get a field by dotted path, e.g. `followers.u1.name`
    pub fn get_field(&self, dotted: &str) -> Option<&Value> {
        get_dotted(&self.fields, dotted)
    }
}

/// Look up a dotted field path inside a field map
pub fn get_dotted<'a>(fields: &'a Fields, dotted: &str) -> Option<&'a Value> {
    let mut parts = dotted.split('.');
    let mut current = fields.get(parts.next()?)?;
    for part in parts {
        current = current.as_object()?.get(part)?;
    }
    Some(current)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_document_creation() {
        let mut doc = Document::new("users/u1");
        doc.set("name", "Ada").set("age", 36i64).set("active", true);

        assert_eq!(doc.id, "u1");
        assert_eq!(doc.get("name"), Some(&Value::String("Ada".into())));
    }

    #[test]
    fn test_dotted_lookup() {
        let mut doc = Document::new("users/u1");
        let mut follower = Fields::new();
        follower.insert("name".into(), "Grace".into());
        let mut followers = Fields::new();
        followers.insert("u2".into(), follower.into());
        doc.set("followers", followers);

        assert_eq!(doc.get_field("followers.u2.name").and_then(Value::as_str), Some("Grace"));
        assert!(doc.get_field("followers.u3.name").is_none());
    }

    #[test]
    fn test_json_conversion() {
        let json = serde_json::json!({"a": 1, "b": [true, "x"], "c": {"d": 1.5}});
        let value = Value::from(json.clone());
        assert_eq!(serde_json::Value::from(&value), json);
    }
}
