//! Typed metadata documents and the shallow merge applied under the advisory lock
use crate::error::{MemoryError, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Version tag of the merge semantics implemented by [`merge`].
///
/// v1: top-level keys only; present keys overwrite, absent keys are kept,
/// `null` removes the key, protected namespaces need a privileged caller.
pub const MERGE_VERSION: u32 = 1;

/// Top-level keys reserved for the service itself
pub const PROTECTED_NAMESPACES: &[&str] = &["system"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyClass {
    Protected,
    UserWritable,
}

pub fn classify_key(key: &str) -> KeyClass {
    if PROTECTED_NAMESPACES.contains(&key) {
        KeyClass::Protected
    } else {
        KeyClass::UserWritable
    }
}

/// Open key-value document attached to sessions, messages and summaries
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MetadataDocument(Map<String, Value>);

impl MetadataDocument {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_map(map: Map<String, Value>) -> Self {
        Self(map)
    }

    pub fn with(mut self, key: impl Into<String>, value: Value) -> Self {
        self.0.insert(key.into(), value);
        self
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &String> {
        self.0.keys()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }

    pub fn into_inner(self) -> Map<String, Value> {
        self.0
    }

    pub(crate) fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(&self.0)?)
    }

    /// Parse a stored column; empty text and JSON `null` read as an empty document
    pub(crate) fn from_json(raw: &str) -> Result<Self> {
        let trimmed = raw.trim();
        if trimmed.is_empty() || trimmed == "null" {
            return Ok(Self::default());
        }
        match serde_json::from_str::<Value>(trimmed)? {
            Value::Object(map) => Ok(Self(map)),
            other => Err(MemoryError::BadRequest(format!(
                "metadata must be a JSON object, found {}",
                json_kind(&other)
            ))),
        }
    }
}

impl From<Map<String, Value>> for MetadataDocument {
    fn from(map: Map<String, Value>) -> Self {
        Self(map)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum PatchOp {
    Set(Value),
    Remove,
}

/// PATCH-style change set; each key is either written or removed
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MetadataPatch {
    ops: Vec<(String, PatchOp)>,
}

impl MetadataPatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(mut self, key: impl Into<String>, value: Value) -> Self {
        self.push(key.into(), PatchOp::Set(value));
        self
    }

    pub fn remove(mut self, key: impl Into<String>) -> Self {
        self.push(key.into(), PatchOp::Remove);
        self
    }

    fn push(&mut self, key: String, op: PatchOp) {
        if let Some(existing) = self.ops.iter_mut().find(|(k, _)| *k == key) {
            existing.1 = op;
        } else {
            self.ops.push((key, op));
        }
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn ops(&self) -> &[(String, PatchOp)] {
        &self.ops
    }

    pub fn protected_keys(&self) -> Vec<&str> {
        self.ops
            .iter()
            .filter(|(k, _)| classify_key(k) == KeyClass::Protected)
            .map(|(k, _)| k.as_str())
            .collect()
    }
}

/// An incoming document becomes a patch: `null` values mean removal
impl From<MetadataDocument> for MetadataPatch {
    fn from(doc: MetadataDocument) -> Self {
        let mut patch = MetadataPatch::new();
        for (key, value) in doc.into_inner() {
            let op = if value.is_null() { PatchOp::Remove } else { PatchOp::Set(value) };
            patch.push(key, op);
        }
        patch
    }
}

/// Apply `patch` on top of `current`.
pub fn merge(current: &MetadataDocument, patch: &MetadataPatch, privileged: bool) -> Result<MetadataDocument> {
    if !privileged {
        let protected = patch.protected_keys();
        if !protected.is_empty() {
            return Err(MemoryError::Unauthorized(format!(
                "metadata keys {:?} are reserved",
                protected
            )));
        }
    }

    let mut merged = current.0.clone();
    for (key, op) in &patch.ops {
        match op {
            PatchOp::Set(value) => {
                merged.insert(key.clone(), value.clone());
            }
            PatchOp::Remove => {
                merged.remove(key);
            }
        }
    }
    Ok(MetadataDocument(merged))
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc(value: Value) -> MetadataDocument {
        match value {
            Value::Object(map) => MetadataDocument::from_map(map),
            _ => panic!("not an object"),
        }
    }

    #[test]
    fn test_present_keys_overwrite_absent_keys_survive() {
        let current = doc(json!({"a": 1, "b": {"nested": true}}));
        let patch = MetadataPatch::new().set("a", json!(2)).set("c", json!("new"));

        let merged = merge(&current, &patch, false).unwrap();
        assert_eq!(merged, doc(json!({"a": 2, "b": {"nested": true}, "c": "new"})));
    }

    #[test]
    fn test_merge_is_shallow() {
        let current = doc(json!({"b": {"x": 1, "y": 2}}));
        let patch = MetadataPatch::new().set("b", json!({"x": 5}));

        let merged = merge(&current, &patch, false).unwrap();
        assert_eq!(merged.get("b"), Some(&json!({"x": 5})));
    }

    #[test]
    fn test_null_removes_key() {
        let current = doc(json!({"a": 1, "b": 2}));
        let patch = MetadataPatch::from(doc(json!({"a": null})));

        let merged = merge(&current, &patch, false).unwrap();
        assert!(!merged.contains_key("a"));
        assert_eq!(merged.get("b"), Some(&json!(2)));
    }

    #[test]
    fn test_protected_namespace_requires_privilege() {
        let current = MetadataDocument::new();
        let patch = MetadataPatch::new().set("system", json!({"summarized": true}));

        let err = merge(&current, &patch, false).unwrap_err();
        assert!(matches!(err, MemoryError::Unauthorized(_)));

        let merged = merge(&current, &patch, true).unwrap();
        assert!(merged.contains_key("system"));
    }

    #[test]
    fn test_removing_protected_key_also_requires_privilege() {
        let current = doc(json!({"system": {"x": 1}}));
        let patch = MetadataPatch::new().remove("system");
        assert!(merge(&current, &patch, false).is_err());
    }

    #[test]
    fn test_later_op_on_same_key_wins() {
        let patch = MetadataPatch::new().set("k", json!(1)).remove("k");
        assert_eq!(patch.len(), 1);
        assert_eq!(patch.ops()[0].1, PatchOp::Remove);
    }

    #[test]
    fn test_from_json_tolerates_empty_and_null() {
        assert!(MetadataDocument::from_json("").unwrap().is_empty());
        assert!(MetadataDocument::from_json("null").unwrap().is_empty());
        assert!(MetadataDocument::from_json("[1,2]").is_err());
        assert_eq!(MetadataDocument::from_json(r#"{"a":1}"#).unwrap().len(), 1);
    }
}
