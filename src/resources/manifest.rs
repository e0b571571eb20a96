//! Manifest payload

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Rendered manifest body: an ordered list of Kubernetes objects
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ManifestSpec {
    objects: Vec<Value>,
}

impl ManifestSpec {
    /// Wrap rendered objects
    pub fn new(objects: Vec<Value>) -> Self {
        Self { objects }
    }

    /// Rendered objects in document order
    pub fn objects(&self) -> &[Value] {
        &self.objects
    }

    /// `kind` of each object, in order
    pub fn kinds(&self) -> Vec<&str> {
        self.objects
            .iter()
            .map(|o| o.get("kind").and_then(Value::as_str).unwrap_or_default())
            .collect()
    }

    /// First object with the given kind and `metadata.name`
    pub fn find(&self, kind: &str, name: &str) -> Option<&Value> {
        self.objects.iter().find(|o| {
            o.get("kind").and_then(Value::as_str) == Some(kind)
                && o.pointer("/metadata/name").and_then(Value::as_str) == Some(name)
        })
    }
}
