use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Static parameters attached to a node or flow at build time.
///
/// Params are read-only during a run; the engine only ever combines maps into
/// new maps, so one set can be shared across concurrent executions without
/// protection. Keys are strings; values are JSON for maximum flexibility.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Params {
    data: HashMap<String, serde_json::Value>,
}

impl Params {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_map(data: HashMap<String, serde_json::Value>) -> Self {
        Self { data }
    }

    /// Builder-style insert.
    pub fn with(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.data.insert(key.into(), value);
        self
    }

    pub fn set(&mut self, key: impl Into<String>, value: serde_json::Value) {
        self.data.insert(key.into(), value);
    }

    pub fn set_str(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.data
            .insert(key.into(), serde_json::Value::String(value.into()));
    }

    pub fn get(&self, key: &str) -> Option<&serde_json::Value> {
        self.data.get(key)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.data.get(key).and_then(|v| v.as_str())
    }

    /// Combine two maps into a new one; `over` wins on key collision.
    ///
    /// Flow params sit under node params, which sit under nothing: callers
    /// build effective params as `flow.overlay(&node)`.
    pub fn overlay(&self, over: &Params) -> Params {
        let mut data = self.data.clone();
        for (k, v) in &over.data {
            data.insert(k.clone(), v.clone());
        }
        Params { data }
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_basic_operations() {
        let mut params = Params::new();
        params.set_str("filename", "report.txt");
        params.set("limit", serde_json::json!(3));

        assert_eq!(params.get_str("filename"), Some("report.txt"));
        assert_eq!(params.get("limit"), Some(&serde_json::json!(3)));
        assert_eq!(params.get("missing"), None);
        assert_eq!(params.len(), 2);
    }

    #[test]
    fn test_overlay_precedence() {
        let base = Params::new()
            .with("a", serde_json::json!(1))
            .with("b", serde_json::json!("base"));
        let over = Params::new()
            .with("b", serde_json::json!("over"))
            .with("c", serde_json::json!(true));

        let merged = base.overlay(&over);
        assert_eq!(merged.get("a"), Some(&serde_json::json!(1)));
        assert_eq!(merged.get_str("b"), Some("over"));
        assert_eq!(merged.get("c"), Some(&serde_json::json!(true)));

        // The inputs are untouched.
        assert_eq!(base.get_str("b"), Some("base"));
        assert_eq!(over.len(), 2);
    }

    #[test]
    fn test_overlay_empty() {
        let base = Params::new().with("a", serde_json::json!(1));
        let merged = base.overlay(&Params::new());
        assert_eq!(merged, base);
    }
}
