use serde::{Deserialize, Serialize};

/// Identity of a node within a flow.
///
/// Used for edge registration, checkpointing, and diagnostics. Ids are
/// caller-chosen and must be unique within one flow.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct NodeId(pub String);

impl NodeId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for NodeId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for NodeId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_id_conversions() {
        let id: NodeId = "generate".into();
        assert_eq!(id.as_str(), "generate");
        assert_eq!(id.to_string(), "generate");
        assert_eq!(id, NodeId::new(String::from("generate")));
    }
}
