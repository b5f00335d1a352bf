use thiserror::Error;

use crate::types::NodeId;

#[derive(Debug, Error)]
pub enum FlowError {
    // Node errors
    /// Raised inside a node body; the engine carries it without inspecting it.
    #[error("{0}")]
    Node(String),

    #[error("node '{node}' failed after {attempts} attempt(s): {message}")]
    NodeExecution {
        node: NodeId,
        attempts: u32,
        message: String,
    },

    #[error("node '{node}' fallback failed: {message}")]
    NodeFallback { node: NodeId, message: String },

    // Batch errors
    #[error(transparent)]
    AggregateBatch(#[from] AggregateBatchError),

    // Traversal errors
    #[error("flow has no start node")]
    MissingStart,

    #[error("node '{0}' is not registered in this flow")]
    UnknownNode(NodeId),

    #[error("nested flow paused at node '{0}'; pause is only supported at the top level")]
    PauseInSubflow(NodeId),

    #[error("flow exceeded the step limit of {0}")]
    StepLimit(usize),

    // JSON errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl FlowError {
    /// Shorthand for an error raised inside a node body.
    pub fn node(message: impl Into<String>) -> Self {
        Self::Node(message.into())
    }
}

pub type Result<T> = std::result::Result<T, FlowError>;

/// One failed item of a concurrent batch.
#[derive(Debug, Clone)]
pub struct ItemFailure {
    /// Position of the item in the input sequence.
    pub index: usize,
    pub message: String,
}

impl std::fmt::Display for ItemFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "item {}: {}", self.index, self.message)
    }
}

/// One or more items of a concurrent batch failed after their own
/// retries/fallback. Raised only once every launched item has settled;
/// siblings are never cancelled on first failure.
#[derive(Debug, Error)]
#[error("{} of {} batch items failed", .failures.len(), .total)]
pub struct AggregateBatchError {
    /// Number of items launched.
    pub total: usize,
    /// Per-item failures, in index order.
    pub failures: Vec<ItemFailure>,
    /// Results of items that did complete, aligned to the input sequence.
    pub partial: Vec<Option<serde_json::Value>>,
}

impl AggregateBatchError {
    /// Result of the item at `index`, if it completed.
    pub fn partial_result(&self, index: usize) -> Option<&serde_json::Value> {
        self.partial.get(index).and_then(|v| v.as_ref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_error_display() {
        let err = FlowError::node("connection refused");
        assert_eq!(err.to_string(), "connection refused");

        let err = FlowError::NodeExecution {
            node: "fetch".into(),
            attempts: 3,
            message: "connection refused".into(),
        };
        assert_eq!(
            err.to_string(),
            "node 'fetch' failed after 3 attempt(s): connection refused"
        );
    }

    #[test]
    fn test_aggregate_display_and_partials() {
        let err = AggregateBatchError {
            total: 3,
            failures: vec![ItemFailure {
                index: 1,
                message: "boom".into(),
            }],
            partial: vec![
                Some(serde_json::json!("r0")),
                None,
                Some(serde_json::json!("r2")),
            ],
        };
        assert_eq!(err.to_string(), "1 of 3 batch items failed");
        assert_eq!(err.partial_result(0), Some(&serde_json::json!("r0")));
        assert_eq!(err.partial_result(1), None);
        assert_eq!(err.partial_result(2), Some(&serde_json::json!("r2")));
        assert_eq!(err.partial_result(9), None);

        let flow_err: FlowError = err.into();
        assert_eq!(flow_err.to_string(), "1 of 3 batch items failed");
    }
}
