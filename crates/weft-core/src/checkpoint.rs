use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::action::Action;
use crate::context::SharedContext;
use crate::error::Result;
use crate::types::NodeId;

/// Externalized pause point of a flow traversal.
///
/// Sufficient to resume at the successor of `node`: the node that paused, the
/// action to route with on resume, and a snapshot of the shared context.
/// Where the checkpoint is persisted (file, record store) is entirely the
/// caller's concern; the engine only produces and consumes it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Node whose post phase paused the traversal.
    pub node: NodeId,
    /// Action to route with when resuming.
    pub action: Action,
    /// Shared context at the moment of the pause.
    pub context: SharedContext,
    /// When the checkpoint was taken.
    pub created_at: DateTime<Utc>,
}

impl Checkpoint {
    pub fn new(node: NodeId, action: Action, context: SharedContext) -> Self {
        Self {
            node,
            action,
            context,
            created_at: Utc::now(),
        }
    }

    /// Serialize for storage.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Deserialize from stored JSON.
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_json_round_trip() {
        let mut ctx = SharedContext::new();
        ctx.set_str("current_joke", "why did the duck cross the road");

        let cp = Checkpoint::new("pause".into(), Action::default(), ctx.clone());
        let json = cp.to_json().unwrap();
        let restored = Checkpoint::from_json(&json).unwrap();

        assert_eq!(restored.node, NodeId::from("pause"));
        assert_eq!(restored.action, Action::default());
        assert_eq!(restored.context, ctx);
        assert_eq!(restored.created_at, cp.created_at);
    }

    #[test]
    fn test_from_json_rejects_garbage() {
        assert!(Checkpoint::from_json("not json").is_err());
        assert!(Checkpoint::from_json("{}").is_err());
    }
}
