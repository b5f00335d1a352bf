use std::collections::HashMap;

use tracing::{debug, info, warn};

use weft_core::{Action, Checkpoint, FlowError, NodeId, Outcome, Params, Result, SharedContext};

use crate::node::{retry_loop, Node, NodeRunner, RetryPolicy};

/// Successor table: action-labeled edges, per node.
///
/// Action keys are unique per node; re-registering an action replaces the
/// prior edge (last write wins) with a build-time warning.
#[derive(Debug, Default)]
pub(crate) struct Transitions {
    edges: HashMap<NodeId, HashMap<Action, NodeId>>,
}

impl Transitions {
    pub(crate) fn insert(&mut self, from: NodeId, action: Action, to: NodeId) {
        let slot = self.edges.entry(from.clone()).or_default();
        if let Some(prev) = slot.insert(action.clone(), to) {
            warn!(node = %from, action = %action, replaced = %prev, "replacing successor for action");
        }
    }

    pub(crate) fn successor(&self, from: &NodeId, action: &Action) -> Option<&NodeId> {
        self.edges.get(from).and_then(|m| m.get(action))
    }

    pub(crate) fn has_successors(&self, from: &NodeId) -> bool {
        self.edges.get(from).is_some_and(|m| !m.is_empty())
    }
}

/// How a traversal ended.
#[derive(Debug, Clone, PartialEq)]
pub enum FlowOutcome {
    /// No successor matched the final action; the action is returned.
    Completed(Action),
    /// A node paused the traversal; resume later from the checkpoint.
    Paused(Checkpoint),
}

impl FlowOutcome {
    pub fn action(&self) -> Option<&Action> {
        match self {
            Self::Completed(action) => Some(action),
            Self::Paused(_) => None,
        }
    }

    pub fn checkpoint(self) -> Option<Checkpoint> {
        match self {
            Self::Paused(cp) => Some(cp),
            Self::Completed(_) => None,
        }
    }

    pub fn is_paused(&self) -> bool {
        matches!(self, Self::Paused(_))
    }
}

/// A graph of nodes traversed by action-driven routing.
///
/// Traversal starts at the start node, runs each node's full lifecycle with
/// the flow's params merged under the node's own, and follows the edge
/// registered for the returned action. Absence of a matching edge terminates
/// the flow with that action; graphs may legitimately cycle, and no step
/// limit is imposed unless `with_max_steps` sets one.
///
/// All builder methods consume and return the flow, so graphs chain off
/// `Flow::new()`.
#[derive(Default)]
pub struct Flow {
    nodes: HashMap<NodeId, Node>,
    transitions: Transitions,
    start: Option<NodeId>,
    params: Params,
    max_steps: Option<usize>,
}

impl Flow {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a node and make it the start node.
    pub fn start(mut self, node: Node) -> Self {
        self.start = Some(node.id().clone());
        self.add(node)
    }

    /// Register a node. Re-registering an id replaces the node.
    pub fn add(mut self, node: Node) -> Self {
        let id = node.id().clone();
        if self.nodes.insert(id.clone(), node).is_some() {
            warn!(node = %id, "replacing registered node");
        }
        self
    }

    /// Register an edge: when `from` finishes with `action`, continue at `to`.
    pub fn connect(
        mut self,
        from: impl Into<NodeId>,
        action: impl Into<Action>,
        to: impl Into<NodeId>,
    ) -> Self {
        self.transitions.insert(from.into(), action.into(), to.into());
        self
    }

    /// Default-action edge, for linear chains.
    pub fn then(self, from: impl Into<NodeId>, to: impl Into<NodeId>) -> Self {
        self.connect(from, Action::default(), to)
    }

    /// Flow-level params, merged under each node's own params.
    pub fn with_params(mut self, params: Params) -> Self {
        self.params = params;
        self
    }

    /// Optional traversal guard; exceeding it fails with `FlowError::StepLimit`.
    pub fn with_max_steps(mut self, limit: usize) -> Self {
        self.max_steps = Some(limit);
        self
    }

    pub(crate) fn start_node(&self) -> Result<NodeId> {
        self.start.clone().ok_or(FlowError::MissingStart)
    }

    pub(crate) fn params(&self) -> &Params {
        &self.params
    }

    /// Traverse from the start node until no edge matches or a node pauses.
    pub fn run(&self, ctx: &mut SharedContext) -> Result<FlowOutcome> {
        let start = self.start_node()?;
        self.traverse(start, ctx, &self.params)
    }

    /// Continue a paused traversal at the successor of the checkpointed node.
    ///
    /// Restores the checkpoint's context snapshot and returns it alongside
    /// the outcome. If the checkpointed node has no matching successor, the
    /// flow completes immediately with the checkpoint's action.
    pub fn resume(&self, checkpoint: Checkpoint) -> Result<(SharedContext, FlowOutcome)> {
        let Checkpoint {
            node,
            action,
            context,
            ..
        } = checkpoint;
        if !self.nodes.contains_key(&node) {
            return Err(FlowError::UnknownNode(node));
        }

        let mut ctx = context;
        let outcome = match self.transitions.successor(&node, &action) {
            Some(next) => {
                let next = next.clone();
                info!(node = %node, next = %next, "resuming flow from checkpoint");
                self.traverse(next, &mut ctx, &self.params)?
            }
            None => FlowOutcome::Completed(action),
        };
        Ok((ctx, outcome))
    }

    pub(crate) fn traverse(
        &self,
        from: NodeId,
        ctx: &mut SharedContext,
        run_params: &Params,
    ) -> Result<FlowOutcome> {
        let mut current = from;
        let mut steps = 0usize;

        loop {
            steps += 1;
            if let Some(limit) = self.max_steps {
                if steps > limit {
                    return Err(FlowError::StepLimit(limit));
                }
            }

            let node = self
                .nodes
                .get(&current)
                .ok_or_else(|| FlowError::UnknownNode(current.clone()))?;

            debug!(node = %current, "running node");
            let action = match node.run_with(ctx, run_params)? {
                Outcome::Pause => {
                    info!(node = %current, "flow paused");
                    return Ok(FlowOutcome::Paused(Checkpoint::new(
                        current,
                        Action::default(),
                        ctx.clone(),
                    )));
                }
                Outcome::Next(action) => action,
                Outcome::Default => Action::default(),
            };

            match self.transitions.successor(&current, &action) {
                Some(next) => {
                    debug!(node = %current, action = %action, next = %next, "routing");
                    current = next.clone();
                }
                None => {
                    if self.transitions.has_successors(&current) {
                        warn!(node = %current, action = %action, "flow ends: no successor for action");
                    } else {
                        debug!(node = %current, action = %action, "terminal node, flow complete");
                    }
                    return Ok(FlowOutcome::Completed(action));
                }
            }
        }
    }
}

impl std::fmt::Debug for Flow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Flow")
            .field("nodes", &self.nodes.len())
            .field("start", &self.start)
            .field("max_steps", &self.max_steps)
            .finish_non_exhaustive()
    }
}

/// Adapter treating a whole flow as a single node in a parent flow.
///
/// Its execute step is "traverse to completion"; its action is the inner
/// traversal's final action. A retry policy on the wrapping node re-runs the
/// entire inner traversal from its start node, not from where it failed.
struct SubflowRunner {
    flow: Flow,
}

impl NodeRunner for SubflowRunner {
    fn run(
        &self,
        id: &NodeId,
        policy: RetryPolicy,
        ctx: &mut SharedContext,
        params: &Params,
    ) -> Result<Outcome> {
        let start = self.flow.start_node()?;
        let run_params = params.overlay(&self.flow.params);

        let outcome = retry_loop(
            id,
            policy,
            || self.flow.traverse(start.clone(), ctx, &run_params),
            |_| Ok(None),
        )?;

        match outcome {
            FlowOutcome::Completed(action) => Ok(Outcome::Next(action)),
            FlowOutcome::Paused(cp) => Err(FlowError::PauseInSubflow(cp.node)),
        }
    }
}

impl Node {
    /// Wrap a flow as a node, enabling nested composition.
    pub fn subflow(id: impl Into<NodeId>, flow: Flow) -> Self {
        Self::from_runner(id.into(), Box::new(SubflowRunner { flow }))
    }
}
