use std::collections::HashMap;

use futures::future::BoxFuture;
use tracing::{debug, info, warn};

use weft_core::{Action, Checkpoint, FlowError, NodeId, Outcome, Params, Result, SharedContext};

use crate::async_node::{AsyncNode, AsyncNodeRunner};
use crate::flow::{FlowOutcome, Transitions};
use crate::node::RetryPolicy;

/// Awaiting counterpart of `Flow`: same routing, checkpointing, and params
/// layering, over `AsyncNode`s.
///
/// Traversal is strictly sequential; nodes merely yield at their suspension
/// points instead of blocking the thread. Builder methods consume and return
/// the flow, as on `Flow`.
#[derive(Default)]
pub struct AsyncFlow {
    nodes: HashMap<NodeId, AsyncNode>,
    transitions: Transitions,
    start: Option<NodeId>,
    params: Params,
    max_steps: Option<usize>,
}

impl AsyncFlow {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a node and make it the start node.
    pub fn start(mut self, node: AsyncNode) -> Self {
        self.start = Some(node.id().clone());
        self.add(node)
    }

    /// Register a node. Re-registering an id replaces the node.
    pub fn add(mut self, node: AsyncNode) -> Self {
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
    pub async fn run(&self, ctx: &mut SharedContext) -> Result<FlowOutcome> {
        let start = self.start_node()?;
        self.traverse(start, ctx, &self.params).await
    }

    /// Continue a paused traversal at the successor of the checkpointed node.
    ///
    /// Same semantics as `Flow::resume`: restores the checkpoint's context
    /// snapshot, and completes immediately with the checkpoint's action when
    /// the checkpointed node has no matching successor.
    pub async fn resume(&self, checkpoint: Checkpoint) -> Result<(SharedContext, FlowOutcome)> {
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
                self.traverse(next, &mut ctx, &self.params).await?
            }
            None => FlowOutcome::Completed(action),
        };
        Ok((ctx, outcome))
    }

    pub(crate) async fn traverse(
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
            let action = match node.run_with(ctx, run_params).await? {
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

impl std::fmt::Debug for AsyncFlow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AsyncFlow")
            .field("nodes", &self.nodes.len())
            .field("start", &self.start)
            .field("max_steps", &self.max_steps)
            .finish_non_exhaustive()
    }
}

/// Adapter treating a whole async flow as a single node in a parent flow.
///
/// A retry policy on the wrapping node re-runs the entire inner traversal
/// from its start node. The retry loop is written out by hand here: each
/// attempt must reborrow the `&mut` context, which a closure returning a
/// single-lifetime `BoxFuture` cannot express.
struct AsyncSubflowRunner {
    flow: AsyncFlow,
}

impl AsyncNodeRunner for AsyncSubflowRunner {
    fn run<'a>(
        &'a self,
        id: &'a NodeId,
        policy: RetryPolicy,
        ctx: &'a mut SharedContext,
        params: &'a Params,
    ) -> BoxFuture<'a, Result<Outcome>> {
        Box::pin(async move {
            let start = self.flow.start_node()?;
            let run_params = params.overlay(&self.flow.params);
            let attempts = policy.attempts();
            let mut last: Option<FlowError> = None;

            for attempt_no in 1..=attempts {
                match self.flow.traverse(start.clone(), ctx, &run_params).await {
                    Ok(FlowOutcome::Completed(action)) => return Ok(Outcome::Next(action)),
                    Ok(FlowOutcome::Paused(cp)) => {
                        return Err(FlowError::PauseInSubflow(cp.node))
                    }
                    // A pause deeper down is a control signal, never retried.
                    Err(e @ FlowError::PauseInSubflow(_)) => return Err(e),
                    Err(e) => {
                        warn!(node = %id, attempt = attempt_no, error = %e, "subflow attempt failed");
                        last = Some(e);
                        if attempt_no < attempts && !policy.wait.is_zero() {
                            tokio::time::sleep(policy.wait).await;
                        }
                    }
                }
            }

            let last = last.unwrap_or_else(|| FlowError::node("traversal made no attempts"));
            Err(FlowError::NodeExecution {
                node: id.clone(),
                attempts,
                message: last.to_string(),
            })
        })
    }
}

impl AsyncNode {
    /// Wrap an async flow as a node, enabling nested composition.
    pub fn subflow(id: impl Into<NodeId>, flow: AsyncFlow) -> Self {
        Self::from_runner(id.into(), Box::new(AsyncSubflowRunner { flow }))
    }
}

/// Awaiting counterpart of `BatchFlowLogic`.
pub trait AsyncBatchFlowLogic: Send + Sync {
    fn prep<'a>(
        &'a self,
        ctx: &'a mut SharedContext,
        params: &'a Params,
    ) -> BoxFuture<'a, Result<Vec<Params>>>;

    fn post<'a>(
        &'a self,
        ctx: &'a mut SharedContext,
        sets: Vec<Params>,
        params: &'a Params,
    ) -> BoxFuture<'a, Result<Outcome>> {
        let _ = (ctx, sets, params);
        Box::pin(async { Ok(Outcome::Default) })
    }
}

/// An async flow run once per parameter set, sequentially.
///
/// Iterations share one context and never overlap; for concurrent
/// iterations see `ParallelBatchFlow`.
pub struct AsyncBatchFlow<B: AsyncBatchFlowLogic> {
    flow: AsyncFlow,
    logic: B,
}

impl<B: AsyncBatchFlowLogic> AsyncBatchFlow<B> {
    pub fn new(flow: AsyncFlow, logic: B) -> Self {
        Self { flow, logic }
    }

    pub async fn run(&self, ctx: &mut SharedContext) -> Result<Outcome> {
        self.run_with(ctx, &Params::default()).await
    }

    pub(crate) async fn run_with(
        &self,
        ctx: &mut SharedContext,
        outer: &Params,
    ) -> Result<Outcome> {
        let start = self.flow.start_node()?;
        let base = outer.overlay(self.flow.params());
        let sets = self.logic.prep(ctx, &base).await?;
        debug!(iterations = sets.len(), "running async batch flow");

        for set in &sets {
            let run_params = base.overlay(set);
            match self.flow.traverse(start.clone(), ctx, &run_params).await? {
                FlowOutcome::Completed(_) => {}
                FlowOutcome::Paused(cp) => return Err(FlowError::PauseInSubflow(cp.node)),
            }
        }

        self.logic.post(ctx, sets, &base).await
    }
}

/// Like `AsyncSubflowRunner`, the wrapping node's retry policy re-runs the
/// whole batch (prepare and every iteration) from scratch; the hand-written
/// loop exists for the same reborrow reason.
struct AsyncBatchFlowRunner<B: AsyncBatchFlowLogic>(AsyncBatchFlow<B>);

impl<B: AsyncBatchFlowLogic + 'static> AsyncNodeRunner for AsyncBatchFlowRunner<B> {
    fn run<'a>(
        &'a self,
        id: &'a NodeId,
        policy: RetryPolicy,
        ctx: &'a mut SharedContext,
        params: &'a Params,
    ) -> BoxFuture<'a, Result<Outcome>> {
        Box::pin(async move {
            let attempts = policy.attempts();
            let mut last: Option<FlowError> = None;

            for attempt_no in 1..=attempts {
                match self.0.run_with(ctx, params).await {
                    Ok(outcome) => return Ok(outcome),
                    Err(e @ FlowError::PauseInSubflow(_)) => return Err(e),
                    Err(e) => {
                        warn!(node = %id, attempt = attempt_no, error = %e, "batch flow attempt failed");
                        last = Some(e);
                        if attempt_no < attempts && !policy.wait.is_zero() {
                            tokio::time::sleep(policy.wait).await;
                        }
                    }
                }
            }

            let last = last.unwrap_or_else(|| FlowError::node("batch made no attempts"));
            Err(FlowError::NodeExecution {
                node: id.clone(),
                attempts,
                message: last.to_string(),
            })
        })
    }
}

impl AsyncNode {
    /// Wrap an async batch flow as a node in a larger flow.
    pub fn batch_flow<B: AsyncBatchFlowLogic + 'static>(
        id: impl Into<NodeId>,
        batch_flow: AsyncBatchFlow<B>,
    ) -> Self {
        Self::from_runner(id.into(), Box::new(AsyncBatchFlowRunner(batch_flow)))
    }
}
