use tracing::debug;

use weft_core::{FlowError, NodeId, Outcome, Params, Result, SharedContext};

use crate::flow::{Flow, FlowOutcome};
use crate::node::{retry_loop, Node, NodeRunner, RetryPolicy};

/// Batch node contract: prepare yields an ordered sequence of items, execute
/// runs once per item, strictly sequentially, in input order.
///
/// The node's retry/fallback policy applies independently to every item. The
/// collected results, in input order, are handed to `post` as a whole.
pub trait BatchLogic: Send + Sync {
    type Item;
    type ItemOutput;

    fn prep(&self, ctx: &mut SharedContext, params: &Params) -> Result<Vec<Self::Item>>;

    fn exec_item(&self, item: &Self::Item, params: &Params) -> Result<Self::ItemOutput>;

    /// Per-item fallback; same semantics as `NodeLogic::exec_fallback`.
    fn exec_item_fallback(
        &self,
        item: &Self::Item,
        error: &FlowError,
        params: &Params,
    ) -> Result<Option<Self::ItemOutput>> {
        let _ = (item, error, params);
        Ok(None)
    }

    fn post(
        &self,
        ctx: &mut SharedContext,
        items: Vec<Self::Item>,
        outputs: Vec<Self::ItemOutput>,
        params: &Params,
    ) -> Result<Outcome>;
}

struct BatchRunner<L>(L);

impl<L: BatchLogic> NodeRunner for BatchRunner<L> {
    fn run(
        &self,
        id: &NodeId,
        policy: RetryPolicy,
        ctx: &mut SharedContext,
        params: &Params,
    ) -> Result<Outcome> {
        let items = self.0.prep(ctx, params)?;
        debug!(node = %id, items = items.len(), "running sequential batch");

        let mut outputs = Vec::with_capacity(items.len());
        for item in &items {
            let output = retry_loop(
                id,
                policy,
                || self.0.exec_item(item, params),
                |err| self.0.exec_item_fallback(item, &err, params),
            )?;
            outputs.push(output);
        }

        self.0.post(ctx, items, outputs, params)
    }
}

impl Node {
    /// A node whose execute phase iterates a sequence of items sequentially.
    pub fn batch(id: impl Into<NodeId>, logic: impl BatchLogic + 'static) -> Self {
        Self::from_runner(id.into(), Box::new(BatchRunner(logic)))
    }
}

/// Batch flow contract: prepare yields an ordered sequence of parameter sets;
/// the owning flow is traversed once per set, sequentially.
///
/// Per-iteration actions are not aggregated; effects are observed via the
/// shared context. `post` decides the batch flow's own action.
pub trait BatchFlowLogic: Send + Sync {
    fn prep(&self, ctx: &mut SharedContext, params: &Params) -> Result<Vec<Params>>;

    fn post(
        &self,
        ctx: &mut SharedContext,
        sets: Vec<Params>,
        params: &Params,
    ) -> Result<Outcome> {
        let _ = (ctx, sets, params);
        Ok(Outcome::Default)
    }
}

/// A flow run once per parameter set, each iteration being an independent
/// full traversal with that set overlaid on the flow's params.
pub struct BatchFlow<B: BatchFlowLogic> {
    flow: Flow,
    logic: B,
}

impl<B: BatchFlowLogic> BatchFlow<B> {
    pub fn new(flow: Flow, logic: B) -> Self {
        Self { flow, logic }
    }

    pub fn run(&self, ctx: &mut SharedContext) -> Result<Outcome> {
        self.run_with(ctx, &Params::default())
    }

    pub(crate) fn run_with(&self, ctx: &mut SharedContext, outer: &Params) -> Result<Outcome> {
        let start = self.flow.start_node()?;
        let base = outer.overlay(self.flow.params());
        let sets = self.logic.prep(ctx, &base)?;
        debug!(iterations = sets.len(), "running batch flow");

        for set in &sets {
            let run_params = base.overlay(set);
            match self.flow.traverse(start.clone(), ctx, &run_params)? {
                FlowOutcome::Completed(_) => {}
                FlowOutcome::Paused(cp) => return Err(FlowError::PauseInSubflow(cp.node)),
            }
        }

        self.logic.post(ctx, sets, &base)
    }
}

/// Like `SubflowRunner`, the wrapping node's retry policy re-runs the whole
/// batch (prepare and every iteration) from scratch.
struct BatchFlowRunner<B: BatchFlowLogic>(BatchFlow<B>);

impl<B: BatchFlowLogic + 'static> NodeRunner for BatchFlowRunner<B> {
    fn run(
        &self,
        id: &NodeId,
        policy: RetryPolicy,
        ctx: &mut SharedContext,
        params: &Params,
    ) -> Result<Outcome> {
        retry_loop(id, policy, || self.0.run_with(ctx, params), |_| Ok(None))
    }
}

impl Node {
    /// Wrap a batch flow as a node in a larger flow.
    pub fn batch_flow<B: BatchFlowLogic + 'static>(
        id: impl Into<NodeId>,
        batch_flow: BatchFlow<B>,
    ) -> Self {
        Self::from_runner(id.into(), Box::new(BatchFlowRunner(batch_flow)))
    }
}
