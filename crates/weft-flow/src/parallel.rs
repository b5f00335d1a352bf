use std::sync::Arc;

use futures::future::{join_all, BoxFuture};
use serde::Serialize;
use tokio::sync::Semaphore;
use tracing::{debug, warn};

use weft_core::{
    AggregateBatchError, FlowError, ItemFailure, NodeId, Outcome, Params, Result, SharedContext,
};

use crate::async_flow::AsyncFlow;
use crate::async_node::{retry_loop_async, AsyncNode, AsyncNodeRunner};
use crate::flow::FlowOutcome;
use crate::node::RetryPolicy;

/// Default cap on concurrently running batch items or flow branches.
pub const DEFAULT_FAN_OUT: usize = 8;

fn fan_out_semaphore(limit: Option<usize>) -> Arc<Semaphore> {
    let permits = match limit {
        Some(n) => n.max(1),
        None => Semaphore::MAX_PERMITS,
    };
    Arc::new(Semaphore::new(permits))
}

/// Parallel batch contract: items run concurrently, capped by `concurrency`.
///
/// Results are collected in input order regardless of completion order. On
/// failure every item still runs to its own conclusion; the error then
/// aggregates all per-item failures alongside the serialized outputs of the
/// items that succeeded. `ItemOutput: Serialize` exists for that error
/// payload.
pub trait ParallelBatchLogic: Send + Sync {
    type Item: Send + Sync;
    type ItemOutput: Send + Serialize;

    fn prep<'a>(
        &'a self,
        ctx: &'a mut SharedContext,
        params: &'a Params,
    ) -> BoxFuture<'a, Result<Vec<Self::Item>>>;

    fn exec_item<'a>(
        &'a self,
        item: &'a Self::Item,
        params: &'a Params,
    ) -> BoxFuture<'a, Result<Self::ItemOutput>>;

    fn exec_item_fallback<'a>(
        &'a self,
        item: &'a Self::Item,
        error: &'a FlowError,
        params: &'a Params,
    ) -> BoxFuture<'a, Result<Option<Self::ItemOutput>>> {
        let _ = (item, error, params);
        Box::pin(async { Ok(None) })
    }

    /// Fan-out cap; `None` lifts the limit entirely.
    fn concurrency(&self) -> Option<usize> {
        Some(DEFAULT_FAN_OUT)
    }

    fn post<'a>(
        &'a self,
        ctx: &'a mut SharedContext,
        items: Vec<Self::Item>,
        outputs: Vec<Self::ItemOutput>,
        params: &'a Params,
    ) -> BoxFuture<'a, Result<Outcome>>;
}

struct ParallelBatchRunner<L>(L);

impl<L: ParallelBatchLogic> AsyncNodeRunner for ParallelBatchRunner<L> {
    fn run<'a>(
        &'a self,
        id: &'a NodeId,
        policy: RetryPolicy,
        ctx: &'a mut SharedContext,
        params: &'a Params,
    ) -> BoxFuture<'a, Result<Outcome>> {
        Box::pin(async move {
            let items = self.0.prep(ctx, params).await?;
            let sem = fan_out_semaphore(self.0.concurrency());
            debug!(
                node = %id,
                items = items.len(),
                concurrency = ?self.0.concurrency(),
                "running parallel batch"
            );

            let futures = items.iter().map(|item| {
                let sem = Arc::clone(&sem);
                async move {
                    let _permit = sem
                        .acquire()
                        .await
                        .map_err(|_| FlowError::node("fan-out limiter closed"))?;
                    retry_loop_async(
                        id,
                        policy,
                        move || self.0.exec_item(item, params),
                        move |err| {
                            Box::pin(async move {
                                self.0.exec_item_fallback(item, &err, params).await
                            })
                        },
                    )
                    .await
                }
            });

            // join_all preserves input order.
            let results = join_all(futures).await;

            let mut failures = Vec::new();
            let mut partial = Vec::with_capacity(results.len());
            let mut outputs = Vec::with_capacity(results.len());
            for (index, result) in results.into_iter().enumerate() {
                match result {
                    Ok(out) => {
                        partial.push(serde_json::to_value(&out).ok());
                        outputs.push(out);
                    }
                    Err(e) => {
                        partial.push(None);
                        failures.push(ItemFailure {
                            index,
                            message: e.to_string(),
                        });
                    }
                }
            }

            if !failures.is_empty() {
                return Err(AggregateBatchError {
                    total: items.len(),
                    failures,
                    partial,
                }
                .into());
            }

            self.0.post(ctx, items, outputs, params).await
        })
    }
}

impl AsyncNode {
    /// A node whose execute phase fans items out concurrently.
    pub fn parallel_batch(id: impl Into<NodeId>, logic: impl ParallelBatchLogic + 'static) -> Self {
        Self::from_runner(id.into(), Box::new(ParallelBatchRunner(logic)))
    }
}

/// Parallel batch flow contract: one full traversal per parameter set,
/// branches running concurrently under the fan-out cap.
pub trait ParallelBatchFlowLogic: Send + Sync {
    fn prep<'a>(
        &'a self,
        ctx: &'a mut SharedContext,
        params: &'a Params,
    ) -> BoxFuture<'a, Result<Vec<Params>>>;

    /// Fan-out cap; `None` lifts the limit entirely.
    fn concurrency(&self) -> Option<usize> {
        Some(DEFAULT_FAN_OUT)
    }

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

/// An async flow traversed once per parameter set, branches in parallel.
///
/// Each branch works on its own copy of the shared context; after every
/// branch finishes, the copies are merged back in set order, so on key
/// collisions the highest-indexed branch wins. If any branch fails, nothing
/// is merged and the error carries each successful branch's serialized
/// context.
pub struct ParallelBatchFlow<B: ParallelBatchFlowLogic> {
    flow: AsyncFlow,
    logic: B,
}

impl<B: ParallelBatchFlowLogic> ParallelBatchFlow<B> {
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
        let sem = fan_out_semaphore(self.logic.concurrency());
        debug!(
            branches = sets.len(),
            concurrency = ?self.logic.concurrency(),
            "running parallel batch flow"
        );

        let futures = sets.iter().map(|set| {
            let sem = Arc::clone(&sem);
            let start = start.clone();
            let run_params = base.overlay(set);
            let mut branch_ctx = ctx.clone();
            async move {
                let _permit = sem
                    .acquire()
                    .await
                    .map_err(|_| FlowError::node("fan-out limiter closed"))?;
                match self.flow.traverse(start, &mut branch_ctx, &run_params).await? {
                    FlowOutcome::Completed(_) => Ok(branch_ctx),
                    FlowOutcome::Paused(cp) => Err(FlowError::PauseInSubflow(cp.node)),
                }
            }
        });

        let results = join_all(futures).await;

        let mut failures = Vec::new();
        let mut partial = Vec::with_capacity(results.len());
        let mut branches = Vec::with_capacity(results.len());
        for (index, result) in results.into_iter().enumerate() {
            match result {
                Ok(branch_ctx) => {
                    partial.push(serde_json::to_value(&branch_ctx).ok());
                    branches.push(branch_ctx);
                }
                Err(e) => {
                    partial.push(None);
                    failures.push(ItemFailure {
                        index,
                        message: e.to_string(),
                    });
                }
            }
        }

        if !failures.is_empty() {
            return Err(AggregateBatchError {
                total: sets.len(),
                failures,
                partial,
            }
            .into());
        }

        for branch_ctx in &branches {
            ctx.merge(branch_ctx);
        }

        self.logic.post(ctx, sets, &base).await
    }
}

/// The wrapping node's retry policy re-runs the whole fan-out (prepare and
/// every branch) from scratch; the hand-written loop exists because each
/// attempt must reborrow the `&mut` context.
struct ParallelBatchFlowRunner<B: ParallelBatchFlowLogic>(ParallelBatchFlow<B>);

impl<B: ParallelBatchFlowLogic + 'static> AsyncNodeRunner for ParallelBatchFlowRunner<B> {
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
                        warn!(node = %id, attempt = attempt_no, error = %e, "parallel batch flow attempt failed");
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
    /// Wrap a parallel batch flow as a node in a larger flow.
    pub fn parallel_batch_flow<B: ParallelBatchFlowLogic + 'static>(
        id: impl Into<NodeId>,
        batch_flow: ParallelBatchFlow<B>,
    ) -> Self {
        Self::from_runner(id.into(), Box::new(ParallelBatchFlowRunner(batch_flow)))
    }
}
