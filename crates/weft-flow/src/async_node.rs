use std::time::Duration;

use futures::future::BoxFuture;
use tracing::{debug, warn};

use weft_core::{FlowError, NodeId, Outcome, Params, Result, SharedContext};

use crate::node::RetryPolicy;

/// Three-phase node contract with suspension points.
///
/// Identical semantics to `NodeLogic`, but every phase may await an external
/// operation. One logical task runs at a time: no sibling node work proceeds
/// while a phase (or a retry wait) is suspended. Async traits are erased with
/// `BoxFuture` rather than a macro.
pub trait AsyncNodeLogic: Send + Sync {
    type Prep: Send + Sync + 'static;
    type Output: Send + Sync + 'static;

    fn prep<'a>(
        &'a self,
        ctx: &'a mut SharedContext,
        params: &'a Params,
    ) -> BoxFuture<'a, Result<Self::Prep>>;

    fn exec<'a>(
        &'a self,
        prep: &'a Self::Prep,
        params: &'a Params,
    ) -> BoxFuture<'a, Result<Self::Output>>;

    /// Last-resort substitute after retries exhaust; same semantics as
    /// `NodeLogic::exec_fallback`.
    fn exec_fallback<'a>(
        &'a self,
        prep: &'a Self::Prep,
        error: &'a FlowError,
        params: &'a Params,
    ) -> BoxFuture<'a, Result<Option<Self::Output>>> {
        let _ = (prep, error, params);
        Box::pin(async { Ok(None) })
    }

    fn post<'a>(
        &'a self,
        ctx: &'a mut SharedContext,
        prep: Self::Prep,
        output: Self::Output,
        params: &'a Params,
    ) -> BoxFuture<'a, Result<Outcome>>;
}

/// Object-safe runner behind `AsyncNode`.
pub(crate) trait AsyncNodeRunner: Send + Sync {
    fn run<'a>(
        &'a self,
        id: &'a NodeId,
        policy: RetryPolicy,
        ctx: &'a mut SharedContext,
        params: &'a Params,
    ) -> BoxFuture<'a, Result<Outcome>>;
}

struct AsyncLogicRunner<L>(L);

impl<L: AsyncNodeLogic> AsyncNodeRunner for AsyncLogicRunner<L> {
    fn run<'a>(
        &'a self,
        id: &'a NodeId,
        policy: RetryPolicy,
        ctx: &'a mut SharedContext,
        params: &'a Params,
    ) -> BoxFuture<'a, Result<Outcome>> {
        Box::pin(async move {
            let prep = self.0.prep(ctx, params).await?;
            let prep_ref = &prep;
            let output = retry_loop_async(
                id,
                policy,
                move || self.0.exec(prep_ref, params),
                move |err| {
                    Box::pin(async move { self.0.exec_fallback(prep_ref, &err, params).await })
                },
            )
            .await?;
            self.0.post(ctx, prep, output, params).await
        })
    }
}

/// Awaiting twin of `node::retry_loop`; the inter-attempt wait is a
/// suspension point, not a blocking sleep.
pub(crate) async fn retry_loop_async<'a, T>(
    id: &'a NodeId,
    policy: RetryPolicy,
    mut attempt: impl FnMut() -> BoxFuture<'a, Result<T>> + 'a,
    fallback: impl FnOnce(FlowError) -> BoxFuture<'a, Result<Option<T>>> + 'a,
) -> Result<T> {
    let attempts = policy.attempts();
    let mut last: Option<FlowError> = None;

    for attempt_no in 1..=attempts {
        match attempt().await {
            Ok(out) => return Ok(out),
            // A pause is a control signal, not a failure; it is never
            // retried or masked by a fallback.
            Err(e @ FlowError::PauseInSubflow(_)) => return Err(e),
            Err(e) => {
                warn!(node = %id, attempt = attempt_no, error = %e, "execute attempt failed");
                last = Some(e);
                if attempt_no < attempts && !policy.wait.is_zero() {
                    tokio::time::sleep(policy.wait).await;
                }
            }
        }
    }

    let last = last.unwrap_or_else(|| FlowError::node("execute made no attempts"));
    let message = last.to_string();
    match fallback(last).await {
        Ok(Some(out)) => {
            debug!(node = %id, "fallback substituted a result");
            Ok(out)
        }
        Ok(None) => Err(FlowError::NodeExecution {
            node: id.clone(),
            attempts,
            message,
        }),
        Err(e) => Err(FlowError::NodeFallback {
            node: id.clone(),
            message: e.to_string(),
        }),
    }
}

/// Awaiting counterpart of `Node`: same identity, retry policy, and params.
pub struct AsyncNode {
    id: NodeId,
    runner: Box<dyn AsyncNodeRunner>,
    policy: RetryPolicy,
    params: Params,
}

impl AsyncNode {
    pub fn new(id: impl Into<NodeId>, logic: impl AsyncNodeLogic + 'static) -> Self {
        Self::from_runner(id.into(), Box::new(AsyncLogicRunner(logic)))
    }

    pub(crate) fn from_runner(id: NodeId, runner: Box<dyn AsyncNodeRunner>) -> Self {
        Self {
            id,
            runner,
            policy: RetryPolicy::default(),
            params: Params::default(),
        }
    }

    /// Total execute attempts before the fallback runs.
    pub fn with_retries(mut self, max_attempts: u32) -> Self {
        self.policy.max_attempts = max_attempts.max(1);
        self
    }

    /// Wait between execute attempts (a suspension point).
    pub fn with_wait(mut self, wait: Duration) -> Self {
        self.policy.wait = wait;
        self
    }

    /// Static params; they win over flow params on key collision.
    pub fn with_params(mut self, params: Params) -> Self {
        self.params = params;
        self
    }

    pub fn id(&self) -> &NodeId {
        &self.id
    }

    /// Run this node on its own, outside any flow.
    pub async fn run(&self, ctx: &mut SharedContext) -> Result<Outcome> {
        self.run_with(ctx, &Params::default()).await
    }

    pub(crate) async fn run_with(
        &self,
        ctx: &mut SharedContext,
        run_params: &Params,
    ) -> Result<Outcome> {
        let effective = run_params.overlay(&self.params);
        self.runner.run(&self.id, self.policy, ctx, &effective).await
    }
}

impl std::fmt::Debug for AsyncNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AsyncNode")
            .field("id", &self.id)
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

/// Awaiting counterpart of `BatchLogic`: items still run strictly
/// sequentially, in input order, but each may suspend.
pub trait AsyncBatchLogic: Send + Sync {
    type Item: Send + Sync;
    type ItemOutput: Send;

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

    /// Per-item fallback; same semantics as `NodeLogic::exec_fallback`.
    fn exec_item_fallback<'a>(
        &'a self,
        item: &'a Self::Item,
        error: &'a FlowError,
        params: &'a Params,
    ) -> BoxFuture<'a, Result<Option<Self::ItemOutput>>> {
        let _ = (item, error, params);
        Box::pin(async { Ok(None) })
    }

    fn post<'a>(
        &'a self,
        ctx: &'a mut SharedContext,
        items: Vec<Self::Item>,
        outputs: Vec<Self::ItemOutput>,
        params: &'a Params,
    ) -> BoxFuture<'a, Result<Outcome>>;
}

struct AsyncBatchRunner<L>(L);

impl<L: AsyncBatchLogic> AsyncNodeRunner for AsyncBatchRunner<L> {
    fn run<'a>(
        &'a self,
        id: &'a NodeId,
        policy: RetryPolicy,
        ctx: &'a mut SharedContext,
        params: &'a Params,
    ) -> BoxFuture<'a, Result<Outcome>> {
        Box::pin(async move {
            let items = self.0.prep(ctx, params).await?;
            debug!(node = %id, items = items.len(), "running sequential async batch");

            let mut outputs = Vec::with_capacity(items.len());
            for item in &items {
                let output = retry_loop_async(
                    id,
                    policy,
                    move || self.0.exec_item(item, params),
                    move |err| {
                        Box::pin(async move {
                            self.0.exec_item_fallback(item, &err, params).await
                        })
                    },
                )
                .await?;
                outputs.push(output);
            }

            self.0.post(ctx, items, outputs, params).await
        })
    }
}

impl AsyncNode {
    /// A node whose execute phase iterates a sequence of items sequentially,
    /// awaiting each.
    pub fn batch(id: impl Into<NodeId>, logic: impl AsyncBatchLogic + 'static) -> Self {
        Self::from_runner(id.into(), Box::new(AsyncBatchRunner(logic)))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    /// Awaits a tiny sleep, then echoes its prep input uppercased.
    struct Shout;

    impl AsyncNodeLogic for Shout {
        type Prep = String;
        type Output = String;

        fn prep<'a>(
            &'a self,
            ctx: &'a mut SharedContext,
            _params: &'a Params,
        ) -> BoxFuture<'a, Result<String>> {
            Box::pin(async move {
                ctx.get_str("input")
                    .map(str::to_string)
                    .ok_or_else(|| FlowError::node("missing input"))
            })
        }

        fn exec<'a>(
            &'a self,
            prep: &'a String,
            _params: &'a Params,
        ) -> BoxFuture<'a, Result<String>> {
            Box::pin(async move {
                tokio::time::sleep(Duration::from_millis(1)).await;
                Ok(prep.to_uppercase())
            })
        }

        fn post<'a>(
            &'a self,
            ctx: &'a mut SharedContext,
            _prep: String,
            output: String,
            _params: &'a Params,
        ) -> BoxFuture<'a, Result<Outcome>> {
            Box::pin(async move {
                ctx.set_str("output", output);
                Ok(Outcome::Default)
            })
        }
    }

    #[tokio::test]
    async fn test_async_lifecycle() {
        let node = AsyncNode::new("shout", Shout);
        let mut ctx = SharedContext::new();
        ctx.set_str("input", "quiet");

        let outcome = node.run(&mut ctx).await.unwrap();
        assert_eq!(outcome, Outcome::Default);
        assert_eq!(ctx.get_str("output"), Some("QUIET"));
    }

    /// Fails the first `fail_times` exec calls.
    struct FlakyAsync {
        fail_times: u32,
        calls: AtomicU32,
        fallback: Option<i64>,
    }

    impl AsyncNodeLogic for FlakyAsync {
        type Prep = ();
        type Output = i64;

        fn prep<'a>(
            &'a self,
            _ctx: &'a mut SharedContext,
            _params: &'a Params,
        ) -> BoxFuture<'a, Result<()>> {
            Box::pin(async { Ok(()) })
        }

        fn exec<'a>(&'a self, _prep: &'a (), _params: &'a Params) -> BoxFuture<'a, Result<i64>> {
            Box::pin(async move {
                let n = self.calls.fetch_add(1, Ordering::SeqCst);
                if n < self.fail_times {
                    Err(FlowError::node("transient failure"))
                } else {
                    Ok(99)
                }
            })
        }

        fn exec_fallback<'a>(
            &'a self,
            _prep: &'a (),
            _error: &'a FlowError,
            _params: &'a Params,
        ) -> BoxFuture<'a, Result<Option<i64>>> {
            Box::pin(async move { Ok(self.fallback) })
        }

        fn post<'a>(
            &'a self,
            ctx: &'a mut SharedContext,
            _prep: (),
            output: i64,
            _params: &'a Params,
        ) -> BoxFuture<'a, Result<Outcome>> {
            Box::pin(async move {
                ctx.set("result", serde_json::json!(output));
                Ok(Outcome::Default)
            })
        }
    }

    #[tokio::test]
    async fn test_async_retry_recovers() {
        let node = AsyncNode::new(
            "flaky",
            FlakyAsync {
                fail_times: 2,
                calls: AtomicU32::new(0),
                fallback: None,
            },
        )
        .with_retries(3)
        .with_wait(Duration::from_millis(1));

        let mut ctx = SharedContext::new();
        node.run(&mut ctx).await.unwrap();
        assert_eq!(ctx.get("result"), Some(&serde_json::json!(99)));
    }

    #[tokio::test]
    async fn test_async_retry_bound_then_fallback() {
        let node = AsyncNode::new(
            "flaky",
            FlakyAsync {
                fail_times: u32::MAX,
                calls: AtomicU32::new(0),
                fallback: Some(-7),
            },
        )
        .with_retries(2);

        let mut ctx = SharedContext::new();
        node.run(&mut ctx).await.unwrap();
        assert_eq!(ctx.get("result"), Some(&serde_json::json!(-7)));
    }

    #[tokio::test]
    async fn test_async_exhaustion_without_fallback() {
        let node = AsyncNode::new(
            "flaky",
            FlakyAsync {
                fail_times: u32::MAX,
                calls: AtomicU32::new(0),
                fallback: None,
            },
        )
        .with_retries(3);

        let mut ctx = SharedContext::new();
        let err = node.run(&mut ctx).await.unwrap_err();
        assert!(matches!(
            err,
            FlowError::NodeExecution { attempts: 3, .. }
        ));
    }

    /// Multiplies each input item by ten after a short suspension.
    struct SeqTenTimes;

    impl AsyncBatchLogic for SeqTenTimes {
        type Item = i64;
        type ItemOutput = i64;

        fn prep<'a>(
            &'a self,
            ctx: &'a mut SharedContext,
            _params: &'a Params,
        ) -> BoxFuture<'a, Result<Vec<i64>>> {
            Box::pin(async move { Ok(ctx.get_as("items").unwrap_or_default()) })
        }

        fn exec_item<'a>(&'a self, item: &'a i64, _params: &'a Params) -> BoxFuture<'a, Result<i64>> {
            Box::pin(async move {
                tokio::time::sleep(Duration::from_millis(1)).await;
                Ok(item * 10)
            })
        }

        fn post<'a>(
            &'a self,
            ctx: &'a mut SharedContext,
            _items: Vec<i64>,
            outputs: Vec<i64>,
            _params: &'a Params,
        ) -> BoxFuture<'a, Result<Outcome>> {
            Box::pin(async move {
                ctx.set("results", serde_json::json!(outputs));
                Ok(Outcome::Default)
            })
        }
    }

    #[tokio::test]
    async fn test_sequential_async_batch() {
        let node = AsyncNode::batch("tens", SeqTenTimes);
        let mut ctx = SharedContext::new();
        ctx.set("items", serde_json::json!([1, 2, 3]));

        node.run(&mut ctx).await.unwrap();
        assert_eq!(ctx.get_as::<Vec<i64>>("results"), Some(vec![10, 20, 30]));
    }
}
