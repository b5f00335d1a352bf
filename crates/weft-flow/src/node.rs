use std::time::Duration;

use tracing::{debug, warn};

use weft_core::{FlowError, NodeId, Outcome, Params, Result, SharedContext};

/// Retry policy for a node's execute phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total execute attempts before the fallback runs (minimum 1).
    pub max_attempts: u32,
    /// Wait between attempts.
    pub wait: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 1,
            wait: Duration::ZERO,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, wait: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            wait,
        }
    }

    pub(crate) fn attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }
}

/// Three-phase node contract: prepare, execute (retried), finalize.
///
/// `exec` deliberately receives no shared context: retries repeat it
/// wholesale, so it must operate only on the value `prep` handed it.
pub trait NodeLogic: Send + Sync {
    type Prep;
    type Output;

    /// Read from the shared context and assemble the execute input.
    fn prep(&self, ctx: &mut SharedContext, params: &Params) -> Result<Self::Prep>;

    /// The unit of work.
    fn exec(&self, prep: &Self::Prep, params: &Params) -> Result<Self::Output>;

    /// Last-resort substitute after retries exhaust. Runs once.
    ///
    /// `Ok(Some(out))` substitutes a result and execution proceeds to `post`;
    /// `Ok(None)` (the default) reports the retries as exhausted;
    /// `Err(e)` reports the fallback itself as failed.
    fn exec_fallback(
        &self,
        prep: &Self::Prep,
        error: &FlowError,
        params: &Params,
    ) -> Result<Option<Self::Output>> {
        let _ = (prep, error, params);
        Ok(None)
    }

    /// Write results back to the shared context and pick the next action.
    fn post(
        &self,
        ctx: &mut SharedContext,
        prep: Self::Prep,
        output: Self::Output,
        params: &Params,
    ) -> Result<Outcome>;
}

/// Object-safe runner behind `Node`; erases `NodeLogic`'s associated types.
pub(crate) trait NodeRunner: Send + Sync {
    fn run(
        &self,
        id: &NodeId,
        policy: RetryPolicy,
        ctx: &mut SharedContext,
        params: &Params,
    ) -> Result<Outcome>;
}

struct LogicRunner<L>(L);

impl<L: NodeLogic> NodeRunner for LogicRunner<L> {
    fn run(
        &self,
        id: &NodeId,
        policy: RetryPolicy,
        ctx: &mut SharedContext,
        params: &Params,
    ) -> Result<Outcome> {
        let prep = self.0.prep(ctx, params)?;
        let output = retry_loop(
            id,
            policy,
            || self.0.exec(&prep, params),
            |err| self.0.exec_fallback(&prep, &err, params),
        )?;
        self.0.post(ctx, prep, output, params)
    }
}

/// Run `attempt` up to the policy's budget, sleeping between attempts, then
/// give `fallback` its single shot.
pub(crate) fn retry_loop<T>(
    id: &NodeId,
    policy: RetryPolicy,
    mut attempt: impl FnMut() -> Result<T>,
    fallback: impl FnOnce(FlowError) -> Result<Option<T>>,
) -> Result<T> {
    let attempts = policy.attempts();
    let mut last: Option<FlowError> = None;

    for attempt_no in 1..=attempts {
        match attempt() {
            Ok(out) => return Ok(out),
            // A pause is a control signal, not a failure; it is never
            // retried or masked by a fallback.
            Err(e @ FlowError::PauseInSubflow(_)) => return Err(e),
            Err(e) => {
                warn!(node = %id, attempt = attempt_no, error = %e, "execute attempt failed");
                last = Some(e);
                if attempt_no < attempts && !policy.wait.is_zero() {
                    std::thread::sleep(policy.wait);
                }
            }
        }
    }

    let last = last.unwrap_or_else(|| FlowError::node("execute made no attempts"));
    let message = last.to_string();
    match fallback(last) {
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

/// A unit of work registrable in a `Flow`: logic plus identity, retry policy,
/// and static params.
///
/// Built once, reusable across many runs; retry counters are run-scoped and
/// never stored on the node.
pub struct Node {
    id: NodeId,
    runner: Box<dyn NodeRunner>,
    policy: RetryPolicy,
    params: Params,
}

impl Node {
    pub fn new(id: impl Into<NodeId>, logic: impl NodeLogic + 'static) -> Self {
        Self::from_runner(id.into(), Box::new(LogicRunner(logic)))
    }

    pub(crate) fn from_runner(id: NodeId, runner: Box<dyn NodeRunner>) -> Self {
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

    /// Wait between execute attempts.
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
    pub fn run(&self, ctx: &mut SharedContext) -> Result<Outcome> {
        self.run_with(ctx, &Params::default())
    }

    pub(crate) fn run_with(&self, ctx: &mut SharedContext, run_params: &Params) -> Result<Outcome> {
        let effective = run_params.overlay(&self.params);
        self.runner.run(&self.id, self.policy, ctx, &effective)
    }
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("id", &self.id)
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}
