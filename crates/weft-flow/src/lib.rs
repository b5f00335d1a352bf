//! Graph engine: nodes with a prepare/execute/finalize lifecycle, wired into
//! flows that route on the action each node returns.
//!
//! Flows nest (a flow wraps into a node), iterate (batch nodes and batch
//! flows), fan out (parallel batch variants with a concurrency cap), and
//! pause into serializable checkpoints that a later process resumes.

pub mod async_flow;
pub mod async_node;
pub mod batch;
pub mod flow;
pub mod node;
pub mod parallel;

pub use async_flow::{AsyncBatchFlow, AsyncBatchFlowLogic, AsyncFlow};
pub use async_node::{AsyncBatchLogic, AsyncNode, AsyncNodeLogic};
pub use batch::{BatchFlow, BatchFlowLogic, BatchLogic};
pub use flow::{Flow, FlowOutcome};
pub use node::{Node, NodeLogic, RetryPolicy};
pub use parallel::{
    ParallelBatchFlow, ParallelBatchFlowLogic, ParallelBatchLogic, DEFAULT_FAN_OUT,
};

pub use weft_core::{
    Action, AggregateBatchError, Checkpoint, FlowError, ItemFailure, NodeId, Outcome, Params,
    Result, SharedContext,
};
