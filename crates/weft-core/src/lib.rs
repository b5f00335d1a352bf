pub mod action;
pub mod checkpoint;
pub mod context;
pub mod error;
pub mod params;
pub mod types;

pub use action::{Action, Outcome};
pub use checkpoint::Checkpoint;
pub use context::SharedContext;
pub use error::{AggregateBatchError, FlowError, ItemFailure, Result};
pub use params::Params;
pub use types::NodeId;
