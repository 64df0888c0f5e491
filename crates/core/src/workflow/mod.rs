// DAG-based workflow execution engine

pub mod dag;
pub mod dispatcher;
pub mod executor;
pub mod levels;

pub use dag::WorkflowGraph;
pub use dispatcher::{StepInputs, TaskContext, TaskDispatcher, TaskHandler, TaskResult};
pub use executor::{DagExecutor, DagOutcome};
pub use levels::execution_levels;
