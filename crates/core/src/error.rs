//! Error types for the orchestration engine.

use crate::types::WorkflowId;

/// Result type for engine operations.
pub type EngineResult<T> = Result<T, EngineError>;

/// Structural defects in an authored workflow graph.
///
/// These abort a run before any step executes.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GraphError {
    /// An edge references a step name missing from the step list.
    #[error("edge references unknown step '{0}'")]
    UnknownStepReference(String),

    /// Two steps share one name; the step map would silently drop one.
    #[error("duplicate step name '{0}'")]
    DuplicateStep(String),

    /// The dependency graph contains a cycle.
    #[error("dependency cycle detected ({0} steps cannot be scheduled)")]
    CycleDetected(usize),
}

/// Errors surfaced by the orchestration engine.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// The workflow graph is structurally invalid.
    #[error(transparent)]
    Graph(#[from] GraphError),

    /// A step's task handler reported failure.
    #[error("step '{step}' failed: {message}")]
    TaskExecution { step: String, message: String },

    /// The backing queue could not be opened; scheduling is degraded.
    #[error("scheduling unavailable: {0}")]
    Unavailable(String),

    /// A job already exists under the key and `force` was not requested.
    #[error("a job is already scheduled under '{key}'")]
    SchedulingConflict { key: String },

    /// A cron expression could not be parsed.
    #[error("invalid cron expression '{expression}': {message}")]
    InvalidCron { expression: String, message: String },

    /// A queued job points at a workflow that no longer exists.
    #[error("workflow {0} not found")]
    WorkflowNotFound(WorkflowId),

    /// Persistence or queue bookkeeping failed mid-operation.
    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

impl EngineError {
    /// Whether the queue should retry the job that hit this error.
    ///
    /// Infrastructure failures engage the queue's backoff retry; structural
    /// and task-logic failures are terminal and live on the workflow record.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Storage(_) | Self::Unavailable(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(EngineError::Storage(anyhow::anyhow!("disk full")).is_retryable());
        assert!(EngineError::Unavailable("queue closed".to_string()).is_retryable());

        assert!(!EngineError::Graph(GraphError::CycleDetected(2)).is_retryable());
        assert!(!EngineError::TaskExecution {
            step: "chunker".to_string(),
            message: "bad input".to_string(),
        }
        .is_retryable());
        assert!(!EngineError::SchedulingConflict {
            key: "workflow:p:w".to_string(),
        }
        .is_retryable());
    }

    #[test]
    fn test_graph_error_display() {
        let err = GraphError::UnknownStepReference("chunker".to_string());
        assert!(err.to_string().contains("unknown step 'chunker'"));
    }
}
