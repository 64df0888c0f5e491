use crate::types::{ProjectId, StepOutput, StepRecord, WorkflowId};
use anyhow::Result;
use std::collections::HashMap;
use std::sync::Arc;

/// Inputs handed to a task handler: upstream step name -> its cached output
pub type StepInputs = HashMap<String, StepOutput>;

/// Identity of the run a task executes under
#[derive(Debug, Clone)]
pub struct TaskContext {
    pub workflow_id: WorkflowId,
    pub project_id: ProjectId,
}

/// Uniform result envelope returned for every dispatch
#[derive(Debug, Clone)]
pub struct TaskResult {
    pub success: bool,
    pub data: Option<StepOutput>,
    pub error: Option<String>,
}

impl TaskResult {
    pub fn ok(data: StepOutput) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(error.into()),
        }
    }
}

/// Business logic of one step type.
///
/// Handlers validate the shape of their inputs and return the typed output
/// envelope; errors they raise are caught at the dispatch boundary.
#[async_trait::async_trait]
pub trait TaskHandler: Send + Sync {
    async fn execute(
        &self,
        ctx: &TaskContext,
        step: &StepRecord,
        inputs: &StepInputs,
    ) -> Result<StepOutput>;
}

/// Maps a step's declared type to its registered handler
pub struct TaskDispatcher {
    handlers: HashMap<String, Arc<dyn TaskHandler>>,
}

impl TaskDispatcher {
    /// Empty registry; callers register their own handlers
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    /// Registry preloaded with the built-in curation step types
    pub fn with_builtin_handlers() -> Self {
        let mut dispatcher = Self::new();
        dispatcher.register("start", Arc::new(crate::tasks::StartHandler));
        dispatcher.register("document", Arc::new(crate::tasks::DocumentHandler));
        dispatcher.register("chunker", Arc::new(crate::tasks::ChunkerHandler));
        dispatcher.register("question", Arc::new(crate::tasks::QuestionHandler));
        dispatcher.register("dataset", Arc::new(crate::tasks::DatasetHandler));
        dispatcher.register("end", Arc::new(crate::tasks::EndHandler));
        dispatcher
    }

    pub fn register(&mut self, name: impl Into<String>, handler: Arc<dyn TaskHandler>) {
        self.handlers.insert(name.into(), handler);
    }

    pub fn has_handler(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    /// Run the handler registered for the step's type.
    ///
    /// Handler errors never escape; they come back as failed envelopes so a
    /// bad step cannot take down its siblings.
    pub async fn dispatch(
        &self,
        ctx: &TaskContext,
        step: &StepRecord,
        inputs: &StepInputs,
    ) -> TaskResult {
        let Some(handler) = self.handlers.get(step.name.as_str()) else {
            return TaskResult::failed(format!("unknown step type '{}'", step.name));
        };

        match handler.execute(ctx, step, inputs).await {
            Ok(output) => TaskResult::ok(output),
            Err(e) => {
                tracing::warn!(
                    "Step {} handler failed for workflow {}: {:#}",
                    step.name,
                    ctx.workflow_id,
                    e
                );
                TaskResult::failed(e.to_string())
            }
        }
    }
}

impl Default for TaskDispatcher {
    fn default() -> Self {
        Self::new()
    }
}
