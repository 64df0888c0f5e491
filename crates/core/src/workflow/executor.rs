use super::dag::WorkflowGraph;
use super::dispatcher::{StepInputs, TaskContext, TaskDispatcher};
use crate::events::{EngineEventKind, EventBus};
use crate::storage::WorkflowStore;
use crate::types::{StepOutput, StepStatus};
use anyhow::{Context, Result};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// Outcome of one DAG run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DagOutcome {
    pub success: bool,
    /// First failing step, in the failing level's declared order
    pub failed_step: Option<String>,
}

impl DagOutcome {
    pub fn success() -> Self {
        Self {
            success: true,
            failed_step: None,
        }
    }

    pub fn failed(step: impl Into<String>) -> Self {
        Self {
            success: false,
            failed_step: Some(step.into()),
        }
    }
}

/// Level-by-level DAG executor.
///
/// Walks the execution plan in order; all steps of one level are dispatched
/// concurrently and every status write for the level resolves before the next
/// level starts. A failing step halts the plan; its dependents keep their
/// prior status and are never dispatched.
pub struct DagExecutor {
    store: Arc<dyn WorkflowStore>,
    dispatcher: Arc<TaskDispatcher>,
    events: EventBus,
}

impl DagExecutor {
    pub fn new(
        store: Arc<dyn WorkflowStore>,
        dispatcher: Arc<TaskDispatcher>,
        events: EventBus,
    ) -> Self {
        Self {
            store,
            dispatcher,
            events,
        }
    }

    pub async fn execute(
        &self,
        ctx: &TaskContext,
        graph: &WorkflowGraph,
        levels: &[Vec<String>],
    ) -> Result<DagOutcome> {
        // Successful outputs of finished steps, keyed by step name; feeds the
        // inputs of every later level and dies with this run.
        let mut output_cache: HashMap<String, StepOutput> = HashMap::new();

        for (level_index, level) in levels.iter().enumerate() {
            tracing::debug!(
                "Dispatching level {} of workflow {}: {:?}",
                level_index,
                ctx.workflow_id,
                level
            );

            let mut handles = Vec::with_capacity(level.len());
            for name in level {
                let step = graph
                    .step(name)
                    .cloned()
                    .with_context(|| format!("step {} missing from graph", name))?;

                // Producers finished in earlier levels, so the cache is complete
                let mut inputs = StepInputs::new();
                for dependency in graph.dependencies_of(name) {
                    if let Some(output) = output_cache.get(&dependency) {
                        inputs.insert(dependency, output.clone());
                    }
                }

                let store = self.store.clone();
                let dispatcher = self.dispatcher.clone();
                let events = self.events.clone();
                let ctx = ctx.clone();

                handles.push(tokio::spawn(async move {
                    let name = step.name.clone();

                    if let Err(e) = store
                        .update_step_run(step.id, StepStatus::Running, None, None)
                        .await
                    {
                        return (name, Err(e));
                    }
                    events.emit(
                        ctx.workflow_id,
                        ctx.project_id.clone(),
                        EngineEventKind::StepStarted { step: name.clone() },
                    );

                    let result = dispatcher.dispatch(&ctx, &step, &inputs).await;

                    let persisted = if result.success {
                        store
                            .update_step_run(
                                step.id,
                                StepStatus::Complete,
                                result.data.clone(),
                                None,
                            )
                            .await
                    } else {
                        store
                            .update_step_run(
                                step.id,
                                StepStatus::Failed,
                                None,
                                result.error.clone(),
                            )
                            .await
                    };
                    if let Err(e) = persisted {
                        return (name, Err(e));
                    }

                    if result.success {
                        events.emit(
                            ctx.workflow_id,
                            ctx.project_id.clone(),
                            EngineEventKind::StepCompleted { step: name.clone() },
                        );
                    } else {
                        events.emit(
                            ctx.workflow_id,
                            ctx.project_id.clone(),
                            EngineEventKind::StepFailed {
                                step: name.clone(),
                                error: result.error.clone().unwrap_or_default(),
                            },
                        );
                    }

                    (name, Ok(result))
                }));
            }

            // Join the whole level; every dispatch and status write resolves here
            let mut joined = Vec::with_capacity(handles.len());
            for handle in handles {
                joined.push(handle.await.context("step task panicked")?);
            }

            let mut failed_steps: HashSet<String> = HashSet::new();
            for (name, outcome) in joined {
                // A bookkeeping failure is the one thing allowed to escape
                let result = outcome
                    .with_context(|| format!("failed to persist state for step {}", name))?;

                if result.success {
                    if let Some(output) = result.data {
                        output_cache.insert(name, output);
                    }
                } else {
                    failed_steps.insert(name);
                }
            }

            if !failed_steps.is_empty() {
                let first_failed = level
                    .iter()
                    .find(|name| failed_steps.contains(*name))
                    .expect("failed step must come from the current level")
                    .clone();

                tracing::warn!(
                    "Workflow {} halted at level {}: step {} failed",
                    ctx.workflow_id,
                    level_index,
                    first_failed
                );

                return Ok(DagOutcome::failed(first_failed));
            }
        }

        Ok(DagOutcome::success())
    }
}
