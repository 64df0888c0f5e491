use super::queue::{JobQueue, JobRecord};
use crate::error::EngineError;
use crate::events::{EngineEventKind, EventBus};
use crate::storage::WorkflowStore;
use crate::types::WorkflowStatus;
use crate::workflow::dag::WorkflowGraph;
use crate::workflow::dispatcher::{TaskContext, TaskDispatcher};
use crate::workflow::executor::{DagExecutor, DagOutcome};
use crate::workflow::levels::execution_levels;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Executes one claimed job to completion
#[async_trait::async_trait]
pub trait JobRunner: Send + Sync {
    async fn run(&self, job: &JobRecord) -> Result<DagOutcome, EngineError>;
}

/// Production runner: load workflow and steps, build the graph, level it,
/// drive the DAG executor, and persist the final workflow status.
pub struct WorkflowJobRunner {
    store: Arc<dyn WorkflowStore>,
    dispatcher: Arc<TaskDispatcher>,
    events: EventBus,
}

impl WorkflowJobRunner {
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
}

#[async_trait::async_trait]
impl JobRunner for WorkflowJobRunner {
    async fn run(&self, job: &JobRecord) -> Result<DagOutcome, EngineError> {
        let workflow = self
            .store
            .get_workflow(job.workflow_id)
            .await?
            .ok_or(EngineError::WorkflowNotFound(job.workflow_id))?;
        let steps = self.store.steps_for_workflow(job.workflow_id).await?;

        let started_at = Utc::now();
        self.store
            .update_workflow_run(workflow.id, WorkflowStatus::Running, Some(started_at), None)
            .await?;
        self.events.emit(
            workflow.id,
            workflow.project_id.clone(),
            EngineEventKind::JobStarted,
        );

        let ctx = TaskContext {
            workflow_id: workflow.id,
            project_id: workflow.project_id.clone(),
        };

        let result: Result<DagOutcome, EngineError> = async {
            let graph = WorkflowGraph::build(&steps, &workflow.edges)?;
            let levels = execution_levels(&graph)?;
            let executor =
                DagExecutor::new(self.store.clone(), self.dispatcher.clone(), self.events.clone());
            Ok(executor.execute(&ctx, &graph, &levels).await?)
        }
        .await;

        let finished_at = Utc::now();
        let duration_secs = (finished_at - started_at).num_seconds();

        match result {
            Ok(outcome) if outcome.success => {
                self.store
                    .update_workflow_run(
                        workflow.id,
                        WorkflowStatus::Complete,
                        None,
                        Some(finished_at),
                    )
                    .await?;
                self.events.emit(
                    workflow.id,
                    workflow.project_id.clone(),
                    EngineEventKind::JobCompleted { duration_secs },
                );

                tracing::info!("Workflow {} completed in {}s", workflow.id, duration_secs);
                Ok(outcome)
            }
            Ok(outcome) => {
                self.store
                    .update_workflow_run(
                        workflow.id,
                        WorkflowStatus::Failed,
                        None,
                        Some(finished_at),
                    )
                    .await?;

                let step = outcome.failed_step.clone().unwrap_or_default();
                tracing::warn!("Workflow {} failed at step {}", workflow.id, step);
                Err(EngineError::TaskExecution {
                    message: format!("step '{}' failed; see its logs", step),
                    step,
                })
            }
            Err(e) => {
                // A retryable error leaves the workflow running so the queue's
                // next attempt can finish it; terminal errors settle it now.
                if !e.is_retryable() {
                    self.store
                        .update_workflow_run(
                            workflow.id,
                            WorkflowStatus::Failed,
                            None,
                            Some(finished_at),
                        )
                        .await?;
                }
                tracing::error!("Workflow {} run aborted: {}", workflow.id, e);
                Err(e)
            }
        }
    }
}

/// Worker pool options
#[derive(Debug, Clone)]
pub struct WorkerOptions {
    pub concurrency: usize,
    pub poll_interval: Duration,
    pub stalled_after_secs: i64,
}

/// Bounded pool of pollers draining the durable queue.
///
/// Each poller claims one due job at a time, so overall concurrency equals
/// the pool size. Shutdown drains in-flight jobs before returning.
pub struct WorkerPool {
    handles: Vec<JoinHandle<()>>,
    shutdown: watch::Sender<bool>,
}

impl WorkerPool {
    pub fn start(
        queue: Arc<JobQueue>,
        runner: Arc<dyn JobRunner>,
        events: EventBus,
        options: WorkerOptions,
    ) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let concurrency = options.concurrency.max(1);

        tracing::info!("Starting worker pool with concurrency {}", concurrency);

        let mut handles = Vec::with_capacity(concurrency);
        for worker_index in 0..concurrency {
            let queue = queue.clone();
            let runner = runner.clone();
            let events = events.clone();
            let options = options.clone();
            let mut shutdown_rx = shutdown_rx.clone();

            handles.push(tokio::spawn(async move {
                loop {
                    if *shutdown_rx.borrow() {
                        break;
                    }

                    // One poller doubles as the stalled-job backstop
                    if worker_index == 0 {
                        if let Err(e) =
                            queue.reclaim_stalled(options.stalled_after_secs, Utc::now())
                        {
                            tracing::warn!("Stalled-job reclaim failed: {:#}", e);
                        }
                    }

                    let job = match queue.claim_due(Utc::now(), 1) {
                        Ok(mut claimed) => claimed.pop(),
                        Err(e) => {
                            tracing::warn!("Queue poll failed: {:#}", e);
                            None
                        }
                    };

                    match job {
                        Some(job) => {
                            Self::process(&queue, runner.as_ref(), &events, &job).await;
                        }
                        None => {
                            tokio::select! {
                                _ = tokio::time::sleep(options.poll_interval) => {}
                                _ = shutdown_rx.changed() => {}
                            }
                        }
                    }
                }

                tracing::debug!("Worker {} stopped", worker_index);
            }));
        }

        Self {
            handles,
            shutdown: shutdown_tx,
        }
    }

    async fn process(queue: &JobQueue, runner: &dyn JobRunner, events: &EventBus, job: &JobRecord) {
        tracing::info!("Processing job {}", job.key);

        match runner.run(job).await {
            Ok(_) => {
                if let Err(e) = queue.complete(&job.key, Utc::now()) {
                    tracing::error!("Failed to settle completed job {}: {:#}", job.key, e);
                }
            }
            Err(e) => {
                let retryable = e.is_retryable();
                let will_retry = retryable && job.attempts_made + 1 < job.max_attempts;

                events.emit(
                    job.workflow_id,
                    job.project_id.clone(),
                    EngineEventKind::JobFailed {
                        error: e.to_string(),
                        will_retry,
                    },
                );

                if let Err(qe) = queue.fail(&job.key, &e.to_string(), retryable, Utc::now()) {
                    tracing::error!("Failed to settle failed job {}: {:#}", job.key, qe);
                }
            }
        }
    }

    /// Whether any poller is still alive
    pub fn is_running(&self) -> bool {
        self.handles.iter().any(|handle| !handle.is_finished())
    }

    /// Stop polling and wait for in-flight jobs to finish
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        for handle in self.handles {
            let _ = handle.await;
        }
        tracing::info!("Worker pool drained");
    }
}
