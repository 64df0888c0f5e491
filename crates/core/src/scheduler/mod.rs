// Durable job scheduling for workflow runs

pub mod queue;
pub mod worker;

pub use queue::{job_key, JobQueue, JobRecord, JobSchedule, JobState};
pub use worker::{JobRunner, WorkerOptions, WorkerPool, WorkflowJobRunner};

use crate::config::{EngineConfig, SchedulerConfig};
use crate::error::{EngineError, EngineResult};
use crate::events::{EngineEvent, EventBus};
use crate::storage::WorkflowStore;
use crate::types::{ProjectId, WorkflowId};
use crate::workflow::dispatcher::TaskDispatcher;
use chrono::Utc;
use queue::IMMEDIATE_PRIORITY;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::sync::Mutex;

/// Options for scheduling one workflow
#[derive(Debug, Clone, Copy, Default)]
pub struct ScheduleOptions {
    /// Replace any existing job under the key
    pub force: bool,
    /// Enqueue a high-priority run when the workflow has no schedule policy
    pub immediate: bool,
}

/// What `schedule_workflow` decided to do
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScheduleOutcome {
    Recurring,
    Delayed,
    Immediate,
    /// The workflow has no schedule and no immediate run was requested
    Skipped,
}

/// Options for starting the worker pool
#[derive(Debug, Clone, Copy)]
pub struct WorkerInitOptions {
    pub concurrency: Option<usize>,
    pub auto_start: bool,
}

impl Default for WorkerInitOptions {
    fn default() -> Self {
        Self {
            concurrency: None,
            auto_start: true,
        }
    }
}

/// Durable scheduling service over the job queue and worker pool.
///
/// Constructed once at the host's composition root. When the queue cannot be
/// opened the service degrades to unavailable instead of failing the host;
/// callers check [`JobScheduler::is_available`] to skip scheduling gracefully.
pub struct JobScheduler {
    queue: Option<Arc<JobQueue>>,
    store: Arc<dyn WorkflowStore>,
    dispatcher: Arc<TaskDispatcher>,
    events: EventBus,
    config: SchedulerConfig,
    worker: Mutex<Option<WorkerPool>>,
}

impl JobScheduler {
    pub fn new(
        config: &EngineConfig,
        store: Arc<dyn WorkflowStore>,
        dispatcher: Arc<TaskDispatcher>,
    ) -> Self {
        let queue = match JobQueue::open(config.queue_path()) {
            Ok(queue) => Some(Arc::new(queue)),
            Err(e) => {
                tracing::warn!("Job queue unavailable, scheduling disabled: {:#}", e);
                None
            }
        };

        Self {
            queue,
            store,
            dispatcher,
            events: EventBus::default(),
            config: config.scheduler.clone(),
            worker: Mutex::new(None),
        }
    }

    /// Whether the backing queue opened successfully
    pub fn is_available(&self) -> bool {
        self.queue.is_some()
    }

    /// Whether a worker pool is currently polling
    pub async fn is_worker_running(&self) -> bool {
        self.worker
            .lock()
            .await
            .as_ref()
            .map(|pool| pool.is_running())
            .unwrap_or(false)
    }

    /// Subscribe to job and step lifecycle events
    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }

    /// Enqueue exactly one job for the workflow under its deterministic key.
    ///
    /// The workflow's schedule policy decides the job shape: a cron expression
    /// wins over `run_at`, which wins over an on-demand immediate run; with
    /// none of the three this is an explicit no-op.
    pub async fn schedule_workflow(
        &self,
        workflow_id: WorkflowId,
        project_id: &ProjectId,
        options: ScheduleOptions,
    ) -> EngineResult<ScheduleOutcome> {
        let Some(queue) = &self.queue else {
            tracing::warn!("Scheduling skipped, job queue is not open");
            return Err(EngineError::Unavailable("job queue is not open".to_string()));
        };

        let workflow = self
            .store
            .get_workflow(workflow_id)
            .await?
            .ok_or(EngineError::WorkflowNotFound(workflow_id))?;

        let key = job_key(project_id, workflow_id);
        let now = Utc::now();
        let policy = &workflow.schedule;

        let (schedule, next_run_at, priority, outcome) = if policy.is_scheduled
            && policy.cron_expression.is_some()
        {
            let cron = policy.cron_expression.clone().unwrap_or_default();
            let first_run = queue::next_cron_occurrence(&cron, now)?;
            (
                JobSchedule::Recurring { cron },
                first_run,
                0,
                ScheduleOutcome::Recurring,
            )
        } else if let Some(run_at) = policy.run_at {
            // A run_at in the past fires on the next poll
            (
                JobSchedule::Delayed { run_at },
                run_at.max(now),
                0,
                ScheduleOutcome::Delayed,
            )
        } else if options.immediate {
            (
                JobSchedule::Immediate,
                now,
                IMMEDIATE_PRIORITY,
                ScheduleOutcome::Immediate,
            )
        } else {
            tracing::debug!("Workflow {} has no schedule, nothing to enqueue", workflow_id);
            return Ok(ScheduleOutcome::Skipped);
        };

        let record = JobRecord {
            key: key.clone(),
            workflow_id,
            project_id: project_id.clone(),
            schedule,
            state: JobState::Pending,
            priority,
            next_run_at,
            attempts_made: 0,
            max_attempts: policy.max_retries.unwrap_or(self.config.default_max_attempts),
            backoff_base_secs: self.config.backoff_base_secs,
            last_error: None,
            enqueued_at: now,
            claimed_at: None,
        };

        queue.put(record, options.force)?;

        tracing::info!("Scheduled {:?} job under {}", outcome, key);
        Ok(outcome)
    }

    /// Remove the workflow's job if present; `false` when there was none.
    pub async fn delete_workflow(
        &self,
        workflow_id: WorkflowId,
        project_id: &ProjectId,
    ) -> EngineResult<bool> {
        let Some(queue) = &self.queue else {
            return Err(EngineError::Unavailable("job queue is not open".to_string()));
        };

        let key = job_key(project_id, workflow_id);
        let removed = queue.remove(&key)?;

        if removed {
            tracing::info!("Removed job {}", key);
        }
        Ok(removed)
    }

    /// Start the worker pool; a no-op when one is already running.
    pub async fn initialize_worker(&self, options: WorkerInitOptions) -> EngineResult<()> {
        let Some(queue) = &self.queue else {
            return Err(EngineError::Unavailable("job queue is not open".to_string()));
        };

        let mut worker = self.worker.lock().await;
        if worker.as_ref().map(|pool| pool.is_running()).unwrap_or(false) {
            tracing::info!("Worker pool already running, ignoring initialize");
            return Ok(());
        }

        if !options.auto_start {
            tracing::info!("Worker auto-start disabled, not polling");
            return Ok(());
        }

        let runner = Arc::new(WorkflowJobRunner::new(
            self.store.clone(),
            self.dispatcher.clone(),
            self.events.clone(),
        ));

        *worker = Some(WorkerPool::start(
            queue.clone(),
            runner,
            self.events.clone(),
            WorkerOptions {
                concurrency: options.concurrency.unwrap_or(self.config.concurrency),
                poll_interval: Duration::from_millis(self.config.poll_interval_ms),
                stalled_after_secs: self.config.stalled_after_secs,
            },
        ));

        Ok(())
    }

    /// Drain the worker pool; the queue closes when the service drops.
    pub async fn shutdown(&self) {
        if let Some(pool) = self.worker.lock().await.take() {
            pool.shutdown().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StorageConfig;
    use crate::storage::RedbWorkflowStore;
    use crate::types::{
        EdgeSpec, SchedulePolicy, StepOutput, StepRecord, StepStatus, WorkflowRecord,
        WorkflowStatus,
    };
    use chrono::Duration as ChronoDuration;
    use tempfile::TempDir;

    struct Fixture {
        _temp_dir: TempDir,
        store: Arc<RedbWorkflowStore>,
        scheduler: JobScheduler,
    }

    fn fixture() -> Fixture {
        let temp_dir = TempDir::new().unwrap();
        let config = EngineConfig {
            data_dir: temp_dir.path().to_path_buf(),
            storage: StorageConfig::default(),
            scheduler: SchedulerConfig {
                concurrency: 2,
                poll_interval_ms: 10,
                backoff_base_secs: 0,
                default_max_attempts: 3,
                stalled_after_secs: 300,
            },
        };

        let store = Arc::new(RedbWorkflowStore::new(config.index_path()).unwrap());
        let dispatcher = Arc::new(TaskDispatcher::with_builtin_handlers());
        let scheduler = JobScheduler::new(&config, store.clone(), dispatcher);

        Fixture {
            _temp_dir: temp_dir,
            store,
            scheduler,
        }
    }

    async fn seed_workflow(fixture: &Fixture, schedule: SchedulePolicy) -> WorkflowRecord {
        let mut workflow = WorkflowRecord::new(ProjectId::new("proj"), "curation", vec![]);
        workflow.schedule = schedule;
        fixture.store.put_workflow(&workflow).await.unwrap();
        workflow
    }

    fn queue(fixture: &Fixture) -> &JobQueue {
        fixture.scheduler.queue.as_deref().unwrap()
    }

    #[tokio::test]
    async fn test_cron_takes_precedence_over_run_at() {
        let fixture = fixture();
        let workflow = seed_workflow(
            &fixture,
            SchedulePolicy {
                is_scheduled: true,
                cron_expression: Some("0 0 * * *".to_string()),
                run_at: Some(Utc::now() + ChronoDuration::hours(1)),
                max_retries: None,
            },
        )
        .await;

        let outcome = fixture
            .scheduler
            .schedule_workflow(workflow.id, &workflow.project_id, ScheduleOptions::default())
            .await
            .unwrap();

        assert_eq!(outcome, ScheduleOutcome::Recurring);
        let key = job_key(&workflow.project_id, workflow.id);
        let record = queue(&fixture).get(&key).unwrap().unwrap();
        assert!(matches!(record.schedule, JobSchedule::Recurring { .. }));
    }

    #[tokio::test]
    async fn test_run_at_takes_precedence_over_immediate() {
        let fixture = fixture();
        let run_at = Utc::now() + ChronoDuration::hours(1);
        let workflow = seed_workflow(
            &fixture,
            SchedulePolicy {
                run_at: Some(run_at),
                ..Default::default()
            },
        )
        .await;

        let outcome = fixture
            .scheduler
            .schedule_workflow(
                workflow.id,
                &workflow.project_id,
                ScheduleOptions {
                    immediate: true,
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        assert_eq!(outcome, ScheduleOutcome::Delayed);
        let key = job_key(&workflow.project_id, workflow.id);
        let record = queue(&fixture).get(&key).unwrap().unwrap();
        assert_eq!(record.next_run_at, run_at);
        assert_eq!(record.priority, 0);
    }

    #[tokio::test]
    async fn test_immediate_run_is_high_priority() {
        let fixture = fixture();
        let workflow = seed_workflow(&fixture, SchedulePolicy::default()).await;

        let outcome = fixture
            .scheduler
            .schedule_workflow(
                workflow.id,
                &workflow.project_id,
                ScheduleOptions {
                    immediate: true,
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        assert_eq!(outcome, ScheduleOutcome::Immediate);
        let key = job_key(&workflow.project_id, workflow.id);
        let record = queue(&fixture).get(&key).unwrap().unwrap();
        assert_eq!(record.priority, IMMEDIATE_PRIORITY);
    }

    #[tokio::test]
    async fn test_no_policy_is_an_explicit_no_op() {
        let fixture = fixture();
        let workflow = seed_workflow(&fixture, SchedulePolicy::default()).await;

        let outcome = fixture
            .scheduler
            .schedule_workflow(workflow.id, &workflow.project_id, ScheduleOptions::default())
            .await
            .unwrap();

        assert_eq!(outcome, ScheduleOutcome::Skipped);
        assert!(queue(&fixture).is_empty().unwrap());
    }

    #[tokio::test]
    async fn test_force_rescheduling_keeps_one_job() {
        let fixture = fixture();
        let workflow = seed_workflow(&fixture, SchedulePolicy::default()).await;
        let options = ScheduleOptions {
            force: true,
            immediate: true,
        };

        fixture
            .scheduler
            .schedule_workflow(workflow.id, &workflow.project_id, options)
            .await
            .unwrap();
        fixture
            .scheduler
            .schedule_workflow(workflow.id, &workflow.project_id, options)
            .await
            .unwrap();

        assert_eq!(queue(&fixture).len().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_duplicate_scheduling_without_force_conflicts() {
        let fixture = fixture();
        let workflow = seed_workflow(&fixture, SchedulePolicy::default()).await;
        let options = ScheduleOptions {
            immediate: true,
            ..Default::default()
        };

        fixture
            .scheduler
            .schedule_workflow(workflow.id, &workflow.project_id, options)
            .await
            .unwrap();
        let err = fixture
            .scheduler
            .schedule_workflow(workflow.id, &workflow.project_id, options)
            .await
            .unwrap_err();

        assert!(matches!(err, EngineError::SchedulingConflict { .. }));
    }

    #[tokio::test]
    async fn test_scheduling_unknown_workflow_fails() {
        let fixture = fixture();

        let err = fixture
            .scheduler
            .schedule_workflow(
                WorkflowId::new(),
                &ProjectId::new("proj"),
                ScheduleOptions::default(),
            )
            .await
            .unwrap_err();

        assert!(matches!(err, EngineError::WorkflowNotFound(_)));
    }

    #[tokio::test]
    async fn test_delete_workflow_is_idempotent() {
        let fixture = fixture();
        let workflow = seed_workflow(&fixture, SchedulePolicy::default()).await;

        fixture
            .scheduler
            .schedule_workflow(
                workflow.id,
                &workflow.project_id,
                ScheduleOptions {
                    immediate: true,
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        assert!(fixture
            .scheduler
            .delete_workflow(workflow.id, &workflow.project_id)
            .await
            .unwrap());
        assert!(!fixture
            .scheduler
            .delete_workflow(workflow.id, &workflow.project_id)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_initialize_worker_twice_is_a_no_op() {
        let fixture = fixture();

        fixture
            .scheduler
            .initialize_worker(WorkerInitOptions::default())
            .await
            .unwrap();
        assert!(fixture.scheduler.is_worker_running().await);

        // Second call logs and succeeds
        fixture
            .scheduler
            .initialize_worker(WorkerInitOptions::default())
            .await
            .unwrap();
        assert!(fixture.scheduler.is_worker_running().await);

        fixture.scheduler.shutdown().await;
        assert!(!fixture.scheduler.is_worker_running().await);
    }

    #[tokio::test]
    async fn test_unavailable_queue_degrades_gracefully() {
        let temp_dir = TempDir::new().unwrap();
        // A plain file where the queue wants a directory
        let blocker = temp_dir.path().join("blocker");
        std::fs::write(&blocker, b"x").unwrap();

        let config = EngineConfig {
            data_dir: blocker.join("nested"),
            storage: StorageConfig::default(),
            scheduler: SchedulerConfig::default(),
        };
        let store =
            Arc::new(RedbWorkflowStore::new(temp_dir.path().join("workflows.redb")).unwrap());
        let scheduler = JobScheduler::new(
            &config,
            store,
            Arc::new(TaskDispatcher::with_builtin_handlers()),
        );

        assert!(!scheduler.is_available());
        let err = scheduler
            .schedule_workflow(
                WorkflowId::new(),
                &ProjectId::new("proj"),
                ScheduleOptions::default(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Unavailable(_)));
    }

    /// Full round trip: the canonical six-step curation pipeline runs through
    /// scheduling, the worker pool, and the DAG executor to completion.
    #[tokio::test]
    async fn test_pipeline_round_trip() {
        let fixture = fixture();

        let names = ["start", "document", "chunker", "question", "dataset", "end"];
        let edges: Vec<EdgeSpec> = names
            .windows(2)
            .map(|pair| EdgeSpec::new(pair[0], pair[1]))
            .collect();

        let mut workflow = WorkflowRecord::new(ProjectId::new("proj"), "curation", edges);
        workflow.schedule = SchedulePolicy::default();
        fixture.store.put_workflow(&workflow).await.unwrap();

        let mut step_ids = Vec::new();
        for (position, name) in names.iter().enumerate() {
            let config = match *name {
                "document" => serde_json::json!({
                    "documents": [
                        {"name": "guide.md", "text": "Alpha section.\n\nBeta section."}
                    ]
                }),
                "chunker" => serde_json::json!({"max_chars": 40}),
                "question" => serde_json::json!({"template": "Summarize {document}."}),
                _ => serde_json::json!({}),
            };
            let step = StepRecord::new(workflow.id, *name, position as u32, config);
            fixture.store.put_step(&step).await.unwrap();
            step_ids.push((*name, step.id));
        }

        fixture
            .scheduler
            .schedule_workflow(
                workflow.id,
                &workflow.project_id,
                ScheduleOptions {
                    immediate: true,
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        fixture
            .scheduler
            .initialize_worker(WorkerInitOptions::default())
            .await
            .unwrap();

        // Wait for the run to settle
        let deadline = tokio::time::Instant::now() + std::time::Duration::from_secs(5);
        loop {
            let current = fixture
                .store
                .get_workflow(workflow.id)
                .await
                .unwrap()
                .unwrap();
            if current.status == WorkflowStatus::Complete {
                break;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "workflow never completed (status {:?})",
                current.status
            );
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }

        fixture.scheduler.shutdown().await;

        let finished = fixture
            .store
            .get_workflow(workflow.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(finished.status, WorkflowStatus::Complete);
        assert!(finished.started_at.is_some());
        assert!(finished.finished_at.is_some());

        // Every step completed and the dataset fed the end summary
        for (name, step_id) in &step_ids {
            let step = fixture.store.get_step(*step_id).await.unwrap().unwrap();
            assert_eq!(step.status, StepStatus::Complete, "step {} not complete", name);
            assert!(step.output.is_some(), "step {} has no output", name);
        }

        let (_, end_id) = step_ids.iter().find(|(name, _)| *name == "end").unwrap();
        let end_step = fixture.store.get_step(*end_id).await.unwrap().unwrap();
        match end_step.output.unwrap() {
            StepOutput::Finished { summary } => {
                assert!(summary.entries > 0, "dataset entries never reached the end step");
            }
            other => panic!("unexpected end output {:?}", other),
        }

        // The one-shot job left the queue
        assert!(queue(&fixture).is_empty().unwrap());
    }
}
