use crate::types::{
    StepOutput, StepRecord, StepRecordId, StepStatus, WorkflowId, WorkflowRecord, WorkflowStatus,
};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use redb::{Database, ReadableTable, TableDefinition};
use std::path::PathBuf;
use std::sync::Arc;

const WORKFLOWS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("workflows");
const STEPS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("workflow_steps");

/// Persistence boundary for workflow and step records.
///
/// The executor and scheduler are the only writers during a run; hosts read.
#[async_trait::async_trait]
pub trait WorkflowStore: Send + Sync {
    async fn put_workflow(&self, workflow: &WorkflowRecord) -> Result<()>;

    async fn get_workflow(&self, id: WorkflowId) -> Result<Option<WorkflowRecord>>;

    async fn put_step(&self, step: &StepRecord) -> Result<()>;

    async fn get_step(&self, id: StepRecordId) -> Result<Option<StepRecord>>;

    /// All steps of a workflow in authored order.
    async fn steps_for_workflow(&self, workflow_id: WorkflowId) -> Result<Vec<StepRecord>>;

    /// Update a workflow's run state; `started_at`/`finished_at` are set when given.
    async fn update_workflow_run(
        &self,
        id: WorkflowId,
        status: WorkflowStatus,
        started_at: Option<DateTime<Utc>>,
        finished_at: Option<DateTime<Utc>>,
    ) -> Result<()>;

    /// Record one step status transition with its output or error text.
    async fn update_step_run(
        &self,
        id: StepRecordId,
        status: StepStatus,
        output: Option<StepOutput>,
        logs: Option<String>,
    ) -> Result<()>;
}

/// Workflow store backed by redb
#[derive(Clone)]
pub struct RedbWorkflowStore {
    db: Arc<Database>,
}

impl RedbWorkflowStore {
    pub fn new(path: PathBuf) -> Result<Self> {
        // Create parent directory if needed
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).context("Failed to create store directory")?;
        }

        let db = Database::create(&path).context("Failed to create redb database")?;

        // Initialize tables
        let write_txn = db.begin_write().context("Failed to begin write transaction")?;
        {
            let _workflows_table = write_txn
                .open_table(WORKFLOWS_TABLE)
                .context("Failed to open workflows table")?;
            let _steps_table = write_txn
                .open_table(STEPS_TABLE)
                .context("Failed to open steps table")?;
        }
        write_txn.commit().context("Failed to commit transaction")?;

        Ok(Self { db: Arc::new(db) })
    }

    fn write_workflow(&self, workflow: &WorkflowRecord) -> Result<()> {
        let write_txn = self.db.begin_write().context("Failed to begin write")?;
        {
            let mut table = write_txn
                .open_table(WORKFLOWS_TABLE)
                .context("Failed to open table")?;

            let key = workflow.id.to_string();
            let value = serde_json::to_vec(workflow).context("Failed to serialize workflow")?;

            table
                .insert(key.as_str(), value.as_slice())
                .context("Failed to insert workflow")?;
        }
        write_txn.commit().context("Failed to commit")?;
        Ok(())
    }

    fn read_workflow(&self, id: WorkflowId) -> Result<Option<WorkflowRecord>> {
        let read_txn = self.db.begin_read().context("Failed to begin read")?;
        let table = read_txn
            .open_table(WORKFLOWS_TABLE)
            .context("Failed to open table")?;

        let key = id.to_string();
        let value = table.get(key.as_str()).context("Failed to get workflow")?;

        match value {
            Some(guard) => {
                let workflow: WorkflowRecord = serde_json::from_slice(guard.value())
                    .context("Failed to deserialize workflow")?;
                Ok(Some(workflow))
            }
            None => Ok(None),
        }
    }

    fn write_step(&self, step: &StepRecord) -> Result<()> {
        let write_txn = self.db.begin_write().context("Failed to begin write")?;
        {
            let mut table = write_txn
                .open_table(STEPS_TABLE)
                .context("Failed to open table")?;

            let key = step.id.to_string();
            let value = serde_json::to_vec(step).context("Failed to serialize step")?;

            table
                .insert(key.as_str(), value.as_slice())
                .context("Failed to insert step")?;
        }
        write_txn.commit().context("Failed to commit")?;
        Ok(())
    }

    fn read_step(&self, id: StepRecordId) -> Result<Option<StepRecord>> {
        let read_txn = self.db.begin_read().context("Failed to begin read")?;
        let table = read_txn
            .open_table(STEPS_TABLE)
            .context("Failed to open table")?;

        let key = id.to_string();
        let value = table.get(key.as_str()).context("Failed to get step")?;

        match value {
            Some(guard) => {
                let step: StepRecord =
                    serde_json::from_slice(guard.value()).context("Failed to deserialize step")?;
                Ok(Some(step))
            }
            None => Ok(None),
        }
    }
}

#[async_trait::async_trait]
impl WorkflowStore for RedbWorkflowStore {
    async fn put_workflow(&self, workflow: &WorkflowRecord) -> Result<()> {
        self.write_workflow(workflow)
    }

    async fn get_workflow(&self, id: WorkflowId) -> Result<Option<WorkflowRecord>> {
        self.read_workflow(id)
    }

    async fn put_step(&self, step: &StepRecord) -> Result<()> {
        self.write_step(step)
    }

    async fn get_step(&self, id: StepRecordId) -> Result<Option<StepRecord>> {
        self.read_step(id)
    }

    async fn steps_for_workflow(&self, workflow_id: WorkflowId) -> Result<Vec<StepRecord>> {
        let read_txn = self.db.begin_read().context("Failed to begin read")?;
        let table = read_txn
            .open_table(STEPS_TABLE)
            .context("Failed to open table")?;

        let mut steps = Vec::new();
        for item in table.iter().context("Failed to iterate steps")? {
            let (_key, value) = item.context("Failed to read item")?;
            let step: StepRecord =
                serde_json::from_slice(value.value()).context("Failed to deserialize step")?;
            if step.workflow_id == workflow_id {
                steps.push(step);
            }
        }

        steps.sort_by_key(|s| s.position);

        Ok(steps)
    }

    async fn update_workflow_run(
        &self,
        id: WorkflowId,
        status: WorkflowStatus,
        started_at: Option<DateTime<Utc>>,
        finished_at: Option<DateTime<Utc>>,
    ) -> Result<()> {
        let mut workflow = self.read_workflow(id)?.context("Workflow not found")?;

        workflow.status = status;
        if started_at.is_some() {
            workflow.started_at = started_at;
        }
        if finished_at.is_some() {
            workflow.finished_at = finished_at;
        }
        workflow.updated_at = Utc::now();

        self.write_workflow(&workflow)
    }

    async fn update_step_run(
        &self,
        id: StepRecordId,
        status: StepStatus,
        output: Option<StepOutput>,
        logs: Option<String>,
    ) -> Result<()> {
        let mut step = self.read_step(id)?.context("Step not found")?;

        step.status = status;
        match status {
            StepStatus::Running => {
                step.started_at = Some(Utc::now());
            }
            StepStatus::Complete | StepStatus::Failed => {
                step.finished_at = Some(Utc::now());
            }
            StepStatus::Pending => {}
        }
        if output.is_some() {
            step.output = output;
        }
        if logs.is_some() {
            step.logs = logs;
        }

        self.write_step(&step)
    }
}
