use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier for a workflow
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorkflowId(pub Uuid);

impl WorkflowId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for WorkflowId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for WorkflowId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Project that owns a workflow
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProjectId(pub String);

impl ProjectId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }
}

impl std::fmt::Display for ProjectId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique identifier for a workflow step record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StepRecordId(pub Uuid);

impl StepRecordId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for StepRecordId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for StepRecordId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Status of a workflow
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    Pending,
    Running,
    Complete,
    Failed,
}

/// Status of a workflow step (mirrors the workflow status, per step)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Running,
    Complete,
    Failed,
}

/// Directed edge between two step names: `source` must finish before `target` starts
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EdgeSpec {
    pub source: String,
    pub target: String,
}

impl EdgeSpec {
    pub fn new(source: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
        }
    }
}

/// Scheduling policy authored on a workflow
///
/// A cron expression (with `is_scheduled`) takes precedence over `run_at`,
/// which takes precedence over on-demand immediate runs.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SchedulePolicy {
    #[serde(default)]
    pub is_scheduled: bool,
    pub cron_expression: Option<String>,
    pub run_at: Option<DateTime<Utc>>,
    pub max_retries: Option<u32>,
}

/// A workflow authored in the curation editor: a named DAG of typed steps
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowRecord {
    pub id: WorkflowId,
    pub project_id: ProjectId,
    pub name: String,
    /// Parsed once when the workflow is authored; never re-parsed downstream
    pub edges: Vec<EdgeSpec>,
    pub schedule: SchedulePolicy,
    pub status: WorkflowStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WorkflowRecord {
    /// Fresh pending workflow with no schedule
    pub fn new(project_id: ProjectId, name: impl Into<String>, edges: Vec<EdgeSpec>) -> Self {
        let now = Utc::now();
        Self {
            id: WorkflowId::new(),
            project_id,
            name: name.into(),
            edges,
            schedule: SchedulePolicy::default(),
            status: WorkflowStatus::Pending,
            started_at: None,
            finished_at: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// A single typed step of a workflow
///
/// The `name` is unique within its workflow and doubles as the task-handler
/// discriminator (`start`, `document`, `chunker`, `question`, `dataset`, `end`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepRecord {
    pub id: StepRecordId,
    pub workflow_id: WorkflowId,
    pub name: String,
    /// Position in the authored node list; used only for deterministic ordering
    pub position: u32,
    /// Step-type specific configuration payload
    pub config: serde_json::Value,
    pub status: StepStatus,
    /// Serialized result of a successful run
    pub output: Option<StepOutput>,
    /// Error text when the step failed
    pub logs: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl StepRecord {
    pub fn new(
        workflow_id: WorkflowId,
        name: impl Into<String>,
        position: u32,
        config: serde_json::Value,
    ) -> Self {
        Self {
            id: StepRecordId::new(),
            workflow_id,
            name: name.into(),
            position,
            config,
            status: StepStatus::Pending,
            output: None,
            logs: None,
            started_at: None,
            finished_at: None,
        }
    }
}

/// Reference to an ingested source document
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentRef {
    pub name: String,
    pub text: String,
}

/// One chunk of a source document
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TextChunk {
    pub document: String,
    pub index: usize,
    pub text: String,
}

/// A question derived from one chunk
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GeneratedQuestion {
    pub document: String,
    pub chunk_index: usize,
    pub question: String,
    /// The chunk text the question was derived from
    pub excerpt: String,
}

/// One question/answer pair of the final dataset
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatasetEntry {
    pub question: String,
    pub answer: String,
    pub source_document: String,
    pub chunk_index: usize,
}

/// Counters reported by the `end` step
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunSummary {
    pub documents: usize,
    pub chunks: usize,
    pub questions: usize,
    pub entries: usize,
}

/// Typed output envelope produced by a step and cached for its dependents
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StepOutput {
    /// Marker emitted by the `start` step
    Started,
    Documents { documents: Vec<DocumentRef> },
    Chunks { chunks: Vec<TextChunk> },
    Questions { questions: Vec<GeneratedQuestion> },
    Dataset { entries: Vec<DatasetEntry> },
    /// Run summary emitted by the `end` step
    Finished { summary: RunSummary },
}
