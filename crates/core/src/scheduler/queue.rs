use crate::error::EngineError;
use crate::types::{ProjectId, WorkflowId};
use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use redb::{Database, ReadableTable, ReadableTableMetadata, TableDefinition};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

const JOBS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("jobs");

/// Queue priority of on-demand immediate runs
pub const IMMEDIATE_PRIORITY: u8 = 10;

/// Deterministic queue key: one logical job per (project, workflow)
pub fn job_key(project_id: &ProjectId, workflow_id: WorkflowId) -> String {
    format!("workflow:{}:{}", project_id, workflow_id)
}

/// When and how often a job fires
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JobSchedule {
    /// Run as soon as a worker is free
    Immediate,
    /// Run once at the given instant
    Delayed { run_at: DateTime<Utc> },
    /// Re-arm after every run on a cron expression
    Recurring { cron: String },
}

/// Queue state of a job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Pending,
    Active,
}

/// One durable queue entry: a request to execute a full workflow run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRecord {
    pub key: String,
    pub workflow_id: WorkflowId,
    pub project_id: ProjectId,
    pub schedule: JobSchedule,
    pub state: JobState,
    pub priority: u8,
    pub next_run_at: DateTime<Utc>,
    pub attempts_made: u32,
    pub max_attempts: u32,
    pub backoff_base_secs: u64,
    pub last_error: Option<String>,
    pub enqueued_at: DateTime<Utc>,
    pub claimed_at: Option<DateTime<Utc>>,
}

/// Durable job queue with at most one row per job key (redb-backed).
///
/// Delivery is at-least-once: a claimed job that is never completed or failed
/// comes back via [`JobQueue::reclaim_stalled`].
pub struct JobQueue {
    db: Arc<Database>,
}

impl JobQueue {
    pub fn open(path: PathBuf) -> Result<Self> {
        // Create parent directory if needed
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).context("Failed to create queue directory")?;
        }

        let db = Database::create(&path).context("Failed to create queue database")?;

        let write_txn = db.begin_write().context("Failed to begin write transaction")?;
        {
            let _jobs_table = write_txn
                .open_table(JOBS_TABLE)
                .context("Failed to open jobs table")?;
        }
        write_txn.commit().context("Failed to commit transaction")?;

        Ok(Self { db: Arc::new(db) })
    }

    /// Add a job under its key.
    ///
    /// With `force` any existing job under the key is replaced; without it an
    /// existing pending or active job is a scheduling conflict.
    pub fn put(&self, record: JobRecord, force: bool) -> Result<(), EngineError> {
        if !force && self.get(&record.key)?.is_some() {
            return Err(EngineError::SchedulingConflict {
                key: record.key.clone(),
            });
        }

        self.write_job(&record)?;
        Ok(())
    }

    /// Remove the job under the key; `false` when none existed.
    pub fn remove(&self, key: &str) -> Result<bool> {
        let write_txn = self.db.begin_write().context("Failed to begin write")?;
        let existed;
        {
            let mut table = write_txn
                .open_table(JOBS_TABLE)
                .context("Failed to open table")?;
            existed = table.remove(key).context("Failed to remove job")?.is_some();
        }
        write_txn.commit().context("Failed to commit")?;
        Ok(existed)
    }

    pub fn get(&self, key: &str) -> Result<Option<JobRecord>> {
        let read_txn = self.db.begin_read().context("Failed to begin read")?;
        let table = read_txn
            .open_table(JOBS_TABLE)
            .context("Failed to open table")?;

        let value = table.get(key).context("Failed to get job")?;

        match value {
            Some(guard) => {
                let record: JobRecord =
                    serde_json::from_slice(guard.value()).context("Failed to deserialize job")?;
                Ok(Some(record))
            }
            None => Ok(None),
        }
    }

    /// Number of jobs currently in the queue (any state)
    pub fn len(&self) -> Result<usize> {
        let read_txn = self.db.begin_read().context("Failed to begin read")?;
        let table = read_txn
            .open_table(JOBS_TABLE)
            .context("Failed to open table")?;
        Ok(table.len().context("Failed to count jobs")? as usize)
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Atomically claim up to `limit` due pending jobs, highest priority and
    /// oldest deadline first, marking them active.
    pub fn claim_due(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<JobRecord>> {
        let write_txn = self.db.begin_write().context("Failed to begin write")?;
        let mut claimed = Vec::new();
        {
            let mut table = write_txn
                .open_table(JOBS_TABLE)
                .context("Failed to open table")?;

            let mut due: Vec<JobRecord> = Vec::new();
            for item in table.iter().context("Failed to iterate jobs")? {
                let (_key, value) = item.context("Failed to read item")?;
                let record: JobRecord =
                    serde_json::from_slice(value.value()).context("Failed to deserialize job")?;
                if record.state == JobState::Pending && record.next_run_at <= now {
                    due.push(record);
                }
            }

            due.sort_by(|a, b| {
                b.priority
                    .cmp(&a.priority)
                    .then(a.next_run_at.cmp(&b.next_run_at))
            });

            for mut record in due.into_iter().take(limit) {
                record.state = JobState::Active;
                record.claimed_at = Some(now);

                let value = serde_json::to_vec(&record).context("Failed to serialize job")?;
                table
                    .insert(record.key.as_str(), value.as_slice())
                    .context("Failed to update job")?;

                claimed.push(record);
            }
        }
        write_txn.commit().context("Failed to commit")?;

        Ok(claimed)
    }

    /// Settle a job after a successful run: recurring jobs re-arm at the next
    /// cron occurrence with attempts reset, one-shots leave the queue.
    pub fn complete(&self, key: &str, now: DateTime<Utc>) -> Result<()> {
        let Some(mut record) = self.get(key)? else {
            return Ok(());
        };

        match &record.schedule {
            JobSchedule::Recurring { cron } => {
                record.next_run_at = next_cron_occurrence(cron, now)?;
                record.state = JobState::Pending;
                record.attempts_made = 0;
                record.claimed_at = None;
                record.last_error = None;
                self.write_job(&record)?;
            }
            _ => {
                self.remove(key)?;
            }
        }

        Ok(())
    }

    /// Settle a job after a failed run.
    ///
    /// Retryable failures with attempts left re-arm with exponential backoff;
    /// otherwise recurring jobs wait for their next occurrence and one-shots
    /// leave the queue (the workflow record carries the failure).
    pub fn fail(&self, key: &str, error: &str, retryable: bool, now: DateTime<Utc>) -> Result<()> {
        let Some(mut record) = self.get(key)? else {
            return Ok(());
        };

        record.attempts_made += 1;
        record.last_error = Some(error.to_string());

        if retryable && record.attempts_made < record.max_attempts {
            let backoff_secs =
                record.backoff_base_secs * 2_u64.pow(record.attempts_made.saturating_sub(1));
            record.next_run_at = now + Duration::seconds(backoff_secs as i64);
            record.state = JobState::Pending;
            record.claimed_at = None;

            tracing::info!(
                "Retrying job {} in {}s (attempt {}/{})",
                key,
                backoff_secs,
                record.attempts_made + 1,
                record.max_attempts
            );

            self.write_job(&record)?;
            return Ok(());
        }

        match &record.schedule {
            JobSchedule::Recurring { cron } => {
                record.next_run_at = next_cron_occurrence(cron, now)?;
                record.state = JobState::Pending;
                record.attempts_made = 0;
                record.claimed_at = None;
                self.write_job(&record)?;
            }
            _ => {
                self.remove(key)?;
            }
        }

        Ok(())
    }

    /// Requeue active jobs whose worker died; returns how many came back.
    pub fn reclaim_stalled(&self, older_than_secs: i64, now: DateTime<Utc>) -> Result<usize> {
        let cutoff = now - Duration::seconds(older_than_secs);

        let write_txn = self.db.begin_write().context("Failed to begin write")?;
        let mut reclaimed = 0;
        {
            let mut table = write_txn
                .open_table(JOBS_TABLE)
                .context("Failed to open table")?;

            let mut stalled: Vec<JobRecord> = Vec::new();
            for item in table.iter().context("Failed to iterate jobs")? {
                let (_key, value) = item.context("Failed to read item")?;
                let record: JobRecord =
                    serde_json::from_slice(value.value()).context("Failed to deserialize job")?;
                if record.state == JobState::Active
                    && record.claimed_at.map(|at| at < cutoff).unwrap_or(true)
                {
                    stalled.push(record);
                }
            }

            for mut record in stalled {
                tracing::warn!("Reclaiming stalled job {}", record.key);
                record.state = JobState::Pending;
                record.claimed_at = None;

                let value = serde_json::to_vec(&record).context("Failed to serialize job")?;
                table
                    .insert(record.key.as_str(), value.as_slice())
                    .context("Failed to update job")?;
                reclaimed += 1;
            }
        }
        write_txn.commit().context("Failed to commit")?;

        Ok(reclaimed)
    }

    fn write_job(&self, record: &JobRecord) -> Result<()> {
        let write_txn = self.db.begin_write().context("Failed to begin write")?;
        {
            let mut table = write_txn
                .open_table(JOBS_TABLE)
                .context("Failed to open table")?;

            let value = serde_json::to_vec(record).context("Failed to serialize job")?;
            table
                .insert(record.key.as_str(), value.as_slice())
                .context("Failed to insert job")?;
        }
        write_txn.commit().context("Failed to commit")?;
        Ok(())
    }
}

/// Next fire instant strictly after `after`.
///
/// The cron crate wants a leading seconds column; plain 5-field expressions
/// are accepted by prepending one.
pub fn next_cron_occurrence(
    expression: &str,
    after: DateTime<Utc>,
) -> Result<DateTime<Utc>, EngineError> {
    let fields = expression.split_whitespace().count();
    let normalized = if fields == 5 {
        format!("0 {}", expression)
    } else {
        expression.to_string()
    };

    let schedule =
        cron::Schedule::from_str(&normalized).map_err(|e| EngineError::InvalidCron {
            expression: expression.to_string(),
            message: e.to_string(),
        })?;

    schedule
        .after(&after)
        .next()
        .ok_or_else(|| EngineError::InvalidCron {
            expression: expression.to_string(),
            message: "no future occurrence".to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn test_queue() -> (TempDir, JobQueue) {
        let temp_dir = TempDir::new().unwrap();
        let queue = JobQueue::open(temp_dir.path().join("jobs.redb")).unwrap();
        (temp_dir, queue)
    }

    fn test_job(key: &str, schedule: JobSchedule, next_run_at: DateTime<Utc>) -> JobRecord {
        JobRecord {
            key: key.to_string(),
            workflow_id: WorkflowId::new(),
            project_id: ProjectId::new("proj"),
            schedule,
            state: JobState::Pending,
            priority: 0,
            next_run_at,
            attempts_made: 0,
            max_attempts: 3,
            backoff_base_secs: 5,
            last_error: None,
            enqueued_at: Utc::now(),
            claimed_at: None,
        }
    }

    #[test]
    fn test_put_without_force_conflicts() {
        let (_guard, queue) = test_queue();
        let now = Utc::now();

        queue
            .put(test_job("workflow:p:w", JobSchedule::Immediate, now), false)
            .unwrap();

        let err = queue
            .put(test_job("workflow:p:w", JobSchedule::Immediate, now), false)
            .unwrap_err();
        assert!(matches!(err, EngineError::SchedulingConflict { .. }));
        assert_eq!(queue.len().unwrap(), 1);
    }

    #[test]
    fn test_put_with_force_replaces() {
        let (_guard, queue) = test_queue();
        let now = Utc::now();

        queue
            .put(test_job("workflow:p:w", JobSchedule::Immediate, now), false)
            .unwrap();
        let replacement = test_job(
            "workflow:p:w",
            JobSchedule::Delayed {
                run_at: now + Duration::hours(1),
            },
            now + Duration::hours(1),
        );
        queue.put(replacement, true).unwrap();

        assert_eq!(queue.len().unwrap(), 1);
        let stored = queue.get("workflow:p:w").unwrap().unwrap();
        assert!(matches!(stored.schedule, JobSchedule::Delayed { .. }));
    }

    #[test]
    fn test_remove_is_idempotent() {
        let (_guard, queue) = test_queue();

        queue
            .put(
                test_job("workflow:p:w", JobSchedule::Immediate, Utc::now()),
                false,
            )
            .unwrap();

        assert!(queue.remove("workflow:p:w").unwrap());
        assert!(!queue.remove("workflow:p:w").unwrap());
    }

    #[test]
    fn test_delayed_job_invisible_until_due() {
        let (_guard, queue) = test_queue();
        let now = Utc::now();
        let run_at = now + Duration::minutes(30);

        queue
            .put(
                test_job("workflow:p:w", JobSchedule::Delayed { run_at }, run_at),
                false,
            )
            .unwrap();

        assert!(queue.claim_due(now, 10).unwrap().is_empty());

        let claimed = queue.claim_due(run_at + Duration::seconds(1), 10).unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].state, JobState::Active);
    }

    #[test]
    fn test_claimed_jobs_are_not_reclaimed_while_active() {
        let (_guard, queue) = test_queue();
        let now = Utc::now();

        queue
            .put(test_job("workflow:p:w", JobSchedule::Immediate, now), false)
            .unwrap();

        assert_eq!(queue.claim_due(now, 10).unwrap().len(), 1);
        // Second poll sees nothing: the job is active
        assert!(queue.claim_due(now, 10).unwrap().is_empty());
    }

    #[test]
    fn test_higher_priority_claims_first() {
        let (_guard, queue) = test_queue();
        let now = Utc::now();

        let early = test_job("workflow:p:a", JobSchedule::Immediate, now - Duration::minutes(5));
        let mut urgent = test_job("workflow:p:b", JobSchedule::Immediate, now);
        urgent.priority = IMMEDIATE_PRIORITY;

        queue.put(early, false).unwrap();
        queue.put(urgent, false).unwrap();

        let claimed = queue.claim_due(now, 1).unwrap();
        assert_eq!(claimed[0].key, "workflow:p:b");
    }

    #[test]
    fn test_retryable_failure_backs_off_exponentially() {
        let (_guard, queue) = test_queue();
        let now = Utc::now();

        queue
            .put(test_job("workflow:p:w", JobSchedule::Immediate, now), false)
            .unwrap();
        queue.claim_due(now, 1).unwrap();

        queue.fail("workflow:p:w", "db unreachable", true, now).unwrap();
        let first = queue.get("workflow:p:w").unwrap().unwrap();
        assert_eq!(first.state, JobState::Pending);
        assert_eq!(first.attempts_made, 1);
        assert_eq!(first.next_run_at, now + Duration::seconds(5));

        queue.claim_due(first.next_run_at, 1).unwrap();
        queue
            .fail("workflow:p:w", "db unreachable", true, first.next_run_at)
            .unwrap();
        let second = queue.get("workflow:p:w").unwrap().unwrap();
        assert_eq!(second.attempts_made, 2);
        // Base delay doubles on the second retry
        assert_eq!(second.next_run_at, first.next_run_at + Duration::seconds(10));
    }

    #[test]
    fn test_exhausted_one_shot_leaves_the_queue() {
        let (_guard, queue) = test_queue();
        let now = Utc::now();

        let mut job = test_job("workflow:p:w", JobSchedule::Immediate, now);
        job.max_attempts = 1;
        queue.put(job, false).unwrap();
        queue.claim_due(now, 1).unwrap();

        queue.fail("workflow:p:w", "db unreachable", true, now).unwrap();

        assert!(queue.get("workflow:p:w").unwrap().is_none());
    }

    #[test]
    fn test_terminal_failure_skips_backoff() {
        let (_guard, queue) = test_queue();
        let now = Utc::now();

        queue
            .put(test_job("workflow:p:w", JobSchedule::Immediate, now), false)
            .unwrap();
        queue.claim_due(now, 1).unwrap();

        // Task-logic failure: never retried even with attempts left
        queue.fail("workflow:p:w", "step failed", false, now).unwrap();

        assert!(queue.get("workflow:p:w").unwrap().is_none());
    }

    #[test]
    fn test_recurring_job_rearms_after_completion() {
        let (_guard, queue) = test_queue();
        let now = Utc::now();

        queue
            .put(
                test_job(
                    "workflow:p:w",
                    JobSchedule::Recurring {
                        cron: "*/5 * * * *".to_string(),
                    },
                    now,
                ),
                false,
            )
            .unwrap();
        queue.claim_due(now, 1).unwrap();

        queue.complete("workflow:p:w", now).unwrap();

        let rearmed = queue.get("workflow:p:w").unwrap().unwrap();
        assert_eq!(rearmed.state, JobState::Pending);
        assert_eq!(rearmed.attempts_made, 0);
        assert!(rearmed.next_run_at > now);
        assert!(rearmed.next_run_at <= now + Duration::minutes(5));
    }

    #[test]
    fn test_recurring_job_rearms_after_terminal_failure() {
        let (_guard, queue) = test_queue();
        let now = Utc::now();

        queue
            .put(
                test_job(
                    "workflow:p:w",
                    JobSchedule::Recurring {
                        cron: "0 0 * * *".to_string(),
                    },
                    now,
                ),
                false,
            )
            .unwrap();
        queue.claim_due(now, 1).unwrap();

        queue.fail("workflow:p:w", "step failed", false, now).unwrap();

        let rearmed = queue.get("workflow:p:w").unwrap().unwrap();
        assert_eq!(rearmed.state, JobState::Pending);
        assert!(rearmed.next_run_at > now);
        assert_eq!(rearmed.last_error.as_deref(), Some("step failed"));
    }

    #[test]
    fn test_one_shot_completion_leaves_the_queue() {
        let (_guard, queue) = test_queue();
        let now = Utc::now();

        queue
            .put(test_job("workflow:p:w", JobSchedule::Immediate, now), false)
            .unwrap();
        queue.claim_due(now, 1).unwrap();
        queue.complete("workflow:p:w", now).unwrap();

        assert!(queue.is_empty().unwrap());
    }

    #[test]
    fn test_stalled_jobs_are_reclaimed() {
        let (_guard, queue) = test_queue();
        let now = Utc::now();

        queue
            .put(test_job("workflow:p:w", JobSchedule::Immediate, now), false)
            .unwrap();
        queue.claim_due(now, 1).unwrap();

        // Too fresh to reclaim
        assert_eq!(queue.reclaim_stalled(300, now).unwrap(), 0);

        let later = now + Duration::seconds(301);
        assert_eq!(queue.reclaim_stalled(300, later).unwrap(), 1);

        let record = queue.get("workflow:p:w").unwrap().unwrap();
        assert_eq!(record.state, JobState::Pending);
        assert!(record.claimed_at.is_none());
    }

    #[test]
    fn test_next_cron_occurrence_accepts_five_fields() {
        let now = Utc::now();
        let next = next_cron_occurrence("*/15 * * * *", now).unwrap();
        assert!(next > now);
        assert!(next <= now + Duration::minutes(15));
    }

    #[test]
    fn test_next_cron_occurrence_rejects_garbage() {
        let err = next_cron_occurrence("not a cron", Utc::now()).unwrap_err();
        assert!(matches!(err, EngineError::InvalidCron { .. }));
    }

    #[test]
    fn test_job_key_format() {
        let workflow_id = WorkflowId::new();
        let key = job_key(&ProjectId::new("proj-1"), workflow_id);
        assert_eq!(key, format!("workflow:proj-1:{}", workflow_id));
    }
}
