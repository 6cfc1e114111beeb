//! Persistence port for jobs and their executions.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use uuid::Uuid;

use crate::errors::FlowError;

use super::model::{JobExecution, JobStatus, ScheduledJob};

/// Storage contract for the scheduling subsystem.
///
/// Implementations are shared between dispatcher and consumer processes;
/// every write must be visible to the other side before the call
/// returns, so a crashed worker can be resumed from stored state.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Inserts or replaces a job.
    async fn put(&self, job: ScheduledJob) -> Result<(), FlowError>;

    /// Fetches a job by id.
    async fn get(&self, id: Uuid) -> Result<Option<ScheduledJob>, FlowError>;

    /// Active jobs with `next_run <= now`, ordered by priority
    /// descending then `next_run` ascending, capped at `limit`.
    async fn due_jobs(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<ScheduledJob>, FlowError>;

    /// Inserts or replaces an execution record.
    async fn record_execution(&self, execution: JobExecution) -> Result<(), FlowError>;

    /// Fetches an execution by id.
    async fn execution(&self, id: Uuid) -> Result<Option<JobExecution>, FlowError>;

    /// All executions recorded for a job.
    async fn executions_for(&self, job_id: Uuid) -> Result<Vec<JobExecution>, FlowError>;
}

/// In-memory store for tests and single-process deployments.
#[derive(Debug, Default)]
pub struct InMemoryJobStore {
    jobs: DashMap<Uuid, ScheduledJob>,
    executions: DashMap<Uuid, JobExecution>,
}

impl InMemoryJobStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn put(&self, job: ScheduledJob) -> Result<(), FlowError> {
        self.jobs.insert(job.id, job);
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<ScheduledJob>, FlowError> {
        Ok(self.jobs.get(&id).map(|entry| entry.clone()))
    }

    async fn due_jobs(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<ScheduledJob>, FlowError> {
        let mut due: Vec<ScheduledJob> = self
            .jobs
            .iter()
            .filter(|entry| {
                entry.status == JobStatus::Active
                    && entry.next_run.is_some_and(|next| next <= now)
            })
            .map(|entry| entry.clone())
            .collect();

        due.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then_with(|| a.next_run.cmp(&b.next_run))
        });
        due.truncate(limit);
        Ok(due)
    }

    async fn record_execution(&self, execution: JobExecution) -> Result<(), FlowError> {
        self.executions.insert(execution.id, execution);
        Ok(())
    }

    async fn execution(&self, id: Uuid) -> Result<Option<JobExecution>, FlowError> {
        Ok(self.executions.get(&id).map(|entry| entry.clone()))
    }

    async fn executions_for(&self, job_id: Uuid) -> Result<Vec<JobExecution>, FlowError> {
        let mut runs: Vec<JobExecution> = self
            .executions
            .iter()
            .filter(|entry| entry.job_id == job_id)
            .map(|entry| entry.clone())
            .collect();
        runs.sort_by_key(|run| run.scheduled_at);
        Ok(runs)
    }
}
