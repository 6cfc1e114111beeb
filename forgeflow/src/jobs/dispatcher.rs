//! The job dispatcher worker.
//!
//! Ticks on a fixed interval, queries due jobs, enforces per-job
//! concurrency through the shared key-value store, and publishes
//! dispatch messages mirrored onto the durable jobs stream. An atomic
//! running guard skips a tick entirely when the previous one is still
//! processing; ticks never queue up.

use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use uuid::Uuid;

use crate::bus::{MessageBus, PublishOptions};
use crate::config::FlowConfig;
use crate::envelope::EventEnvelope;
use crate::errors::FlowError;
use crate::retry::with_retry;
use crate::store::KeyValueStore;

use super::model::{JobDispatch, JobExecution, JobExecutionStatus, JobStatus, JobType, ScheduledJob};
use super::schedule::{next_run_after, validate_schedule};
use super::store::JobStore;
use super::{running_slot_key, JOBS_STREAM, JOBS_TOPIC};

/// Cumulative dispatcher counters.
#[derive(Debug, Default)]
struct Counters {
    jobs_dispatched: AtomicU64,
    jobs_skipped: AtomicU64,
    jobs_completed: AtomicU64,
    errors: AtomicU64,
}

/// Point-in-time view of the dispatcher counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatcherStats {
    /// Dispatch messages published.
    pub jobs_dispatched: u64,
    /// Due jobs skipped by the concurrency limit.
    pub jobs_skipped: u64,
    /// Jobs that reached `Completed` (budget or schedule exhausted).
    pub jobs_completed: u64,
    /// Dispatch attempts that failed after retries.
    pub errors: u64,
}

/// Periodically dispatches due jobs onto the bus.
pub struct JobDispatcher {
    store: Arc<dyn JobStore>,
    kv: Arc<dyn KeyValueStore>,
    bus: Arc<dyn MessageBus>,
    config: FlowConfig,
    running: AtomicBool,
    counters: Counters,
}

impl JobDispatcher {
    /// Creates a dispatcher.
    #[must_use]
    pub fn new(
        store: Arc<dyn JobStore>,
        kv: Arc<dyn KeyValueStore>,
        bus: Arc<dyn MessageBus>,
        config: FlowConfig,
    ) -> Self {
        Self {
            store,
            kv,
            bus,
            config,
            running: AtomicBool::new(false),
            counters: Counters::default(),
        }
    }

    /// Current counter values.
    #[must_use]
    pub fn stats(&self) -> DispatcherStats {
        DispatcherStats {
            jobs_dispatched: self.counters.jobs_dispatched.load(Ordering::Relaxed),
            jobs_skipped: self.counters.jobs_skipped.load(Ordering::Relaxed),
            jobs_completed: self.counters.jobs_completed.load(Ordering::Relaxed),
            errors: self.counters.errors.load(Ordering::Relaxed),
        }
    }

    /// Validates and activates a job, computing its first `next_run`.
    ///
    /// # Errors
    ///
    /// Rejects invalid cron expressions and unknown timezones
    /// synchronously; nothing is stored on failure.
    pub async fn submit(&self, mut job: ScheduledJob) -> Result<ScheduledJob, FlowError> {
        validate_schedule(&job)?;

        match job.job_type {
            JobType::Cron | JobType::Recurring => {
                job.next_run = next_run_after(&job, Utc::now())?;
                job.status = if job.next_run.is_some() {
                    JobStatus::Active
                } else {
                    JobStatus::Completed
                };
            }
            JobType::OneTime => {
                if job.next_run.is_none() {
                    job.next_run = Some(Utc::now());
                }
                job.status = JobStatus::Active;
            }
            JobType::Event => {
                job.next_run = None;
                job.status = JobStatus::Active;
            }
        }

        self.store.put(job.clone()).await?;
        tracing::info!(job_id = %job.id, name = %job.name, next_run = ?job.next_run, "job submitted");
        Ok(job)
    }

    /// Dispatches a job immediately, regardless of its schedule. The
    /// path event-type jobs are fired through.
    ///
    /// # Errors
    ///
    /// Fails for unknown jobs and on exhausted publish retries.
    pub async fn trigger(&self, job_id: Uuid) -> Result<(), FlowError> {
        let job = self
            .store
            .get(job_id)
            .await?
            .ok_or_else(|| FlowError::Internal(format!("unknown job '{job_id}'")))?;
        self.dispatch_job(job, Utc::now()).await
    }

    /// Runs the tick loop until the task is aborted.
    pub async fn run(&self) {
        let mut interval = tokio::time::interval(self.config.tick_interval());
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            if let Err(err) = self.run_tick().await {
                tracing::error!(error = %err, "dispatcher tick failed");
            }
        }
    }

    /// Executes one dispatch cycle. Returns `Ok(false)` without doing
    /// anything when the previous tick is still running.
    ///
    /// # Errors
    ///
    /// Fails when the job store cannot be queried; per-job dispatch
    /// errors are counted and logged, not propagated.
    pub async fn run_tick(&self) -> Result<bool, FlowError> {
        if self.running.swap(true, Ordering::SeqCst) {
            tracing::warn!("previous dispatch tick still running; skipping");
            return Ok(false);
        }
        let result = self.tick_inner().await;
        self.running.store(false, Ordering::SeqCst);
        result.map(|()| true)
    }

    async fn tick_inner(&self) -> Result<(), FlowError> {
        let now = Utc::now();
        let due = self
            .store
            .due_jobs(now, self.config.dispatch_batch_size)
            .await?;

        for job in due {
            let job_id = job.id;
            if let Err(err) = self.dispatch_job(job, now).await {
                self.counters.errors.fetch_add(1, Ordering::Relaxed);
                tracing::error!(job_id = %job_id, error = %err, "job dispatch failed");
            }
        }
        Ok(())
    }

    async fn dispatch_job(&self, mut job: ScheduledJob, now: DateTime<Utc>) -> Result<(), FlowError> {
        if !job.allow_overlap {
            let slot_key = running_slot_key(job.id);
            let running = self.kv.incr(&slot_key).await?;
            if running > i64::from(job.concurrency) {
                self.kv.decr(&slot_key).await?;
                self.counters.jobs_skipped.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(job_id = %job.id, running, "concurrency limit reached; job stays due");
                return Ok(());
            }
        }

        // The execution record is persisted before the publish so a
        // crash mid-dispatch is observable.
        let mut execution = JobExecution::new(job.id, Uuid::new_v4().to_string());
        self.store.record_execution(execution.clone()).await?;

        let dispatch = JobDispatch {
            job_id: job.id,
            execution_id: execution.id,
            handler_name: job.handler_name.clone(),
            payload: job.payload.clone(),
            timeout_ms: job.timeout_ms,
            trace_id: execution.trace_id.clone(),
        };
        let envelope = EventEnvelope::new("job.dispatch", serde_json::to_value(&dispatch)?)
            .with_correlation_id(execution.id.to_string());

        let published = with_retry(&self.config.dispatch_retry, || {
            let envelope = envelope.clone();
            async move {
                self.bus
                    .publish(JOBS_TOPIC, envelope, PublishOptions::mirrored(JOBS_STREAM))
                    .await
            }
        })
        .await;

        if let Err(err) = published {
            if !job.allow_overlap {
                let _ = self.kv.decr(&running_slot_key(job.id)).await;
            }
            execution.status = JobExecutionStatus::Failed;
            execution.completed_at = Some(Utc::now());
            execution.error = Some(err.to_string());
            self.store.record_execution(execution).await?;
            return Err(err);
        }

        job.last_run = Some(now);
        job.executions_count += 1;
        match job.job_type {
            JobType::OneTime => {
                job.status = JobStatus::Completed;
                job.next_run = None;
                self.counters.jobs_completed.fetch_add(1, Ordering::Relaxed);
            }
            JobType::Event => {
                job.next_run = None;
            }
            JobType::Cron | JobType::Recurring => match next_run_after(&job, now)? {
                Some(next) => job.next_run = Some(next),
                None => {
                    job.status = JobStatus::Completed;
                    job.next_run = None;
                    self.counters.jobs_completed.fetch_add(1, Ordering::Relaxed);
                }
            },
        }
        self.store.put(job).await?;
        self.counters.jobs_dispatched.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

impl std::fmt::Debug for JobDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobDispatcher")
            .field("running", &self.running.load(Ordering::Relaxed))
            .field("stats", &self.stats())
            .finish()
    }
}
