//! Scheduled job and job execution records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// How a job decides when to fire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobType {
    /// Fires on a cron expression.
    Cron,
    /// Fires once at `next_run`, then completes.
    OneTime,
    /// Fires repeatedly on a cron expression. Like `Cron`, but intended
    /// for bounded runs via `max_executions`/`end_date`.
    Recurring,
    /// Fired only by an explicit trigger; never self-schedules.
    Event,
}

/// Lifecycle status of a scheduled job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Defined but not yet submitted.
    Pending,
    /// Eligible for dispatch when due.
    Active,
    /// Temporarily excluded from dispatch.
    Paused,
    /// Will never fire again.
    Completed,
    /// Marked failed by an operator or repeated errors.
    Failed,
    /// Cancelled by an operator.
    Cancelled,
}

/// A job definition owned by the scheduler.
///
/// Invariant: `next_run` is `None` exactly when the job will not fire on
/// its own (event jobs, completed jobs).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduledJob {
    /// Job id.
    pub id: Uuid,
    /// Human-readable name.
    pub name: String,
    /// Scheduling behavior.
    pub job_type: JobType,
    /// Lifecycle status.
    pub status: JobStatus,
    /// Cron expression, for `Cron`/`Recurring` jobs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schedule: Option<String>,
    /// IANA timezone the cron expression is evaluated in.
    pub timezone: String,
    /// Next due time, when the job self-fires.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_run: Option<DateTime<Utc>>,
    /// Last dispatch time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_run: Option<DateTime<Utc>>,
    /// Earliest time the job may fire.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_date: Option<DateTime<Utc>>,
    /// Latest time the job may fire.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_date: Option<DateTime<Utc>>,
    /// Total dispatch budget.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_executions: Option<u32>,
    /// Name of the registered handler invoked per execution.
    pub handler_name: String,
    /// Payload passed to the handler.
    pub payload: serde_json::Value,
    /// Handler retries before the execution is considered failed.
    pub max_retries: u32,
    /// Per-execution deadline in milliseconds.
    pub timeout_ms: u64,
    /// Maximum concurrently running executions.
    pub concurrency: u32,
    /// Whether dispatch may exceed `concurrency`.
    pub allow_overlap: bool,
    /// Dispatch priority; higher first.
    pub priority: i32,
    /// How many times the job has been dispatched.
    pub executions_count: u32,
    /// When the job was created.
    pub created_at: DateTime<Utc>,
}

impl ScheduledJob {
    /// Creates a pending job with scheduler defaults.
    #[must_use]
    pub fn new(name: impl Into<String>, handler_name: impl Into<String>, job_type: JobType) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            job_type,
            status: JobStatus::Pending,
            schedule: None,
            timezone: "UTC".to_string(),
            next_run: None,
            last_run: None,
            start_date: None,
            end_date: None,
            max_executions: None,
            handler_name: handler_name.into(),
            payload: serde_json::Value::Object(serde_json::Map::new()),
            max_retries: 3,
            timeout_ms: 300_000,
            concurrency: 1,
            allow_overlap: false,
            priority: 0,
            executions_count: 0,
            created_at: Utc::now(),
        }
    }

    /// Sets the cron expression.
    #[must_use]
    pub fn with_schedule(mut self, expression: impl Into<String>) -> Self {
        self.schedule = Some(expression.into());
        self
    }

    /// Sets the timezone.
    #[must_use]
    pub fn with_timezone(mut self, timezone: impl Into<String>) -> Self {
        self.timezone = timezone.into();
        self
    }

    /// Sets the payload.
    #[must_use]
    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }

    /// Sets the dispatch priority.
    #[must_use]
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Sets the concurrency limit.
    #[must_use]
    pub fn with_concurrency(mut self, concurrency: u32) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    /// Allows dispatch past the concurrency limit.
    #[must_use]
    pub fn allow_overlap(mut self) -> Self {
        self.allow_overlap = true;
        self
    }

    /// Sets the per-execution timeout.
    #[must_use]
    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }

    /// Bounds the total number of dispatches.
    #[must_use]
    pub fn with_max_executions(mut self, max: u32) -> Self {
        self.max_executions = Some(max);
        self
    }

    /// Sets the window the job may fire in.
    #[must_use]
    pub fn with_window(
        mut self,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
    ) -> Self {
        self.start_date = start;
        self.end_date = end;
        self
    }

    /// Sets the fire time of a one-time job.
    #[must_use]
    pub fn run_at(mut self, at: DateTime<Utc>) -> Self {
        self.next_run = Some(at);
        self
    }
}

/// Lifecycle status of one job execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobExecutionStatus {
    /// Dispatched, not yet claimed by a consumer.
    Pending,
    /// A consumer is running the handler.
    Running,
    /// The handler completed.
    Success,
    /// The handler failed or could not be resolved.
    Failed,
    /// The handler exceeded its deadline.
    Timeout,
    /// Cancelled by an operator.
    Cancelled,
    /// Dispatch was skipped (concurrency limit).
    Skipped,
}

/// One dispatched run of a job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobExecution {
    /// Execution id.
    pub id: Uuid,
    /// The job this run belongs to.
    pub job_id: Uuid,
    /// Current status.
    pub status: JobExecutionStatus,
    /// When the dispatcher fired the run.
    pub scheduled_at: DateTime<Utc>,
    /// When a consumer started the handler.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    /// When the run reached a terminal status.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    /// Handler retries so far.
    pub retry_count: u32,
    /// Earliest time of the next retry, when one is scheduled.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_retry_at: Option<DateTime<Utc>>,
    /// The consumer that ran the handler.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker_id: Option<String>,
    /// Trace id correlating this run's events.
    pub trace_id: String,
    /// Failure reason, when any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl JobExecution {
    /// Creates a pending execution for a freshly dispatched job.
    #[must_use]
    pub fn new(job_id: Uuid, trace_id: impl Into<String>) -> Self {
        Self {
            id: Uuid::now_v7(),
            job_id,
            status: JobExecutionStatus::Pending,
            scheduled_at: Utc::now(),
            started_at: None,
            completed_at: None,
            retry_count: 0,
            next_retry_at: None,
            worker_id: None,
            trace_id: trace_id.into(),
            error: None,
        }
    }

    /// Recreates the record for a known execution id, used by consumers
    /// recovering a dispatch whose original record is missing.
    #[must_use]
    pub fn with_id(id: Uuid, job_id: Uuid, trace_id: impl Into<String>) -> Self {
        Self {
            id,
            ..Self::new(job_id, trace_id)
        }
    }
}

/// Dispatch message published for consumers, mirrored onto the durable
/// jobs stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobDispatch {
    /// The job being run.
    pub job_id: Uuid,
    /// The execution record created at dispatch.
    pub execution_id: Uuid,
    /// Handler to invoke.
    pub handler_name: String,
    /// Handler payload.
    pub payload: serde_json::Value,
    /// Per-execution deadline in milliseconds.
    pub timeout_ms: u64,
    /// Fresh trace id for this run.
    pub trace_id: String,
}
