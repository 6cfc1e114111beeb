//! Execution records and the status state machine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

use crate::errors::InvalidStateError;
use crate::gates::GateResult;

/// Lifecycle status of a pipeline execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    /// Accepted, not yet started.
    Pending,
    /// Actively scheduling and awaiting stages.
    Running,
    /// Dispatch suspended; in-flight stages drain normally.
    Paused,
    /// All stages reached terminal outcomes with no fatal failure.
    Completed,
    /// A stage failed fatally or the executor hit an internal error.
    Failed,
    /// Cancelled by an operator.
    Cancelled,
}

impl ExecutionStatus {
    /// Whether the status is terminal.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Whether a transition to `next` is legal.
    ///
    /// Terminal states accept nothing. `Paused` can only resume or
    /// cancel.
    #[must_use]
    pub fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Running | Self::Cancelled)
                | (
                    Self::Running,
                    Self::Paused | Self::Completed | Self::Failed | Self::Cancelled
                )
                | (Self::Paused, Self::Running | Self::Cancelled)
        )
    }

    /// Lowercase name, matching the serialized form.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Terminal and in-flight status of a single stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    /// Not yet eligible or dispatched.
    Pending,
    /// Dispatched, awaiting its result.
    Running,
    /// Completed successfully and passed all blocking gates.
    Success,
    /// Execution or a blocking gate failed.
    Failed,
    /// Never ran; a required dependency was not satisfied.
    Skipped,
}

impl StageStatus {
    /// Whether the status is terminal.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Success | Self::Failed | Self::Skipped)
    }
}

/// Recorded outcome of one stage within an execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageResult {
    /// The stage this result belongs to.
    pub stage_id: String,
    /// Current status.
    pub status: StageStatus,
    /// Worker output payload, when any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<serde_json::Value>,
    /// Metrics reported by the worker, evaluated by quality gates.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metrics: Option<serde_json::Value>,
    /// Per-gate evaluation results.
    #[serde(default)]
    pub gate_results: Vec<GateResult>,
    /// Failure or skip reason, when any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// When the stage was dispatched.
    pub started_at: DateTime<Utc>,
    /// When the stage reached a terminal status.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl StageResult {
    /// A result in the `Running` state, recorded at dispatch time.
    #[must_use]
    pub fn running(stage_id: impl Into<String>) -> Self {
        Self {
            stage_id: stage_id.into(),
            status: StageStatus::Running,
            output: None,
            metrics: None,
            gate_results: Vec::new(),
            error: None,
            started_at: Utc::now(),
            completed_at: None,
        }
    }

    /// A skipped result with the given reason.
    #[must_use]
    pub fn skipped(stage_id: impl Into<String>, reason: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            stage_id: stage_id.into(),
            status: StageStatus::Skipped,
            output: None,
            metrics: None,
            gate_results: Vec::new(),
            error: Some(reason.into()),
            started_at: now,
            completed_at: Some(now),
        }
    }
}

/// A single run of a pipeline definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineExecution {
    /// Execution id.
    pub id: Uuid,
    /// The pipeline this execution runs.
    pub pipeline_id: Uuid,
    /// Current lifecycle status.
    pub status: ExecutionStatus,
    /// What triggered the run (manual, schedule, event).
    pub triggered_by: String,
    /// The actor behind the trigger.
    pub trigger_actor: String,
    /// Results keyed by stage id. Only dispatched or skipped stages have
    /// an entry.
    pub stage_results: HashMap<String, StageResult>,
    /// Execution-level failure reason, when any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// When the execution was created.
    pub created_at: DateTime<Utc>,
    /// When the execution entered `Running`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    /// When the execution reached a terminal status.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl PipelineExecution {
    /// Creates a pending execution record.
    #[must_use]
    pub fn new(
        pipeline_id: Uuid,
        triggered_by: impl Into<String>,
        trigger_actor: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::now_v7(),
            pipeline_id,
            status: ExecutionStatus::Pending,
            triggered_by: triggered_by.into(),
            trigger_actor: trigger_actor.into(),
            stage_results: HashMap::new(),
            error: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }

    /// Applies a status transition, enforcing the state machine and
    /// stamping timestamps.
    ///
    /// # Errors
    ///
    /// Returns [`InvalidStateError`] for illegal transitions, including
    /// any transition out of a terminal state.
    pub fn transition_to(&mut self, next: ExecutionStatus) -> Result<(), InvalidStateError> {
        if !self.status.can_transition_to(next) {
            return Err(InvalidStateError::new(
                "execution",
                self.id.to_string(),
                self.status.as_str(),
                next.as_str(),
            ));
        }

        if next == ExecutionStatus::Running && self.started_at.is_none() {
            self.started_at = Some(Utc::now());
        }
        if next.is_terminal() {
            self.completed_at = Some(Utc::now());
        }
        self.status = next;
        Ok(())
    }

    /// Whether every stage entry is terminal. Stages without an entry
    /// have not been dispatched and do not count.
    #[must_use]
    pub fn all_recorded_terminal(&self) -> bool {
        self.stage_results.values().all(|r| r.status.is_terminal())
    }
}

/// Task message dispatched to a worker for one stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskDispatch {
    /// Correlation id for the result.
    pub task_id: Uuid,
    /// The execution the stage belongs to.
    pub execution_id: Uuid,
    /// The pipeline being run.
    pub pipeline_id: Uuid,
    /// The stage to execute.
    pub stage_id: String,
    /// Operation name.
    pub action: String,
    /// Stage parameters.
    pub parameters: serde_json::Value,
    /// Pipeline environment.
    pub environment: HashMap<String, String>,
    /// Deadline the worker should respect, in milliseconds.
    pub timeout_ms: u64,
    /// Trace id for log correlation.
    pub trace_id: String,
}

/// Worker-reported outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// The worker finished the task.
    Success,
    /// The worker could not finish the task.
    Failure,
}

/// Result message published by a worker after executing a task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskResult {
    /// Correlation id from the dispatch.
    pub task_id: Uuid,
    /// Outcome.
    pub status: TaskStatus,
    /// Output payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<serde_json::Value>,
    /// Metrics for gate evaluation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metrics: Option<serde_json::Value>,
    /// Error messages, when the task failed.
    #[serde(default)]
    pub errors: Vec<String>,
}

impl TaskResult {
    /// A successful result.
    #[must_use]
    pub fn success(task_id: Uuid, output: serde_json::Value) -> Self {
        Self {
            task_id,
            status: TaskStatus::Success,
            output: Some(output),
            metrics: None,
            errors: Vec::new(),
        }
    }

    /// A failed result.
    #[must_use]
    pub fn failure(task_id: Uuid, error: impl Into<String>) -> Self {
        Self {
            task_id,
            status: TaskStatus::Failure,
            output: None,
            metrics: None,
            errors: vec![error.into()],
        }
    }

    /// Attaches metrics.
    #[must_use]
    pub fn with_metrics(mut self, metrics: serde_json::Value) -> Self {
        self.metrics = Some(metrics);
        self
    }
}
