//! Error types for the forgeflow orchestration core.
//!
//! The taxonomy separates structural/validation errors (rejected at
//! submission time), transient infrastructure errors (retryable), and
//! permanent configuration errors (fail fast, never retried). Every
//! validation-class error carries a machine-readable code so ops tooling
//! can alert differently per class.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

/// The main error type for forgeflow operations.
#[derive(Debug, Error)]
pub enum FlowError {
    /// A pipeline validation error occurred.
    #[error("{0}")]
    Validation(#[from] PipelineValidationError),

    /// A cycle was detected in the stage dependency graph.
    #[error("{0}")]
    CycleDetected(#[from] CycleDetectedError),

    /// An operation was requested against an invalid execution/job state.
    #[error("{0}")]
    InvalidState(#[from] InvalidStateError),

    /// A referenced execution or job does not exist.
    #[error("Unknown {entity}: '{id}'")]
    NotFound {
        /// The entity kind that was looked up.
        entity: &'static str,
        /// The id that failed to resolve.
        id: String,
    },

    /// A handler name could not be resolved. Permanent, never retried.
    #[error("{0}")]
    UnknownHandler(#[from] UnknownHandlerError),

    /// A handler or route was registered twice under the same key.
    /// Permanent configuration error.
    #[error("Duplicate registration for '{key}'")]
    DuplicateRegistration {
        /// The registry key that was already taken.
        key: String,
    },

    /// A job schedule could not be parsed or evaluated.
    #[error("{0}")]
    Schedule(#[from] ScheduleError),

    /// The key-value store is unavailable or rejected an operation.
    #[error("Store error: {0}")]
    Store(String),

    /// The message bus is unavailable or rejected an operation.
    #[error("Bus error: {0}")]
    Bus(String),

    /// An awaited operation exceeded its deadline.
    #[error("Timed out after {timeout_ms}ms: {operation}")]
    Timeout {
        /// Description of the operation that timed out.
        operation: String,
        /// The deadline that was exceeded, in milliseconds.
        timeout_ms: u64,
    },

    /// Serialization/deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// A generic internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl FlowError {
    /// Returns true if the error is a transient infrastructure failure
    /// that may succeed on retry.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Store(_) | Self::Bus(_) | Self::Timeout { .. }
        )
    }

    /// Returns the stable machine-readable code for this error, when one
    /// is defined.
    #[must_use]
    pub fn code(&self) -> Option<&str> {
        match self {
            Self::Validation(e) => e.detail.as_ref().map(|d| d.code.as_str()),
            Self::CycleDetected(e) => Some(&e.detail.code),
            Self::InvalidState(e) => Some(&e.detail.code),
            Self::NotFound { .. } => Some("FLOW-002-NOT_FOUND"),
            Self::UnknownHandler(e) => Some(&e.detail.code),
            Self::DuplicateRegistration { .. } => Some("FLOW-003-DUPLICATE"),
            Self::Schedule(e) => Some(&e.detail.code),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for FlowError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

/// Machine-readable detail attached to structural errors.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ErrorDetail {
    /// Stable error code (e.g., "FLOW-001-CYCLE").
    pub code: String,
    /// Short summary of the error.
    pub summary: String,
    /// Hint for fixing the error.
    pub fix_hint: Option<String>,
    /// Additional context key-value pairs.
    #[serde(default)]
    pub context: HashMap<String, String>,
}

impl ErrorDetail {
    /// Creates a new error detail.
    #[must_use]
    pub fn new(code: impl Into<String>, summary: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            summary: summary.into(),
            fix_hint: None,
            context: HashMap::new(),
        }
    }

    /// Sets the fix hint.
    #[must_use]
    pub fn with_fix_hint(mut self, hint: impl Into<String>) -> Self {
        self.fix_hint = Some(hint.into());
        self
    }

    /// Adds a single context entry.
    #[must_use]
    pub fn with_context_entry(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }
}

/// Error raised when pipeline definition validation fails.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct PipelineValidationError {
    /// The error message.
    pub message: String,
    /// The stages involved in the error.
    pub stages: Vec<String>,
    /// Optional machine-readable detail.
    pub detail: Option<ErrorDetail>,
}

impl PipelineValidationError {
    /// Creates a new pipeline validation error.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            stages: Vec::new(),
            detail: None,
        }
    }

    /// Sets the stages involved.
    #[must_use]
    pub fn with_stages(mut self, stages: Vec<String>) -> Self {
        self.stages = stages;
        self
    }

    /// Sets the machine-readable detail.
    #[must_use]
    pub fn with_detail(mut self, detail: ErrorDetail) -> Self {
        self.detail = Some(detail);
        self
    }

    /// Creates the unknown-dependency-target variant.
    #[must_use]
    pub fn unknown_stage(stage: &str, dependency: &str) -> Self {
        Self::new(format!(
            "Stage '{stage}' depends on unknown stage '{dependency}'"
        ))
        .with_stages(vec![stage.to_string(), dependency.to_string()])
        .with_detail(
            ErrorDetail::new(
                "FLOW-001-MISSING_DEP",
                format!("Dependency target '{dependency}' not found"),
            )
            .with_fix_hint("Ensure every dependency references an existing stage id."),
        )
    }
}

/// Error raised when a cycle is detected in the stage dependency graph.
#[derive(Debug, Clone, Error)]
#[error("Cycle detected in pipeline: {}", cycle_path.join(" -> "))]
pub struct CycleDetectedError {
    /// The path of stage ids forming the cycle.
    pub cycle_path: Vec<String>,
    /// Machine-readable detail.
    pub detail: ErrorDetail,
}

impl CycleDetectedError {
    /// Creates a new cycle detected error.
    #[must_use]
    pub fn new(cycle_path: Vec<String>) -> Self {
        let detail = ErrorDetail::new(
            "FLOW-001-CYCLE",
            format!(
                "Pipeline contains a dependency cycle: {}",
                cycle_path.join(" -> ")
            ),
        )
        .with_fix_hint("Remove one of the dependencies in the cycle to break it.");

        Self { cycle_path, detail }
    }
}

impl From<CycleDetectedError> for PipelineValidationError {
    fn from(err: CycleDetectedError) -> Self {
        PipelineValidationError {
            message: err.to_string(),
            stages: err.cycle_path.clone(),
            detail: Some(err.detail),
        }
    }
}

/// Error raised when a lifecycle operation is requested against a state
/// that does not permit it (e.g., pausing a completed execution).
#[derive(Debug, Clone, Error)]
#[error("Invalid state transition for {entity} '{id}': {current} -> {requested}")]
pub struct InvalidStateError {
    /// What kind of entity the transition was requested on.
    pub entity: String,
    /// The entity id.
    pub id: String,
    /// The current state.
    pub current: String,
    /// The requested state.
    pub requested: String,
    /// Machine-readable detail.
    pub detail: ErrorDetail,
}

impl InvalidStateError {
    /// Creates a new invalid state error.
    #[must_use]
    pub fn new(
        entity: impl Into<String>,
        id: impl Into<String>,
        current: impl Into<String>,
        requested: impl Into<String>,
    ) -> Self {
        let entity = entity.into();
        let current = current.into();
        let requested = requested.into();
        let detail = ErrorDetail::new(
            "FLOW-002-STATE",
            format!("{entity} in state '{current}' cannot transition to '{requested}'"),
        );

        Self {
            entity,
            id: id.into(),
            current,
            requested,
            detail,
        }
    }
}

/// Error raised when a handler name cannot be resolved.
///
/// This is a permanent configuration error: redelivery can never make it
/// succeed, so callers must not retry it.
#[derive(Debug, Clone, Error)]
#[error("Unknown handler: '{name}'")]
pub struct UnknownHandlerError {
    /// The handler name that failed to resolve.
    pub name: String,
    /// Machine-readable detail.
    pub detail: ErrorDetail,
}

impl UnknownHandlerError {
    /// Creates a new unknown handler error.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        let detail = ErrorDetail::new(
            "FLOW-003-UNKNOWN",
            format!("No handler registered under '{name}'"),
        )
        .with_fix_hint("Register the handler before dispatching jobs that reference it.");

        Self { name, detail }
    }
}

/// Error raised when a job schedule is invalid or cannot be evaluated.
#[derive(Debug, Clone, Error)]
#[error("Schedule error for job '{job}': {message}")]
pub struct ScheduleError {
    /// The job the schedule belongs to.
    pub job: String,
    /// The error message.
    pub message: String,
    /// Machine-readable detail.
    pub detail: ErrorDetail,
}

impl ScheduleError {
    /// Creates a new schedule error.
    #[must_use]
    pub fn new(job: impl Into<String>, message: impl Into<String>) -> Self {
        let job = job.into();
        let message = message.into();
        let detail = ErrorDetail::new("FLOW-004-SCHEDULE", message.clone());

        Self {
            job,
            message,
            detail,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_detail_creation() {
        let detail = ErrorDetail::new("FLOW-999", "Test error")
            .with_fix_hint("Fix this by doing that")
            .with_context_entry("stage", "build");

        assert_eq!(detail.code, "FLOW-999");
        assert_eq!(detail.summary, "Test error");
        assert_eq!(detail.fix_hint, Some("Fix this by doing that".to_string()));
        assert_eq!(detail.context.get("stage"), Some(&"build".to_string()));
    }

    #[test]
    fn test_cycle_detected_error() {
        let err = CycleDetectedError::new(vec![
            "a".to_string(),
            "b".to_string(),
            "a".to_string(),
        ]);

        assert!(err.to_string().contains("a -> b -> a"));
        assert_eq!(err.detail.code, "FLOW-001-CYCLE");
    }

    #[test]
    fn test_unknown_stage_error() {
        let err = PipelineValidationError::unknown_stage("deploy", "missing");
        assert_eq!(err.stages, vec!["deploy".to_string(), "missing".to_string()]);
        assert_eq!(err.detail.unwrap().code, "FLOW-001-MISSING_DEP");
    }

    #[test]
    fn test_transient_classification() {
        assert!(FlowError::Bus("down".into()).is_transient());
        assert!(FlowError::Store("down".into()).is_transient());
        assert!(FlowError::Timeout {
            operation: "dispatch".into(),
            timeout_ms: 100
        }
        .is_transient());
        assert!(!FlowError::from(UnknownHandlerError::new("nope")).is_transient());
        assert!(!FlowError::from(CycleDetectedError::new(vec![])).is_transient());
    }

    #[test]
    fn test_error_codes_surface_through_umbrella() {
        let err = FlowError::from(UnknownHandlerError::new("nope"));
        assert_eq!(err.code(), Some("FLOW-003-UNKNOWN"));

        let err = FlowError::from(InvalidStateError::new(
            "execution",
            "e1",
            "completed",
            "paused",
        ));
        assert_eq!(err.code(), Some("FLOW-002-STATE"));

        let err = FlowError::NotFound {
            entity: "execution",
            id: "e9".to_string(),
        };
        assert_eq!(err.code(), Some("FLOW-002-NOT_FOUND"));
        assert!(!err.is_transient());
    }

    #[test]
    fn test_invalid_state_message() {
        let err = InvalidStateError::new("execution", "e1", "completed", "running");
        assert!(err.to_string().contains("completed -> running"));
    }
}
