//! Lifecycle event emission.
//!
//! The executor and workers emit lifecycle events through an [`EventSink`]
//! so observability stays pluggable: discard, log via `tracing`, or
//! collect for assertions in tests.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::{debug, info, Level};

/// The lifecycle events emitted by the pipeline executor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleEvent {
    /// An execution transitioned to running.
    ExecutionStarted,
    /// A stage was dispatched to a worker.
    StageStarted,
    /// A stage finished successfully (gates included).
    StageCompleted,
    /// A stage failed (worker failure, timeout, or blocking gate).
    StageFailed,
    /// A stage was skipped because a required dependency did not succeed.
    StageSkipped,
    /// The execution reached its successful terminal state.
    ExecutionCompleted,
    /// The execution reached its failed terminal state.
    ExecutionFailed,
    /// The execution was cancelled.
    ExecutionCancelled,
    /// The execution was paused.
    ExecutionPaused,
    /// The execution was resumed.
    ExecutionResumed,
}

impl fmt::Display for LifecycleEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::ExecutionStarted => "execution_started",
            Self::StageStarted => "stage_started",
            Self::StageCompleted => "stage_completed",
            Self::StageFailed => "stage_failed",
            Self::StageSkipped => "stage_skipped",
            Self::ExecutionCompleted => "execution_completed",
            Self::ExecutionFailed => "execution_failed",
            Self::ExecutionCancelled => "execution_cancelled",
            Self::ExecutionPaused => "execution_paused",
            Self::ExecutionResumed => "execution_resumed",
        };
        write!(f, "{name}")
    }
}

/// Trait for event sinks that receive lifecycle events.
#[async_trait]
pub trait EventSink: Send + Sync {
    /// Emits an event asynchronously.
    async fn emit(&self, event_type: &str, data: Option<serde_json::Value>);

    /// Emits an event without blocking. Must never panic; errors are
    /// logged and suppressed.
    fn try_emit(&self, event_type: &str, data: Option<serde_json::Value>);
}

/// A no-op sink that discards all events.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpEventSink;

#[async_trait]
impl EventSink for NoOpEventSink {
    async fn emit(&self, _event_type: &str, _data: Option<serde_json::Value>) {}

    fn try_emit(&self, _event_type: &str, _data: Option<serde_json::Value>) {}
}

/// A sink that logs events through the tracing framework.
#[derive(Debug, Clone)]
pub struct LoggingEventSink {
    level: Level,
}

impl Default for LoggingEventSink {
    fn default() -> Self {
        Self { level: Level::INFO }
    }
}

impl LoggingEventSink {
    /// Creates a new logging sink with the specified level.
    #[must_use]
    pub fn new(level: Level) -> Self {
        Self { level }
    }

    fn log_event(&self, event_type: &str, data: &Option<serde_json::Value>) {
        if self.level == Level::DEBUG {
            debug!(event_type = %event_type, event_data = ?data, "Event: {}", event_type);
        } else {
            info!(event_type = %event_type, event_data = ?data, "Event: {}", event_type);
        }
    }
}

#[async_trait]
impl EventSink for LoggingEventSink {
    async fn emit(&self, event_type: &str, data: Option<serde_json::Value>) {
        self.log_event(event_type, &data);
    }

    fn try_emit(&self, event_type: &str, data: Option<serde_json::Value>) {
        self.log_event(event_type, &data);
    }
}

/// A collecting sink for tests.
#[derive(Debug, Default)]
pub struct CollectingEventSink {
    events: parking_lot::RwLock<Vec<(String, Option<serde_json::Value>)>>,
}

impl CollectingEventSink {
    /// Creates a new collecting sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns all collected events.
    #[must_use]
    pub fn events(&self) -> Vec<(String, Option<serde_json::Value>)> {
        self.events.read().clone()
    }

    /// Returns the number of collected events.
    #[must_use]
    pub fn len(&self) -> usize {
        self.events.read().len()
    }

    /// Returns true if no events have been collected.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.events.read().is_empty()
    }

    /// Returns events whose type matches exactly.
    #[must_use]
    pub fn events_of_type(&self, event_type: &str) -> Vec<Option<serde_json::Value>> {
        self.events
            .read()
            .iter()
            .filter(|(t, _)| t == event_type)
            .map(|(_, d)| d.clone())
            .collect()
    }
}

#[async_trait]
impl EventSink for CollectingEventSink {
    async fn emit(&self, event_type: &str, data: Option<serde_json::Value>) {
        self.events.write().push((event_type.to_string(), data));
    }

    fn try_emit(&self, event_type: &str, data: Option<serde_json::Value>) {
        self.events.write().push((event_type.to_string(), data));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lifecycle_event_names() {
        assert_eq!(LifecycleEvent::ExecutionStarted.to_string(), "execution_started");
        assert_eq!(LifecycleEvent::StageFailed.to_string(), "stage_failed");
        assert_eq!(LifecycleEvent::ExecutionCancelled.to_string(), "execution_cancelled");
    }

    #[tokio::test]
    async fn test_noop_sink() {
        let sink = NoOpEventSink;
        sink.emit("x", None).await;
        sink.try_emit("x", Some(serde_json::json!({"k": 1})));
    }

    #[tokio::test]
    async fn test_collecting_sink() {
        let sink = CollectingEventSink::new();
        assert!(sink.is_empty());

        sink.emit("stage_started", Some(serde_json::json!({"stage": "build"})))
            .await;
        sink.try_emit("stage_completed", None);

        assert_eq!(sink.len(), 2);
        assert_eq!(sink.events_of_type("stage_started").len(), 1);
        assert!(sink.events_of_type("execution_failed").is_empty());
    }
}
