//! The pipeline executor.
//!
//! Owns in-memory execution state, schedules stages as their
//! dependencies resolve, dispatches them to workers over the bus, and
//! correlates the asynchronous results back by task id. Pause, resume,
//! and cancel are driven through a watch channel per execution so the
//! scheduling loop reacts without polling.
//!
//! Pause is conservative: it stops new dispatches while in-flight
//! stages drain normally. Cancellation stops the scheduling loop at
//! once, but results from already-dispatched stages are still recorded
//! on arrival so the audit trail stays complete.

use chrono::Utc;
use dashmap::DashMap;
use parking_lot::RwLock;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use uuid::Uuid;

use crate::broadcast::BroadcastHub;
use crate::bus::{MessageBus, PublishOptions, Subscription, TopicHandler};
use crate::config::FlowConfig;
use crate::envelope::EventEnvelope;
use crate::errors::{FlowError, InvalidStateError};
use crate::events::{EventSink, LifecycleEvent};
use crate::gates::evaluate_gates;
use crate::registry::AgentRouteRegistry;
use crate::retry::with_retry;

use super::execution::{
    ExecutionStatus, PipelineExecution, StageResult, StageStatus, TaskDispatch, TaskResult,
    TaskStatus,
};
use super::spec::{DependencyCondition, ExecutionMode, PipelineDefinition, StageDefinition};

/// One live execution: the immutable definition plus mutable state.
struct ExecutionHandle {
    id: Uuid,
    trace_id: String,
    definition: PipelineDefinition,
    execution: RwLock<PipelineExecution>,
    status_tx: watch::Sender<ExecutionStatus>,
}

impl ExecutionHandle {
    fn snapshot(&self) -> PipelineExecution {
        self.execution.read().clone()
    }

    fn status(&self) -> ExecutionStatus {
        self.execution.read().status
    }

    fn record_stage(&self, result: StageResult) {
        self.execution
            .write()
            .stage_results
            .insert(result.stage_id.clone(), result);
    }
}

struct Shared {
    bus: Arc<dyn MessageBus>,
    routes: Arc<AgentRouteRegistry>,
    sink: Arc<dyn EventSink>,
    hub: Arc<BroadcastHub>,
    config: FlowConfig,
    executions: DashMap<Uuid, Arc<ExecutionHandle>>,
    pending: DashMap<Uuid, oneshot::Sender<TaskResult>>,
}

impl Shared {
    fn emit(&self, handle: &ExecutionHandle, event: LifecycleEvent, data: serde_json::Value) {
        let name = event.to_string();
        self.sink.try_emit(&name, Some(data.clone()));
        self.hub.publish_update(handle.id, name, data);
    }

    /// Applies a lifecycle transition and emits the matching event.
    fn transition(
        &self,
        handle: &ExecutionHandle,
        next: ExecutionStatus,
    ) -> Result<(), FlowError> {
        let previous = {
            let mut execution = handle.execution.write();
            let previous = execution.status;
            execution.transition_to(next)?;
            previous
        };
        handle.status_tx.send_replace(next);

        let event = match next {
            ExecutionStatus::Running if previous == ExecutionStatus::Paused => {
                LifecycleEvent::ExecutionResumed
            }
            ExecutionStatus::Running => LifecycleEvent::ExecutionStarted,
            ExecutionStatus::Paused => LifecycleEvent::ExecutionPaused,
            ExecutionStatus::Completed => LifecycleEvent::ExecutionCompleted,
            ExecutionStatus::Failed => LifecycleEvent::ExecutionFailed,
            ExecutionStatus::Cancelled => LifecycleEvent::ExecutionCancelled,
            ExecutionStatus::Pending => return Ok(()),
        };
        self.emit(
            handle,
            event,
            json!({"execution_id": handle.id, "status": next}),
        );
        Ok(())
    }
}

/// Schedules pipelines over the message bus.
pub struct PipelineExecutor {
    shared: Arc<Shared>,
    _results_subscription: Subscription,
}

impl PipelineExecutor {
    /// Creates an executor and subscribes it to the results topic.
    #[must_use]
    pub fn new(
        bus: Arc<dyn MessageBus>,
        routes: Arc<AgentRouteRegistry>,
        sink: Arc<dyn EventSink>,
        hub: Arc<BroadcastHub>,
        config: FlowConfig,
    ) -> Self {
        let shared = Arc::new(Shared {
            bus,
            routes,
            sink,
            hub,
            config,
            executions: DashMap::new(),
            pending: DashMap::new(),
        });

        let correlator = Arc::clone(&shared);
        let handler: TopicHandler = Arc::new(move |envelope: EventEnvelope| {
            let shared = Arc::clone(&correlator);
            Box::pin(async move {
                let result: TaskResult = serde_json::from_value(envelope.payload)?;
                match shared.pending.remove(&result.task_id) {
                    Some((_, tx)) => {
                        let _ = tx.send(result);
                    }
                    None => {
                        // Result for a stage that already timed out.
                        tracing::debug!(task_id = %result.task_id, "dropping uncorrelated task result");
                    }
                }
                Ok(())
            })
        });
        let results_topic = shared.config.results_topic.clone();
        let subscription = shared.bus.subscribe(&results_topic, handler);

        Self {
            shared,
            _results_subscription: subscription,
        }
    }

    /// Validates the definition, creates an execution, and starts its
    /// scheduling loop. Returns a snapshot of the running execution.
    ///
    /// # Errors
    ///
    /// Returns a validation error for a structurally invalid definition.
    pub async fn start_pipeline(
        &self,
        definition: PipelineDefinition,
        triggered_by: &str,
        trigger_actor: &str,
    ) -> Result<PipelineExecution, FlowError> {
        definition.validate()?;

        let execution = PipelineExecution::new(definition.id, triggered_by, trigger_actor);
        let (status_tx, _) = watch::channel(ExecutionStatus::Pending);
        let handle = Arc::new(ExecutionHandle {
            id: execution.id,
            trace_id: execution.id.to_string(),
            definition,
            execution: RwLock::new(execution),
            status_tx,
        });
        self.shared.executions.insert(handle.id, Arc::clone(&handle));

        tracing::info!(
            execution_id = %handle.id,
            pipeline = %handle.definition.name,
            stages = handle.definition.stages.len(),
            "starting pipeline execution"
        );
        self.shared.transition(&handle, ExecutionStatus::Running)?;

        let shared = Arc::clone(&self.shared);
        let driver = Arc::clone(&handle);
        tokio::spawn(async move {
            drive(shared, driver).await;
        });

        Ok(handle.snapshot())
    }

    /// Suspends dispatch of new stages. In-flight stages drain normally.
    ///
    /// # Errors
    ///
    /// Rejects unknown executions and any execution not currently
    /// running.
    pub fn pause_execution(&self, execution_id: Uuid) -> Result<(), FlowError> {
        let handle = self.handle(execution_id)?;
        self.shared.transition(&handle, ExecutionStatus::Paused)
    }

    /// Resumes a paused execution.
    ///
    /// # Errors
    ///
    /// Rejects unknown executions and any execution not currently
    /// paused.
    pub fn resume_execution(&self, execution_id: Uuid) -> Result<(), FlowError> {
        let handle = self.handle(execution_id)?;
        self.shared.transition(&handle, ExecutionStatus::Running)
    }

    /// Cancels an execution. The scheduling loop stops at once; results
    /// of already-dispatched stages are still recorded on arrival.
    ///
    /// # Errors
    ///
    /// Rejects unknown executions and executions already terminal.
    pub fn cancel_execution(&self, execution_id: Uuid) -> Result<(), FlowError> {
        let handle = self.handle(execution_id)?;
        self.shared.transition(&handle, ExecutionStatus::Cancelled)
    }

    /// Returns a snapshot of an execution, if known.
    #[must_use]
    pub fn execution(&self, execution_id: Uuid) -> Option<PipelineExecution> {
        self.shared
            .executions
            .get(&execution_id)
            .map(|handle| handle.snapshot())
    }

    /// Waits until the execution reaches a terminal status and returns
    /// its final snapshot.
    ///
    /// # Errors
    ///
    /// Rejects unknown executions.
    pub async fn wait_for_completion(
        &self,
        execution_id: Uuid,
    ) -> Result<PipelineExecution, FlowError> {
        let handle = self.handle(execution_id)?;
        let mut status_rx = handle.status_tx.subscribe();
        status_rx
            .wait_for(|status| status.is_terminal())
            .await
            .map_err(|_| FlowError::Internal("execution driver went away".to_string()))?;
        Ok(handle.snapshot())
    }

    /// Removes a terminal execution from the executor, returning its
    /// final snapshot. Long-lived processes call this after persisting
    /// the record so the in-memory map stays bounded.
    ///
    /// # Errors
    ///
    /// Rejects unknown executions and executions still in progress.
    pub fn archive_execution(&self, execution_id: Uuid) -> Result<PipelineExecution, FlowError> {
        let handle = self.handle(execution_id)?;
        let snapshot = handle.snapshot();
        if !snapshot.status.is_terminal() {
            return Err(InvalidStateError::new(
                "execution",
                execution_id.to_string(),
                snapshot.status.to_string(),
                "archived",
            )
            .into());
        }
        self.shared.executions.remove(&execution_id);
        Ok(snapshot)
    }

    fn handle(&self, execution_id: Uuid) -> Result<Arc<ExecutionHandle>, FlowError> {
        self.shared
            .executions
            .get(&execution_id)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| FlowError::NotFound {
                entity: "execution",
                id: execution_id.to_string(),
            })
    }
}

impl std::fmt::Debug for PipelineExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineExecutor")
            .field("executions", &self.shared.executions.len())
            .field("pending_tasks", &self.shared.pending.len())
            .finish()
    }
}

enum Disposition {
    Ready,
    Wait,
    Skip(String),
}

/// Decides whether a not-yet-dispatched stage can run, must wait, or
/// will never run.
fn disposition(stage: &StageDefinition, results: &HashMap<String, StageResult>) -> Disposition {
    let mut waiting = false;
    let mut skip_reason = None;

    for dep in &stage.dependencies {
        let Some(result) = results
            .get(&dep.stage_id)
            .filter(|r| r.status.is_terminal())
        else {
            waiting = true;
            continue;
        };

        let satisfied = match dep.condition {
            DependencyCondition::Always => true,
            DependencyCondition::Completed => {
                matches!(result.status, StageStatus::Success | StageStatus::Failed)
            }
            DependencyCondition::Success => result.status == StageStatus::Success,
        };

        if !satisfied && dep.required && skip_reason.is_none() {
            skip_reason = Some(format!(
                "required dependency '{}' ended {:?}",
                dep.stage_id, result.status
            ));
        }
    }

    match skip_reason {
        Some(reason) => Disposition::Skip(reason),
        None if waiting => Disposition::Wait,
        None => Disposition::Ready,
    }
}

/// The per-execution scheduling loop.
async fn drive(shared: Arc<Shared>, handle: Arc<ExecutionHandle>) {
    let (done_tx, mut done_rx) = mpsc::unbounded_channel::<String>();
    let mut status_rx = handle.status_tx.subscribe();
    let mut in_flight: usize = 0;

    loop {
        let status = *status_rx.borrow_and_update();
        match status {
            ExecutionStatus::Completed | ExecutionStatus::Failed | ExecutionStatus::Cancelled => {
                break;
            }
            ExecutionStatus::Paused => {
                tokio::select! {
                    changed = status_rx.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                    Some(stage_id) = done_rx.recv(), if in_flight > 0 => {
                        in_flight -= 1;
                        apply_completion(&shared, &handle, &stage_id);
                    }
                }
                continue;
            }
            ExecutionStatus::Pending | ExecutionStatus::Running => {}
        }

        let mut ready = Vec::new();
        let mut skips = Vec::new();
        {
            let execution = handle.execution.read();
            for stage in &handle.definition.stages {
                if execution.stage_results.contains_key(&stage.id) {
                    continue;
                }
                match disposition(stage, &execution.stage_results) {
                    Disposition::Ready => ready.push(stage.clone()),
                    Disposition::Skip(reason) => skips.push((stage.id.clone(), reason)),
                    Disposition::Wait => {}
                }
            }
        }

        if !skips.is_empty() {
            // Skips cascade, so re-evaluate before dispatching anything.
            for (stage_id, reason) in skips {
                handle.record_stage(StageResult::skipped(&stage_id, reason.clone()));
                shared.emit(
                    &handle,
                    LifecycleEvent::StageSkipped,
                    json!({"stage_id": stage_id, "reason": reason}),
                );
            }
            continue;
        }

        if ready.is_empty() && in_flight == 0 {
            finalize(&shared, &handle);
            break;
        }

        if handle.definition.execution_mode == ExecutionMode::Sequential {
            ready.truncate(usize::from(in_flight == 0));
        }

        for stage in ready {
            handle.record_stage(StageResult::running(&stage.id));
            shared.emit(
                &handle,
                LifecycleEvent::StageStarted,
                json!({"stage_id": stage.id, "agent_type": stage.agent_type}),
            );
            in_flight += 1;
            tokio::spawn(run_stage(
                Arc::clone(&shared),
                Arc::clone(&handle),
                stage,
                done_tx.clone(),
            ));
        }

        tokio::select! {
            Some(stage_id) = done_rx.recv() => {
                in_flight -= 1;
                apply_completion(&shared, &handle, &stage_id);
            }
            changed = status_rx.changed() => {
                if changed.is_err() {
                    break;
                }
            }
        }
    }
}

/// Reacts to a recorded stage outcome: a failure of a stage without
/// `continue_on_failure` fails the whole execution.
fn apply_completion(shared: &Arc<Shared>, handle: &Arc<ExecutionHandle>, stage_id: &str) {
    let (fatal, error) = {
        let execution = handle.execution.read();
        let Some(result) = execution.stage_results.get(stage_id) else {
            return;
        };
        let fatal = result.status == StageStatus::Failed
            && handle
                .definition
                .stage(stage_id)
                .map_or(true, |stage| !stage.continue_on_failure);
        (fatal, result.error.clone())
    };

    if fatal && !handle.status().is_terminal() {
        handle.execution.write().error =
            Some(error.unwrap_or_else(|| format!("stage '{stage_id}' failed")));
        let _ = shared.transition(handle, ExecutionStatus::Failed);
    }
}

/// Settles the terminal status once nothing is dispatchable or running.
fn finalize(shared: &Arc<Shared>, handle: &Arc<ExecutionHandle>) {
    let (unreached, fatal_failure) = {
        let execution = handle.execution.read();
        let unreached = handle
            .definition
            .stages
            .iter()
            .any(|stage| !execution.stage_results.contains_key(&stage.id));
        let fatal_failure = handle.definition.stages.iter().any(|stage| {
            !stage.continue_on_failure
                && execution
                    .stage_results
                    .get(&stage.id)
                    .is_some_and(|r| r.status == StageStatus::Failed)
        });
        (unreached, fatal_failure)
    };

    if unreached {
        // Cannot happen for a validated DAG, but never report success
        // for a graph that stalled.
        handle.execution.write().error = Some("stage graph stalled before completion".to_string());
    }

    let next = if unreached || fatal_failure {
        ExecutionStatus::Failed
    } else {
        ExecutionStatus::Completed
    };
    let _ = shared.transition(handle, next);
}

/// Dispatches one stage and awaits its result, then records the outcome
/// with quality gates applied.
async fn run_stage(
    shared: Arc<Shared>,
    handle: Arc<ExecutionHandle>,
    stage: StageDefinition,
    done_tx: mpsc::UnboundedSender<String>,
) {
    let task_id = Uuid::new_v4();
    let timeout_ms = stage
        .timeout_ms
        .unwrap_or(shared.config.default_stage_timeout_ms);
    let (result_tx, result_rx) = oneshot::channel();
    shared.pending.insert(task_id, result_tx);

    let outcome = dispatch_and_await(&shared, &handle, &stage, task_id, timeout_ms, result_rx).await;
    shared.pending.remove(&task_id);

    let mut result = StageResult::running(&stage.id);
    match outcome {
        Ok(task_result) => {
            result.output = task_result.output;
            result.metrics = task_result.metrics;
            match task_result.status {
                TaskStatus::Success => result.status = StageStatus::Success,
                TaskStatus::Failure => {
                    result.status = StageStatus::Failed;
                    result.error = Some(if task_result.errors.is_empty() {
                        "worker reported failure".to_string()
                    } else {
                        task_result.errors.join("; ")
                    });
                }
            }
        }
        Err(err) => {
            result.status = StageStatus::Failed;
            result.error = Some(err.to_string());
        }
    }

    if !stage.quality_gates.is_empty() {
        let metrics = result
            .metrics
            .clone()
            .unwrap_or_else(|| json!({}));
        let evaluation = evaluate_gates(&metrics, &stage.quality_gates);
        if !evaluation.passed && result.status == StageStatus::Success {
            let failed_gates: Vec<&str> = evaluation
                .results
                .iter()
                .filter(|g| g.blocking && !g.passed)
                .map(|g| g.gate.as_str())
                .collect();
            result.status = StageStatus::Failed;
            result.error = Some(format!(
                "blocking quality gate(s) failed: {}",
                failed_gates.join(", ")
            ));
        }
        result.gate_results = evaluation.results;
    }
    result.completed_at = Some(Utc::now());

    let event = if result.status == StageStatus::Success {
        LifecycleEvent::StageCompleted
    } else {
        LifecycleEvent::StageFailed
    };
    let data = json!({
        "stage_id": stage.id,
        "status": result.status,
        "error": result.error,
    });
    handle.record_stage(result);
    shared.emit(&handle, event, data);

    // Receiver is gone once the execution ends; the result above is
    // still recorded.
    let _ = done_tx.send(stage.id);
}

async fn dispatch_and_await(
    shared: &Arc<Shared>,
    handle: &Arc<ExecutionHandle>,
    stage: &StageDefinition,
    task_id: Uuid,
    timeout_ms: u64,
    result_rx: oneshot::Receiver<TaskResult>,
) -> Result<TaskResult, FlowError> {
    let dispatch = TaskDispatch {
        task_id,
        execution_id: handle.id,
        pipeline_id: handle.definition.id,
        stage_id: stage.id.clone(),
        action: stage.action.clone(),
        parameters: stage.parameters.clone(),
        environment: handle.definition.environment.clone(),
        timeout_ms,
        trace_id: handle.trace_id.clone(),
    };
    let envelope = EventEnvelope::new("task.dispatch", serde_json::to_value(&dispatch)?)
        .with_correlation_id(task_id.to_string());
    let topic = shared.routes.topic_for(&stage.agent_type, &stage.action);

    with_retry(&shared.config.dispatch_retry, || {
        let envelope = envelope.clone();
        let topic = topic.clone();
        async move {
            shared
                .bus
                .publish(&topic, envelope, PublishOptions::fire_and_forget())
                .await
        }
    })
    .await?;

    match tokio::time::timeout(Duration::from_millis(timeout_ms), result_rx).await {
        Ok(Ok(task_result)) => Ok(task_result),
        Ok(Err(_)) => Err(FlowError::Internal(
            "task result channel closed".to_string(),
        )),
        Err(_) => Err(FlowError::Timeout {
            operation: format!("stage '{}'", stage.id),
            timeout_ms,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::InMemoryBus;
    use crate::events::NoOpEventSink;

    fn executor() -> PipelineExecutor {
        PipelineExecutor::new(
            Arc::new(InMemoryBus::new()),
            Arc::new(AgentRouteRegistry::new()),
            Arc::new(NoOpEventSink),
            Arc::new(BroadcastHub::default()),
            FlowConfig::default(),
        )
    }

    #[tokio::test]
    async fn test_invalid_definition_rejected() {
        let executor = executor();
        let definition = PipelineDefinition::new("cyclic")
            .with_stage(StageDefinition::new("a", "t", "run").depends_on("b"))
            .with_stage(StageDefinition::new("b", "t", "run").depends_on("a"));

        let err = executor
            .start_pipeline(definition, "manual", "tests")
            .await
            .unwrap_err();
        assert_eq!(err.code(), Some("FLOW-001-CYCLE"));
    }

    #[tokio::test]
    async fn test_unknown_execution_rejected_with_not_found_code() {
        let executor = executor();

        let err = executor.pause_execution(Uuid::new_v4()).err().unwrap();
        assert_eq!(err.code(), Some("FLOW-002-NOT_FOUND"));
        assert!(!err.is_transient());

        assert!(executor.cancel_execution(Uuid::new_v4()).is_err());
        assert!(executor.execution(Uuid::new_v4()).is_none());
    }

    #[test]
    fn test_disposition_success_condition() {
        let stage = StageDefinition::new("deploy", "t", "run").depends_on("test");

        let mut results = HashMap::new();
        assert!(matches!(disposition(&stage, &results), Disposition::Wait));

        results.insert("test".to_string(), StageResult::running("test"));
        assert!(matches!(disposition(&stage, &results), Disposition::Wait));

        let mut success = StageResult::running("test");
        success.status = StageStatus::Success;
        results.insert("test".to_string(), success);
        assert!(matches!(disposition(&stage, &results), Disposition::Ready));

        results.insert(
            "test".to_string(),
            StageResult::skipped("test", "upstream failed"),
        );
        assert!(matches!(disposition(&stage, &results), Disposition::Skip(_)));
    }

    #[test]
    fn test_disposition_completed_condition_accepts_failure() {
        use super::super::spec::StageDependency;

        let stage = StageDefinition::new("cleanup", "t", "run").with_dependency(
            StageDependency::on("risky").with_condition(DependencyCondition::Completed),
        );

        let mut failed = StageResult::running("risky");
        failed.status = StageStatus::Failed;
        let mut results = HashMap::new();
        results.insert("risky".to_string(), failed);

        assert!(matches!(disposition(&stage, &results), Disposition::Ready));
    }

    #[test]
    fn test_disposition_optional_dependency_never_skips() {
        use super::super::spec::StageDependency;

        let stage = StageDefinition::new("report", "t", "run")
            .with_dependency(StageDependency::on("flaky").optional());

        let mut results = HashMap::new();
        results.insert(
            "flaky".to_string(),
            StageResult::skipped("flaky", "dependency failed"),
        );

        assert!(matches!(disposition(&stage, &results), Disposition::Ready));
    }
}
