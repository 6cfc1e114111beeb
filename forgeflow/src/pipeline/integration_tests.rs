//! End-to-end executor tests over the in-memory bus, with simulated
//! workers subscribed to the conventional agent topics.

use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

use crate::broadcast::{BroadcastHub, ClientFrame, ServerFrame};
use crate::bus::{InMemoryBus, MessageBus, PublishOptions, Subscription, TopicHandler};
use crate::config::FlowConfig;
use crate::envelope::EventEnvelope;
use crate::events::CollectingEventSink;
use crate::gates::{GateOperator, QualityGate};
use crate::registry::AgentRouteRegistry;

use super::{
    DependencyCondition, ExecutionMode, ExecutionStatus, PipelineDefinition, PipelineExecutor,
    StageDefinition, StageDependency, StageStatus, TaskDispatch, TaskResult,
};

struct Harness {
    bus: Arc<InMemoryBus>,
    sink: Arc<CollectingEventSink>,
    hub: Arc<BroadcastHub>,
    executor: PipelineExecutor,
}

fn harness() -> Harness {
    let bus = Arc::new(InMemoryBus::new());
    let sink = Arc::new(CollectingEventSink::new());
    let hub = Arc::new(BroadcastHub::default());
    let executor = PipelineExecutor::new(
        Arc::clone(&bus) as Arc<dyn MessageBus>,
        Arc::new(AgentRouteRegistry::new()),
        Arc::clone(&sink) as Arc<_>,
        Arc::clone(&hub),
        FlowConfig::default(),
    );
    Harness {
        bus,
        sink,
        hub,
        executor,
    }
}

/// Subscribes a simulated worker to the conventional task topic for
/// `agent_type`, answering each dispatch on the results topic.
fn spawn_worker(
    bus: &Arc<InMemoryBus>,
    agent_type: &str,
    delay: Duration,
    behavior: impl Fn(&TaskDispatch) -> TaskResult + Send + Sync + 'static,
) -> Subscription {
    let publisher = Arc::clone(bus);
    let behavior = Arc::new(behavior);
    let handler: TopicHandler = Arc::new(move |envelope: EventEnvelope| {
        let bus = Arc::clone(&publisher);
        let behavior = Arc::clone(&behavior);
        Box::pin(async move {
            let dispatch: TaskDispatch = serde_json::from_value(envelope.payload)?;
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            let result = behavior(&dispatch);
            let envelope = EventEnvelope::new("task.result", serde_json::to_value(&result)?);
            bus.publish("agent:results", envelope, PublishOptions::fire_and_forget())
                .await
        })
    });
    bus.subscribe(&format!("agent:{agent_type}:tasks"), handler)
}

fn succeed(dispatch: &TaskDispatch) -> TaskResult {
    TaskResult::success(dispatch.task_id, json!({"stage": dispatch.stage_id}))
}

#[tokio::test]
async fn test_sequential_pipeline_completes_in_order() {
    let h = harness();
    let _worker = spawn_worker(&h.bus, "builder", Duration::ZERO, succeed);

    let definition = PipelineDefinition::new("ci")
        .with_stage(StageDefinition::new("build", "builder", "compile"))
        .with_stage(StageDefinition::new("test", "builder", "test").depends_on("build"))
        .with_stage(StageDefinition::new("deploy", "builder", "deploy").depends_on("test"));

    let execution = h
        .executor
        .start_pipeline(definition, "manual", "tests")
        .await
        .unwrap();
    let finished = h.executor.wait_for_completion(execution.id).await.unwrap();

    assert_eq!(finished.status, ExecutionStatus::Completed);
    assert!(finished.completed_at.is_some());
    for stage in ["build", "test", "deploy"] {
        assert_eq!(
            finished.stage_results.get(stage).unwrap().status,
            StageStatus::Success,
            "stage {stage}"
        );
    }

    // Sequential mode dispatches in dependency order.
    let starts: Vec<String> = h
        .sink
        .events_of_type("stage_started")
        .into_iter()
        .map(|d| d.unwrap()["stage_id"].as_str().unwrap().to_string())
        .collect();
    assert_eq!(starts, vec!["build", "test", "deploy"]);
    assert_eq!(h.sink.events_of_type("execution_completed").len(), 1);
}

#[tokio::test]
async fn test_blocking_gate_failure_fails_execution() {
    let h = harness();
    let _worker = spawn_worker(&h.bus, "tester", Duration::ZERO, |dispatch| {
        TaskResult::success(dispatch.task_id, json!({}))
            .with_metrics(json!({"coverage": {"line_rate": 0.62}}))
    });
    let _builder = spawn_worker(&h.bus, "builder", Duration::ZERO, succeed);

    let definition = PipelineDefinition::new("gated")
        .with_mode(ExecutionMode::Parallel)
        .with_stage(StageDefinition::new("scaffold", "builder", "scaffold"))
        .with_stage(
            StageDefinition::new("unit_test", "tester", "test")
                .depends_on("scaffold")
                .with_gate(
                    QualityGate::new(
                        "coverage-floor",
                        "coverage.line_rate",
                        GateOperator::Ge,
                        json!(0.9),
                    )
                    .blocking(),
                ),
        )
        .with_stage(StageDefinition::new("integrate", "builder", "merge").depends_on("unit_test"));

    let execution = h
        .executor
        .start_pipeline(definition, "manual", "tests")
        .await
        .unwrap();
    let finished = h.executor.wait_for_completion(execution.id).await.unwrap();

    assert_eq!(finished.status, ExecutionStatus::Failed);

    let unit_test = finished.stage_results.get("unit_test").unwrap();
    assert_eq!(unit_test.status, StageStatus::Failed);
    assert!(unit_test.error.as_deref().unwrap().contains("coverage-floor"));
    assert_eq!(unit_test.gate_results.len(), 1);
    assert!(!unit_test.gate_results[0].passed);

    // Downstream of the fatal failure never ran.
    assert!(finished.stage_results.get("integrate").is_none());
    assert_eq!(h.sink.events_of_type("execution_failed").len(), 1);
}

#[tokio::test]
async fn test_gate_failure_scenario_with_independent_branch() {
    let h = harness();
    let _builder = spawn_worker(&h.bus, "builder", Duration::ZERO, succeed);
    let _tester = spawn_worker(&h.bus, "tester", Duration::ZERO, |dispatch| {
        TaskResult::success(dispatch.task_id, json!({}))
            .with_metrics(json!({"line_coverage": 75}))
    });
    let _linter = spawn_worker(&h.bus, "linter", Duration::from_millis(50), succeed);

    let definition = PipelineDefinition::new("branched")
        .with_mode(ExecutionMode::Parallel)
        .with_stage(StageDefinition::new("build", "builder", "compile"))
        .with_stage(
            StageDefinition::new("unit_test", "tester", "test")
                .depends_on("build")
                .with_gate(
                    QualityGate::new("coverage", "line_coverage", GateOperator::Ge, json!(80))
                        .blocking(),
                ),
        )
        .with_stage(
            StageDefinition::new("lint", "linter", "lint").with_dependency(
                StageDependency::on("build").with_condition(DependencyCondition::Always),
            ),
        );

    let execution = h
        .executor
        .start_pipeline(definition, "manual", "tests")
        .await
        .unwrap();
    let finished = h.executor.wait_for_completion(execution.id).await.unwrap();
    assert_eq!(finished.status, ExecutionStatus::Failed);

    // lint was already in flight when the gate failed; its result is
    // still recorded.
    tokio::time::sleep(Duration::from_millis(150)).await;
    let settled = h.executor.execution(execution.id).unwrap();
    assert_eq!(
        settled.stage_results.get("build").unwrap().status,
        StageStatus::Success
    );
    assert_eq!(
        settled.stage_results.get("unit_test").unwrap().status,
        StageStatus::Failed
    );
    assert_eq!(
        settled.stage_results.get("lint").unwrap().status,
        StageStatus::Success
    );
}

#[tokio::test]
async fn test_non_blocking_gate_records_failure_but_proceeds() {
    let h = harness();
    let _worker = spawn_worker(&h.bus, "tester", Duration::ZERO, |dispatch| {
        TaskResult::success(dispatch.task_id, json!({}))
            .with_metrics(json!({"line_coverage": 70}))
    });

    let definition = PipelineDefinition::new("advisory")
        .with_stage(
            StageDefinition::new("unit_test", "tester", "test").with_gate(QualityGate::new(
                "coverage",
                "line_coverage",
                GateOperator::Ge,
                json!(80),
            )),
        )
        .with_stage(StageDefinition::new("report", "tester", "report").depends_on("unit_test"));

    let execution = h
        .executor
        .start_pipeline(definition, "manual", "tests")
        .await
        .unwrap();
    let finished = h.executor.wait_for_completion(execution.id).await.unwrap();

    assert_eq!(finished.status, ExecutionStatus::Completed);
    let unit_test = finished.stage_results.get("unit_test").unwrap();
    assert_eq!(unit_test.status, StageStatus::Success);
    assert!(!unit_test.gate_results[0].passed);
    assert_eq!(
        finished.stage_results.get("report").unwrap().status,
        StageStatus::Success
    );
}

#[tokio::test]
async fn test_failure_skips_downstream_when_tolerated() {
    let h = harness();
    let _worker = spawn_worker(&h.bus, "builder", Duration::ZERO, |dispatch| {
        if dispatch.stage_id == "build" {
            TaskResult::failure(dispatch.task_id, "compiler exited 1")
        } else {
            succeed(dispatch)
        }
    });

    let definition = PipelineDefinition::new("tolerant")
        .with_stage(StageDefinition::new("build", "builder", "compile").continue_on_failure())
        .with_stage(StageDefinition::new("test", "builder", "test").depends_on("build"))
        .with_stage(StageDefinition::new("deploy", "builder", "deploy").depends_on("test"));

    let execution = h
        .executor
        .start_pipeline(definition, "manual", "tests")
        .await
        .unwrap();
    let finished = h.executor.wait_for_completion(execution.id).await.unwrap();

    // The failure is tolerated, so the run itself completes; everything
    // downstream of it is skipped, transitively.
    assert_eq!(finished.status, ExecutionStatus::Completed);
    assert_eq!(
        finished.stage_results.get("build").unwrap().status,
        StageStatus::Failed
    );
    assert_eq!(
        finished.stage_results.get("test").unwrap().status,
        StageStatus::Skipped
    );
    assert_eq!(
        finished.stage_results.get("deploy").unwrap().status,
        StageStatus::Skipped
    );
    assert_eq!(h.sink.events_of_type("stage_skipped").len(), 2);
}

#[tokio::test]
async fn test_completed_condition_runs_cleanup_after_failure() {
    let h = harness();
    let _worker = spawn_worker(&h.bus, "builder", Duration::ZERO, |dispatch| {
        if dispatch.stage_id == "risky" {
            TaskResult::failure(dispatch.task_id, "boom")
        } else {
            succeed(dispatch)
        }
    });

    let definition = PipelineDefinition::new("cleanup")
        .with_stage(StageDefinition::new("risky", "builder", "migrate").continue_on_failure())
        .with_stage(
            StageDefinition::new("cleanup", "builder", "rollback").with_dependency(
                StageDependency::on("risky").with_condition(DependencyCondition::Completed),
            ),
        );

    let execution = h
        .executor
        .start_pipeline(definition, "manual", "tests")
        .await
        .unwrap();
    let finished = h.executor.wait_for_completion(execution.id).await.unwrap();

    assert_eq!(finished.status, ExecutionStatus::Completed);
    assert_eq!(
        finished.stage_results.get("cleanup").unwrap().status,
        StageStatus::Success
    );
}

#[tokio::test]
async fn test_pause_stops_dispatch_and_resume_continues() {
    let h = harness();
    let _worker = spawn_worker(&h.bus, "builder", Duration::from_millis(50), succeed);

    let definition = PipelineDefinition::new("pausable")
        .with_stage(StageDefinition::new("first", "builder", "run"))
        .with_stage(StageDefinition::new("second", "builder", "run").depends_on("first"));

    let execution = h
        .executor
        .start_pipeline(definition, "manual", "tests")
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(10)).await;
    h.executor.pause_execution(execution.id).unwrap();

    // The in-flight first stage drains; the second is not dispatched.
    tokio::time::sleep(Duration::from_millis(150)).await;
    let paused = h.executor.execution(execution.id).unwrap();
    assert_eq!(paused.status, ExecutionStatus::Paused);
    assert_eq!(
        paused.stage_results.get("first").unwrap().status,
        StageStatus::Success
    );
    assert!(paused.stage_results.get("second").is_none());

    h.executor.resume_execution(execution.id).unwrap();
    let finished = h.executor.wait_for_completion(execution.id).await.unwrap();
    assert_eq!(finished.status, ExecutionStatus::Completed);
    assert_eq!(
        finished.stage_results.get("second").unwrap().status,
        StageStatus::Success
    );
    assert_eq!(h.sink.events_of_type("execution_paused").len(), 1);
    assert_eq!(h.sink.events_of_type("execution_resumed").len(), 1);
}

#[tokio::test]
async fn test_pause_holds_join_stage_in_parallel_pipeline() {
    let h = harness();
    let _worker = spawn_worker(&h.bus, "builder", Duration::from_millis(40), succeed);

    let definition = PipelineDefinition::new("parallel-pausable")
        .with_mode(ExecutionMode::Parallel)
        .with_stage(StageDefinition::new("fetch", "builder", "run"))
        .with_stage(StageDefinition::new("analyze", "builder", "run"))
        .with_stage(
            StageDefinition::new("report", "builder", "run")
                .depends_on("fetch")
                .depends_on("analyze"),
        );

    let execution = h
        .executor
        .start_pipeline(definition, "manual", "tests")
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(10)).await;
    h.executor.pause_execution(execution.id).unwrap();

    // Both in-flight branches drain and their results land while
    // paused; the join stage is not dispatched.
    tokio::time::sleep(Duration::from_millis(120)).await;
    let paused = h.executor.execution(execution.id).unwrap();
    assert_eq!(paused.status, ExecutionStatus::Paused);
    assert_eq!(
        paused.stage_results.get("fetch").unwrap().status,
        StageStatus::Success
    );
    assert_eq!(
        paused.stage_results.get("analyze").unwrap().status,
        StageStatus::Success
    );
    assert!(paused.stage_results.get("report").is_none());
    assert_eq!(h.sink.events_of_type("stage_started").len(), 2);

    h.executor.resume_execution(execution.id).unwrap();
    let finished = h.executor.wait_for_completion(execution.id).await.unwrap();
    assert_eq!(finished.status, ExecutionStatus::Completed);
    assert_eq!(
        finished.stage_results.get("report").unwrap().status,
        StageStatus::Success
    );
    assert_eq!(h.sink.events_of_type("stage_started").len(), 3);
}

#[tokio::test]
async fn test_pause_rejected_once_terminal() {
    let h = harness();
    let _worker = spawn_worker(&h.bus, "builder", Duration::ZERO, succeed);

    let definition =
        PipelineDefinition::new("done").with_stage(StageDefinition::new("only", "builder", "run"));
    let execution = h
        .executor
        .start_pipeline(definition, "manual", "tests")
        .await
        .unwrap();
    h.executor.wait_for_completion(execution.id).await.unwrap();

    let err = h.executor.pause_execution(execution.id).unwrap_err();
    assert_eq!(err.code(), Some("FLOW-002-STATE"));
}

#[tokio::test]
async fn test_cancel_records_late_results() {
    let h = harness();
    let _worker = spawn_worker(&h.bus, "builder", Duration::from_millis(100), succeed);

    let definition = PipelineDefinition::new("cancellable")
        .with_stage(StageDefinition::new("slow", "builder", "run"))
        .with_stage(StageDefinition::new("after", "builder", "run").depends_on("slow"));

    let execution = h
        .executor
        .start_pipeline(definition, "manual", "tests")
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(10)).await;
    h.executor.cancel_execution(execution.id).unwrap();

    let cancelled = h.executor.wait_for_completion(execution.id).await.unwrap();
    assert_eq!(cancelled.status, ExecutionStatus::Cancelled);

    // The in-flight stage's result still lands for the audit trail,
    // but nothing new is dispatched.
    tokio::time::sleep(Duration::from_millis(200)).await;
    let after = h.executor.execution(execution.id).unwrap();
    assert_eq!(after.status, ExecutionStatus::Cancelled);
    assert_eq!(
        after.stage_results.get("slow").unwrap().status,
        StageStatus::Success
    );
    assert!(after.stage_results.get("after").is_none());
}

#[tokio::test]
async fn test_stage_timeout_fails_execution() {
    let h = harness();
    // No worker subscribed: the dispatch goes nowhere and the stage
    // times out.
    let definition = PipelineDefinition::new("stuck").with_stage(
        StageDefinition::new("hang", "builder", "run").with_timeout_ms(50),
    );

    let execution = h
        .executor
        .start_pipeline(definition, "manual", "tests")
        .await
        .unwrap();
    let finished = h.executor.wait_for_completion(execution.id).await.unwrap();

    assert_eq!(finished.status, ExecutionStatus::Failed);
    let hang = finished.stage_results.get("hang").unwrap();
    assert_eq!(hang.status, StageStatus::Failed);
    assert!(hang.error.as_deref().unwrap().contains("Timed out"));
}

#[tokio::test]
async fn test_parallel_diamond_runs_both_branches() {
    let h = harness();
    let _worker = spawn_worker(&h.bus, "builder", Duration::from_millis(20), succeed);

    let definition = PipelineDefinition::new("diamond")
        .with_mode(ExecutionMode::Parallel)
        .with_stage(StageDefinition::new("root", "builder", "run"))
        .with_stage(StageDefinition::new("left", "builder", "run").depends_on("root"))
        .with_stage(StageDefinition::new("right", "builder", "run").depends_on("root"))
        .with_stage(
            StageDefinition::new("join", "builder", "run")
                .depends_on("left")
                .depends_on("right"),
        );

    let execution = h
        .executor
        .start_pipeline(definition, "manual", "tests")
        .await
        .unwrap();
    let finished = h.executor.wait_for_completion(execution.id).await.unwrap();

    assert_eq!(finished.status, ExecutionStatus::Completed);
    assert_eq!(finished.stage_results.len(), 4);
    assert!(finished
        .stage_results
        .values()
        .all(|r| r.status == StageStatus::Success));
}

#[tokio::test]
async fn test_archive_evicts_terminal_execution() {
    let h = harness();
    let _worker = spawn_worker(&h.bus, "builder", Duration::from_millis(50), succeed);

    let definition = PipelineDefinition::new("archivable")
        .with_stage(StageDefinition::new("only", "builder", "run"));
    let execution = h
        .executor
        .start_pipeline(definition, "manual", "tests")
        .await
        .unwrap();

    // Still running: archival is refused.
    let err = h.executor.archive_execution(execution.id).err().unwrap();
    assert_eq!(err.code(), Some("FLOW-002-STATE"));

    h.executor.wait_for_completion(execution.id).await.unwrap();
    let archived = h.executor.archive_execution(execution.id).unwrap();
    assert_eq!(archived.status, ExecutionStatus::Completed);

    // Evicted: further lookups and archivals miss.
    assert!(h.executor.execution(execution.id).is_none());
    let err = h.executor.archive_execution(execution.id).err().unwrap();
    assert_eq!(err.code(), Some("FLOW-002-NOT_FOUND"));
}

#[tokio::test]
async fn test_lifecycle_updates_reach_broadcast_observers() {
    let h = harness();
    let _worker = spawn_worker(&h.bus, "builder", Duration::ZERO, succeed);

    let definition = PipelineDefinition::new("observed")
        .with_stage(StageDefinition::new("only", "builder", "run"));

    let execution = h
        .executor
        .start_pipeline(definition.clone(), "manual", "tests")
        .await
        .unwrap();
    let (observer, mut rx) = h.hub.register();
    h.hub.handle_control(
        observer,
        ClientFrame::Subscribe {
            execution_id: execution.id,
        },
    );

    h.executor.wait_for_completion(execution.id).await.unwrap();

    let mut seen = Vec::new();
    while let Ok(frame) = rx.try_recv() {
        if let ServerFrame::Update { event_type, .. } = frame {
            seen.push(event_type);
        }
    }
    assert!(seen.contains(&"execution_completed".to_string()));
}
