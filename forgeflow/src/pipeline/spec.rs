//! Pipeline and stage definitions.
//!
//! Definitions are authored ahead of time and read-only during
//! execution. Validation happens at submission: duplicate stage ids,
//! dependencies on unknown stages, and dependency cycles are all
//! rejected before anything is dispatched.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use uuid::Uuid;

use crate::errors::{CycleDetectedError, FlowError, PipelineValidationError};
use crate::gates::QualityGate;

/// How stage eligibility treats the upstream stage's outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DependencyCondition {
    /// Upstream must have succeeded.
    #[default]
    Success,
    /// Upstream must have executed to a terminal outcome, success or
    /// failure.
    Completed,
    /// Satisfied regardless of upstream outcome, including skipped.
    Always,
}

/// A dependency edge between two stages.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageDependency {
    /// The upstream stage id.
    pub stage_id: String,
    /// Whether an unsatisfied edge skips the downstream stage (true) or
    /// is merely advisory (false).
    #[serde(default = "default_required")]
    pub required: bool,
    /// Outcome condition for the edge.
    #[serde(default)]
    pub condition: DependencyCondition,
}

fn default_required() -> bool {
    true
}

impl StageDependency {
    /// A required, success-conditioned dependency.
    #[must_use]
    pub fn on(stage_id: impl Into<String>) -> Self {
        Self {
            stage_id: stage_id.into(),
            required: true,
            condition: DependencyCondition::Success,
        }
    }

    /// Sets the condition.
    #[must_use]
    pub fn with_condition(mut self, condition: DependencyCondition) -> Self {
        self.condition = condition;
        self
    }

    /// Marks the edge as advisory rather than required.
    #[must_use]
    pub fn optional(mut self) -> Self {
        self.required = false;
        self
    }
}

/// Whether eligible stages run one at a time or concurrently.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    /// One eligible stage at a time, dependency-then-definition order.
    #[default]
    Sequential,
    /// All currently-eligible stages dispatched concurrently.
    Parallel,
}

/// Definition of one unit of work within a pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageDefinition {
    /// Unique id within the pipeline.
    pub id: String,
    /// Display name.
    pub name: String,
    /// Worker type that executes this stage.
    pub agent_type: String,
    /// Operation name dispatched to the worker.
    pub action: String,
    /// Stage parameters, opaque to the executor.
    #[serde(default)]
    pub parameters: serde_json::Value,
    /// Dependency edges.
    #[serde(default)]
    pub dependencies: Vec<StageDependency>,
    /// Quality gates evaluated after the stage completes.
    #[serde(default)]
    pub quality_gates: Vec<QualityGate>,
    /// Per-stage timeout; the executor default applies when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    /// Names of outputs to persist.
    #[serde(default)]
    pub artifacts: Vec<String>,
    /// Whether a failure of this stage aborts the whole execution.
    #[serde(default)]
    pub continue_on_failure: bool,
}

impl StageDefinition {
    /// Creates a stage definition.
    #[must_use]
    pub fn new(
        id: impl Into<String>,
        agent_type: impl Into<String>,
        action: impl Into<String>,
    ) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            agent_type: agent_type.into(),
            action: action.into(),
            parameters: serde_json::Value::Object(serde_json::Map::new()),
            dependencies: Vec::new(),
            quality_gates: Vec::new(),
            timeout_ms: None,
            artifacts: Vec::new(),
            continue_on_failure: false,
        }
    }

    /// Sets the display name.
    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Sets the parameters.
    #[must_use]
    pub fn with_parameters(mut self, parameters: serde_json::Value) -> Self {
        self.parameters = parameters;
        self
    }

    /// Adds a required success-conditioned dependency.
    #[must_use]
    pub fn depends_on(mut self, stage_id: impl Into<String>) -> Self {
        self.dependencies.push(StageDependency::on(stage_id));
        self
    }

    /// Adds an explicit dependency edge.
    #[must_use]
    pub fn with_dependency(mut self, dependency: StageDependency) -> Self {
        self.dependencies.push(dependency);
        self
    }

    /// Adds a quality gate.
    #[must_use]
    pub fn with_gate(mut self, gate: QualityGate) -> Self {
        self.quality_gates.push(gate);
        self
    }

    /// Sets the timeout.
    #[must_use]
    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }

    /// Marks a failure of this stage as non-fatal for the execution.
    #[must_use]
    pub fn continue_on_failure(mut self) -> Self {
        self.continue_on_failure = true;
        self
    }
}

/// Definition of an entire pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineDefinition {
    /// Pipeline id.
    pub id: Uuid,
    /// Pipeline name.
    pub name: String,
    /// Definition version.
    pub version: String,
    /// Owning workflow, when any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workflow_id: Option<String>,
    /// Stage definitions, in authoring order.
    pub stages: Vec<StageDefinition>,
    /// Dispatch mode for eligible stages.
    #[serde(default)]
    pub execution_mode: ExecutionMode,
    /// Environment passed to all stages.
    #[serde(default)]
    pub environment: HashMap<String, String>,
    /// Additional metadata.
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

impl PipelineDefinition {
    /// Creates a pipeline definition.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            version: "1".to_string(),
            workflow_id: None,
            stages: Vec::new(),
            execution_mode: ExecutionMode::default(),
            environment: HashMap::new(),
            metadata: HashMap::new(),
        }
    }

    /// Sets the execution mode.
    #[must_use]
    pub fn with_mode(mut self, mode: ExecutionMode) -> Self {
        self.execution_mode = mode;
        self
    }

    /// Adds a stage.
    #[must_use]
    pub fn with_stage(mut self, stage: StageDefinition) -> Self {
        self.stages.push(stage);
        self
    }

    /// Adds an environment entry.
    #[must_use]
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.environment.insert(key.into(), value.into());
        self
    }

    /// Looks up a stage by id.
    #[must_use]
    pub fn stage(&self, id: &str) -> Option<&StageDefinition> {
        self.stages.iter().find(|s| s.id == id)
    }

    /// Validates the definition: non-empty, unique stage ids, known
    /// dependency targets, and an acyclic dependency graph.
    ///
    /// # Errors
    ///
    /// Returns a validation error describing the first problem found.
    pub fn validate(&self) -> Result<(), FlowError> {
        if self.stages.is_empty() {
            return Err(PipelineValidationError::new("Pipeline has no stages").into());
        }

        let mut ids = HashSet::new();
        for stage in &self.stages {
            if !ids.insert(stage.id.as_str()) {
                return Err(PipelineValidationError::new(format!(
                    "Duplicate stage id '{}'",
                    stage.id
                ))
                .with_stages(vec![stage.id.clone()])
                .into());
            }
        }

        for stage in &self.stages {
            for dep in &stage.dependencies {
                if !ids.contains(dep.stage_id.as_str()) {
                    return Err(
                        PipelineValidationError::unknown_stage(&stage.id, &dep.stage_id).into(),
                    );
                }
            }
        }

        self.detect_cycles()?;
        Ok(())
    }

    /// Detects cycles in the dependency graph via DFS with a recursion
    /// stack, reporting the offending path.
    fn detect_cycles(&self) -> Result<(), CycleDetectedError> {
        let mut visited = HashSet::new();
        let mut rec_stack = HashSet::new();
        let mut path = Vec::new();

        for stage in &self.stages {
            if !visited.contains(stage.id.as_str()) {
                if let Some(cycle) =
                    self.dfs_cycle(&stage.id, &mut visited, &mut rec_stack, &mut path)
                {
                    return Err(CycleDetectedError::new(cycle));
                }
            }
        }

        Ok(())
    }

    fn dfs_cycle(
        &self,
        node: &str,
        visited: &mut HashSet<String>,
        rec_stack: &mut HashSet<String>,
        path: &mut Vec<String>,
    ) -> Option<Vec<String>> {
        visited.insert(node.to_string());
        rec_stack.insert(node.to_string());
        path.push(node.to_string());

        if let Some(stage) = self.stage(node) {
            for dep in &stage.dependencies {
                let target = dep.stage_id.as_str();
                if !visited.contains(target) {
                    if let Some(cycle) = self.dfs_cycle(target, visited, rec_stack, path) {
                        return Some(cycle);
                    }
                } else if rec_stack.contains(target) {
                    let cycle_start = path.iter().position(|n| n == target).unwrap_or(0);
                    let mut cycle: Vec<String> = path[cycle_start..].to_vec();
                    cycle.push(target.to_string());
                    return Some(cycle);
                }
            }
        }

        path.pop();
        rec_stack.remove(node);
        None
    }
}
