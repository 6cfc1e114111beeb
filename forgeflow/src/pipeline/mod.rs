//! DAG-based pipeline execution.
//!
//! A [`PipelineDefinition`] names stages and the dependency edges
//! between them; the [`PipelineExecutor`] validates the graph, then
//! dispatches stages to workers over the message bus as their
//! dependencies resolve, applying quality gates to each result.

mod execution;
mod executor;
mod spec;

#[cfg(test)]
mod integration_tests;

pub use execution::{
    ExecutionStatus, PipelineExecution, StageResult, StageStatus, TaskDispatch, TaskResult,
    TaskStatus,
};
pub use executor::PipelineExecutor;
pub use spec::{
    DependencyCondition, ExecutionMode, PipelineDefinition, StageDefinition, StageDependency,
};
