//! # Forgeflow
//!
//! The orchestration core for multi-agent workflows: DAG pipelines
//! dispatched over a message bus, scheduled jobs, and real-time
//! observability.
//!
//! Forgeflow provides:
//!
//! - **Pipeline execution**: stage DAGs with dependency conditions,
//!   quality gates, and pause/resume/cancel lifecycle control
//! - **Message bus port**: pub/sub topics plus durable streams with
//!   consumer-group redelivery and dead-lettering
//! - **Job scheduling**: cron/one-time/event jobs with a dispatcher and
//!   consumer worker pair
//! - **Idempotency and retry**: store-backed exactly-once helpers and
//!   bounded exponential backoff
//! - **Broadcast**: filtered fan-out of lifecycle events to observers
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use forgeflow::prelude::*;
//!
//! let definition = PipelineDefinition::new("ci")
//!     .with_stage(StageDefinition::new("build", "builder", "compile"))
//!     .with_stage(StageDefinition::new("test", "tester", "test").depends_on("build"));
//!
//! let execution = executor.start_pipeline(definition, "manual", "ops").await?;
//! let finished = executor.wait_for_completion(execution.id).await?;
//! ```

#![forbid(unsafe_code)]
#![warn(
    clippy::all,
    clippy::pedantic,
    missing_docs,
    rust_2018_idioms
)]
#![allow(
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc
)]

pub mod broadcast;
pub mod bus;
pub mod config;
pub mod envelope;
pub mod errors;
pub mod events;
pub mod gates;
pub mod idempotency;
pub mod jobs;
pub mod pipeline;
pub mod registry;
pub mod retry;
pub mod store;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::broadcast::{BroadcastHub, ClientFrame, ServerFrame};
    pub use crate::bus::{
        BusHealth, InMemoryBus, MessageBus, PublishOptions, StreamEntry, StreamLog, Subscription,
    };
    pub use crate::config::FlowConfig;
    pub use crate::envelope::EventEnvelope;
    pub use crate::errors::{
        CycleDetectedError, ErrorDetail, FlowError, InvalidStateError, PipelineValidationError,
        ScheduleError, UnknownHandlerError,
    };
    pub use crate::events::{
        CollectingEventSink, EventSink, LifecycleEvent, LoggingEventSink, NoOpEventSink,
    };
    pub use crate::gates::{GateEvaluation, GateOperator, GateResult, QualityGate};
    pub use crate::idempotency::{deduplicate_event, idempotency_key, once};
    pub use crate::jobs::{
        InMemoryJobStore, JobConsumer, JobDispatcher, JobExecution, JobExecutionStatus,
        JobStatus, JobStore, JobType, ScheduledJob,
    };
    pub use crate::pipeline::{
        DependencyCondition, ExecutionMode, ExecutionStatus, PipelineDefinition,
        PipelineExecution, PipelineExecutor, StageDefinition, StageDependency, StageResult,
        StageStatus, TaskResult, TaskStatus,
    };
    pub use crate::registry::{
        AgentRoute, AgentRouteRegistry, JobContext, JobHandler, JobHandlerRegistry,
    };
    pub use crate::retry::{with_retry, RetryConfig};
    pub use crate::store::{InMemoryKvStore, KeyValueStore, StoreHealth};
}
