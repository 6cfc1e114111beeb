//! Scheduled job subsystem: model, schedule evaluation, and the
//! dispatcher/consumer worker pair.
//!
//! The dispatcher and consumers are independent processes that share
//! only the job store, the key-value store, and the bus. The dispatcher
//! publishes each due job onto [`JOBS_TOPIC`], mirrored to the durable
//! [`JOBS_STREAM`]; consumers compete for entries within [`JOBS_GROUP`].

mod consumer;
mod dispatcher;
mod model;
mod schedule;
mod store;

pub use consumer::JobConsumer;
pub use dispatcher::{DispatcherStats, JobDispatcher};
pub use model::{
    JobDispatch, JobExecution, JobExecutionStatus, JobStatus, JobType, ScheduledJob,
};
pub use schedule::{next_run_after, validate_schedule};
pub use store::{InMemoryJobStore, JobStore};

use uuid::Uuid;

/// Topic job dispatches are published on.
pub const JOBS_TOPIC: &str = "jobs:dispatch";

/// Durable stream the dispatches are mirrored to.
pub const JOBS_STREAM: &str = "jobs:stream";

/// Consumer group name for job consumers.
pub const JOBS_GROUP: &str = "job-consumers";

/// Key-value store key counting the running executions of a job.
#[must_use]
pub fn running_slot_key(job_id: Uuid) -> String {
    format!("job:{job_id}:running")
}
