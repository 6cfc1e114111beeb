//! The job consumer worker.
//!
//! Reads dispatch messages from the durable jobs stream as a member of
//! the consumer group, resolves the handler, and records the execution
//! outcome. Acknowledgement is the commit point: a handler success acks
//! the entry, a transient failure leaves it pending so the stream's
//! redelivery and dead-letter policy take over. An unknown handler is
//! permanent and is acked after recording the failure, since redelivery
//! can never make it resolve.

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use crate::bus::{StreamEntry, StreamLog};
use crate::config::FlowConfig;
use crate::errors::FlowError;
use crate::registry::{JobContext, JobHandlerRegistry};
use crate::store::KeyValueStore;

use super::model::{JobDispatch, JobExecution, JobExecutionStatus};
use super::store::JobStore;
use super::{running_slot_key, JOBS_GROUP, JOBS_STREAM};

const POLL_IDLE: Duration = Duration::from_millis(500);

/// Consumer-group worker executing dispatched jobs.
pub struct JobConsumer {
    stream: Arc<dyn StreamLog>,
    store: Arc<dyn JobStore>,
    kv: Arc<dyn KeyValueStore>,
    handlers: Arc<JobHandlerRegistry>,
    worker_id: String,
    config: FlowConfig,
}

impl JobConsumer {
    /// Creates a consumer identified by `worker_id` within the group.
    #[must_use]
    pub fn new(
        stream: Arc<dyn StreamLog>,
        store: Arc<dyn JobStore>,
        kv: Arc<dyn KeyValueStore>,
        handlers: Arc<JobHandlerRegistry>,
        worker_id: impl Into<String>,
        config: FlowConfig,
    ) -> Self {
        Self {
            stream,
            store,
            kv,
            handlers,
            worker_id: worker_id.into(),
            config,
        }
    }

    /// Runs the read loop until the task is aborted.
    pub async fn run(&self) {
        loop {
            match self.poll_once().await {
                Ok(0) => tokio::time::sleep(POLL_IDLE).await,
                Ok(_) => {}
                Err(err) => {
                    tracing::error!(error = %err, "job consumer poll failed");
                    tokio::time::sleep(POLL_IDLE).await;
                }
            }
        }
    }

    /// Claims and processes one batch. Returns the number of entries
    /// claimed.
    ///
    /// # Errors
    ///
    /// Fails when the stream cannot be read; per-entry processing
    /// errors are recorded against the execution instead.
    pub async fn poll_once(&self) -> Result<usize, FlowError> {
        let entries = self
            .stream
            .read_group(
                JOBS_STREAM,
                JOBS_GROUP,
                &self.worker_id,
                self.config.dispatch_batch_size,
            )
            .await?;
        let claimed = entries.len();

        for entry in entries {
            if let Err(err) = self.process(entry).await {
                tracing::error!(error = %err, "failed to process job dispatch");
            }
        }
        Ok(claimed)
    }

    async fn process(&self, entry: StreamEntry) -> Result<(), FlowError> {
        let Ok(dispatch) = serde_json::from_value::<JobDispatch>(entry.envelope.payload.clone())
        else {
            // A malformed entry can never become parseable; drop it from
            // the pending list rather than cycling it to the DLQ.
            tracing::error!(entry_id = entry.id, "malformed job dispatch; acknowledging");
            self.stream.ack(JOBS_STREAM, JOBS_GROUP, entry.id).await?;
            return Ok(());
        };

        // A store failure here must leave the entry pending, never
        // default the overlap check: guessing "unlimited" would run
        // the handler without releasing the dispatcher's slot claim.
        let limited = self
            .store
            .get(dispatch.job_id)
            .await?
            .is_some_and(|job| !job.allow_overlap);

        // The dispatcher claimed the concurrency slot when it recorded
        // the pending execution. An attempt releases the slot exactly
        // when it records an outcome, so a record past `Pending` means
        // the claim is gone and this redelivery must re-claim; a record
        // still `Pending` means the dispatcher's claim is held.
        let prior = self.store.execution(dispatch.execution_id).await?;
        let prior_attempted = prior
            .as_ref()
            .is_some_and(|run| run.status != JobExecutionStatus::Pending);
        if limited && entry.delivery_count > 1 && prior_attempted {
            self.kv.incr(&running_slot_key(dispatch.job_id)).await?;
        }

        let mut execution = prior.unwrap_or_else(|| {
            JobExecution::with_id(
                dispatch.execution_id,
                dispatch.job_id,
                dispatch.trace_id.clone(),
            )
        });
        execution.retry_count = entry.delivery_count.saturating_sub(1);

        let mut recorded = false;
        let attempt = self.run_attempt(&dispatch, execution, &mut recorded).await;
        if limited && recorded {
            self.release_slot(dispatch.job_id).await;
        }

        if attempt? {
            self.stream.ack(JOBS_STREAM, JOBS_GROUP, entry.id).await?;
        } else {
            tracing::warn!(
                job_id = %dispatch.job_id,
                delivery = entry.delivery_count,
                "job handler failed; leaving entry for redelivery"
            );
        }
        Ok(())
    }

    /// Resolves and runs the handler, recording every outcome. Returns
    /// whether the entry should be acknowledged.
    async fn run_attempt(
        &self,
        dispatch: &JobDispatch,
        mut execution: JobExecution,
        recorded: &mut bool,
    ) -> Result<bool, FlowError> {
        let handler = match self.handlers.get(&dispatch.handler_name) {
            Ok(handler) => handler,
            Err(err) => {
                execution.status = JobExecutionStatus::Failed;
                execution.completed_at = Some(Utc::now());
                execution.error = Some(err.to_string());
                self.store.record_execution(execution).await?;
                *recorded = true;
                tracing::error!(
                    handler = %dispatch.handler_name,
                    job_id = %dispatch.job_id,
                    "unknown job handler; execution failed permanently"
                );
                // Permanent: redelivery cannot resolve the handler.
                return Ok(true);
            }
        };

        execution.status = JobExecutionStatus::Running;
        execution.started_at = Some(Utc::now());
        execution.worker_id = Some(self.worker_id.clone());
        self.store.record_execution(execution.clone()).await?;
        *recorded = true;

        let ctx = JobContext {
            worker_id: self.worker_id.clone(),
            trace_id: dispatch.trace_id.clone(),
            execution_id: dispatch.execution_id,
        };
        let deadline = Duration::from_millis(dispatch.timeout_ms);
        let outcome =
            tokio::time::timeout(deadline, handler.run(dispatch.payload.clone(), &ctx)).await;

        execution.completed_at = Some(Utc::now());
        let ack = match outcome {
            Ok(Ok(_output)) => {
                execution.status = JobExecutionStatus::Success;
                execution.error = None;
                true
            }
            Ok(Err(err)) => {
                execution.status = JobExecutionStatus::Failed;
                execution.error = Some(err.to_string());
                false
            }
            Err(_) => {
                execution.status = JobExecutionStatus::Timeout;
                execution.error = Some(format!(
                    "handler '{}' exceeded {}ms",
                    dispatch.handler_name, dispatch.timeout_ms
                ));
                false
            }
        };

        // State is persisted before the entry is (not) acked, so a crash
        // here is recoverable from the store plus the pending list.
        self.store.record_execution(execution).await?;
        Ok(ack)
    }

    async fn release_slot(&self, job_id: Uuid) {
        if let Err(err) = self.kv.decr(&running_slot_key(job_id)).await {
            tracing::error!(job_id = %job_id, error = %err, "failed to release concurrency slot");
        }
    }
}

impl std::fmt::Debug for JobConsumer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobConsumer")
            .field("worker_id", &self.worker_id)
            .finish()
    }
}
