//! Message bus port: pub/sub over named topics with optional mirroring
//! onto durable streams.
//!
//! Pub/sub delivery is best-effort to currently-connected subscribers.
//! Stream mirroring gives at-least-once semantics to consumer groups,
//! with redelivery and a dead-letter path once a delivery budget is
//! exhausted.

mod memory;

pub use memory::{InMemoryBus, StreamConfig};

use async_trait::async_trait;
use futures::future::BoxFuture;
use std::sync::Arc;

use crate::envelope::EventEnvelope;
use crate::errors::FlowError;

/// Health probe result for a bus backend.
#[derive(Debug, Clone)]
pub struct BusHealth {
    /// Whether the bus responded.
    pub ok: bool,
    /// Round-trip latency in milliseconds.
    pub latency_ms: f64,
    /// Backend-specific details.
    pub details: String,
}

/// Options for a single publish call.
#[derive(Debug, Clone, Default)]
pub struct PublishOptions {
    /// When set, the envelope is additionally appended to this durable
    /// stream for consumer-group replay.
    pub mirror_to_stream: Option<String>,
}

impl PublishOptions {
    /// Pub/sub only, no stream mirror.
    #[must_use]
    pub fn fire_and_forget() -> Self {
        Self::default()
    }

    /// Pub/sub plus a durable append to `stream`.
    #[must_use]
    pub fn mirrored(stream: impl Into<String>) -> Self {
        Self {
            mirror_to_stream: Some(stream.into()),
        }
    }
}

/// Async handler invoked for each envelope delivered on a subscription.
pub type TopicHandler =
    Arc<dyn Fn(EventEnvelope) -> BoxFuture<'static, Result<(), FlowError>> + Send + Sync>;

/// Handle for an active subscription. Dropping it unsubscribes.
pub struct Subscription {
    cancel: Option<Box<dyn FnOnce() + Send>>,
}

impl Subscription {
    /// Creates a subscription from a cancellation closure.
    #[must_use]
    pub fn new(cancel: impl FnOnce() + Send + 'static) -> Self {
        Self {
            cancel: Some(Box::new(cancel)),
        }
    }

    /// Explicitly unsubscribes.
    pub fn unsubscribe(mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.cancel.is_some())
            .finish()
    }
}

/// Publish/subscribe over named topics.
///
/// Guarantees: every current subscriber of a topic receives its own copy
/// of each published envelope; for a single topic and single publisher,
/// delivery order to a given subscriber matches publish order; a failing
/// handler never prevents delivery to other subscribers or of later
/// messages.
#[async_trait]
pub trait MessageBus: Send + Sync {
    /// Publishes an envelope to all current subscribers of `topic`.
    async fn publish(
        &self,
        topic: &str,
        envelope: EventEnvelope,
        options: PublishOptions,
    ) -> Result<(), FlowError>;

    /// Registers a handler for `topic`. The returned subscription
    /// unsubscribes on drop.
    fn subscribe(&self, topic: &str, handler: TopicHandler) -> Subscription;

    /// Round-trip health probe.
    async fn health(&self) -> BusHealth;
}

/// A single entry claimed from a durable stream.
#[derive(Debug, Clone)]
pub struct StreamEntry {
    /// Monotonic entry id within the stream.
    pub id: u64,
    /// The mirrored envelope.
    pub envelope: EventEnvelope,
    /// How many times this entry has been delivered to the group.
    pub delivery_count: u32,
}

/// Durable append-only stream with consumer-group replay.
///
/// Each message is delivered to exactly one member of a group. Entries
/// stay pending until acknowledged; unacknowledged entries are
/// redelivered after an idle period, and dead-lettered once the
/// delivery budget is exhausted.
#[async_trait]
pub trait StreamLog: Send + Sync {
    /// Appends an envelope, returning its entry id.
    async fn append(&self, stream: &str, envelope: EventEnvelope) -> Result<u64, FlowError>;

    /// Claims up to `max` entries for `consumer` within `group`:
    /// redeliverable pending entries first, then new ones.
    async fn read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        max: usize,
    ) -> Result<Vec<StreamEntry>, FlowError>;

    /// Acknowledges an entry, removing it from the pending list.
    /// Returns false if the entry was not pending.
    async fn ack(&self, stream: &str, group: &str, entry_id: u64) -> Result<bool, FlowError>;

    /// Number of unacknowledged entries for the group.
    async fn pending(&self, stream: &str, group: &str) -> Result<usize, FlowError>;

    /// Entries that exhausted their delivery budget.
    async fn dead_letters(&self, stream: &str) -> Result<Vec<StreamEntry>, FlowError>;
}
