//! In-memory bus for tests and single-process deployments.
//!
//! Implements both the pub/sub port and the durable stream port. Each
//! subscriber gets a dedicated delivery task fed by an ordered channel,
//! so per-subscriber FIFO holds and a slow or failing handler never
//! blocks other subscribers.

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

use super::{BusHealth, MessageBus, PublishOptions, StreamEntry, StreamLog, Subscription, TopicHandler};
use crate::envelope::EventEnvelope;
use crate::errors::FlowError;

/// Stream behavior knobs.
#[derive(Debug, Clone)]
pub struct StreamConfig {
    /// Deliveries allowed per entry before dead-lettering.
    pub max_deliveries: u32,
    /// How long a claimed entry may sit unacknowledged before it becomes
    /// claimable again.
    pub redelivery_idle: Duration,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            max_deliveries: 5,
            redelivery_idle: Duration::from_secs(30),
        }
    }
}

#[derive(Debug)]
struct PendingDelivery {
    consumer: String,
    delivery_count: u32,
    last_delivery: Instant,
}

#[derive(Debug, Default)]
struct GroupState {
    /// Index into the entry log of the next never-delivered entry.
    cursor: usize,
    pending: BTreeMap<u64, PendingDelivery>,
}

#[derive(Debug, Default)]
struct StreamState {
    next_id: u64,
    entries: Vec<(u64, EventEnvelope)>,
    groups: HashMap<String, GroupState>,
    dead: Vec<StreamEntry>,
}

impl StreamState {
    fn envelope_for(&self, entry_id: u64) -> Option<&EventEnvelope> {
        self.entries
            .binary_search_by_key(&entry_id, |(id, _)| *id)
            .ok()
            .map(|idx| &self.entries[idx].1)
    }
}

/// In-memory [`MessageBus`] and [`StreamLog`].
pub struct InMemoryBus {
    topics: Arc<DashMap<String, HashMap<u64, mpsc::UnboundedSender<EventEnvelope>>>>,
    streams: Arc<Mutex<HashMap<String, StreamState>>>,
    next_subscriber_id: AtomicU64,
    stream_config: StreamConfig,
}

impl Default for InMemoryBus {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryBus {
    /// Creates a bus with default stream behavior.
    #[must_use]
    pub fn new() -> Self {
        Self::with_stream_config(StreamConfig::default())
    }

    /// Creates a bus with explicit stream behavior.
    #[must_use]
    pub fn with_stream_config(stream_config: StreamConfig) -> Self {
        Self {
            topics: Arc::new(DashMap::new()),
            streams: Arc::new(Mutex::new(HashMap::new())),
            next_subscriber_id: AtomicU64::new(0),
            stream_config,
        }
    }

    /// Number of active subscribers on a topic.
    #[must_use]
    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.topics.get(topic).map_or(0, |subs| subs.len())
    }
}

impl std::fmt::Debug for InMemoryBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryBus")
            .field("topics", &self.topics.len())
            .field("stream_config", &self.stream_config)
            .finish()
    }
}

#[async_trait]
impl MessageBus for InMemoryBus {
    async fn publish(
        &self,
        topic: &str,
        envelope: EventEnvelope,
        options: PublishOptions,
    ) -> Result<(), FlowError> {
        if let Some(stream) = options.mirror_to_stream {
            self.append(&stream, envelope.clone()).await?;
        }

        if let Some(subs) = self.topics.get(topic) {
            for sender in subs.values() {
                // A closed channel means the subscriber is gone; skip it.
                let _ = sender.send(envelope.clone());
            }
        }

        Ok(())
    }

    fn subscribe(&self, topic: &str, handler: TopicHandler) -> Subscription {
        let subscriber_id = self.next_subscriber_id.fetch_add(1, Ordering::Relaxed);
        let (tx, mut rx) = mpsc::unbounded_channel::<EventEnvelope>();

        self.topics
            .entry(topic.to_string())
            .or_default()
            .insert(subscriber_id, tx);

        // Dedicated delivery task: preserves publish order per subscriber
        // and keeps handler failures contained to this subscriber.
        let task_topic = topic.to_string();
        tokio::spawn(async move {
            while let Some(envelope) = rx.recv().await {
                let envelope_id = envelope.id;
                if let Err(err) = handler(envelope).await {
                    tracing::warn!(
                        topic = %task_topic,
                        envelope_id = %envelope_id,
                        error = %err,
                        "subscriber handler failed"
                    );
                }
            }
        });

        let topics = Arc::clone(&self.topics);
        let topic = topic.to_string();
        Subscription::new(move || {
            if let Some(mut subs) = topics.get_mut(&topic) {
                subs.remove(&subscriber_id);
            }
        })
    }

    async fn health(&self) -> BusHealth {
        let start = Instant::now();
        let topic_count = self.topics.len();
        let stream_count = self.streams.lock().len();
        BusHealth {
            ok: true,
            latency_ms: start.elapsed().as_secs_f64() * 1000.0,
            details: format!("in-memory, {topic_count} topics, {stream_count} streams"),
        }
    }
}

#[async_trait]
impl StreamLog for InMemoryBus {
    async fn append(&self, stream: &str, envelope: EventEnvelope) -> Result<u64, FlowError> {
        let mut streams = self.streams.lock();
        let state = streams.entry(stream.to_string()).or_default();
        let id = state.next_id;
        state.next_id += 1;
        state.entries.push((id, envelope));
        Ok(id)
    }

    async fn read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        max: usize,
    ) -> Result<Vec<StreamEntry>, FlowError> {
        let mut streams = self.streams.lock();
        let Some(state) = streams.get_mut(stream) else {
            return Ok(Vec::new());
        };

        let mut claimed = Vec::new();
        let now = Instant::now();

        // Redeliveries first: idle pending entries get claimed again, or
        // dead-lettered once their delivery budget is spent.
        let idle_ids: Vec<u64> = state
            .groups
            .entry(group.to_string())
            .or_default()
            .pending
            .iter()
            .filter(|(_, p)| now.duration_since(p.last_delivery) >= self.stream_config.redelivery_idle)
            .map(|(id, _)| *id)
            .collect();

        for entry_id in idle_ids {
            if claimed.len() >= max {
                break;
            }
            let Some(envelope) = state.envelope_for(entry_id).cloned() else {
                continue;
            };
            let group_state = state.groups.get_mut(group).ok_or_else(|| {
                FlowError::Internal(format!("group '{group}' vanished mid-read"))
            })?;
            let Some(pending) = group_state.pending.get_mut(&entry_id) else {
                continue;
            };

            if pending.delivery_count >= self.stream_config.max_deliveries {
                let delivery_count = pending.delivery_count;
                group_state.pending.remove(&entry_id);
                tracing::warn!(
                    stream,
                    group,
                    entry_id,
                    delivery_count,
                    "entry exhausted delivery budget, dead-lettering"
                );
                state.dead.push(StreamEntry {
                    id: entry_id,
                    envelope,
                    delivery_count,
                });
                continue;
            }

            pending.delivery_count += 1;
            pending.consumer = consumer.to_string();
            pending.last_delivery = now;
            let delivery_count = pending.delivery_count;
            claimed.push(StreamEntry {
                id: entry_id,
                envelope,
                delivery_count,
            });
        }

        // Then new entries past the group's cursor.
        loop {
            if claimed.len() >= max {
                break;
            }
            let group_state = state
                .groups
                .get(group)
                .ok_or_else(|| FlowError::Internal(format!("group '{group}' vanished mid-read")))?;
            let Some((entry_id, envelope)) = state.entries.get(group_state.cursor).cloned() else {
                break;
            };

            let group_state = state.groups.get_mut(group).ok_or_else(|| {
                FlowError::Internal(format!("group '{group}' vanished mid-read"))
            })?;
            group_state.cursor += 1;
            group_state.pending.insert(
                entry_id,
                PendingDelivery {
                    consumer: consumer.to_string(),
                    delivery_count: 1,
                    last_delivery: now,
                },
            );
            claimed.push(StreamEntry {
                id: entry_id,
                envelope,
                delivery_count: 1,
            });
        }

        Ok(claimed)
    }

    async fn ack(&self, stream: &str, group: &str, entry_id: u64) -> Result<bool, FlowError> {
        let mut streams = self.streams.lock();
        Ok(streams
            .get_mut(stream)
            .and_then(|state| state.groups.get_mut(group))
            .is_some_and(|group_state| group_state.pending.remove(&entry_id).is_some()))
    }

    async fn pending(&self, stream: &str, group: &str) -> Result<usize, FlowError> {
        let streams = self.streams.lock();
        Ok(streams
            .get(stream)
            .and_then(|state| state.groups.get(group))
            .map_or(0, |group_state| group_state.pending.len()))
    }

    async fn dead_letters(&self, stream: &str) -> Result<Vec<StreamEntry>, FlowError> {
        let streams = self.streams.lock();
        Ok(streams.get(stream).map_or_else(Vec::new, |state| state.dead.clone()))
    }
}
