//! Real-time fan-out of executor lifecycle events to observers.
//!
//! Observers hold a persistent connection (modeled as a bounded channel),
//! manage their execution-id filters with subscribe/unsubscribe control
//! frames, and receive `update` frames plus `pong` keep-alives. A slow or
//! disconnected observer is dropped from the hub; it never blocks the
//! executor.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use tokio::sync::mpsc;
use uuid::Uuid;

/// Control frames sent by an observer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    /// Start receiving updates for one execution.
    Subscribe {
        /// The execution to follow.
        execution_id: Uuid,
    },
    /// Stop receiving updates for one execution.
    Unsubscribe {
        /// The execution to stop following.
        execution_id: Uuid,
    },
    /// Keep-alive probe.
    Ping,
}

/// Frames pushed to an observer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    /// A lifecycle or metric update for a subscribed execution.
    Update {
        /// The execution the update belongs to.
        execution_id: Uuid,
        /// Lifecycle event name.
        event_type: String,
        /// Event payload.
        data: serde_json::Value,
    },
    /// Keep-alive response.
    Pong,
}

struct Observer {
    tx: mpsc::Sender<ServerFrame>,
    filters: HashSet<Uuid>,
}

/// Hub fanning executor events out to registered observers.
pub struct BroadcastHub {
    observers: DashMap<Uuid, Observer>,
    buffer: usize,
}

impl Default for BroadcastHub {
    fn default() -> Self {
        Self::new(64)
    }
}

impl BroadcastHub {
    /// Creates a hub with the given per-observer channel capacity.
    #[must_use]
    pub fn new(buffer: usize) -> Self {
        Self {
            observers: DashMap::new(),
            buffer: buffer.max(1),
        }
    }

    /// Registers a new observer connection, returning its id and the
    /// receiving end of its frame channel.
    #[must_use]
    pub fn register(&self) -> (Uuid, mpsc::Receiver<ServerFrame>) {
        let id = Uuid::new_v4();
        let (tx, rx) = mpsc::channel(self.buffer);
        self.observers.insert(
            id,
            Observer {
                tx,
                filters: HashSet::new(),
            },
        );
        (id, rx)
    }

    /// Removes an observer connection.
    pub fn disconnect(&self, observer_id: Uuid) {
        self.observers.remove(&observer_id);
    }

    /// Handles a control frame from an observer. Unknown observers are
    /// ignored (their connection already went away).
    pub fn handle_control(&self, observer_id: Uuid, frame: ClientFrame) {
        let Some(mut observer) = self.observers.get_mut(&observer_id) else {
            return;
        };

        match frame {
            ClientFrame::Subscribe { execution_id } => {
                observer.filters.insert(execution_id);
            }
            ClientFrame::Unsubscribe { execution_id } => {
                observer.filters.remove(&execution_id);
            }
            ClientFrame::Ping => {
                // Keep-alives share the data channel; a full channel means
                // the observer is stalled and will be dropped on the next
                // update anyway.
                let _ = observer.tx.try_send(ServerFrame::Pong);
            }
        }
    }

    /// Fans an update out to every observer subscribed to `execution_id`.
    ///
    /// Observers whose channel is closed or full are dropped from the hub.
    pub fn publish_update(
        &self,
        execution_id: Uuid,
        event_type: impl Into<String>,
        data: serde_json::Value,
    ) {
        let event_type = event_type.into();
        let mut stalled = Vec::new();

        for entry in &self.observers {
            if !entry.filters.contains(&execution_id) {
                continue;
            }
            let frame = ServerFrame::Update {
                execution_id,
                event_type: event_type.clone(),
                data: data.clone(),
            };
            if entry.tx.try_send(frame).is_err() {
                stalled.push(*entry.key());
            }
        }

        for observer_id in stalled {
            tracing::warn!(%observer_id, "dropping stalled broadcast observer");
            self.observers.remove(&observer_id);
        }
    }

    /// Number of connected observers.
    #[must_use]
    pub fn observer_count(&self) -> usize {
        self.observers.len()
    }
}

impl std::fmt::Debug for BroadcastHub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BroadcastHub")
            .field("observers", &self.observers.len())
            .field("buffer", &self.buffer)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_filtered_fan_out() {
        let hub = BroadcastHub::default();
        let exec_a = Uuid::new_v4();
        let exec_b = Uuid::new_v4();

        let (id_a, mut rx_a) = hub.register();
        let (id_b, mut rx_b) = hub.register();
        hub.handle_control(id_a, ClientFrame::Subscribe { execution_id: exec_a });
        hub.handle_control(id_b, ClientFrame::Subscribe { execution_id: exec_b });

        hub.publish_update(exec_a, "stage_completed", serde_json::json!({"stage": "build"}));

        let frame = rx_a.try_recv().unwrap();
        assert!(matches!(frame, ServerFrame::Update { execution_id, .. } if execution_id == exec_a));
        assert!(rx_b.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_unsubscribe_stops_updates() {
        let hub = BroadcastHub::default();
        let exec = Uuid::new_v4();
        let (id, mut rx) = hub.register();

        hub.handle_control(id, ClientFrame::Subscribe { execution_id: exec });
        hub.publish_update(exec, "execution_started", serde_json::json!({}));
        assert!(rx.try_recv().is_ok());

        hub.handle_control(id, ClientFrame::Unsubscribe { execution_id: exec });
        hub.publish_update(exec, "execution_completed", serde_json::json!({}));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_ping_pong() {
        let hub = BroadcastHub::default();
        let (id, mut rx) = hub.register();

        hub.handle_control(id, ClientFrame::Ping);
        assert_eq!(rx.try_recv().unwrap(), ServerFrame::Pong);
    }

    #[tokio::test]
    async fn test_stalled_observer_dropped() {
        let hub = BroadcastHub::new(1);
        let exec = Uuid::new_v4();
        let (id, _rx) = hub.register();
        hub.handle_control(id, ClientFrame::Subscribe { execution_id: exec });

        // Fill the buffer, then overflow it.
        hub.publish_update(exec, "stage_started", serde_json::json!({}));
        hub.publish_update(exec, "stage_completed", serde_json::json!({}));

        assert_eq!(hub.observer_count(), 0);
    }

    #[tokio::test]
    async fn test_disconnect() {
        let hub = BroadcastHub::default();
        let (id, _rx) = hub.register();
        assert_eq!(hub.observer_count(), 1);
        hub.disconnect(id);
        assert_eq!(hub.observer_count(), 0);
    }

    #[test]
    fn test_frame_serde() {
        let frame = ClientFrame::Subscribe {
            execution_id: Uuid::nil(),
        };
        let json = serde_json::to_string(&frame).unwrap();
        assert!(json.contains(r#""type":"subscribe""#));

        let pong = serde_json::to_string(&ServerFrame::Pong).unwrap();
        assert!(pong.contains(r#""type":"pong""#));
    }
}
