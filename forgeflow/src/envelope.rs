//! The event envelope: the immutable wrapper every message on the bus
//! travels in.
//!
//! An envelope carries identity (`id`), routing (`event_type`), causal
//! linkage (`correlation_id`), isolation scope (`tenant_id`) and retry
//! bookkeeping. The payload itself is opaque JSON.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// An immutable message envelope.
///
/// `id` and `event_type` never change after creation. Retrying produces a
/// new envelope via [`EventEnvelope::retry`]; the original is never
/// mutated in place.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EventEnvelope {
    /// Unique identity of this message instance.
    pub id: Uuid,
    /// Topic/category of the message.
    pub event_type: String,
    /// Creation time.
    pub timestamp: DateTime<Utc>,
    /// Links related messages across a causal chain.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    /// Isolation scope.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tenant_id: Option<String>,
    /// Opaque structured payload.
    pub payload: serde_json::Value,
    /// Retry attempt counter; absent until the first retry.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attempts: Option<u32>,
    /// Last error message; set on retry.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl EventEnvelope {
    /// Creates a fresh envelope with a generated id and timestamp.
    #[must_use]
    pub fn new(event_type: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            event_type: event_type.into(),
            timestamp: Utc::now(),
            correlation_id: None,
            tenant_id: None,
            payload,
            attempts: None,
            last_error: None,
        }
    }

    /// Sets the correlation id.
    #[must_use]
    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    /// Sets the tenant id.
    #[must_use]
    pub fn with_tenant_id(mut self, tenant_id: impl Into<String>) -> Self {
        self.tenant_id = Some(tenant_id.into());
        self
    }

    /// Returns a new envelope representing a retry of this one.
    ///
    /// The returned envelope keeps the same `id` and `event_type`, with
    /// `attempts` incremented and `last_error` recorded. `self` is
    /// untouched.
    #[must_use]
    pub fn retry(&self, error: impl Into<String>) -> Self {
        Self {
            attempts: Some(self.attempts.unwrap_or(0) + 1),
            last_error: Some(error.into()),
            ..self.clone()
        }
    }
}
