//! Key-value store port.
//!
//! The store is the single source of truth for idempotency markers and
//! CAS-guarded counters. All concurrency-limit and dedup checks go through
//! its atomic primitives; callers never read-then-write with their own
//! locking, since multiple dispatcher/consumer processes may run against
//! the same backing store.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::errors::FlowError;

/// Health probe result for a store backend.
#[derive(Debug, Clone)]
pub struct StoreHealth {
    /// Whether the store responded.
    pub ok: bool,
    /// Round-trip latency in milliseconds.
    pub latency_ms: f64,
    /// Backend-specific details.
    pub details: String,
}

/// Minimal atomic key-value store contract.
///
/// Implementations must make `incr`, `set_nx` and `compare_and_swap`
/// atomic with respect to concurrent callers; the idempotency layer and
/// the job dispatcher's concurrency limiting rely on that.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Gets a value by key. Expired entries read as absent.
    async fn get(&self, key: &str) -> Result<Option<String>, FlowError>;

    /// Sets a value, optionally with a TTL.
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), FlowError>;

    /// Deletes a key. Returns true if the key existed.
    async fn delete(&self, key: &str) -> Result<bool, FlowError>;

    /// Atomically increments a numeric key by one, creating it at zero
    /// first if absent. Returns the new value.
    async fn incr(&self, key: &str) -> Result<i64, FlowError>;

    /// Atomically decrements a numeric key by one, creating it at zero
    /// first if absent. Returns the new value.
    async fn decr(&self, key: &str) -> Result<i64, FlowError>;

    /// Atomically sets a key only if it is absent. Returns true if the
    /// key was claimed by this call.
    async fn set_nx(&self, key: &str, value: &str, ttl: Option<Duration>)
        -> Result<bool, FlowError>;

    /// Atomically replaces `expected` with `new`. Returns true if the
    /// swap happened.
    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&str>,
        new: &str,
    ) -> Result<bool, FlowError>;

    /// Round-trip health probe.
    async fn health(&self) -> StoreHealth;
}

#[derive(Debug, Clone)]
struct Entry {
    value: String,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_expired(&self) -> bool {
        self.expires_at.is_some_and(|at| Instant::now() >= at)
    }
}

/// In-memory store for tests and single-process deployments.
///
/// Expiry is lazy: expired entries are dropped when next observed.
#[derive(Debug, Default, Clone)]
pub struct InMemoryKvStore {
    entries: Arc<Mutex<HashMap<String, Entry>>>,
}

impl InMemoryKvStore {
    /// Creates a new empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of live (unexpired) entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.lock().values().filter(|e| !e.is_expired()).count()
    }

    /// Returns true if the store holds no live entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn add(&self, key: &str, delta: i64) -> Result<i64, FlowError> {
        let mut entries = self.entries.lock();
        let current = Self::live_value(&mut entries, key)
            .map(|v| {
                v.parse::<i64>()
                    .map_err(|_| FlowError::Store(format!("key '{key}' is not numeric")))
            })
            .transpose()?
            .unwrap_or(0);

        let next = current + delta;
        let expires_at = entries.get(key).and_then(|e| e.expires_at);
        entries.insert(
            key.to_string(),
            Entry {
                value: next.to_string(),
                expires_at,
            },
        );
        Ok(next)
    }

    fn live_value(entries: &mut HashMap<String, Entry>, key: &str) -> Option<String> {
        match entries.get(key) {
            Some(entry) if entry.is_expired() => {
                entries.remove(key);
                None
            }
            Some(entry) => Some(entry.value.clone()),
            None => None,
        }
    }
}

#[async_trait]
impl KeyValueStore for InMemoryKvStore {
    async fn get(&self, key: &str) -> Result<Option<String>, FlowError> {
        let mut entries = self.entries.lock();
        Ok(Self::live_value(&mut entries, key))
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), FlowError> {
        let entry = Entry {
            value: value.to_string(),
            expires_at: ttl.map(|t| Instant::now() + t),
        };
        self.entries.lock().insert(key.to_string(), entry);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool, FlowError> {
        let mut entries = self.entries.lock();
        let existed = Self::live_value(&mut entries, key).is_some();
        entries.remove(key);
        Ok(existed)
    }

    async fn incr(&self, key: &str) -> Result<i64, FlowError> {
        self.add(key, 1)
    }

    async fn decr(&self, key: &str) -> Result<i64, FlowError> {
        self.add(key, -1)
    }

    async fn set_nx(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<bool, FlowError> {
        let mut entries = self.entries.lock();
        if Self::live_value(&mut entries, key).is_some() {
            return Ok(false);
        }
        entries.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: ttl.map(|t| Instant::now() + t),
            },
        );
        Ok(true)
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&str>,
        new: &str,
    ) -> Result<bool, FlowError> {
        let mut entries = self.entries.lock();
        let current = Self::live_value(&mut entries, key);

        if current.as_deref() != expected {
            return Ok(false);
        }

        let expires_at = entries.get(key).and_then(|e| e.expires_at);
        entries.insert(
            key.to_string(),
            Entry {
                value: new.to_string(),
                expires_at,
            },
        );
        Ok(true)
    }

    async fn health(&self) -> StoreHealth {
        let start = Instant::now();
        let count = self.len();
        StoreHealth {
            ok: true,
            latency_ms: start.elapsed().as_secs_f64() * 1000.0,
            details: format!("in-memory, {count} entries"),
        }
    }
}
