//! Handler and route registries.
//!
//! Registries are explicit instances injected into the executor and
//! workers at construction time, never process-wide singletons. They are
//! created once at startup, read-heavy thereafter, and mutated only
//! through `register`, which rejects duplicates.

use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;
use uuid::Uuid;

use crate::errors::{FlowError, UnknownHandlerError};

/// Context passed to a job handler invocation.
#[derive(Debug, Clone)]
pub struct JobContext {
    /// Identity of the worker process invoking the handler.
    pub worker_id: String,
    /// Trace id correlating everything in this workflow instance.
    pub trace_id: String,
    /// The job execution this invocation belongs to.
    pub execution_id: Uuid,
}

/// A registered job handler.
#[async_trait]
pub trait JobHandler: Send + Sync {
    /// Runs the handler with the dispatched payload.
    async fn run(
        &self,
        payload: serde_json::Value,
        ctx: &JobContext,
    ) -> Result<serde_json::Value, FlowError>;
}

/// Registry of job handlers keyed by handler name.
#[derive(Default)]
pub struct JobHandlerRegistry {
    handlers: DashMap<String, Arc<dyn JobHandler>>,
}

impl JobHandlerRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a handler under `name`.
    ///
    /// # Errors
    ///
    /// Returns a duplicate-registration error if the name is taken.
    pub fn register(
        &self,
        name: impl Into<String>,
        handler: Arc<dyn JobHandler>,
    ) -> Result<(), FlowError> {
        let name = name.into();
        match self.handlers.entry(name.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                Err(FlowError::DuplicateRegistration { key: name })
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(handler);
                Ok(())
            }
        }
    }

    /// Looks up a handler by name.
    ///
    /// # Errors
    ///
    /// Returns [`UnknownHandlerError`] (permanent, non-retryable) when
    /// nothing is registered under `name`.
    pub fn get(&self, name: &str) -> Result<Arc<dyn JobHandler>, UnknownHandlerError> {
        self.handlers
            .get(name)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| UnknownHandlerError::new(name))
    }

    /// Returns the number of registered handlers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    /// Returns true if no handlers are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl std::fmt::Debug for JobHandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobHandlerRegistry")
            .field("handlers", &self.handlers.len())
            .finish()
    }
}

/// Routing metadata for one `(agent_type, action)` pair.
#[derive(Debug, Clone, Default)]
pub struct AgentRoute {
    /// Topic override; the conventional `agent:{type}:tasks` topic is
    /// used when absent.
    pub topic: Option<String>,
}

/// Registry of stage dispatch routes keyed by `(agent_type, action)`.
///
/// Replaces conditional chains over agent-type strings: routes are
/// registered openly and the executor resolves topics through a single
/// lookup.
#[derive(Default)]
pub struct AgentRouteRegistry {
    routes: DashMap<(String, String), AgentRoute>,
}

impl AgentRouteRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a route for `(agent_type, action)`.
    ///
    /// # Errors
    ///
    /// Returns a duplicate-registration error if the pair is taken.
    pub fn register(
        &self,
        agent_type: impl Into<String>,
        action: impl Into<String>,
        route: AgentRoute,
    ) -> Result<(), FlowError> {
        let key = (agent_type.into(), action.into());
        match self.routes.entry(key) {
            dashmap::mapref::entry::Entry::Occupied(slot) => {
                let (agent_type, action) = slot.key();
                Err(FlowError::DuplicateRegistration {
                    key: format!("{agent_type}/{action}"),
                })
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(route);
                Ok(())
            }
        }
    }

    /// Resolves the dispatch topic for a stage. Falls back to the
    /// `agent:{agent_type}:tasks` convention when no route is registered.
    #[must_use]
    pub fn topic_for(&self, agent_type: &str, action: &str) -> String {
        self.routes
            .get(&(agent_type.to_string(), action.to_string()))
            .and_then(|route| route.topic.clone())
            .unwrap_or_else(|| format!("agent:{agent_type}:tasks"))
    }
}

impl std::fmt::Debug for AgentRouteRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentRouteRegistry")
            .field("routes", &self.routes.len())
            .finish()
    }
}
