//! Runtime configuration for the orchestration core.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::retry::RetryConfig;

/// Configuration shared by the executor and the job workers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowConfig {
    /// Job dispatcher tick interval in milliseconds.
    pub tick_interval_ms: u64,
    /// Maximum due jobs dispatched per tick.
    pub dispatch_batch_size: usize,
    /// Deliveries allowed per stream entry before dead-lettering.
    pub stream_max_deliveries: u32,
    /// Idle time before an unacknowledged stream entry is claimable again.
    pub stream_redelivery_idle_ms: u64,
    /// Default stage timeout when a stage definition does not set one.
    pub default_stage_timeout_ms: u64,
    /// Topic the executor listens on for worker task results.
    pub results_topic: String,
    /// Per-observer broadcast channel capacity.
    pub broadcast_buffer: usize,
    /// Retry policy for transient infrastructure failures.
    pub dispatch_retry: RetryConfig,
}

impl Default for FlowConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: 60_000,
            dispatch_batch_size: 50,
            stream_max_deliveries: 5,
            stream_redelivery_idle_ms: 30_000,
            default_stage_timeout_ms: 300_000,
            results_topic: "agent:results".to_string(),
            broadcast_buffer: 64,
            dispatch_retry: RetryConfig::default(),
        }
    }
}

impl FlowConfig {
    /// Creates a config from defaults with environment overrides applied.
    ///
    /// Recognized variables: `FORGEFLOW_TICK_INTERVAL_MS`,
    /// `FORGEFLOW_DISPATCH_BATCH_SIZE`, `FORGEFLOW_RESULTS_TOPIC`,
    /// `FORGEFLOW_STREAM_MAX_DELIVERIES`. Unparseable values fall back to
    /// the default.
    #[must_use]
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(v) = env_parse("FORGEFLOW_TICK_INTERVAL_MS") {
            config.tick_interval_ms = v;
        }
        if let Some(v) = env_parse("FORGEFLOW_DISPATCH_BATCH_SIZE") {
            config.dispatch_batch_size = v;
        }
        if let Ok(v) = std::env::var("FORGEFLOW_RESULTS_TOPIC") {
            config.results_topic = v;
        }
        if let Some(v) = env_parse("FORGEFLOW_STREAM_MAX_DELIVERIES") {
            config.stream_max_deliveries = v;
        }

        config
    }

    /// The dispatcher tick interval as a [`Duration`].
    #[must_use]
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    /// The stream redelivery idle window as a [`Duration`].
    #[must_use]
    pub fn stream_redelivery_idle(&self) -> Duration {
        Duration::from_millis(self.stream_redelivery_idle_ms)
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok()?.parse().ok()
}
