//! Engine configuration
//!
//! All tunables are explicit fields with documented defaults. The config is
//! plain serde data so hosts can load it from a JSON file or build it in code.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Default values for [`EngineConfig`].
pub mod defaults {
    /// Interval between timeout sweeps, in milliseconds.
    pub const TIMEOUT_SWEEP_INTERVAL_MS: u64 = 1_000;
    /// Attempts for a single optimistic node update before giving up.
    pub const MAX_UPDATE_ATTEMPTS: u32 = 8;
    /// Wait between retries when the adviser declares none, in milliseconds.
    pub const DEFAULT_RETRY_WAIT_MS: u64 = 0;
    /// How long finished plan executions are kept for audit and visualization.
    pub const RETENTION_DAYS: u32 = 184;
    /// Upper bound on node executions created under one plan execution.
    pub const MAX_NODE_EXECUTIONS_PER_PLAN: u32 = 10_000;
    /// Responses held for correlation ids nobody waits on yet.
    pub const MAX_BUFFERED_RESPONSES: usize = 10_000;
    /// How long such a response is held before it is dropped, in milliseconds.
    pub const BUFFERED_RESPONSE_TTL_MS: u64 = 300_000;
}

/// Runtime configuration for the orchestration engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EngineConfig {
    /// How often the timeout sweeper scans for expired instances.
    pub timeout_sweep_interval_ms: u64,
    /// Bound on compare-and-swap retries for one node update.
    pub max_update_attempts: u32,
    /// Retry wait used when a retry adviser declares no wait intervals.
    pub default_retry_wait_ms: u64,
    /// Retention window for terminal plan executions.
    pub retention_days: u32,
    /// Facilitator types in precedence order, consulted when several
    /// facilitators claim the same step type.
    pub facilitator_precedence: Vec<String>,
    /// Runaway guard: a plan execution creating more nodes than this errors out.
    pub max_node_executions_per_plan: u32,
    /// Capacity of the buffer for responses that arrive before their wait
    /// is registered. Zero disables buffering.
    pub max_buffered_responses: usize,
    /// Age after which a buffered response is dropped by the sweep.
    pub buffered_response_ttl_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            timeout_sweep_interval_ms: defaults::TIMEOUT_SWEEP_INTERVAL_MS,
            max_update_attempts: defaults::MAX_UPDATE_ATTEMPTS,
            default_retry_wait_ms: defaults::DEFAULT_RETRY_WAIT_MS,
            retention_days: defaults::RETENTION_DAYS,
            facilitator_precedence: Vec::new(),
            max_node_executions_per_plan: defaults::MAX_NODE_EXECUTIONS_PER_PLAN,
            max_buffered_responses: defaults::MAX_BUFFERED_RESPONSES,
            buffered_response_ttl_ms: defaults::BUFFERED_RESPONSE_TTL_MS,
        }
    }
}

impl EngineConfig {
    /// Parse a config from JSON. Missing fields take their defaults.
    pub fn from_json_str(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Load a config from a JSON file.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        let config = Self::from_json_str(&content)?;
        log::info!("Loaded engine config from {:?}", path.as_ref());
        Ok(config)
    }

    pub fn timeout_sweep_interval(&self) -> Duration {
        // A zero interval would spin the sweeper.
        Duration::from_millis(self.timeout_sweep_interval_ms.max(10))
    }

    pub fn default_retry_wait(&self) -> Duration {
        Duration::from_millis(self.default_retry_wait_ms)
    }

    pub fn retention(&self) -> chrono::Duration {
        chrono::Duration::days(i64::from(self.retention_days))
    }

    pub fn max_update_attempts(&self) -> u32 {
        self.max_update_attempts.max(1)
    }

    pub fn buffered_response_ttl(&self) -> chrono::Duration {
        crate::timeout::saturating_millis(self.buffered_response_ttl_ms)
    }
}
