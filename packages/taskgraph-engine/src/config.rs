use crate::error::{EngineError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Engine-wide configuration: the handful of knobs the scheduler and worker
/// protocol actually own. Deliberately a single flat struct rather than a
/// tiered preset/patch system — this crate has a handful of knobs, not a
/// pipeline-configuration product.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Upper bound on concurrently running tasks (`|running| < |workers|`
    /// in the dispatch loop). Defaults to the number of available workers
    /// reported by the pool, capped by this value if set lower.
    pub max_concurrent_tasks: usize,

    /// Capacity of the completion channel the workers report results on.
    pub completion_channel_capacity: usize,

    /// Per-task deadline. A task exceeding this is reported as a timeout
    /// failure and aborts the run (see `EngineError::Timeout`).
    pub task_timeout_ms: u64,

    /// Whether to record `:comm`/`:compute` span durations (the named
    /// instrumentation spans from the worker protocol).
    pub record_spans: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_concurrent_tasks: num_cpus::get(),
            completion_channel_capacity: 1024,
            task_timeout_ms: 300_000,
            record_spans: true,
        }
    }
}

impl EngineConfig {
    /// Load overrides from a TOML file, falling back to `Default` values for
    /// any field the file omits.
    pub fn from_toml_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_toml_str(&raw)
    }

    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let partial: PartialEngineConfig = toml::from_str(raw)?;
        Ok(partial.into_config(Self::default()))
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_concurrent_tasks == 0 {
            return Err(EngineError::config(
                "max_concurrent_tasks must be at least 1",
            ));
        }
        if self.completion_channel_capacity == 0 {
            return Err(EngineError::config(
                "completion_channel_capacity must be at least 1",
            ));
        }
        Ok(())
    }
}

/// Mirrors `EngineConfig` with every field optional, so a TOML file only
/// needs to mention the knobs it wants to change.
#[derive(Debug, Default, Deserialize)]
struct PartialEngineConfig {
    max_concurrent_tasks: Option<usize>,
    completion_channel_capacity: Option<usize>,
    task_timeout_ms: Option<u64>,
    record_spans: Option<bool>,
}

impl PartialEngineConfig {
    fn into_config(self, base: EngineConfig) -> EngineConfig {
        EngineConfig {
            max_concurrent_tasks: self.max_concurrent_tasks.unwrap_or(base.max_concurrent_tasks),
            completion_channel_capacity: self
                .completion_channel_capacity
                .unwrap_or(base.completion_channel_capacity),
            task_timeout_ms: self.task_timeout_ms.unwrap_or(base.task_timeout_ms),
            record_spans: self.record_spans.unwrap_or(base.record_spans),
        }
    }
}
