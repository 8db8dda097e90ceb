//! Run configuration
//!
//! A replication run is fully described by its trial count, its execution
//! mode and an optional worker-pool size. The random seed is not part of the
//! run configuration: it belongs to the shared random source the caller
//! hands in.

use super::engine::ReplicationError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::num::NonZeroUsize;
use std::str::FromStr;

/// Upper bound on an explicit worker-pool size
pub const MAX_POOL_SIZE: usize = 1024;

/// How trials are executed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    /// All trials on the calling thread, in index order
    #[default]
    Sequential,

    /// Trials pulled by a fixed-size worker pool
    Parallel,
}

impl fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecutionMode::Sequential => write!(f, "sequential"),
            ExecutionMode::Parallel => write!(f, "parallel"),
        }
    }
}

impl FromStr for ExecutionMode {
    type Err = ReplicationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "sequential" | "seq" => Ok(ExecutionMode::Sequential),
            "parallel" | "par" => Ok(ExecutionMode::Parallel),
            other => Err(ReplicationError::Configuration(format!(
                "unknown execution mode '{}' (expected 'sequential' or 'parallel')",
                other
            ))),
        }
    }
}

/// Complete configuration of one replication run
///
/// # Fields
///
/// * `trials` - Number of independent trials `n`; zero is valid and yields
///   an empty result
/// * `mode` - Sequential or parallel execution
/// * `pool_size` - Worker-pool size for parallel mode (None = available
///   parallelism)
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RunConfig {
    pub trials: usize,

    #[serde(default)]
    pub mode: ExecutionMode,

    #[serde(default)]
    pub pool_size: Option<usize>,
}

impl RunConfig {
    /// Sequential run of `trials` trials
    pub fn sequential(trials: usize) -> Self {
        Self {
            trials,
            mode: ExecutionMode::Sequential,
            pool_size: None,
        }
    }

    /// Parallel run of `trials` trials on a pool sized to the machine
    pub fn parallel(trials: usize) -> Self {
        Self {
            trials,
            mode: ExecutionMode::Parallel,
            pool_size: None,
        }
    }

    pub fn with_mode(mut self, mode: ExecutionMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_pool_size(mut self, pool_size: usize) -> Self {
        self.pool_size = Some(pool_size);
        self
    }

    /// Parse and validate a JSON configuration
    ///
    /// # Example
    /// ```
    /// use replicate_core_rs::{ExecutionMode, RunConfig};
    ///
    /// let config = RunConfig::from_json(r#"{"trials": 8, "mode": "parallel", "pool_size": 2}"#).unwrap();
    /// assert_eq!(config.mode, ExecutionMode::Parallel);
    /// assert_eq!(config.worker_count(), 2);
    /// ```
    pub fn from_json(json: &str) -> Result<Self, ReplicationError> {
        let config: RunConfig = serde_json::from_str(json).map_err(|e| {
            ReplicationError::Configuration(format!("malformed run config: {}", e))
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Reject configurations that cannot be dispatched
    pub fn validate(&self) -> Result<(), ReplicationError> {
        match self.pool_size {
            Some(0) => Err(ReplicationError::Configuration(
                "pool_size must be at least 1".to_string(),
            )),
            Some(size) if size > MAX_POOL_SIZE => Err(ReplicationError::Configuration(format!(
                "pool_size {} exceeds maximum of {}",
                size, MAX_POOL_SIZE
            ))),
            _ => Ok(()),
        }
    }

    /// Pool size to request in parallel mode
    pub fn resolved_pool_size(&self) -> usize {
        self.pool_size.unwrap_or_else(available_parallelism)
    }

    /// Number of worker slots the run will use
    ///
    /// Never more workers than trials; zero when there is nothing to do.
    pub fn worker_count(&self) -> usize {
        match self.mode {
            _ if self.trials == 0 => 0,
            ExecutionMode::Sequential => 1,
            ExecutionMode::Parallel => self.resolved_pool_size().min(self.trials),
        }
    }
}

fn available_parallelism() -> usize {
    std::thread::available_parallelism()
        .map(NonZeroUsize::get)
        .unwrap_or(1)
}
