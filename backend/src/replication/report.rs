//! Run reports
//!
//! A [`RunManifest`] records what a run was asked to do and how the work was
//! spread across worker slots, so a result set can be matched to the exact
//! configuration that produced it.
//!
//! # Critical Invariants
//!
//! - **Config matching**: the config hash is computed over canonical JSON
//!   (sorted keys), so equal configs always hash equally
//! - **Result digests**: equal result sequences always produce equal digests

use super::config::RunConfig;
use super::engine::ReplicationError;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::time::Duration;
use uuid::Uuid;

/// Description of one completed run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunManifest {
    /// Unique id of this run (also attached to its log events)
    pub run_id: Uuid,

    pub config: RunConfig,

    /// SHA256 of the canonical JSON form of `config`
    pub config_hash: String,

    /// Worker slots used (0 when there were no trials)
    pub workers: usize,

    /// Trials completed by each slot, indexed by slot id
    pub slot_trials: Vec<usize>,

    /// Shared random source lock acquisitions made by this run's trials
    pub lock_acquisitions: u64,

    pub elapsed: Duration,
}

impl RunManifest {
    /// Start a manifest before dispatch
    pub(crate) fn new(run_id: Uuid, config: &RunConfig) -> Result<Self, ReplicationError> {
        Ok(Self {
            run_id,
            config: config.clone(),
            config_hash: compute_config_hash(config)?,
            workers: 0,
            slot_trials: Vec::new(),
            lock_acquisitions: 0,
            elapsed: Duration::ZERO,
        })
    }

    /// Fill in the per-slot statistics after the join
    pub(crate) fn finish(
        mut self,
        slot_trials: Vec<usize>,
        lock_acquisitions: u64,
        elapsed: Duration,
    ) -> Self {
        self.workers = slot_trials.len();
        self.slot_trials = slot_trials;
        self.lock_acquisitions = lock_acquisitions;
        self.elapsed = elapsed;
        self
    }

    /// Total trials completed across all slots
    pub fn total_trials(&self) -> usize {
        self.slot_trials.iter().sum()
    }
}

/// Results of a successful run together with its manifest
#[derive(Debug, Clone)]
pub struct RunReport<T> {
    pub manifest: RunManifest,

    /// One result per trial, in trial-index order
    pub results: Vec<T>,
}

impl<T: Serialize> RunReport<T> {
    /// Digest of this report's results, see [`digest_results`]
    pub fn results_digest(&self) -> Result<String, ReplicationError> {
        digest_results(&self.results)
    }
}

// ============================================================================
// Hashing
// ============================================================================

/// Compute deterministic SHA256 hash of a config
///
/// Uses canonical JSON serialization with sorted keys so the hash does not
/// depend on field or map ordering.
pub fn compute_config_hash<C: Serialize>(config: &C) -> Result<String, ReplicationError> {
    let json = canonical_json(config)?;
    Ok(sha256_hex(json.as_bytes()))
}

/// SHA256 over the canonical JSON form of a result sequence
///
/// Two runs produced byte-identical results exactly when their digests match.
///
/// # Example
/// ```
/// use replicate_core_rs::digest_results;
///
/// let a = digest_results(&[1u64, 2, 3]).unwrap();
/// let b = digest_results(&[1u64, 2, 3]).unwrap();
/// let c = digest_results(&[3u64, 2, 1]).unwrap();
/// assert_eq!(a, b);
/// assert_ne!(a, c);
/// ```
pub fn digest_results<T: Serialize>(results: &[T]) -> Result<String, ReplicationError> {
    let json = canonical_json(&results)?;
    Ok(sha256_hex(json.as_bytes()))
}

fn canonical_json<V: Serialize>(value: &V) -> Result<String, ReplicationError> {
    use serde_json::Value;
    use std::collections::BTreeMap;

    let value = serde_json::to_value(value)
        .map_err(|e| ReplicationError::Serialization(format!("serialization failed: {}", e)))?;

    // serde_json's default Map is already sorted, but not when any crate in
    // the build enables its `preserve_order` feature
    fn canonicalize(value: Value) -> Value {
        match value {
            Value::Object(map) => {
                let sorted: BTreeMap<String, Value> =
                    map.into_iter().map(|(k, v)| (k, canonicalize(v))).collect();
                Value::Object(sorted.into_iter().collect())
            }
            Value::Array(arr) => Value::Array(arr.into_iter().map(canonicalize).collect()),
            other => other,
        }
    }

    serde_json::to_string(&canonicalize(value))
        .map_err(|e| ReplicationError::Serialization(format!("serialization failed: {}", e)))
}

fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}
