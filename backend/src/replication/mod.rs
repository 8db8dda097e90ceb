//! Replication - trial dispatch across sequential or parallel execution
//!
//! See `engine.rs` for the run lifecycle and its invariants.

pub mod config;
pub mod engine;
pub mod pool;
pub mod report;
pub mod scratch;

// Re-export main types for convenience
pub use config::{ExecutionMode, RunConfig, MAX_POOL_SIZE};
pub use engine::{
    replicate, replicate_on, replicate_with_report, BoxError, ReplicationError, RunPhase,
    TrialContext,
};
pub use pool::{Job, RayonPool, ScopedThreads, WorkerPool};
pub use report::{compute_config_hash, digest_results, RunManifest, RunReport};
pub use scratch::{ScratchTable, SlotId};
