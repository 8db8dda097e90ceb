//! Replication Engine - Rust core
//!
//! Runs N independent stochastic trials on the calling thread or across a
//! fixed-size worker pool, with one shared random source and per-worker
//! scratch state.
//!
//! # Architecture
//!
//! - **rng**: Random sources and the mutex-guarded [`SharedRandom`] handle
//! - **replication**: Run configuration, scratch table, worker pools, the
//!   engine itself, and run reports
//!
//! # Critical Invariants
//!
//! 1. Exactly one worker touches the shared random source at any instant
//! 2. A successful run yields exactly `n` results, ordered by trial index
//! 3. A failed run yields exactly one error and no partial results
//! 4. Scratch objects are never shared between worker slots

pub mod replication;
pub mod rng;

// Re-exports for convenience
pub use replication::{
    compute_config_hash, digest_results, replicate, replicate_on, replicate_with_report,
    BoxError, ExecutionMode, RayonPool, ReplicationError, RunConfig, RunManifest, RunPhase,
    RunReport, ScopedThreads, ScratchTable, SlotId, TrialContext, WorkerPool, MAX_POOL_SIZE,
};
pub use rng::{LockViolation, RandomSource, RngManager, SharedRandom};
