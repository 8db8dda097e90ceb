//! Replication Engine
//!
//! Runs `n` independent trials either on the calling thread or across a
//! fixed-size worker pool, and returns their results ordered by trial index.
//!
//! # Run lifecycle
//!
//! ```text
//! Idle ──> Dispatching ──> Collecting ──> Done
//!   │           │              │           ^
//!   │           └──> Draining <┘           │
//!   │                   └──────────────────┤
//!   └──────────────────────────────────────┘  (n == 0)
//! ```
//!
//! - **Dispatching**: workers claim trial indices from a shared counter
//! - **Collecting**: every index has been claimed, in-flight trials finish
//! - **Draining**: a trial failed; no new index is claimed, in-flight trials
//!   are allowed to finish (cancellation is cooperative, never preemptive)
//! - **Done**: results assembled or the first failure reported
//!
//! # Critical Invariants
//!
//! 1. Each trial index is claimed by exactly one worker and never retried
//! 2. A successful run returns exactly `n` results, result `i` from trial `i`
//! 3. A failed run returns one error and no results
//! 4. Every random draw goes through the [`SharedRandom`] lock, in both modes
//!
//! # Determinism
//!
//! Sequential runs with a fixed seed are reproducible trial by trial.
//! Parallel runs are reproducible only as a multiset of results: which trial
//! gets which draw depends on how the scheduler interleaves lock
//! acquisitions.
//!
//! # Example
//!
//! ```rust
//! use replicate_core_rs::{replicate, RngManager, RunConfig, SharedRandom, TrialContext};
//! use std::convert::Infallible;
//!
//! let random = SharedRandom::new(RngManager::new(42));
//! let config = RunConfig::parallel(5).with_pool_size(3);
//!
//! let squares = replicate(
//!     |ctx: &TrialContext<'_, RngManager>, _scratch: &mut ()| {
//!         Ok::<_, Infallible>(ctx.index() * ctx.index())
//!     },
//!     &config,
//!     &random,
//!     |_slot| (),
//! )
//! .unwrap();
//!
//! assert_eq!(squares, vec![0, 1, 4, 9, 16]);
//! ```

use super::config::{ExecutionMode, RunConfig};
use super::pool::{Job, RayonPool, WorkerPool};
use super::report::{RunManifest, RunReport};
use super::scratch::{ScratchTable, SlotId};
use crate::rng::{LockViolation, RandomSource, SharedRandom};
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Instant;
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Boxed error returned by a trial callback
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

// ============================================================================
// Errors
// ============================================================================

/// Errors from a replication run
#[derive(Debug, Error)]
pub enum ReplicationError {
    /// A trial callback returned an error
    #[error("trial {index} failed: {source}")]
    TrialFailure {
        index: usize,
        #[source]
        source: BoxError,
    },

    /// A trial callback panicked
    #[error("trial {index} panicked: {message}")]
    TrialPanicked { index: usize, message: String },

    /// Invalid run configuration, rejected before dispatch
    #[error("invalid configuration: {0}")]
    Configuration(String),

    /// Internal invariant breach (re-entrant lock, result slot written twice)
    #[error("lock violation: {0}")]
    LockViolation(String),

    /// Report hashing or digest failure
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl ReplicationError {
    /// Index of the failing trial, for trial-level failures
    pub fn trial_index(&self) -> Option<usize> {
        match self {
            ReplicationError::TrialFailure { index, .. }
            | ReplicationError::TrialPanicked { index, .. } => Some(*index),
            _ => None,
        }
    }
}

impl From<LockViolation> for ReplicationError {
    fn from(violation: LockViolation) -> Self {
        ReplicationError::LockViolation(violation.to_string())
    }
}

// ============================================================================
// Run phases
// ============================================================================

/// Lifecycle phase of one engine run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunPhase {
    Idle,
    Dispatching,
    Draining,
    Collecting,
    Done,
}

impl RunPhase {
    /// Whether the lifecycle allows moving from `self` to `next`
    pub fn can_advance_to(self, next: RunPhase) -> bool {
        use RunPhase::*;
        matches!(
            (self, next),
            (Idle, Dispatching)
                | (Idle, Done)
                | (Dispatching, Draining)
                | (Dispatching, Collecting)
                | (Collecting, Draining)
                | (Collecting, Done)
                | (Draining, Done)
        )
    }

    fn from_u8(raw: u8) -> RunPhase {
        match raw {
            0 => RunPhase::Idle,
            1 => RunPhase::Dispatching,
            2 => RunPhase::Draining,
            3 => RunPhase::Collecting,
            _ => RunPhase::Done,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            RunPhase::Idle => 0,
            RunPhase::Dispatching => 1,
            RunPhase::Draining => 2,
            RunPhase::Collecting => 3,
            RunPhase::Done => 4,
        }
    }
}

/// Phase shared by all workers of one run
#[derive(Debug)]
struct PhaseTracker {
    phase: AtomicU8,
}

impl PhaseTracker {
    fn new() -> Self {
        Self {
            phase: AtomicU8::new(RunPhase::Idle.as_u8()),
        }
    }

    fn current(&self) -> RunPhase {
        RunPhase::from_u8(self.phase.load(Ordering::Acquire))
    }

    /// Move to `next` if the lifecycle allows it from the current phase
    fn advance(&self, next: RunPhase) -> bool {
        let mut current = self.current();
        loop {
            if !current.can_advance_to(next) {
                return false;
            }
            match self.phase.compare_exchange(
                current.as_u8(),
                next.as_u8(),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    debug!(from = ?current, to = ?next, "run phase changed");
                    return true;
                }
                Err(raw) => current = RunPhase::from_u8(raw),
            }
        }
    }
}

// ============================================================================
// Trial context
// ============================================================================

/// Handle passed to every trial invocation
///
/// Carries the trial's index, the slot executing it, and locked access to
/// the shared random source. Draws made through the context are counted
/// against the run that owns it.
pub struct TrialContext<'a, R> {
    index: usize,
    slot: SlotId,
    random: &'a SharedRandom<R>,
    counters: &'a RunCounters,
}

impl<'a, R> TrialContext<'a, R> {
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn slot(&self) -> SlotId {
        self.slot
    }

    /// Run `draw` with exclusive access to the shared generator
    pub fn with_random<T>(&self, draw: impl FnOnce(&mut R) -> T) -> Result<T, LockViolation> {
        let outcome = self.random.with(draw);
        self.counters.record(&outcome);
        outcome
    }
}

impl<R: RandomSource> TrialContext<'_, R> {
    pub fn next_u64(&self) -> Result<u64, LockViolation> {
        self.with_random(|rng| rng.next_u64())
    }

    pub fn next_f64(&self) -> Result<f64, LockViolation> {
        self.with_random(|rng| rng.next_f64())
    }

    pub fn range(&self, min: i64, max: i64) -> Result<i64, LockViolation> {
        self.with_random(|rng| rng.range(min, max))
    }
}

/// Lock statistics of one run
///
/// Kept per run rather than read off the [`SharedRandom`], which other runs
/// may be drawing from at the same time.
#[derive(Debug, Default)]
struct RunCounters {
    acquisitions: AtomicU64,
    violations: AtomicU64,
}

impl RunCounters {
    fn record<T>(&self, outcome: &Result<T, LockViolation>) {
        let counter = match outcome {
            Ok(_) => &self.acquisitions,
            Err(_) => &self.violations,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn acquisitions(&self) -> u64 {
        self.acquisitions.load(Ordering::Relaxed)
    }

    fn violations(&self) -> u64 {
        self.violations.load(Ordering::Relaxed)
    }
}

// ============================================================================
// Dispatch
// ============================================================================

/// Work queue and failure latch shared by all workers of one run
struct Dispatch<'a, R> {
    trials: usize,
    next_index: AtomicUsize,
    phase: PhaseTracker,
    first_failure: Mutex<Option<ReplicationError>>,
    counters: RunCounters,
    random: &'a SharedRandom<R>,
}

impl<'a, R> Dispatch<'a, R> {
    fn new(trials: usize, random: &'a SharedRandom<R>) -> Self {
        let phase = PhaseTracker::new();
        phase.advance(RunPhase::Dispatching);
        Self {
            trials,
            next_index: AtomicUsize::new(0),
            phase,
            first_failure: Mutex::new(None),
            counters: RunCounters::default(),
            random,
        }
    }

    /// Claim the next unassigned trial index
    fn claim(&self) -> Option<usize> {
        if self.phase.current() == RunPhase::Draining {
            return None;
        }
        let index = self.next_index.fetch_add(1, Ordering::AcqRel);
        self.admit(index)
    }

    /// Decide whether a freshly claimed index may still run
    ///
    /// A failure can be latched between the drain check in `claim` and the
    /// counter increment, so the phase is checked again here.
    fn admit(&self, index: usize) -> Option<usize> {
        if index >= self.trials {
            self.phase.advance(RunPhase::Collecting);
            return None;
        }
        if self.phase.current() == RunPhase::Draining {
            return None;
        }
        Some(index)
    }

    /// Latch the first failure and stop further dispatch
    fn fail(&self, error: ReplicationError) {
        let mut first = self
            .first_failure
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if first.is_none() {
            warn!(error = %error, "trial failed, draining run");
            *first = Some(error);
        }
        drop(first);
        self.phase.advance(RunPhase::Draining);
    }

    fn take_failure(&self) -> Option<ReplicationError> {
        self.first_failure
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }
}

/// Results produced by one worker slot, as `(trial index, result)` pairs
type SlotOutput<T> = Vec<(usize, T)>;

/// Worker loop: claim indices until the queue is exhausted or the run drains
fn run_slot<T, S, R, F, E>(
    dispatch: &Dispatch<'_, R>,
    slot: SlotId,
    scratch: &mut S,
    trial: &F,
    output: &mut SlotOutput<T>,
) where
    F: Fn(&TrialContext<'_, R>, &mut S) -> Result<T, E>,
    E: Into<BoxError>,
{
    while let Some(index) = dispatch.claim() {
        let ctx = TrialContext {
            index,
            slot,
            random: dispatch.random,
            counters: &dispatch.counters,
        };
        match panic::catch_unwind(AssertUnwindSafe(|| trial(&ctx, &mut *scratch))) {
            Ok(Ok(value)) => output.push((index, value)),
            Ok(Err(error)) => {
                dispatch.fail(ReplicationError::TrialFailure {
                    index,
                    source: error.into(),
                });
                break;
            }
            Err(payload) => {
                dispatch.fail(ReplicationError::TrialPanicked {
                    index,
                    message: panic_message(payload.as_ref()),
                });
                break;
            }
        }
    }
    debug!(%slot, completed = output.len(), "worker slot finished");
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Place every slot's results at their trial index
fn assemble<T>(
    trials: usize,
    outputs: Vec<SlotOutput<T>>,
) -> Result<Vec<T>, ReplicationError> {
    let mut slots: Vec<Option<T>> = (0..trials).map(|_| None).collect();
    for (index, value) in outputs.into_iter().flatten() {
        let cell = slots.get_mut(index).ok_or_else(|| {
            ReplicationError::LockViolation(format!("trial index {} out of range", index))
        })?;
        if cell.replace(value).is_some() {
            return Err(ReplicationError::LockViolation(format!(
                "trial {} recorded twice",
                index
            )));
        }
    }

    slots
        .into_iter()
        .enumerate()
        .map(|(index, value)| {
            value.ok_or_else(|| {
                ReplicationError::LockViolation(format!("trial {} has no result", index))
            })
        })
        .collect()
}

// ============================================================================
// Public entry points
// ============================================================================

/// Run `config.trials` trials and return their results in index order
///
/// # Arguments
///
/// * `trial` - Callback invoked once per trial with its context and the
///   executing slot's scratch
/// * `config` - Trial count, mode and pool size
/// * `random` - Shared random source, borrowed for the run
/// * `factory` - Builds one scratch object per worker slot before dispatch
///
/// # Returns
///
/// * `Ok(results)` - exactly `config.trials` results
/// * `Err(ReplicationError)` - configuration rejected, or the first trial
///   failure; partial results are discarded
///
/// In parallel mode a dedicated [`RayonPool`] is built for the run; no pool
/// is built when there are no trials.
pub fn replicate<T, S, R, F, E, W>(
    trial: F,
    config: &RunConfig,
    random: &SharedRandom<R>,
    factory: W,
) -> Result<Vec<T>, ReplicationError>
where
    T: Send,
    S: Send,
    R: Send,
    F: Fn(&TrialContext<'_, R>, &mut S) -> Result<T, E> + Sync,
    E: Into<BoxError>,
    W: FnMut(SlotId) -> S,
{
    replicate_with_report(trial, config, random, factory).map(|report| report.results)
}

/// [`replicate`], also returning the run's manifest
pub fn replicate_with_report<T, S, R, F, E, W>(
    trial: F,
    config: &RunConfig,
    random: &SharedRandom<R>,
    factory: W,
) -> Result<RunReport<T>, ReplicationError>
where
    T: Send,
    S: Send,
    R: Send,
    F: Fn(&TrialContext<'_, R>, &mut S) -> Result<T, E> + Sync,
    E: Into<BoxError>,
    W: FnMut(SlotId) -> S,
{
    config.validate()?;
    if config.mode == ExecutionMode::Parallel && config.trials > 0 {
        let pool = RayonPool::new(config.worker_count())?;
        run(Some(&pool), trial, config, random, factory)
    } else {
        run(None::<&RayonPool>, trial, config, random, factory)
    }
}

/// Run on a caller-supplied worker pool
///
/// Parallel mode uses `min(pool_size or pool concurrency, trials)` workers;
/// sequential mode never touches the pool.
pub fn replicate_on<P, T, S, R, F, E, W>(
    pool: &P,
    trial: F,
    config: &RunConfig,
    random: &SharedRandom<R>,
    factory: W,
) -> Result<RunReport<T>, ReplicationError>
where
    P: WorkerPool,
    T: Send,
    S: Send,
    R: Send,
    F: Fn(&TrialContext<'_, R>, &mut S) -> Result<T, E> + Sync,
    E: Into<BoxError>,
    W: FnMut(SlotId) -> S,
{
    config.validate()?;
    let pool = (config.mode == ExecutionMode::Parallel).then_some(pool);
    run(pool, trial, config, random, factory)
}

/// Shared body of every entry point; `pool` is `None` for sequential runs
fn run<P, T, S, R, F, E, W>(
    pool: Option<&P>,
    trial: F,
    config: &RunConfig,
    random: &SharedRandom<R>,
    factory: W,
) -> Result<RunReport<T>, ReplicationError>
where
    P: WorkerPool,
    T: Send,
    S: Send,
    R: Send,
    F: Fn(&TrialContext<'_, R>, &mut S) -> Result<T, E> + Sync,
    E: Into<BoxError>,
    W: FnMut(SlotId) -> S,
{
    let run_id = Uuid::new_v4();
    let started = Instant::now();
    let workers = match pool {
        _ if config.trials == 0 => 0,
        None => 1,
        Some(pool) => config
            .pool_size
            .unwrap_or_else(|| pool.concurrency())
            .min(pool.concurrency())
            .min(config.trials)
            .max(1),
    };
    let manifest = RunManifest::new(run_id, config)?;

    if workers == 0 {
        debug!(%run_id, "no trials, nothing to dispatch");
        return Ok(RunReport {
            manifest: manifest.finish(Vec::new(), 0, started.elapsed()),
            results: Vec::new(),
        });
    }

    info!(
        %run_id,
        trials = config.trials,
        mode = %config.mode,
        workers,
        "starting replication run"
    );

    let mut scratch = ScratchTable::build(workers, factory);
    let mut outputs: Vec<SlotOutput<T>> = (0..workers).map(|_| Vec::new()).collect();
    let dispatch = Dispatch::new(config.trials, random);

    match pool {
        None => {
            for ((slot, scratch), output) in scratch.slots_mut().zip(outputs.iter_mut()) {
                run_slot(&dispatch, slot, scratch, &trial, output);
            }
        }
        Some(pool) => {
            let dispatch = &dispatch;
            let trial = &trial;
            let jobs: Vec<Job<'_>> = scratch
                .slots_mut()
                .zip(outputs.iter_mut())
                .map(|((slot, scratch), output)| {
                    Box::new(move || run_slot(dispatch, slot, scratch, trial, output)) as Job<'_>
                })
                .collect();
            pool.execute(jobs);
        }
    }
    drop(scratch);

    let phase = dispatch.phase.current();
    dispatch.phase.advance(RunPhase::Done);

    let violations = dispatch.counters.violations();
    if violations > 0 {
        return Err(ReplicationError::LockViolation(format!(
            "{} re-entrant acquisition(s) of the shared random source",
            violations
        )));
    }
    if let Some(failure) = dispatch.take_failure() {
        debug!(%run_id, ?phase, "run failed, discarding partial results");
        return Err(failure);
    }

    let slot_trials: Vec<usize> = outputs.iter().map(Vec::len).collect();
    let results = assemble(config.trials, outputs)?;
    let elapsed = started.elapsed();

    info!(
        %run_id,
        trials = results.len(),
        elapsed_ms = elapsed.as_millis() as u64,
        "replication run complete"
    );

    Ok(RunReport {
        manifest: manifest.finish(slot_trials, dispatch.counters.acquisitions(), elapsed),
        results,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rng::RngManager;
    use crate::replication::pool::ScopedThreads;
    use std::convert::Infallible;

    #[test]
    fn test_phase_transitions() {
        use RunPhase::*;
        assert!(Idle.can_advance_to(Dispatching));
        assert!(Idle.can_advance_to(Done));
        assert!(Dispatching.can_advance_to(Collecting));
        assert!(Dispatching.can_advance_to(Draining));
        assert!(Collecting.can_advance_to(Draining));
        assert!(Draining.can_advance_to(Done));
        assert!(!Draining.can_advance_to(Collecting));
        assert!(!Done.can_advance_to(Dispatching));
        assert!(!Idle.can_advance_to(Collecting));
    }

    #[test]
    fn test_tracker_rejects_illegal_transition() {
        let tracker = PhaseTracker::new();
        assert!(!tracker.advance(RunPhase::Collecting));
        assert!(tracker.advance(RunPhase::Dispatching));
        assert!(tracker.advance(RunPhase::Draining));
        assert!(!tracker.advance(RunPhase::Collecting));
        assert_eq!(tracker.current(), RunPhase::Draining);
    }

    #[test]
    fn test_claim_stops_after_failure() {
        let random = SharedRandom::new(RngManager::new(1));
        let dispatch = Dispatch::new(10, &random);

        assert_eq!(dispatch.claim(), Some(0));
        dispatch.fail(ReplicationError::TrialPanicked {
            index: 0,
            message: "boom".to_string(),
        });
        assert_eq!(dispatch.claim(), None);
        assert_eq!(dispatch.take_failure().and_then(|e| e.trial_index()), Some(0));
    }

    #[test]
    fn test_index_claimed_before_failure_is_not_admitted() {
        let random = SharedRandom::new(RngManager::new(1));
        let dispatch = Dispatch::new(10, &random);

        // Worker passed the drain check and took index 3, then another
        // worker latched a failure before this one could start the trial
        let index = dispatch.next_index.fetch_add(3, Ordering::AcqRel) + 3;
        dispatch.fail(ReplicationError::TrialPanicked {
            index: 0,
            message: "boom".to_string(),
        });

        assert_eq!(dispatch.admit(index), None);
        assert_eq!(dispatch.phase.current(), RunPhase::Draining);
    }

    #[test]
    fn test_context_draws_counted_per_run() {
        let random = SharedRandom::new(RngManager::new(1));
        random.next_u64().unwrap();
        let dispatch = Dispatch::new(1, &random);
        let ctx = TrialContext {
            index: 0,
            slot: SlotId(0),
            random: &random,
            counters: &dispatch.counters,
        };

        ctx.next_u64().unwrap();
        ctx.range(0, 10).unwrap();
        assert!(ctx.with_random(|_| ctx.next_f64()).unwrap().is_err());

        assert_eq!(dispatch.counters.acquisitions(), 3);
        assert_eq!(dispatch.counters.violations(), 1);
        assert_eq!(random.acquisitions(), 4);
    }

    #[test]
    fn test_claim_exhausts_into_collecting() {
        let random = SharedRandom::new(RngManager::new(1));
        let dispatch = Dispatch::new(2, &random);

        assert_eq!(dispatch.claim(), Some(0));
        assert_eq!(dispatch.claim(), Some(1));
        assert_eq!(dispatch.claim(), None);
        assert_eq!(dispatch.phase.current(), RunPhase::Collecting);
    }

    #[test]
    fn test_first_failure_is_kept() {
        let random = SharedRandom::new(RngManager::new(1));
        let dispatch = Dispatch::new(4, &random);
        dispatch.fail(ReplicationError::TrialPanicked {
            index: 2,
            message: "first".to_string(),
        });
        dispatch.fail(ReplicationError::TrialPanicked {
            index: 3,
            message: "second".to_string(),
        });
        assert_eq!(dispatch.take_failure().and_then(|e| e.trial_index()), Some(2));
    }

    #[test]
    fn test_assemble_detects_duplicates_and_gaps() {
        let dup = assemble(2, vec![vec![(0, 'a'), (1, 'b')], vec![(1, 'c')]]);
        assert!(matches!(dup, Err(ReplicationError::LockViolation(_))));

        let gap = assemble(3, vec![vec![(0, 'a'), (2, 'c')]]);
        assert!(matches!(gap, Err(ReplicationError::LockViolation(_))));

        let ok = assemble(3, vec![vec![(2, 'c')], vec![(0, 'a'), (1, 'b')]]).unwrap();
        assert_eq!(ok, vec!['a', 'b', 'c']);
    }

    #[test]
    fn test_panic_message_extraction() {
        let payload: Box<dyn Any + Send> = Box::new("static str");
        assert_eq!(panic_message(payload.as_ref()), "static str");

        let payload: Box<dyn Any + Send> = Box::new(String::from("owned"));
        assert_eq!(panic_message(payload.as_ref()), "owned");

        let payload: Box<dyn Any + Send> = Box::new(17u32);
        assert_eq!(panic_message(payload.as_ref()), "non-string panic payload");
    }

    #[test]
    fn test_replicate_on_scoped_threads() {
        let random = SharedRandom::new(RngManager::new(5));
        let pool = ScopedThreads::new(3);
        let config = RunConfig::parallel(20);

        let report = replicate_on(
            &pool,
            |ctx: &TrialContext<'_, RngManager>, _: &mut ()| Ok::<_, Infallible>(ctx.index() + 1),
            &config,
            &random,
            |_| (),
        )
        .unwrap();

        assert_eq!(report.results, (1..=20).collect::<Vec<_>>());
        assert_eq!(report.manifest.workers, 3);
        assert_eq!(report.manifest.slot_trials.iter().sum::<usize>(), 20);
    }

    #[test]
    fn test_sequential_ignores_supplied_pool() {
        let random = SharedRandom::new(RngManager::new(5));
        let pool = ScopedThreads::new(8);
        let report = replicate_on(
            &pool,
            |ctx: &TrialContext<'_, RngManager>, _: &mut ()| {
                Ok::<_, Infallible>(ctx.slot())
            },
            &RunConfig::sequential(4),
            &random,
            |_| (),
        )
        .unwrap();

        assert_eq!(report.manifest.workers, 1);
        assert!(report.results.iter().all(|slot| *slot == SlotId(0)));
    }
}
