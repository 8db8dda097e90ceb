//! Mutex-guarded shared random source
//!
//! # Critical Invariants
//!
//! - **Exclusivity**: at most one thread holds the generator at any instant
//! - **Scoped release**: the lock is released when the draw closure returns,
//!   errors, or unwinds
//! - **No re-entry**: a thread that already holds the generator and asks for
//!   it again gets a [`LockViolation`] instead of deadlocking

use super::RandomSource;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use thiserror::Error;

/// Re-entrant acquisition of a [`SharedRandom`]
///
/// Always an engine or trial bug: the caller asked for the generator from
/// inside its own draw closure.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("shared random source re-entered by holder {holder}")]
pub struct LockViolation {
    /// Per-thread holder id of the offending thread
    pub holder: usize,
}

// Holder ids start at 1 so that 0 can mean "unheld".
static NEXT_HOLDER_ID: AtomicUsize = AtomicUsize::new(1);

thread_local! {
    static HOLDER_ID: usize = NEXT_HOLDER_ID.fetch_add(1, Ordering::Relaxed);
}

fn current_holder() -> usize {
    HOLDER_ID.with(|id| *id)
}

/// A single generator shared by every worker slot of a run
///
/// The engine borrows this for the duration of a run; it outlives the run,
/// so a caller can keep drawing from (or reseed) the same source afterwards.
///
/// # Example
/// ```
/// use replicate_core_rs::{RngManager, SharedRandom};
///
/// let shared = SharedRandom::new(RngManager::new(42));
/// let a = shared.next_u64().unwrap();
/// let b = shared.with(|rng| rng.state()).unwrap();
/// assert_ne!(a, 0);
/// assert_eq!(shared.acquisitions(), 2);
/// # let _ = b;
/// ```
#[derive(Debug)]
pub struct SharedRandom<R> {
    source: Mutex<R>,

    /// Holder id of the thread currently inside `with`, 0 when unheld
    holder: AtomicUsize,

    acquisitions: AtomicU64,
    violations: AtomicU64,
}

/// Lock guard that clears the holder marker before unlocking
struct HeldSource<'a, R> {
    guard: MutexGuard<'a, R>,
    holder: &'a AtomicUsize,
}

impl<R> Drop for HeldSource<'_, R> {
    fn drop(&mut self) {
        self.holder.store(0, Ordering::Release);
    }
}

impl<R> SharedRandom<R> {
    /// Wrap a generator for shared use
    pub fn new(source: R) -> Self {
        Self {
            source: Mutex::new(source),
            holder: AtomicUsize::new(0),
            acquisitions: AtomicU64::new(0),
            violations: AtomicU64::new(0),
        }
    }

    /// Run `draw` with exclusive access to the generator
    ///
    /// A lock poisoned by a panicking draw is recovered: the generator's
    /// state is a plain value that is never left half-written.
    ///
    /// # Errors
    /// Returns [`LockViolation`] if the calling thread already holds the
    /// generator.
    pub fn with<T>(&self, draw: impl FnOnce(&mut R) -> T) -> Result<T, LockViolation> {
        let me = current_holder();
        if self.holder.load(Ordering::Acquire) == me {
            self.violations.fetch_add(1, Ordering::Relaxed);
            return Err(LockViolation { holder: me });
        }

        let guard = self.source.lock().unwrap_or_else(PoisonError::into_inner);
        self.holder.store(me, Ordering::Release);
        self.acquisitions.fetch_add(1, Ordering::Relaxed);

        let mut held = HeldSource {
            guard,
            holder: &self.holder,
        };
        Ok(draw(&mut *held.guard))
    }

    /// Number of successful lock acquisitions so far
    pub fn acquisitions(&self) -> u64 {
        self.acquisitions.load(Ordering::Relaxed)
    }

    /// Number of rejected re-entrant acquisitions so far
    pub fn violations(&self) -> u64 {
        self.violations.load(Ordering::Relaxed)
    }

    /// Give the generator back to the caller
    pub fn into_inner(self) -> R {
        self.source
            .into_inner()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl<R: RandomSource> SharedRandom<R> {
    /// Draw the next 64-bit value under the lock
    pub fn next_u64(&self) -> Result<u64, LockViolation> {
        self.with(|rng| rng.next_u64())
    }

    /// Draw an f64 in `[0.0, 1.0)` under the lock
    pub fn next_f64(&self) -> Result<f64, LockViolation> {
        self.with(|rng| rng.next_f64())
    }

    /// Draw an integer in `[min, max)` under the lock
    ///
    /// # Panics
    /// Panics if `min >= max`
    pub fn range(&self, min: i64, max: i64) -> Result<i64, LockViolation> {
        self.with(|rng| rng.range(min, max))
    }

    /// Reseed the generator under the lock
    pub fn reseed(&self, seed: u64) -> Result<(), LockViolation> {
        self.with(|rng| rng.reseed(seed))
    }
}

impl<R: Clone> SharedRandom<R> {
    /// Copy of the generator as it is right now
    pub fn snapshot(&self) -> Result<R, LockViolation> {
        self.with(|rng| rng.clone())
    }
}
