//! Worker pools
//!
//! The engine does not manage thread lifecycles itself. It asks a
//! [`WorkerPool`] to run one job per worker slot and relies on
//! [`WorkerPool::execute`] returning only after every job has finished;
//! that return is the synchronization point that makes the workers' result
//! buffers visible to the engine.

use super::engine::ReplicationError;

/// A unit of work handed to a pool; may borrow from the caller's stack
pub type Job<'scope> = Box<dyn FnOnce() + Send + 'scope>;

/// Provider of concurrent execution contexts
pub trait WorkerPool {
    /// Number of jobs the pool can run at the same time
    fn concurrency(&self) -> usize;

    /// Run every job and return once all of them have completed
    fn execute<'scope>(&self, jobs: Vec<Job<'scope>>);
}

/// Dedicated rayon thread pool
///
/// Threads are named `replicate-worker-{i}`.
pub struct RayonPool {
    pool: rayon::ThreadPool,
}

impl RayonPool {
    /// Build a pool with exactly `threads` threads
    pub fn new(threads: usize) -> Result<Self, ReplicationError> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .thread_name(|i| format!("replicate-worker-{}", i))
            .build()
            .map_err(|e| {
                ReplicationError::Configuration(format!("failed to build worker pool: {}", e))
            })?;

        Ok(Self { pool })
    }
}

impl WorkerPool for RayonPool {
    fn concurrency(&self) -> usize {
        self.pool.current_num_threads()
    }

    fn execute<'scope>(&self, jobs: Vec<Job<'scope>>) {
        self.pool.scope(|scope| {
            for job in jobs {
                scope.spawn(move |_| job());
            }
        });
    }
}

/// One scoped OS thread per job, joined before `execute` returns
#[derive(Debug, Clone, Copy)]
pub struct ScopedThreads {
    threads: usize,
}

impl ScopedThreads {
    pub fn new(threads: usize) -> Self {
        Self { threads }
    }
}

impl WorkerPool for ScopedThreads {
    fn concurrency(&self) -> usize {
        self.threads
    }

    fn execute<'scope>(&self, jobs: Vec<Job<'scope>>) {
        std::thread::scope(|scope| {
            for job in jobs {
                scope.spawn(job);
            }
        });
    }
}
