use std::io;

use crate::utils::available_cpus;

/// Default prefix for worker thread names
const DEFAULT_THREAD_NAME: &str = "ferrypool-worker";

/// Calculate the default worker count from the system CPU count
///
/// Connection handlers mix CPU work with blocking I/O, so one worker per core is
/// the baseline, with a floor of 2 so a single slow task cannot stall the pool.
///
/// # Examples
/// - 1 core → 2 workers
/// - 8 cores → 8 workers
/// - 64 cores → 64 workers
const fn calculate_default_num_threads(num_cpus: usize) -> usize {
    match num_cpus {
        0..=2 => 2,
        n => n,
    }
}

/// Builder for configuring a `ThreadPool`
///
/// Use `ThreadPool::builder()` to create.
///
/// # Example
/// ```
/// use ferrypool::ThreadPool;
///
/// let pool = ThreadPool::builder()
///     .num_threads(4)
///     .thread_name("conn-worker")
///     .stack_size(256 * 1024)
///     .build()
///     .expect("spawn workers");
/// assert_eq!(pool.num_threads(), 4);
/// ```
#[derive(Debug, Clone, Default)]
pub struct Builder {
    num_threads: Option<usize>,
    thread_name: Option<String>,
    stack_size: Option<usize>,
}

impl Builder {
    /// Set the number of worker threads
    ///
    /// Default: one per CPU, at least 2
    pub fn num_threads(mut self, count: usize) -> Self {
        self.num_threads = Some(count);
        self
    }

    /// Set the worker thread name prefix
    ///
    /// Workers are named `{prefix}-{index}`.
    /// Default: `ferrypool-worker`
    pub fn thread_name(mut self, prefix: impl Into<String>) -> Self {
        self.thread_name = Some(prefix.into());
        self
    }

    /// Set the stack size of each worker in bytes
    ///
    /// Default: the platform default for spawned threads
    pub fn stack_size(mut self, bytes: usize) -> Self {
        self.stack_size = Some(bytes);
        self
    }

    /// Spawn the configured `ThreadPool`
    ///
    /// # Errors
    ///
    /// Returns the OS error if a worker thread cannot be spawned. Workers spawned
    /// before the failure are shut down.
    ///
    /// # Panics
    ///
    /// Panics if `num_threads` is set to 0.
    pub fn build(self) -> io::Result<crate::ThreadPool> {
        let num_threads = self
            .num_threads
            .unwrap_or_else(|| calculate_default_num_threads(available_cpus()));

        assert!(num_threads > 0, "num_threads must be greater than 0");

        let config = PoolConfig {
            num_threads,
            thread_name: self.thread_name.unwrap_or_else(|| DEFAULT_THREAD_NAME.to_owned()),
            stack_size: self.stack_size,
        };

        crate::ThreadPool::with_config(config)
    }
}

/// Internal configuration for the thread pool (not part of public API)
#[derive(Debug, Clone)]
pub(crate) struct PoolConfig {
    pub num_threads: usize,
    pub thread_name: String,
    pub stack_size: Option<usize>,
}
