use parking_lot::{Condvar, Mutex, MutexGuard};
use std::any::Any;
use std::collections::VecDeque;
use std::fmt;
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;

use crate::config::PoolConfig;
use crate::error::PoolError;
use crate::tls::WORKER_INDEX;

/// Unit of work run by a pool worker
type Task = Box<dyn FnOnce() + Send + 'static>;

struct State {
    tasks: VecDeque<Task>,
    closed: bool,
}

/// State shared by the pool handle and every worker
///
/// Workers hold their own `Arc`, so this outlives the `ThreadPool` handle
/// while they drain the remaining tasks.
struct Shared {
    state: Mutex<State>,
    cond: Condvar,
    live_workers: AtomicUsize,
    config: PoolConfig,
}

impl Shared {
    fn close(&self) -> bool {
        {
            let mut state = self.state.lock();
            if state.closed {
                return false;
            }
            state.closed = true;
        }
        self.cond.notify_all();
        true
    }
}

/// Fixed-size pool of detached worker threads sharing one task queue
///
/// # Lifecycle
///
/// Dropping the pool (or calling [`close`](Self::close)) stops new submissions and
/// wakes every worker, but does not join them. Tasks already queued still run;
/// each worker exits once the queue is empty, and the last one out frees the
/// shared state.
///
/// # Architecture
///
/// ```text
///  execute() ──┐
///              ▼
///      ┌───────────────┐   notify_one    ┌──────────┐
///      │ Mutex<State>  │ ──────────────▶ │ worker 0 │──▶ task() (unlocked)
///      │  tasks: FIFO  │                 ├──────────┤
///      │  closed: bool │ ──────────────▶ │ worker 1 │──▶ task() (unlocked)
///      └───────────────┘                 ├──────────┤
///         Arc<Shared>    notify_all      │   ...    │
///                        (on close)      └──────────┘
/// ```
///
/// # Example
/// ```
/// use ferrypool::ThreadPool;
/// use std::sync::mpsc;
///
/// let pool = ThreadPool::new(4);
/// let (tx, rx) = mpsc::channel();
/// for i in 0..8 {
///     let tx = tx.clone();
///     pool.execute(move || tx.send(i * i).unwrap()).unwrap();
/// }
/// drop(tx);
/// let mut squares: Vec<_> = rx.iter().collect();
/// squares.sort();
/// assert_eq!(squares, vec![0, 1, 4, 9, 16, 25, 36, 49]);
/// ```
pub struct ThreadPool {
    shared: Arc<Shared>,
}

impl ThreadPool {
    /// Spawn a pool with `num_threads` workers and default settings
    ///
    /// # Panics
    ///
    /// Panics if `num_threads` is 0 or if the OS refuses to spawn a thread.
    /// Use [`ThreadPool::builder`] to handle spawn failures.
    pub fn new(num_threads: usize) -> Self {
        Self::builder()
            .num_threads(num_threads)
            .build()
            .expect("failed to spawn thread pool workers")
    }

    /// Create a builder for custom configuration
    #[inline]
    pub fn builder() -> crate::Builder {
        crate::Builder::default()
    }

    pub(crate) fn with_config(config: PoolConfig) -> io::Result<Self> {
        let num_threads = config.num_threads;
        let shared = Arc::new(Shared {
            state: Mutex::new(State {
                tasks: VecDeque::new(),
                closed: false,
            }),
            cond: Condvar::new(),
            live_workers: AtomicUsize::new(0),
            config,
        });

        for index in 0..num_threads {
            let mut builder =
                thread::Builder::new().name(format!("{}-{index}", shared.config.thread_name));
            if let Some(size) = shared.config.stack_size {
                builder = builder.stack_size(size);
            }

            shared.live_workers.fetch_add(1, Ordering::AcqRel);
            let worker_shared = Arc::clone(&shared);
            // JoinHandle dropped: the worker is detached
            if let Err(e) = builder.spawn(move || worker_loop(index, worker_shared)) {
                shared.live_workers.fetch_sub(1, Ordering::AcqRel);
                shared.close();
                tracing::error!(error = %e, spawned = index, "failed to spawn pool worker");
                return Err(e);
            }
        }

        tracing::debug!(
            num_threads,
            name = %shared.config.thread_name,
            "thread pool started"
        );
        Ok(Self { shared })
    }

    /// Queue `task` and wake one idle worker
    ///
    /// # Errors
    ///
    /// Returns [`PoolError::Closed`] if the pool has been closed; the task is
    /// dropped without running.
    pub fn execute<F>(&self, task: F) -> Result<(), PoolError>
    where
        F: FnOnce() + Send + 'static,
    {
        {
            let mut state = self.shared.state.lock();
            if state.closed {
                return Err(PoolError::Closed);
            }
            state.tasks.push_back(Box::new(task));
        }
        self.shared.cond.notify_one();
        Ok(())
    }

    /// Stop accepting tasks and let workers exit once the queue drains
    ///
    /// Does not wait for the workers. Dropping the pool does the same.
    pub fn close(&self) {
        if self.shared.close() {
            tracing::debug!(
                queued = self.queued_tasks(),
                "thread pool closing"
            );
        }
    }

    /// Number of worker threads the pool was built with
    #[inline]
    pub fn num_threads(&self) -> usize {
        self.shared.config.num_threads
    }

    /// Tasks waiting for a worker
    #[inline]
    pub fn queued_tasks(&self) -> usize {
        self.shared.state.lock().tasks.len()
    }

    /// Workers that have not exited yet
    #[inline]
    pub fn live_workers(&self) -> usize {
        self.shared.live_workers.load(Ordering::Acquire)
    }

    /// Returns `true` once the pool stopped accepting tasks
    #[inline]
    pub fn is_closed(&self) -> bool {
        self.shared.state.lock().closed
    }

    #[cfg(test)]
    pub(crate) fn config(&self) -> &PoolConfig {
        &self.shared.config
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        self.close();
    }
}

impl fmt::Debug for ThreadPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadPool")
            .field("num_threads", &self.num_threads())
            .field("live_workers", &self.live_workers())
            .field("queued_tasks", &self.queued_tasks())
            .field("closed", &self.is_closed())
            .finish()
    }
}

fn worker_loop(index: usize, shared: Arc<Shared>) {
    WORKER_INDEX.with(|w| w.set(Some(index)));

    let mut state = shared.state.lock();
    loop {
        if let Some(task) = state.tasks.pop_front() {
            MutexGuard::unlocked(&mut state, || run_task(index, task));
        } else if state.closed {
            break;
        } else {
            shared.cond.wait(&mut state);
        }
    }
    drop(state);

    shared.live_workers.fetch_sub(1, Ordering::AcqRel);
    tracing::trace!(worker = index, "pool worker exiting");
}

/// Run one task, keeping the worker alive if it panics
fn run_task(index: usize, task: Task) {
    if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(task)) {
        tracing::error!(
            worker = index,
            panic = panic_message(payload.as_ref()),
            "pool task panicked"
        );
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.as_str()
    } else {
        "<non-string panic payload>"
    }
}
