use std::cell::Cell;

thread_local! {
    /// Index of the pool worker running on this thread
    /// Set once when the worker starts; `None` on every other thread
    pub(crate) static WORKER_INDEX: Cell<Option<usize>> = const { Cell::new(None) };
}

/// Index of the [`ThreadPool`](crate::ThreadPool) worker the caller runs on
///
/// Returns `None` when called outside a pool worker. Indices are assigned per
/// pool in spawn order, starting at 0.
///
/// # Examples
///
/// ```
/// use ferrypool::{ThreadPool, current_worker};
/// use std::sync::mpsc;
///
/// assert_eq!(current_worker(), None);
///
/// let pool = ThreadPool::new(2);
/// let (tx, rx) = mpsc::channel();
/// pool.execute(move || tx.send(current_worker()).unwrap()).unwrap();
/// assert!(matches!(rx.recv().unwrap(), Some(0 | 1)));
/// ```
#[inline]
pub fn current_worker() -> Option<usize> {
    WORKER_INDEX.with(Cell::get)
}
