//! Error types shared by the queue, pool and timer

use thiserror::Error;

/// Error returned when an item cannot be pushed onto a [`BlockingQueue`](crate::BlockingQueue).
///
/// The rejected item is handed back so the caller can retry, log or drop it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum PushError<T> {
    /// The queue has been closed and accepts no further items.
    #[error("queue closed")]
    Closed(T),
    /// The queue is at capacity (only returned by non-blocking pushes).
    #[error("queue full")]
    Full(T),
}

impl<T> PushError<T> {
    /// Recover the item that was rejected.
    #[inline]
    pub fn into_inner(self) -> T {
        match self {
            Self::Closed(item) | Self::Full(item) => item,
        }
    }

    /// Returns `true` if the push failed because the queue was closed.
    #[inline]
    pub fn is_closed(&self) -> bool {
        matches!(self, Self::Closed(_))
    }
}

/// Errors returned by [`ThreadPool::execute`](crate::ThreadPool::execute).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum PoolError {
    /// The pool has been shut down; the task was not queued.
    #[error("thread pool closed")]
    Closed,
}

/// Errors returned by [`HeapTimer`](crate::HeapTimer) operations that address a node by id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum TimerError {
    /// No timeout is registered under the given id.
    #[error("no timeout scheduled for this id")]
    NotScheduled,
}
