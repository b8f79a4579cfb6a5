//! Bounded blocking producer/consumer queue
//!
//! Producers block while the queue is full, consumers block while it is empty.
//! Producers and consumers wait on separate condition variables so a push only
//! wakes a consumer and a pop only wakes a producer; both are woken together
//! only by [`BlockingQueue::close`].

use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::fmt;
use std::time::{Duration, Instant};

use crate::error::PushError;

/// Capacity of [`BlockingQueue::default`]
pub const DEFAULT_QUEUE_CAPACITY: usize = 1000;

struct State<T> {
    items: VecDeque<T>,
    closed: bool,
}

/// Thread-safe FIFO with a capacity limit
///
/// Share it between threads with `Arc<BlockingQueue<T>>`.
///
/// # Closing
///
/// [`close`](Self::close) is irreversible: pending items are discarded, blocked
/// producers get their item back as [`PushError::Closed`], and blocked consumers
/// return `None`.
///
/// # Examples
///
/// ```
/// use ferrypool::BlockingQueue;
/// use std::sync::Arc;
/// use std::thread;
///
/// let queue = Arc::new(BlockingQueue::new(2));
/// let consumer = {
///     let queue = Arc::clone(&queue);
///     thread::spawn(move || {
///         let mut seen = Vec::new();
///         while let Some(v) = queue.pop() {
///             seen.push(v);
///             if seen.len() == 3 {
///                 break;
///             }
///         }
///         seen
///     })
/// };
///
/// for v in 1..=3 {
///     queue.push_back(v).unwrap();
/// }
/// assert_eq!(consumer.join().unwrap(), vec![1, 2, 3]);
/// ```
pub struct BlockingQueue<T> {
    state: Mutex<State<T>>,
    capacity: usize,
    /// Signalled when an item is added (or on flush/close)
    not_empty: Condvar,
    /// Signalled when room is made (or on close)
    not_full: Condvar,
}

impl<T> BlockingQueue<T> {
    /// Create an open queue holding at most `capacity` items
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is 0.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "queue capacity must be greater than 0");
        Self {
            state: Mutex::new(State {
                items: VecDeque::with_capacity(capacity.min(DEFAULT_QUEUE_CAPACITY)),
                closed: false,
            }),
            capacity,
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
        }
    }

    /// Append `item`, blocking while the queue is full
    ///
    /// # Errors
    ///
    /// Returns [`PushError::Closed`] with the item if the queue is closed, either
    /// before the call or while waiting for room.
    pub fn push_back(&self, item: T) -> Result<(), PushError<T>> {
        self.push_with(item, VecDeque::push_back)
    }

    /// Insert `item` at the head, blocking while the queue is full
    ///
    /// # Errors
    ///
    /// Same as [`push_back`](Self::push_back).
    pub fn push_front(&self, item: T) -> Result<(), PushError<T>> {
        self.push_with(item, VecDeque::push_front)
    }

    fn push_with(&self, item: T, insert: fn(&mut VecDeque<T>, T)) -> Result<(), PushError<T>> {
        let mut state = self.state.lock();
        while state.items.len() >= self.capacity && !state.closed {
            self.not_full.wait(&mut state);
        }
        if state.closed {
            return Err(PushError::Closed(item));
        }
        insert(&mut state.items, item);
        drop(state);
        self.not_empty.notify_one();
        Ok(())
    }

    /// Append `item` only if there is room right now
    ///
    /// # Errors
    ///
    /// Returns [`PushError::Full`] at capacity and [`PushError::Closed`] once closed.
    pub fn try_push_back(&self, item: T) -> Result<(), PushError<T>> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(PushError::Closed(item));
        }
        if state.items.len() >= self.capacity {
            return Err(PushError::Full(item));
        }
        state.items.push_back(item);
        drop(state);
        self.not_empty.notify_one();
        Ok(())
    }

    /// Remove the front item, blocking while the queue is empty
    ///
    /// Returns `None` once the queue is closed.
    pub fn pop(&self) -> Option<T> {
        let mut state = self.state.lock();
        loop {
            if state.closed {
                return None;
            }
            if let Some(item) = state.items.pop_front() {
                drop(state);
                self.not_full.notify_one();
                return Some(item);
            }
            self.not_empty.wait(&mut state);
        }
    }

    /// Like [`pop`](Self::pop) but gives up after `timeout`
    ///
    /// Returns `None` on timeout (leaving the queue unchanged) or when closed.
    pub fn pop_timeout(&self, timeout: Duration) -> Option<T> {
        // a deadline past what Instant can represent is no deadline at all
        let Some(deadline) = Instant::now().checked_add(timeout) else {
            return self.pop();
        };
        let mut state = self.state.lock();
        loop {
            if state.closed {
                return None;
            }
            if let Some(item) = state.items.pop_front() {
                drop(state);
                self.not_full.notify_one();
                return Some(item);
            }
            if self.not_empty.wait_until(&mut state, deadline).timed_out() {
                // A push may have landed right at the deadline
                if state.closed {
                    return None;
                }
                let item = state.items.pop_front()?;
                drop(state);
                self.not_full.notify_one();
                return Some(item);
            }
        }
    }

    /// [`pop_timeout`](Self::pop_timeout) with a timeout in whole seconds
    #[inline]
    pub fn pop_timeout_secs(&self, secs: u64) -> Option<T> {
        self.pop_timeout(Duration::from_secs(secs))
    }

    /// Number of queued items
    #[inline]
    pub fn len(&self) -> usize {
        self.state.lock().items.len()
    }

    /// Maximum number of queued items
    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Returns `true` if nothing is queued
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.state.lock().items.is_empty()
    }

    /// Returns `true` if a blocking push would wait
    #[inline]
    pub fn is_full(&self) -> bool {
        self.state.lock().items.len() >= self.capacity
    }

    /// Returns `true` once [`close`](Self::close) has been called
    #[inline]
    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Discard every queued item without closing
    pub fn clear(&self) {
        self.state.lock().items.clear();
        self.not_full.notify_all();
    }

    /// Close the queue, discard pending items and wake every waiter
    ///
    /// Calling it again has no further effect.
    pub fn close(&self) {
        drop(self.close_and_take());
    }

    /// [`close`](Self::close), handing back the items it discarded
    pub(crate) fn close_and_take(&self) -> VecDeque<T> {
        let pending = {
            let mut state = self.state.lock();
            state.closed = true;
            std::mem::take(&mut state.items)
        };
        self.not_full.notify_all();
        self.not_empty.notify_all();
        pending
    }

    /// Wake one consumer without adding data
    ///
    /// Lets a consumer re-check external conditions, e.g. while a shutdown path waits
    /// for the queue to drain.
    #[inline]
    pub fn flush(&self) {
        self.not_empty.notify_one();
    }
}

impl<T: Clone> BlockingQueue<T> {
    /// Clone of the front item
    pub fn front(&self) -> Option<T> {
        self.state.lock().items.front().cloned()
    }

    /// Clone of the back item
    pub fn back(&self) -> Option<T> {
        self.state.lock().items.back().cloned()
    }
}

impl<T> Default for BlockingQueue<T> {
    fn default() -> Self {
        Self::new(DEFAULT_QUEUE_CAPACITY)
    }
}

impl<T> fmt::Debug for BlockingQueue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("BlockingQueue")
            .field("len", &state.items.len())
            .field("capacity", &self.capacity)
            .field("closed", &state.closed)
            .finish()
    }
}
