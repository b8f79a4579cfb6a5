//! Indexed min-heap of connection timeouts
//!
//! A plain priority queue only gives cheap access to the root. Idle-connection
//! tracking also needs to refresh or drop an arbitrary connection's deadline, so
//! the heap array is paired with an `id -> position` map that is rewritten on every
//! swap. Any node can then be found in O(1) and repaired in O(log n).
//!
//! ```text
//!   heap (by expiry)                 index
//!   [0] id=7  t=100                  7 -> 0
//!   [1] id=3  t=250                  3 -> 1
//!   [2] id=9  t=180                  9 -> 2
//!   [3] id=4  t=400                  4 -> 3
//! ```
//!
//! The timer is single-owner and never locks; drive it from the reactor thread.

use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;
use std::time::Duration;

use crate::clock::{Clock, MonotonicClock};
use crate::error::TimerError;

/// Callback invoked when a timeout fires
pub type TimeoutCallback = Box<dyn FnOnce() + Send + 'static>;

struct TimerNode<K> {
    id: K,
    /// Absolute expiry on the timer's clock
    expires: Duration,
    callback: TimeoutCallback,
}

/// Timeout scheduler keyed by connection id
///
/// # Examples
///
/// ```
/// use ferrypool::{HeapTimer, ManualClock};
/// use std::sync::Arc;
/// use std::sync::atomic::{AtomicBool, Ordering};
/// use std::time::Duration;
///
/// let clock = ManualClock::new();
/// let mut timer = HeapTimer::with_clock(clock.clone());
///
/// let closed = Arc::new(AtomicBool::new(false));
/// let flag = Arc::clone(&closed);
/// timer.add(42u32, Duration::from_secs(60), move || flag.store(true, Ordering::SeqCst));
///
/// clock.advance(Duration::from_secs(61));
/// assert_eq!(timer.next_tick(), None);
/// assert!(closed.load(Ordering::SeqCst));
/// ```
pub struct HeapTimer<K, C = MonotonicClock> {
    heap: Vec<TimerNode<K>>,
    index: HashMap<K, usize>,
    clock: C,
}

impl<K: Copy + Eq + Hash> HeapTimer<K, MonotonicClock> {
    /// Create an empty timer driven by real monotonic time
    pub fn new() -> Self {
        Self::with_clock(MonotonicClock::new())
    }
}

impl<K: Copy + Eq + Hash> Default for HeapTimer<K, MonotonicClock> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Copy + Eq + Hash, C: Clock> HeapTimer<K, C> {
    /// Create an empty timer reading time from `clock`
    pub fn with_clock(clock: C) -> Self {
        Self {
            heap: Vec::with_capacity(64),
            index: HashMap::with_capacity(64),
            clock,
        }
    }

    /// The clock this timer reads
    #[inline]
    pub fn clock(&self) -> &C {
        &self.clock
    }

    /// Schedule `callback` to run `timeout` from now
    ///
    /// If `id` is already scheduled its expiry and callback are replaced; the old
    /// callback is dropped without running.
    pub fn add<F>(&mut self, id: K, timeout: Duration, callback: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let expires = self.clock.now().saturating_add(timeout);
        match self.index.get(&id) {
            None => {
                let i = self.heap.len();
                self.index.insert(id, i);
                self.heap.push(TimerNode {
                    id,
                    expires,
                    callback: Box::new(callback),
                });
                self.sift_up(i);
            }
            Some(&i) => {
                let node = &mut self.heap[i];
                node.expires = expires;
                node.callback = Box::new(callback);
                self.repair(i);
            }
        }
    }

    /// Move the expiry of `id` to `timeout` from now, keeping its callback
    ///
    /// # Errors
    ///
    /// Returns [`TimerError::NotScheduled`] if `id` is not in the timer.
    pub fn adjust(&mut self, id: K, timeout: Duration) -> Result<(), TimerError> {
        let &i = self.index.get(&id).ok_or(TimerError::NotScheduled)?;
        self.heap[i].expires = self.clock.now().saturating_add(timeout);
        // Refreshes normally only push the expiry out, but a shorter timeout
        // must still leave a valid heap.
        self.repair(i);
        Ok(())
    }

    /// Remove the soonest-expiring entry without running its callback
    ///
    /// Returns the removed id, or `None` if the timer is empty.
    pub fn pop(&mut self) -> Option<K> {
        if self.heap.is_empty() {
            return None;
        }
        self.delete(0).map(|node| node.id)
    }

    /// Remove `id` without running its callback
    ///
    /// Returns `false` if `id` was not scheduled.
    pub fn cancel(&mut self, id: K) -> bool {
        match self.index.get(&id) {
            Some(&i) => self.delete(i).is_some(),
            None => false,
        }
    }

    /// Run the callback of `id` right away and remove it, regardless of expiry
    ///
    /// Returns `false` if `id` was not scheduled.
    pub fn dowork(&mut self, id: K) -> bool {
        let Some(&i) = self.index.get(&id) else {
            return false;
        };
        match self.delete(i) {
            Some(node) => {
                (node.callback)();
                true
            }
            None => false,
        }
    }

    /// Fire and remove every expired entry, soonest first
    ///
    /// Returns the number of callbacks run.
    pub fn tick(&mut self) -> usize {
        let now = self.clock.now();
        let mut fired = 0;
        while self.heap.first().is_some_and(|root| root.expires <= now) {
            let Some(node) = self.delete(0) else {
                break;
            };
            (node.callback)();
            fired += 1;
        }
        if fired > 0 {
            tracing::trace!(fired, remaining = self.heap.len(), "expired timeouts fired");
        }
        fired
    }

    /// Run [`tick`](Self::tick), then return the time until the next expiry
    ///
    /// Returns `None` when nothing is scheduled.
    pub fn next_tick(&mut self) -> Option<Duration> {
        self.tick();
        let now = self.clock.now();
        self.heap.first().map(|root| root.expires.saturating_sub(now))
    }

    /// [`next_tick`](Self::next_tick) as a poll timeout: `-1` when empty, otherwise
    /// milliseconds rounded up and saturated to `i32::MAX`
    ///
    /// The value can be passed straight to `epoll_wait`/`poll`.
    pub fn next_tick_ms(&mut self) -> i32 {
        match self.next_tick() {
            None => -1,
            Some(remaining) => {
                let ms = remaining.as_nanos().div_ceil(1_000_000);
                i32::try_from(ms).unwrap_or(i32::MAX)
            }
        }
    }

    /// Time left before `id` expires, if it is scheduled
    pub fn expires_in(&self, id: K) -> Option<Duration> {
        let &i = self.index.get(&id)?;
        Some(self.heap[i].expires.saturating_sub(self.clock.now()))
    }

    /// Returns `true` if `id` is scheduled
    #[inline]
    pub fn contains(&self, id: K) -> bool {
        self.index.contains_key(&id)
    }

    /// Number of scheduled entries
    #[inline]
    pub fn len(&self) -> usize {
        self.heap.len()
    }

    /// Returns `true` if nothing is scheduled
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    /// Drop every entry without running callbacks
    pub fn clear(&mut self) {
        self.index.clear();
        self.heap.clear();
    }

    /// Swap-with-last removal followed by a repair of the moved node
    fn delete(&mut self, i: usize) -> Option<TimerNode<K>> {
        debug_assert!(i < self.heap.len(), "delete index {i} out of bounds");
        let last = self.heap.len().checked_sub(1)?;
        if i < last {
            self.swap_nodes(i, last);
        }
        let node = self.heap.pop()?;
        self.index.remove(&node.id);
        if i < self.heap.len() {
            self.repair(i);
        }
        Some(node)
    }

    #[inline]
    fn repair(&mut self, i: usize) {
        if !self.sift_down(i) {
            self.sift_up(i);
        }
    }

    fn sift_up(&mut self, mut i: usize) {
        while i > 0 {
            let parent = (i - 1) / 2;
            if self.heap[parent].expires <= self.heap[i].expires {
                break;
            }
            self.swap_nodes(i, parent);
            i = parent;
        }
    }

    /// Returns `true` if the node moved
    fn sift_down(&mut self, index: usize) -> bool {
        let n = self.heap.len();
        let mut i = index;
        let mut child = i * 2 + 1;
        while child < n {
            if child + 1 < n && self.heap[child + 1].expires < self.heap[child].expires {
                child += 1;
            }
            if self.heap[i].expires <= self.heap[child].expires {
                break;
            }
            self.swap_nodes(i, child);
            i = child;
            child = i * 2 + 1;
        }
        i > index
    }

    #[inline]
    fn swap_nodes(&mut self, i: usize, j: usize) {
        self.heap.swap(i, j);
        self.index.insert(self.heap[i].id, i);
        self.index.insert(self.heap[j].id, j);
    }
}

impl<K, C> fmt::Debug for HeapTimer<K, C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HeapTimer")
            .field("len", &self.heap.len())
            .field("next_expiry", &self.heap.first().map(|root| root.expires))
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use parking_lot::Mutex;
    use std::sync::Arc;

    const MS: Duration = Duration::from_millis(1);

    impl<K: Copy + Eq + Hash + fmt::Debug, C: Clock> HeapTimer<K, C> {
        fn check_invariants(&self) {
            assert_eq!(self.heap.len(), self.index.len());
            for (pos, node) in self.heap.iter().enumerate() {
                assert_eq!(self.index.get(&node.id), Some(&pos), "stale index for {:?}", node.id);
                for child in [pos * 2 + 1, pos * 2 + 2] {
                    if let Some(c) = self.heap.get(child) {
                        assert!(node.expires <= c.expires, "heap order broken at {pos}");
                    }
                }
            }
        }
    }

    fn recorder() -> (Arc<Mutex<Vec<u32>>>, impl Fn(u32) -> TimeoutCallback) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let make = {
            let log = Arc::clone(&log);
            move |id: u32| -> TimeoutCallback {
                let log = Arc::clone(&log);
                Box::new(move || log.lock().push(id))
            }
        };
        (log, make)
    }

    #[test]
    fn test_tick_fires_expired_in_order() {
        let clock = ManualClock::new();
        let mut timer = HeapTimer::with_clock(clock.clone());
        let (log, cb) = recorder();

        timer.add(3, 30 * MS, cb(3));
        timer.add(1, 10 * MS, cb(1));
        timer.add(2, 20 * MS, cb(2));
        timer.check_invariants();

        clock.advance(25 * MS);
        assert_eq!(timer.tick(), 2);
        assert_eq!(*log.lock(), vec![1, 2]);
        assert!(timer.contains(3));
        assert_eq!(timer.len(), 1);
        timer.check_invariants();
    }

    #[test]
    fn test_tick_fires_at_exact_expiry() {
        let clock = ManualClock::new();
        let mut timer = HeapTimer::with_clock(clock.clone());
        let (log, cb) = recorder();
        timer.add(1, 10 * MS, cb(1));

        clock.advance(9 * MS);
        assert_eq!(timer.tick(), 0);
        clock.advance(MS);
        assert_eq!(timer.tick(), 1);
        assert_eq!(*log.lock(), vec![1]);
    }

    #[test]
    fn test_add_existing_replaces_expiry_and_callback() {
        let clock = ManualClock::new();
        let mut timer = HeapTimer::with_clock(clock.clone());
        let (log, cb) = recorder();

        timer.add(1, 10 * MS, cb(100));
        timer.add(2, 20 * MS, cb(2));
        // push 1 behind 2
        timer.add(1, 50 * MS, cb(1));
        timer.check_invariants();
        assert_eq!(timer.len(), 2);

        clock.advance(30 * MS);
        timer.tick();
        assert_eq!(*log.lock(), vec![2]);

        // pull it back in front
        timer.add(5, 40 * MS, cb(5));
        timer.add(1, MS, cb(1));
        timer.check_invariants();
        clock.advance(MS);
        timer.tick();
        assert_eq!(*log.lock(), vec![2, 1]);
    }

    #[test]
    fn test_adjust_refreshes_expiry() {
        let clock = ManualClock::new();
        let mut timer = HeapTimer::with_clock(clock.clone());
        let (log, cb) = recorder();
        timer.add(1, 10 * MS, cb(1));
        timer.add(2, 20 * MS, cb(2));

        clock.advance(5 * MS);
        timer.adjust(1, 60 * MS).unwrap();
        timer.check_invariants();
        assert_eq!(timer.expires_in(1), Some(60 * MS));

        clock.advance(20 * MS);
        timer.tick();
        assert_eq!(*log.lock(), vec![2]);
        assert!(timer.contains(1));
    }

    #[test]
    fn test_adjust_shorter_keeps_heap_valid() {
        let clock = ManualClock::new();
        let mut timer = HeapTimer::with_clock(clock);
        for id in 0..10u32 {
            timer.add(id, (100 + id) * MS, || {});
        }
        timer.adjust(9, MS).unwrap();
        timer.check_invariants();
        assert_eq!(timer.pop(), Some(9));
    }

    #[test]
    fn test_adjust_unknown_id() {
        let mut timer: HeapTimer<u32> = HeapTimer::new();
        assert_eq!(timer.adjust(7, MS), Err(TimerError::NotScheduled));
    }

    #[test]
    fn test_dowork_fires_early() {
        let clock = ManualClock::new();
        let mut timer = HeapTimer::with_clock(clock);
        let (log, cb) = recorder();
        timer.add(1, 10 * MS, cb(1));
        timer.add(2, 20 * MS, cb(2));
        timer.add(3, 30 * MS, cb(3));

        assert!(timer.dowork(2));
        assert_eq!(*log.lock(), vec![2]);
        assert!(!timer.contains(2));
        assert!(!timer.dowork(2));
        timer.check_invariants();
    }

    #[test]
    fn test_cancel_drops_without_firing() {
        let clock = ManualClock::new();
        let mut timer = HeapTimer::with_clock(clock.clone());
        let (log, cb) = recorder();
        timer.add(1, 10 * MS, cb(1));
        assert!(timer.cancel(1));
        assert!(!timer.cancel(1));
        clock.advance(20 * MS);
        assert_eq!(timer.tick(), 0);
        assert!(log.lock().is_empty());
    }

    #[test]
    fn test_pop_removes_root() {
        let mut timer = HeapTimer::with_clock(ManualClock::new());
        timer.add(1, 30 * MS, || {});
        timer.add(2, 10 * MS, || {});
        timer.add(3, 20 * MS, || {});
        assert_eq!(timer.pop(), Some(2));
        assert_eq!(timer.pop(), Some(3));
        assert_eq!(timer.pop(), Some(1));
        assert_eq!(timer.pop(), None);
    }

    #[test]
    fn test_next_tick() {
        let clock = ManualClock::new();
        let mut timer = HeapTimer::with_clock(clock.clone());
        assert_eq!(timer.next_tick(), None);
        assert_eq!(timer.next_tick_ms(), -1);

        let (log, cb) = recorder();
        timer.add(1, 10 * MS, cb(1));
        timer.add(2, 40 * MS, cb(2));
        assert_eq!(timer.next_tick(), Some(10 * MS));

        clock.advance(15 * MS);
        assert_eq!(timer.next_tick_ms(), 25);
        assert_eq!(*log.lock(), vec![1], "next_tick reclaims expired entries first");

        clock.advance(100 * MS);
        assert_eq!(timer.next_tick_ms(), -1);
        assert!(timer.is_empty());
    }

    #[test]
    fn test_next_tick_ms_rounds_up() {
        let mut timer = HeapTimer::new();
        timer.add(1u8, Duration::from_secs(3600), || {});
        let ms = timer.next_tick_ms();
        assert!(ms > 3_599_000 && ms <= 3_600_000, "got {ms}");

        timer.add(1u8, Duration::from_secs(u64::MAX / 4), || {});
        assert_eq!(timer.next_tick_ms(), i32::MAX);
    }

    #[test]
    fn test_zero_timeout_fires_on_next_tick() {
        let mut timer = HeapTimer::new();
        let (log, cb) = recorder();
        timer.add(1, Duration::ZERO, cb(1));
        assert_eq!(timer.tick(), 1);
        assert_eq!(*log.lock(), vec![1]);
    }

    #[test]
    fn test_clear() {
        let mut timer = HeapTimer::with_clock(ManualClock::new());
        timer.add(1, MS, || {});
        timer.add(2, MS, || {});
        timer.clear();
        assert!(timer.is_empty());
        assert!(!timer.contains(1));
        assert_eq!(timer.expires_in(1), None);
    }

    mod proptests {
        use super::*;
        use proptest::prelude::*;

        #[derive(Debug, Clone)]
        enum Op {
            Add(u8, u64),
            Adjust(u8, u64),
            Pop,
            Cancel(u8),
            Dowork(u8),
            Advance(u64),
        }

        fn op() -> impl Strategy<Value = Op> {
            prop_oneof![
                4 => (0u8..24, 0u64..500).prop_map(|(id, t)| Op::Add(id, t)),
                2 => (0u8..24, 0u64..500).prop_map(|(id, t)| Op::Adjust(id, t)),
                1 => Just(Op::Pop),
                1 => (0u8..24).prop_map(Op::Cancel),
                1 => (0u8..24).prop_map(Op::Dowork),
                2 => (0u64..200).prop_map(Op::Advance),
            ]
        }

        proptest! {
            #[test]
            fn test_heap_and_index_stay_consistent(ops in proptest::collection::vec(op(), 1..200)) {
                let clock = ManualClock::new();
                let mut timer = HeapTimer::with_clock(clock.clone());
                let fired = Arc::new(Mutex::new(Vec::new()));

                for op in ops {
                    match op {
                        Op::Add(id, t) => {
                            let fired = Arc::clone(&fired);
                            timer.add(id, Duration::from_millis(t), move || fired.lock().push(id));
                        }
                        Op::Adjust(id, t) => {
                            let known = timer.contains(id);
                            prop_assert_eq!(timer.adjust(id, Duration::from_millis(t)).is_ok(), known);
                        }
                        Op::Pop => {
                            let len = timer.len();
                            let popped = timer.pop();
                            prop_assert_eq!(popped.is_some(), len > 0);
                        }
                        Op::Cancel(id) => {
                            let known = timer.contains(id);
                            prop_assert_eq!(timer.cancel(id), known);
                        }
                        Op::Dowork(id) => {
                            let known = timer.contains(id);
                            prop_assert_eq!(timer.dowork(id), known);
                        }
                        Op::Advance(ms) => {
                            clock.advance(Duration::from_millis(ms));
                            timer.tick();
                            if let Some(root) = timer.heap.first() {
                                prop_assert!(root.expires > clock.now());
                            }
                        }
                    }
                    timer.check_invariants();
                }
            }
        }
    }
}
