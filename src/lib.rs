//! # FerryPool - Concurrency Substrate for Connection Servers
//!
//! `FerryPool` provides the pieces a reactor-style server needs between its
//! event loop and its request handlers:
//!
//! - **Timeout scheduling**: [`HeapTimer`], an indexed binary min-heap with
//!   O(log n) add, adjust and cancel by connection id
//! - **Worker threads**: [`ThreadPool`], fixed-size, detached workers draining one FIFO
//! - **Bounded hand-off**: [`BlockingQueue`], a producer/consumer queue with
//!   blocking, timed and non-blocking operations plus explicit close
//! - **Byte buffering**: [`Buffer`], a growable cursor buffer with `readv`-based
//!   descriptor reads that never need a second syscall
//! - **Asynchronous logging**: [`AsyncWriter`], a log thread behind a
//!   `BlockingQueue<String>`, usable as a `tracing_subscriber` writer
//!
//! # Architecture
//!
//! ```text
//!   reactor thread                      worker threads             log thread
//!  ┌────────────────┐  execute(closure) ┌──────────────┐
//!  │ HeapTimer      │ ────────────────▶ │ ThreadPool   │
//!  │  add / adjust  │                   │  Buffer I/O  │  tracing::info!
//!  │  next_tick_ms ─┼─▶ wait timeout    │  read_fd     │ ─────────────┐
//!  │  dowork (evict)│                   │  write_fd    │              ▼
//!  └────────────────┘                   └──────────────┘   BlockingQueue<String>
//!                                                                     │ pop
//!                                                               AsyncWriter ─▶ sink
//! ```
//!
//! # Quick Start
//!
//! ```rust
//! use ferrypool::{HeapTimer, ThreadPool};
//! use std::sync::mpsc;
//! use std::time::Duration;
//!
//! let pool = ThreadPool::new(4);
//! let mut timer: HeapTimer<u32> = HeapTimer::new();
//!
//! let (tx, rx) = mpsc::channel();
//! timer.add(7, Duration::from_secs(60), move || tx.send(7).unwrap());
//!
//! // hand the request to a worker
//! pool.execute(|| { /* read, parse, respond */ }).unwrap();
//!
//! // client went away: evict now instead of waiting for the timeout
//! assert!(timer.dowork(7));
//! assert_eq!(rx.recv().unwrap(), 7);
//! assert_eq!(timer.next_tick_ms(), -1);
//! ```
//!
//! # Custom Configuration
//!
//! ```rust
//! use ferrypool::{AsyncWriter, ThreadPool};
//!
//! let pool = ThreadPool::builder()
//!     .num_threads(8)                // Override CPU-based default
//!     .thread_name("http-worker")    // Workers named http-worker-0..7
//!     .build()
//!     .expect("spawn workers");
//!
//! let log = AsyncWriter::builder()
//!     .queue_capacity(4096)          // 0 = write from the caller
//!     .spawn(std::io::stderr())
//!     .expect("spawn log thread");
//! ```
//!
//! # Shutdown
//!
//! Nothing here joins on drop except the log writer. Dropping a
//! [`ThreadPool`] closes it and lets workers finish the queued tasks in the
//! background; closing a [`BlockingQueue`] discards pending items and wakes
//! every waiter. [`AsyncWriter`] drains its queue before closing so no line is
//! lost at exit.

mod buffer;
mod clock;
mod config;
mod error;
mod log;
mod pool;
mod queue;
mod timer;
mod tls;
mod utils;

pub use buffer::{Buffer, DEFAULT_BUFFER_CAPACITY, EXTRA_READ_SIZE};
pub use clock::{Clock, ManualClock, MonotonicClock};
pub use config::Builder;
pub use error::{PoolError, PushError, TimerError};
pub use log::{AsyncWriter, AsyncWriterBuilder, DEFAULT_LOG_QUEUE_CAPACITY, EventWriter, LogHandle};
pub use pool::ThreadPool;
pub use queue::{BlockingQueue, DEFAULT_QUEUE_CAPACITY};
pub use timer::{HeapTimer, TimeoutCallback};
pub use tls::current_worker;

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_workers_feed_bounded_queue() {
        let pool = ThreadPool::new(4);
        let queue = Arc::new(BlockingQueue::new(10));

        // Consumer collects until it has seen every value
        let consumer = {
            let queue = Arc::clone(&queue);
            thread::spawn(move || {
                let mut seen = BTreeSet::new();
                while seen.len() < 100 {
                    let value = queue.pop_timeout(Duration::from_secs(5)).expect("producer stalled");
                    assert!(seen.insert(value), "value {value} delivered twice");
                }
                seen
            })
        };

        for i in 0..100 {
            let queue = Arc::clone(&queue);
            pool.execute(move || queue.push_back(i).unwrap()).unwrap();
        }

        let seen = consumer.join().unwrap();
        assert_eq!(seen, (0..100).collect());
        assert!(queue.is_empty());
    }

    #[test]
    fn test_timer_evicts_through_pool() {
        let pool = Arc::new(ThreadPool::new(2));
        let clock = ManualClock::new();
        let mut timer = HeapTimer::with_clock(clock.clone());
        let closed = Arc::new(AtomicUsize::new(0));
        let (tx, rx) = std::sync::mpsc::channel();

        for conn in 0..5u32 {
            let pool = Arc::clone(&pool);
            let closed = Arc::clone(&closed);
            let tx = tx.clone();
            timer.add(conn, Duration::from_millis(100 * u64::from(conn + 1)), move || {
                pool.execute(move || {
                    closed.fetch_add(1, Ordering::SeqCst);
                    tx.send(conn).unwrap();
                })
                .unwrap();
            });
        }
        drop(tx);

        // connection 4 stays busy
        timer.adjust(4, Duration::from_secs(10)).unwrap();

        clock.advance(Duration::from_millis(400));
        assert_eq!(timer.next_tick_ms(), 9_600);

        let mut evicted: Vec<_> = (0..4).map(|_| rx.recv_timeout(Duration::from_secs(5)).unwrap()).collect();
        evicted.sort_unstable();
        assert_eq!(evicted, vec![0, 1, 2, 3]);
        assert_eq!(closed.load(Ordering::SeqCst), 4);
        assert!(timer.contains(4));
    }

    #[test]
    fn test_buffer_lines_through_writer() {
        #[derive(Clone, Default)]
        struct Collect(Arc<parking_lot::Mutex<Vec<u8>>>);
        impl std::io::Write for Collect {
            fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
                self.0.lock().extend_from_slice(buf);
                Ok(buf.len())
            }
            fn flush(&mut self) -> std::io::Result<()> {
                Ok(())
            }
        }

        let sink = Collect::default();
        let mut writer = AsyncWriter::builder().queue_capacity(4).spawn(sink.clone()).unwrap();

        let mut input = Buffer::new();
        input.append_str("GET / HTTP/1.1\r\nHost: a\r\n\r\n");
        while let Some(end) = input.find(b"\r\n") {
            let line = String::from_utf8_lossy(&input.peek()[..end]).into_owned();
            input.retrieve_until(end + 2);
            if !line.is_empty() {
                writer.write_line(line);
            }
        }
        writer.shutdown();

        let out = String::from_utf8(sink.0.lock().clone()).unwrap();
        assert_eq!(out, "GET / HTTP/1.1\nHost: a\n");
        assert_eq!(input.readable_bytes(), 0);
    }
}
