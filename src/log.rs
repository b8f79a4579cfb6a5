//! Asynchronous line writer
//!
//! Producers on any thread hand complete lines to a [`BlockingQueue<String>`];
//! one consumer thread drains it onto the sink. When the queue is saturated the
//! producer writes the line itself rather than blocking.
//!
//! [`LogHandle`] plugs the writer into `tracing_subscriber` as a
//! [`MakeWriter`], so every formatted event reaches the sink as one line.
//!
//! ```
//! use ferrypool::AsyncWriter;
//! use std::io::Write;
//!
//! let mut writer = AsyncWriter::builder()
//!     .queue_capacity(64)
//!     .spawn(std::io::sink())
//!     .expect("spawn log thread");
//! writer.write_line("connection 7 closed");
//!
//! let mut w = tracing_subscriber::fmt::MakeWriter::make_writer(&writer.make_writer());
//! writeln!(w, "one event").unwrap();
//! drop(w);
//!
//! writer.shutdown();
//! assert_eq!(writer.write_errors(), 0);
//! ```

use parking_lot::Mutex;
use std::fmt;
use std::io::{self, Write};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::{self, JoinHandle};
use tracing_subscriber::fmt::MakeWriter;

use crate::buffer::Buffer;
use crate::error::PushError;
use crate::queue::BlockingQueue;

/// Default number of lines buffered between producers and the log thread
pub const DEFAULT_LOG_QUEUE_CAPACITY: usize = 1024;

const DEFAULT_LOG_THREAD_NAME: &str = "ferrypool-log";

/// Initial capacity of the per-event line buffer
const LINE_BUFFER_CAPACITY: usize = 256;

struct Inner {
    sink: Mutex<Box<dyn Write + Send>>,
    /// `None` in synchronous mode
    queue: Option<BlockingQueue<String>>,
    write_errors: AtomicU64,
    dropped_lines: AtomicU64,
    /// Set before the final drain; later lines are dropped
    shutting_down: AtomicBool,
}

impl Inner {
    fn submit(&self, line: String) {
        if self.shutting_down.load(Ordering::Acquire) {
            self.dropped_lines.fetch_add(1, Ordering::Relaxed);
            return;
        }
        let Some(queue) = &self.queue else {
            self.write_direct(line.as_bytes());
            return;
        };
        match queue.try_push_back(line) {
            Ok(()) => {}
            Err(PushError::Full(line)) => self.write_direct(line.as_bytes()),
            Err(PushError::Closed(_)) => {
                self.dropped_lines.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    fn write_direct(&self, line: &[u8]) {
        let mut sink = self.sink.lock();
        if sink.write_all(line).is_err() {
            self.write_errors.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn flush_sink(&self) {
        if self.sink.lock().flush().is_err() {
            self.write_errors.fetch_add(1, Ordering::Relaxed);
        }
    }
}

/// Builder for an [`AsyncWriter`]
///
/// Use `AsyncWriter::builder()` to create.
#[derive(Debug, Clone, Default)]
pub struct AsyncWriterBuilder {
    queue_capacity: Option<usize>,
    thread_name: Option<String>,
}

impl AsyncWriterBuilder {
    /// Set how many lines may wait for the log thread
    ///
    /// 0 disables the queue and the thread: every line is written by the caller.
    /// Default: 1024
    pub fn queue_capacity(mut self, lines: usize) -> Self {
        self.queue_capacity = Some(lines);
        self
    }

    /// Set the name of the log thread
    ///
    /// Default: `ferrypool-log`
    pub fn thread_name(mut self, name: impl Into<String>) -> Self {
        self.thread_name = Some(name.into());
        self
    }

    /// Start the writer on `sink`
    ///
    /// # Errors
    ///
    /// Returns the OS error if the log thread cannot be spawned.
    pub fn spawn<W>(self, sink: W) -> io::Result<AsyncWriter>
    where
        W: Write + Send + 'static,
    {
        let capacity = self.queue_capacity.unwrap_or(DEFAULT_LOG_QUEUE_CAPACITY);
        let inner = Arc::new(Inner {
            sink: Mutex::new(Box::new(sink)),
            queue: (capacity > 0).then(|| BlockingQueue::new(capacity)),
            write_errors: AtomicU64::new(0),
            dropped_lines: AtomicU64::new(0),
            shutting_down: AtomicBool::new(false),
        });

        let worker = if capacity > 0 {
            let name = self
                .thread_name
                .unwrap_or_else(|| DEFAULT_LOG_THREAD_NAME.to_owned());
            let consumer = Arc::clone(&inner);
            Some(thread::Builder::new().name(name).spawn(move || drain(&consumer))?)
        } else {
            None
        };

        tracing::debug!(queue_capacity = capacity, "log writer started");
        Ok(AsyncWriter { inner, worker })
    }
}

/// Log thread body: write lines until the queue is closed
fn drain(inner: &Inner) {
    if let Some(queue) = &inner.queue {
        while let Some(line) = queue.pop() {
            inner.write_direct(line.as_bytes());
        }
    }
    inner.flush_sink();
}

/// Line writer with a dedicated consumer thread
///
/// # Shutdown
///
/// [`shutdown`](Self::shutdown) (also run on drop) waits until the log thread
/// has taken every queued line, closes the queue, joins the thread and flushes
/// the sink. Lines submitted afterwards are dropped and counted in
/// [`dropped_lines`](Self::dropped_lines).
pub struct AsyncWriter {
    inner: Arc<Inner>,
    worker: Option<JoinHandle<()>>,
}

impl AsyncWriter {
    /// Create a builder for custom configuration
    #[inline]
    pub fn builder() -> AsyncWriterBuilder {
        AsyncWriterBuilder::default()
    }

    /// Submit one line; a trailing newline is added if missing
    pub fn write_line(&self, line: impl Into<String>) {
        self.inner.submit(terminated(line.into()));
    }

    /// Handle for `tracing_subscriber::fmt().with_writer(..)`
    pub fn make_writer(&self) -> LogHandle {
        LogHandle {
            inner: Arc::clone(&self.inner),
        }
    }

    /// Returns `true` when lines go through the log thread
    #[inline]
    pub fn is_async(&self) -> bool {
        self.inner.queue.is_some()
    }

    /// Lines waiting for the log thread
    pub fn pending(&self) -> usize {
        self.inner.queue.as_ref().map_or(0, BlockingQueue::len)
    }

    /// Failed sink writes and flushes so far
    #[inline]
    pub fn write_errors(&self) -> u64 {
        self.inner.write_errors.load(Ordering::Relaxed)
    }

    /// Lines discarded because the writer was shutting down or its log thread died
    #[inline]
    pub fn dropped_lines(&self) -> u64 {
        self.inner.dropped_lines.load(Ordering::Relaxed)
    }

    /// Drain, stop the log thread and flush the sink
    ///
    /// Safe to call more than once.
    pub fn shutdown(&mut self) {
        self.inner.shutting_down.store(true, Ordering::Release);
        let Some(worker) = self.worker.take() else {
            if self.inner.queue.is_none() {
                self.inner.flush_sink();
            }
            return;
        };

        if let Some(queue) = &self.inner.queue {
            // a dead log thread never empties the queue
            while !queue.is_empty() && !worker.is_finished() {
                queue.flush();
                thread::yield_now();
            }
            let lost = queue.close_and_take().len();
            if lost > 0 {
                self.inner.dropped_lines.fetch_add(lost as u64, Ordering::Relaxed);
            }
        }
        if worker.join().is_err() {
            tracing::error!("log thread panicked");
        }
        self.inner.flush_sink();
    }
}

impl Drop for AsyncWriter {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl fmt::Debug for AsyncWriter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AsyncWriter")
            .field("is_async", &self.is_async())
            .field("pending", &self.pending())
            .field("write_errors", &self.write_errors())
            .field("dropped_lines", &self.dropped_lines())
            .finish()
    }
}

/// Clonable producer side of an [`AsyncWriter`]
///
/// Outlives the writer safely: once the writer is shut down, lines are dropped.
#[derive(Clone)]
pub struct LogHandle {
    inner: Arc<Inner>,
}

impl LogHandle {
    /// Submit one line; a trailing newline is added if missing
    pub fn write_line(&self, line: impl Into<String>) {
        self.inner.submit(terminated(line.into()));
    }
}

fn terminated(mut line: String) -> String {
    if !line.ends_with('\n') {
        line.push('\n');
    }
    line
}

impl fmt::Debug for LogHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LogHandle").finish_non_exhaustive()
    }
}

impl<'a> MakeWriter<'a> for LogHandle {
    type Writer = EventWriter;

    fn make_writer(&'a self) -> Self::Writer {
        EventWriter {
            inner: Arc::clone(&self.inner),
            line: Buffer::with_capacity(LINE_BUFFER_CAPACITY),
        }
    }
}

/// Collects one formatted event and submits it as a single line on drop
pub struct EventWriter {
    inner: Arc<Inner>,
    line: Buffer,
}

impl Write for EventWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.line.append(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Drop for EventWriter {
    fn drop(&mut self) {
        if self.line.readable_bytes() > 0 {
            self.inner.submit(self.line.retrieve_all_to_string());
        }
    }
}

impl fmt::Debug for EventWriter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventWriter")
            .field("buffered", &self.line.readable_bytes())
            .finish()
    }
}
