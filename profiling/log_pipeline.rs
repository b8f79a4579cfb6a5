//! Log Pipeline Profiling Program
//!
//! Drives the `AsyncWriter` from pool workers in two ways:
//! - Raw `write_line` calls at several queue capacities (0 = synchronous),
//!   showing when producers fall back to writing directly
//! - `tracing` events through a global subscriber whose writer is the
//!   `AsyncWriter`, the way a server installs it
//!
//! Usage: cargo flamegraph --profile profiling --bin log_pipeline

use ferrypool::{AsyncWriter, ThreadPool};
use std::io::{self, Write};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc;
use std::time::Instant;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, fmt};

const NUM_WORKER_THREADS: usize = 8;
const TASKS: usize = 64;
const LINES_PER_TASK: usize = 5_000;
const QUEUE_CAPACITIES: &[usize] = &[0, 64, 1024, 16_384];

/// Sink that only counts, so the profile shows the pipeline rather than disk I/O
#[derive(Clone, Default)]
struct CountingSink {
    lines: Arc<AtomicUsize>,
    bytes: Arc<AtomicUsize>,
}

impl Write for CountingSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let newlines = buf.iter().filter(|&&b| b == b'\n').count();
        self.lines.fetch_add(newlines, Ordering::Relaxed);
        self.bytes.fetch_add(buf.len(), Ordering::Relaxed);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Run `TASKS` pool tasks of `LINES_PER_TASK` each and wait for all of them
fn run_tasks<F>(pool: &ThreadPool, task: F)
where
    F: Fn(usize) + Send + Sync + 'static,
{
    let task = Arc::new(task);
    let (tx, rx) = mpsc::channel();
    for t in 0..TASKS {
        let task = Arc::clone(&task);
        let tx = tx.clone();
        let submitted = pool.execute(move || {
            task(t);
            let _ = tx.send(());
        });
        if submitted.is_err() {
            return;
        }
    }
    drop(tx);
    rx.iter().take(TASKS).for_each(drop);
}

fn main() -> io::Result<()> {
    eprintln!("=== Log Pipeline Profiling ===");
    eprintln!("Worker threads: {NUM_WORKER_THREADS}");
    eprintln!("Lines per run: {}", TASKS * LINES_PER_TASK);
    eprintln!();

    let pool = ThreadPool::builder()
        .num_threads(NUM_WORKER_THREADS)
        .thread_name("log-producer")
        .build()?;

    for &capacity in QUEUE_CAPACITIES {
        let sink = CountingSink::default();
        let mut writer = AsyncWriter::builder()
            .queue_capacity(capacity)
            .spawn(sink.clone())?;

        let start = Instant::now();
        let producer = writer.make_writer();
        run_tasks(&pool, move |t| {
            for i in 0..LINES_PER_TASK {
                producer.write_line(format!("task={t} seq={i} status=ok latency_us={}", i % 997));
            }
        });
        let submitted = start.elapsed();

        writer.shutdown();
        let drained = start.elapsed();

        eprintln!(
            "[capacity {capacity:>6}] submitted in {submitted:.2?}, drained in {drained:.2?}, \
             {} lines, {} bytes, {} errors",
            sink.lines.load(Ordering::Relaxed),
            sink.bytes.load(Ordering::Relaxed),
            writer.write_errors(),
        );
    }

    // tracing events through the writer
    let sink = CountingSink::default();
    let mut writer = AsyncWriter::builder().spawn(sink.clone())?;
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .with_ansi(false)
                .with_thread_names(true)
                .with_writer(writer.make_writer()),
        )
        .init();

    let start = Instant::now();
    run_tasks(&pool, |t| {
        for i in 0..LINES_PER_TASK {
            tracing::info!(task = t, seq = i, "request served");
        }
    });
    drop(pool);
    writer.shutdown();

    eprintln!(
        "[tracing        ] {:.2?}, {} lines, {} bytes, {} dropped",
        start.elapsed(),
        sink.lines.load(Ordering::Relaxed),
        sink.bytes.load(Ordering::Relaxed),
        writer.dropped_lines(),
    );
    Ok(())
}
