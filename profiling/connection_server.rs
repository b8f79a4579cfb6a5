//! Connection Server Profiling Program
//!
//! Simulates a reactor-driven server over Unix socket pairs:
//! - The main thread plays the reactor: it owns the `HeapTimer`, refreshes
//!   keep-alive deadlines and evicts idle connections
//! - Readiness events arrive through a `BlockingQueue`
//! - Request handling (read_fd → line parsing → write_fd) runs on the `ThreadPool`
//! - Every 8th client goes silent part way through and must be evicted by timeout
//!
//! Usage: cargo flamegraph --profile profiling --bin connection_server

use ferrypool::{BlockingQueue, Buffer, HeapTimer, ThreadPool};
use parking_lot::Mutex;
use std::io;
use std::net::Shutdown;
use std::os::unix::net::UnixStream;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::{Duration, Instant};
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, fmt};

const NUM_WORKER_THREADS: usize = 8;
const NUM_CLIENT_THREADS: usize = 8;
const CONNECTIONS: usize = 256;
const REQUESTS_PER_CONNECTION: usize = 200;
const SILENT_EVERY: usize = 8;
const SILENT_AFTER: usize = 10;
const IDLE_TIMEOUT: Duration = Duration::from_millis(200);

enum Event {
    Readable(usize),
    Hangup(usize),
}

/// Server side of one connection
struct Conn {
    stream: UnixStream,
    input: Buffer,
    output: Buffer,
    closed: bool,
}

#[derive(Default)]
struct Stats {
    requests: AtomicUsize,
    bytes_in: AtomicUsize,
    closed: AtomicUsize,
    hangups: AtomicUsize,
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_thread_names(true))
        .init();
}

fn main() -> io::Result<()> {
    init_logging();
    tracing::info!(
        workers = NUM_WORKER_THREADS,
        clients = NUM_CLIENT_THREADS,
        connections = CONNECTIONS,
        requests = REQUESTS_PER_CONNECTION,
        "connection server profiling"
    );

    let pool = ThreadPool::builder()
        .num_threads(NUM_WORKER_THREADS)
        .thread_name("conn-worker")
        .build()?;
    let events = Arc::new(BlockingQueue::new(1024));
    let stats = Arc::new(Stats::default());
    let mut timer = HeapTimer::new();

    let mut conns = Vec::with_capacity(CONNECTIONS);
    let mut clients: Vec<Vec<(usize, UnixStream)>> = (0..NUM_CLIENT_THREADS).map(|_| Vec::new()).collect();
    for id in 0..CONNECTIONS {
        let (client, server) = UnixStream::pair()?;
        let conn = Arc::new(Mutex::new(Conn {
            stream: server,
            input: Buffer::new(),
            output: Buffer::new(),
            closed: false,
        }));
        timer.add(id, IDLE_TIMEOUT, close_callback(Arc::clone(&conn), Arc::clone(&stats)));
        conns.push(conn);
        clients[id % NUM_CLIENT_THREADS].push((id, client));
    }

    let start = Instant::now();
    let client_handles: Vec<_> = clients
        .into_iter()
        .enumerate()
        .map(|(n, streams)| {
            let events = Arc::clone(&events);
            thread::Builder::new()
                .name(format!("client-{n}"))
                .spawn(move || run_client(streams, &events))
        })
        .collect::<io::Result<_>>()?;

    // Reactor loop
    while stats.closed.load(Ordering::Relaxed) < CONNECTIONS {
        let wait = match timer.next_tick_ms() {
            -1 => Duration::from_secs(1),
            ms => Duration::from_millis(ms.unsigned_abs().into()),
        };

        match events.pop_timeout(wait) {
            Some(Event::Readable(id)) => {
                if timer.adjust(id, IDLE_TIMEOUT).is_err() {
                    tracing::debug!(conn = id, "readable after eviction");
                    continue;
                }
                let conn = Arc::clone(&conns[id]);
                let stats = Arc::clone(&stats);
                if pool.execute(move || handle_readable(id, &conn, &stats)).is_err() {
                    break;
                }
            }
            Some(Event::Hangup(id)) => {
                // run the close callback now instead of waiting for the deadline
                if timer.dowork(id) {
                    stats.hangups.fetch_add(1, Ordering::Relaxed);
                } else {
                    tracing::debug!(conn = id, "hangup after eviction");
                }
            }
            None => {}
        }
    }

    for handle in client_handles {
        if handle.join().is_err() {
            tracing::error!("client thread panicked");
        }
    }
    drop(pool);

    let elapsed = start.elapsed();
    let requests = stats.requests.load(Ordering::Relaxed);
    let hangups = stats.hangups.load(Ordering::Relaxed);
    tracing::info!(
        ?elapsed,
        requests,
        bytes_in = stats.bytes_in.load(Ordering::Relaxed),
        hangups,
        evicted = stats.closed.load(Ordering::Relaxed) - hangups,
        requests_per_sec = requests as f64 / elapsed.as_secs_f64(),
        "connection server profiling complete"
    );
    Ok(())
}

/// Runs on the reactor, either at the idle deadline or on hangup via `dowork`
fn close_callback(conn: Arc<Mutex<Conn>>, stats: Arc<Stats>) -> impl FnOnce() + Send + 'static {
    move || {
        let mut conn = conn.lock();
        conn.closed = true;
        let _ = conn.stream.shutdown(Shutdown::Both);
        stats.closed.fetch_add(1, Ordering::Relaxed);
    }
}

/// Worker task: read what arrived, answer every complete line
fn handle_readable(id: usize, conn: &Mutex<Conn>, stats: &Stats) {
    let mut guard = conn.lock();
    let Conn {
        stream,
        input,
        output,
        closed,
    } = &mut *guard;
    if *closed {
        return;
    }

    match input.read_fd(&*stream) {
        Ok(0) => return,
        Ok(n) => {
            stats.bytes_in.fetch_add(n, Ordering::Relaxed);
        }
        Err(e) => {
            tracing::warn!(conn = id, error = %e, "read failed");
            return;
        }
    }

    while let Some(end) = input.find(b"\r\n") {
        output.append(b"PONG");
        output.append(input.peek().get(4..end).unwrap_or_default());
        output.append(b"\r\n");
        input.retrieve_until(end + 2);
        stats.requests.fetch_add(1, Ordering::Relaxed);
    }

    while output.readable_bytes() > 0 {
        if let Err(e) = output.write_fd(&*stream) {
            tracing::warn!(conn = id, error = %e, "write failed");
            output.retrieve_all();
            return;
        }
    }
}

fn run_client(streams: Vec<(usize, UnixStream)>, events: &BlockingQueue<Event>) {
    let mut reply = Buffer::new();
    for round in 0..REQUESTS_PER_CONNECTION {
        for (id, stream) in &streams {
            let id = *id;
            if id % SILENT_EVERY == 0 && round >= SILENT_AFTER {
                continue;
            }

            let mut request = Buffer::with_capacity(32);
            request.append_str(&format!("PING {id}:{round}\r\n"));
            if request.write_fd(stream).is_err() || events.push_back(Event::Readable(id)).is_err() {
                return;
            }

            // wait for the full response line
            loop {
                match reply.read_fd(stream) {
                    Ok(0) | Err(_) => return,
                    Ok(_) => {}
                }
                if let Some(end) = reply.find(b"\r\n") {
                    reply.retrieve_until(end + 2);
                    break;
                }
            }
        }
    }

    for (id, _) in &streams {
        if id % SILENT_EVERY != 0 && events.push_back(Event::Hangup(*id)).is_err() {
            return;
        }
    }
}
