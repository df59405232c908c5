//! Append-only structured JSONL event streams.
//!
//! The hook critical path never blocks on logging: [`EventLog::log`] does a
//! single non-blocking channel send and returns. A background worker drains
//! the queue to `logs/<stream>.jsonl` with `O_APPEND`, one complete JSON
//! object per line. Records that do not fit the bounded queue are dropped
//! and counted; the drop count is flushed periodically (and at shutdown) as
//! its own record on the `performance` stream, so loss is visible.
//!
//! Records are kept under 4 KiB per line so a single `write(2)` stays
//! atomic under concurrent writers; larger records are replaced by a
//! truncation marker carrying a bounded head of the original.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc;
use std::time::{Duration, Instant};

use serde_json::{Value, json};

use crate::state::now_ns;

// ---------------------------------------------------------------------------
// Stream
// ---------------------------------------------------------------------------

/// The four event streams.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Stream {
    /// Security rule hits, malformed payloads, fail-open degradations.
    Security,
    /// Event classification, decisions, agent lifecycle transitions.
    Lifecycle,
    /// Timing records and budget overruns.
    Performance,
    /// Lock acquisitions/releases and tool-call outcomes.
    Audit,
}

impl Stream {
    /// File name of the stream under the logs directory.
    #[must_use]
    pub const fn file_name(self) -> &'static str {
        match self {
            Self::Security => "security.jsonl",
            Self::Lifecycle => "lifecycle.jsonl",
            Self::Performance => "performance.jsonl",
            Self::Audit => "audit.jsonl",
        }
    }
}

/// Maximum serialized record size; larger records are truncated.
const RECORD_MAX_BYTES: usize = 4096;

/// How often the worker flushes a nonzero drop count as its own record.
const DROP_FLUSH_INTERVAL: Duration = Duration::from_secs(5);

/// Hard deadline for draining the queue at shutdown.
const SHUTDOWN_DEADLINE: Duration = Duration::from_millis(200);

// ---------------------------------------------------------------------------
// EventLog
// ---------------------------------------------------------------------------

enum Msg {
    Record { stream: Stream, line: String },
    Shutdown,
}

/// Cheap-to-clone logging handle. Never blocks.
#[derive(Clone)]
pub struct EventLog {
    tx: Option<mpsc::SyncSender<Msg>>,
    dropped: Arc<AtomicU64>,
}

impl EventLog {
    /// A handle that discards everything. For tests and for hook runs where
    /// the logs directory is unavailable.
    #[must_use]
    pub fn noop() -> Self {
        Self {
            tx: None,
            dropped: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Append a record to a stream, best-effort.
    ///
    /// Adds a `ts_ns` field when the record lacks one. On a full queue the
    /// record is dropped and counted; on an oversized record a truncation
    /// marker is enqueued instead.
    pub fn log(&self, stream: Stream, mut record: Value) {
        let Some(tx) = &self.tx else { return };

        if let Value::Object(map) = &mut record {
            map.entry("ts_ns").or_insert_with(|| json!(now_ns()));
        }
        let line = match serde_json::to_string(&record) {
            Ok(line) => line,
            Err(_) => return,
        };
        let line = if line.len() > RECORD_MAX_BYTES {
            truncation_marker(&line)
        } else {
            line
        };

        if tx.try_send(Msg::Record { stream, line }).is_err() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Records dropped so far because the queue was full.
    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// Replace an oversized serialized record with a bounded, valid-JSON marker.
fn truncation_marker(line: &str) -> String {
    let mut end = RECORD_MAX_BYTES - 256;
    while !line.is_char_boundary(end) {
        end -= 1;
    }
    json!({
        "truncated": true,
        "original_bytes": line.len(),
        "head": &line[..end],
    })
    .to_string()
}

// ---------------------------------------------------------------------------
// LogGuard
// ---------------------------------------------------------------------------

/// Owns the background worker. Hold in `main()` until exit; dropping it
/// drains remaining records with a hard deadline.
pub struct LogGuard {
    tx: Option<mpsc::SyncSender<Msg>>,
    done_rx: mpsc::Receiver<()>,
}

impl Drop for LogGuard {
    fn drop(&mut self) {
        if let Some(tx) = self.tx.take() {
            // A full queue means the shutdown marker is dropped; the worker
            // still exits when every sender is gone.
            let _ = tx.try_send(Msg::Shutdown);
            drop(tx);
        }
        let _ = self.done_rx.recv_timeout(SHUTDOWN_DEADLINE);
    }
}

/// Start the logging worker for the given logs directory.
///
/// Returns the cloneable handle and the guard that drains on drop.
#[must_use]
pub fn init(logs_dir: PathBuf, queue_capacity: usize) -> (EventLog, LogGuard) {
    let (tx, rx) = mpsc::sync_channel(queue_capacity.max(1));
    let (done_tx, done_rx) = mpsc::sync_channel(1);
    let dropped = Arc::new(AtomicU64::new(0));
    let worker_dropped = Arc::clone(&dropped);

    std::thread::spawn(move || {
        run_worker(&logs_dir, &rx, &worker_dropped);
        let _ = done_tx.try_send(());
    });

    (
        EventLog {
            tx: Some(tx.clone()),
            dropped,
        },
        LogGuard {
            tx: Some(tx),
            done_rx,
        },
    )
}

fn run_worker(logs_dir: &Path, rx: &mpsc::Receiver<Msg>, dropped: &AtomicU64) {
    let mut last_flush = Instant::now();
    let mut flushed_total: u64 = 0;

    loop {
        match rx.recv_timeout(Duration::from_millis(250)) {
            Ok(Msg::Record { stream, line }) => {
                append_line(logs_dir, stream, &line);
            }
            Ok(Msg::Shutdown) => break,
            Err(mpsc::RecvTimeoutError::Timeout) => {}
            Err(mpsc::RecvTimeoutError::Disconnected) => break,
        }

        if last_flush.elapsed() >= DROP_FLUSH_INTERVAL {
            flushed_total = flush_drop_count(logs_dir, dropped, flushed_total);
            last_flush = Instant::now();
        }
    }

    // Drain whatever is already queued, then account for final drops.
    while let Ok(Msg::Record { stream, line }) = rx.try_recv() {
        append_line(logs_dir, stream, &line);
    }
    flush_drop_count(logs_dir, dropped, flushed_total);
}

fn flush_drop_count(logs_dir: &Path, dropped: &AtomicU64, already_flushed: u64) -> u64 {
    let total = dropped.load(Ordering::Relaxed);
    if total > already_flushed {
        let record = json!({
            "ts_ns": now_ns(),
            "event": "log_records_dropped",
            "count": total - already_flushed,
            "total": total,
        });
        append_line(logs_dir, Stream::Performance, &record.to_string());
    }
    total
}

fn append_line(logs_dir: &Path, stream: Stream, line: &str) {
    let path = logs_dir.join(stream.file_name());
    let open = OpenOptions::new().create(true).append(true).open(&path);
    let Ok(mut file) = open else {
        // Best-effort: try once to create the parent, then give up quietly.
        if std::fs::create_dir_all(logs_dir).is_err() {
            return;
        }
        let Ok(file) = OpenOptions::new().create(true).append(true).open(&path) else {
            return;
        };
        let _ = writeln!(&file, "{line}");
        return;
    };
    let _ = writeln!(file, "{line}");
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
