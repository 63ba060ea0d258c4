//! Durable append-only record of every relayed message.
//!
//! The relay only ever calls `append`. Sinks run on a dedicated blocking
//! thread behind a bounded queue (`spawn_sink`), so a slow or failing store
//! never stalls a session or a broadcast.

use std::collections::VecDeque;
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use chrono::Local;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;

use crate::config::SinkConfig;
use crate::error::SinkError;
use crate::logger::Logger;

/// Append-only store for relayed messages.
pub trait LogSink: Send + 'static {
    fn append(&mut self, message: &[u8]) -> Result<(), SinkError>;
}

/////////////////////////
// MemorySink          //
/////////////////////////

/// In-memory list, newest entry first. Clones share the same list, so a test
/// (or an admin endpoint) can keep a handle while the relay owns another.
#[derive(Clone, Default)]
pub struct MemorySink {
    entries: Arc<Mutex<VecDeque<Bytes>>>,
    max_entries: Option<usize>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Keep at most `max` entries; the oldest are trimmed first.
    pub fn with_max_entries(max: usize) -> Self {
        Self {
            entries: Arc::default(),
            max_entries: Some(max),
        }
    }

    /// Snapshot of the stored entries, most recent first.
    pub fn entries(&self) -> Vec<Bytes> {
        match self.entries.lock() {
            Ok(list) => list.iter().cloned().collect(),
            Err(poisoned) => poisoned.into_inner().iter().cloned().collect(),
        }
    }
}

impl LogSink for MemorySink {
    fn append(&mut self, message: &[u8]) -> Result<(), SinkError> {
        let mut list = self
            .entries
            .lock()
            .map_err(|_| SinkError::Rejected("memory sink lock poisoned".into()))?;
        list.push_front(Bytes::copy_from_slice(message));
        if let Some(max) = self.max_entries {
            list.truncate(max);
        }
        Ok(())
    }
}

/////////////////////////
// FileSink            //
/////////////////////////

#[derive(Serialize)]
struct FileEntry<'a> {
    timestamp: String,
    message: std::borrow::Cow<'a, str>,
}

/// JSON-lines file, one `{"timestamp", "message"}` object per entry,
/// flushed after every append.
pub struct FileSink {
    path: PathBuf,
    out: BufWriter<File>,
}

impl FileSink {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, SinkError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            path,
            out: BufWriter::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl LogSink for FileSink {
    fn append(&mut self, message: &[u8]) -> Result<(), SinkError> {
        let entry = FileEntry {
            timestamp: Local::now().to_rfc3339(),
            message: String::from_utf8_lossy(message),
        };
        serde_json::to_writer(&mut self.out, &entry)?;
        self.out.write_all(b"\n")?;
        self.out.flush()?;
        Ok(())
    }
}

/// Accepts and forgets every entry.
#[derive(Clone, Copy, Default)]
pub struct DiscardSink;

impl LogSink for DiscardSink {
    fn append(&mut self, _message: &[u8]) -> Result<(), SinkError> {
        Ok(())
    }
}

/// Build the sink named by the config.
pub fn from_config(config: &SinkConfig) -> Result<Box<dyn LogSink>, SinkError> {
    Ok(match config {
        SinkConfig::Memory { max_entries: Some(max) } => Box::new(MemorySink::with_max_entries(*max)),
        SinkConfig::Memory { max_entries: None } => Box::new(MemorySink::new()),
        SinkConfig::File { path } => Box::new(FileSink::open(path)?),
        SinkConfig::Discard => Box::new(DiscardSink),
    })
}

impl LogSink for Box<dyn LogSink> {
    fn append(&mut self, message: &[u8]) -> Result<(), SinkError> {
        (**self).append(message)
    }
}

/////////////////////////
// SinkHandle          //
/////////////////////////

/// Cheap, cloneable front door to a sink running on its own thread.
#[derive(Clone)]
pub struct SinkHandle {
    tx: mpsc::Sender<Bytes>,
    failures: Arc<AtomicU64>,
}

impl SinkHandle {
    /// Queue `message` for appending. Never waits: a full queue or a stopped
    /// writer is reported to the caller, who decides whether to log it.
    pub fn submit(&self, message: Bytes) -> Result<(), SinkError> {
        self.tx.try_send(message).map_err(|e| match e {
            TrySendError::Full(_) => SinkError::QueueFull,
            TrySendError::Closed(_) => SinkError::Closed,
        })
    }

    /// Appends that the sink itself rejected so far.
    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }
}

/// Move `sink` onto a blocking thread fed by a queue of `capacity` entries.
/// The thread exits once every `SinkHandle` clone is dropped.
pub fn spawn_sink<S: LogSink>(
    mut sink: S,
    capacity: usize,
    logger: Logger,
) -> (SinkHandle, JoinHandle<()>) {
    let (tx, mut rx) = mpsc::channel::<Bytes>(capacity.max(1));
    let failures = Arc::new(AtomicU64::new(0));
    let counter = failures.clone();

    let handle = tokio::task::spawn_blocking(move || {
        while let Some(message) = rx.blocking_recv() {
            if let Err(e) = sink.append(&message) {
                let total = counter.fetch_add(1, Ordering::Relaxed) + 1;
                logger.warn(&format!("📝 Log sink append failed ({} so far): {}", total, e));
            }
        }
        logger.debug("Log sink writer stopped");
    });

    (SinkHandle { tx, failures }, handle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::BufRead;

    struct FailingSink;

    impl LogSink for FailingSink {
        fn append(&mut self, _message: &[u8]) -> Result<(), SinkError> {
            Err(SinkError::Rejected("store unavailable".into()))
        }
    }

    #[test]
    fn memory_sink_is_newest_first() {
        let mut sink = MemorySink::new();
        sink.append(b"first").unwrap();
        sink.append(b"second").unwrap();
        assert_eq!(sink.entries(), vec![Bytes::from("second"), Bytes::from("first")]);
    }

    #[test]
    fn memory_sink_trims_oldest() {
        let mut sink = MemorySink::with_max_entries(2);
        for m in ["a", "b", "c"] {
            sink.append(m.as_bytes()).unwrap();
        }
        assert_eq!(sink.entries(), vec![Bytes::from("c"), Bytes::from("b")]);
    }

    #[test]
    fn file_sink_appends_json_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("chat.jsonl");

        let mut sink = FileSink::open(&path).unwrap();
        sink.append(b"hello").unwrap();
        sink.append("line\nbreak".as_bytes()).unwrap();
        drop(sink);

        // Reopening appends rather than truncating.
        let mut sink = FileSink::open(&path).unwrap();
        sink.append(b"again").unwrap();
        assert_eq!(sink.path(), path.as_path());

        let lines: Vec<String> = std::io::BufReader::new(File::open(&path).unwrap())
            .lines()
            .map(|l| l.unwrap())
            .collect();
        assert_eq!(lines.len(), 3);
        let first: serde_json::Value = serde_json::from_str(&lines[0]).unwrap();
        assert_eq!(first["message"], "hello");
        assert!(first["timestamp"].is_string());
        let second: serde_json::Value = serde_json::from_str(&lines[1]).unwrap();
        assert_eq!(second["message"], "line\nbreak");
    }

    #[test]
    fn from_config_builds_each_kind() {
        let dir = tempfile::tempdir().unwrap();
        let mut file = from_config(&SinkConfig::File {
            path: dir.path().join("log.jsonl"),
        })
        .unwrap();
        file.append(b"x").unwrap();

        let mut discard = from_config(&SinkConfig::Discard).unwrap();
        discard.append(b"x").unwrap();
    }

    #[tokio::test]
    async fn handle_feeds_the_sink_thread() {
        let memory = MemorySink::new();
        let (handle, join) = spawn_sink(memory.clone(), 8, Logger);

        handle.submit(Bytes::from("one")).unwrap();
        handle.submit(Bytes::from("two")).unwrap();
        drop(handle);
        join.await.unwrap();

        assert_eq!(memory.entries(), vec![Bytes::from("two"), Bytes::from("one")]);
    }

    #[tokio::test]
    async fn failures_are_counted_not_fatal() {
        let (handle, join) = spawn_sink(FailingSink, 8, Logger);
        let probe = handle.clone();

        handle.submit(Bytes::from("a")).unwrap();
        handle.submit(Bytes::from("b")).unwrap();
        drop(handle);
        // The probe keeps the channel open; wait for both appends to be attempted.
        for _ in 0..100 {
            if probe.failures() == 2 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert_eq!(probe.failures(), 2);
        drop(probe);
        join.await.unwrap();
    }

    #[test]
    fn submit_reports_full_and_closed() {
        let (tx, rx) = mpsc::channel::<Bytes>(1);
        let handle = SinkHandle { tx, failures: Arc::default() };

        handle.submit(Bytes::from("a")).unwrap();
        assert!(matches!(handle.submit(Bytes::from("b")), Err(SinkError::QueueFull)));

        drop(rx);
        assert!(matches!(handle.submit(Bytes::from("c")), Err(SinkError::Closed)));
    }
}
