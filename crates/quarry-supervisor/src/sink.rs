//! Injected logging/event port.
//!
//! Core components emit classified events through an [`EventSink`] rather
//! than a process-wide logger, so hosts can render them and tests can
//! capture them synchronously. The default [`ConsoleSink`] keeps a bounded
//! in-memory ring of display lines and forwards them to an asynchronous
//! single-consumer file writer with size-based rotation.

use std::{
    collections::VecDeque,
    path::PathBuf,
    sync::{Arc, Mutex},
};

use quarry_process::{LogEvent, LogEventKind};
use tokio::{io::AsyncWriteExt, sync::mpsc};

use crate::support::{env_u64, env_usize};

const DEFAULT_LOG_MAX_LINES: usize = 1000;
const DEFAULT_LOG_FILE_MAX_BYTES: u64 = 10 * 1024 * 1024; // 10 MiB
const DEFAULT_LOG_FILE_MAX_FILES: usize = 3;

fn log_max_lines() -> usize {
    env_usize("QUARRY_LOG_MAX_LINES")
        .map(|v| v.clamp(100, 50_000))
        .unwrap_or(DEFAULT_LOG_MAX_LINES)
}

fn log_file_limits() -> (u64, usize) {
    let max_bytes = env_u64("QUARRY_LOG_FILE_MAX_BYTES")
        .map(|v| v.clamp(256 * 1024, 1024 * 1024 * 1024))
        .unwrap_or(DEFAULT_LOG_FILE_MAX_BYTES);
    let max_files = env_usize("QUARRY_LOG_FILE_MAX_FILES")
        .map(|v| v.clamp(1, 20))
        .unwrap_or(DEFAULT_LOG_FILE_MAX_FILES);
    (max_bytes, max_files)
}

pub trait EventSink: Send + Sync {
    fn emit(&self, event: LogEvent);
}

/// Single display line for one event.
pub fn render_line(event: &LogEvent) -> String {
    match &event.kind {
        LogEventKind::ServerStarted => "[event] server started".to_string(),
        LogEventKind::ServerStopping => "[event] server stopping".to_string(),
        LogEventKind::GameRuleValue { name, value } => {
            format!("[event] gamerule {name} = {value}")
        }
        LogEventKind::PlayerCount { online, max, names } => {
            format!("[event] players online: {online}/{max} ({})", names.join(", "))
        }
        LogEventKind::EulaBlocked => "[event] first-run EULA not accepted".to_string(),
        LogEventKind::Informational { raw } => raw.clone(),
    }
}

/// Bounded ring of display lines. Sequence numbers start at 1 and keep
/// counting as old lines fall out, so a polling cursor stays valid across
/// evictions; `first_seq` is the sequence of the oldest retained line.
#[derive(Debug)]
struct LogBuffer {
    first_seq: u64,
    max_lines: usize,
    lines: VecDeque<String>,
}

impl Default for LogBuffer {
    fn default() -> Self {
        Self {
            first_seq: 1,
            max_lines: log_max_lines(),
            lines: VecDeque::new(),
        }
    }
}

impl LogBuffer {
    fn push_line(&mut self, line: String) {
        self.lines.push_back(line);
        while self.lines.len() > self.max_lines {
            self.lines.pop_front();
            self.first_seq += 1;
        }
    }

    fn tail_after(&self, cursor: u64, limit: usize) -> (Vec<String>, u64) {
        // Cursor 0 is the UI's "just give me the most recent lines" poll.
        let next_seq = self.first_seq + self.lines.len() as u64;
        let from = if cursor == 0 {
            next_seq.saturating_sub(limit as u64)
        } else {
            cursor + 1
        }
        .max(self.first_seq);

        let out: Vec<String> = self
            .lines
            .iter()
            .skip((from - self.first_seq) as usize)
            .take(limit)
            .cloned()
            .collect();
        let last = if out.is_empty() {
            cursor
        } else {
            from + out.len() as u64 - 1
        };
        (out, last)
    }
}

/// Append-only log file with size-based rotation. When the active file
/// would exceed `max_bytes` it is renamed to `.1` (shifting older
/// rotations up, dropping the one past `max_files`) and a fresh file is
/// opened.
struct FileLogWriter {
    path: PathBuf,
    max_bytes: u64,
    max_files: usize,
    written: u64,
    file: tokio::fs::File,
}

impl FileLogWriter {
    async fn open(path: PathBuf, max_bytes: u64, max_files: usize) -> std::io::Result<Self> {
        if let Some(dir) = path.parent() {
            tokio::fs::create_dir_all(dir).await?;
        }
        let file = append_handle(&path).await?;
        let written = file.metadata().await.map(|m| m.len()).unwrap_or(0);
        Ok(Self {
            path,
            max_bytes,
            max_files,
            written,
            file,
        })
    }

    fn numbered(&self, n: usize) -> PathBuf {
        PathBuf::from(format!("{}.{n}", self.path.display()))
    }

    async fn rotate(&mut self) -> std::io::Result<()> {
        let _ = self.file.flush().await;
        for n in (1..self.max_files).rev() {
            if tokio::fs::try_exists(self.numbered(n)).await.unwrap_or(false) {
                let _ = tokio::fs::rename(self.numbered(n), self.numbered(n + 1)).await;
            }
        }
        let _ = tokio::fs::rename(&self.path, self.numbered(1)).await;
        self.file = append_handle(&self.path).await?;
        self.written = 0;
        Ok(())
    }

    async fn write_line(&mut self, line: &str) -> std::io::Result<()> {
        let needed = line.len() as u64 + 1;
        if self.max_bytes > 0 && self.written + needed > self.max_bytes {
            self.rotate().await.ok();
        }
        self.file.write_all(line.as_bytes()).await?;
        self.file.write_all(b"\n").await?;
        self.written += needed;
        Ok(())
    }
}

async fn append_handle(path: &std::path::Path) -> std::io::Result<tokio::fs::File> {
    tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await
}

/// Default sink: bounded ring buffer plus optional rotating log file.
///
/// `emit` never blocks; file writes happen on a dedicated consumer task so
/// strict per-source ordering is preserved by the single producer loop that
/// feeds a given server's events.
#[derive(Clone)]
pub struct ConsoleSink {
    buffer: Arc<Mutex<LogBuffer>>,
    file_tx: Option<mpsc::UnboundedSender<String>>,
}

impl ConsoleSink {
    pub fn in_memory() -> Self {
        Self {
            buffer: Arc::new(Mutex::new(LogBuffer::default())),
            file_tx: None,
        }
    }

    /// Must be called from within a tokio runtime; the writer task is
    /// spawned immediately.
    pub fn with_file(path: PathBuf) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<String>();
        let (max_bytes, max_files) = log_file_limits();
        tokio::spawn(async move {
            let Ok(mut writer) = FileLogWriter::open(path, max_bytes, max_files).await else {
                return;
            };
            while let Some(line) = rx.recv().await {
                let _ = writer.write_line(&line).await;
            }
        });

        Self {
            buffer: Arc::new(Mutex::new(LogBuffer::default())),
            file_tx: Some(tx),
        }
    }

    /// Lines appended after `cursor`, plus the new cursor.
    pub fn tail_after(&self, cursor: u64, limit: usize) -> (Vec<String>, u64) {
        let guard = self.buffer.lock().unwrap_or_else(|e| e.into_inner());
        guard.tail_after(cursor, limit)
    }
}

impl EventSink for ConsoleSink {
    fn emit(&self, event: LogEvent) {
        let line = render_line(&event);
        {
            let mut guard = self.buffer.lock().unwrap_or_else(|e| e.into_inner());
            guard.push_line(line.clone());
        }
        if let Some(tx) = &self.file_tx {
            let _ = tx.send(line);
        }
    }
}

/// Synchronous capture sink for tests and host-side assertions.
#[derive(Default)]
pub struct MemorySink {
    events: Mutex<Vec<LogEvent>>,
}

impl MemorySink {
    pub fn events(&self) -> Vec<LogEvent> {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn lines(&self) -> Vec<String> {
        self.events().iter().map(render_line).collect()
    }
}

impl EventSink for MemorySink {
    fn emit(&self, event: LogEvent) {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(event);
    }
}
