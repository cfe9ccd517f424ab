//! Per-service output journal.
//!
//! Captures stdout/stderr of managed processes, keeps a bounded tail in
//! memory and appends every line to the service's log file.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use tokio::sync::RwLock;

/// Maximum number of log entries to keep in memory per service.
const MAX_MEMORY_ENTRIES: usize = 1000;

/// Where a journal line came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stream {
    Stdout,
    Stderr,
    /// Lines written by the supervisor itself (start/stop markers)
    Supervisor,
}

impl std::fmt::Display for Stream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Stream::Stdout => write!(f, "out"),
            Stream::Stderr => write!(f, "err"),
            Stream::Supervisor => write!(f, "sup"),
        }
    }
}

/// A single journal entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JournalEntry {
    /// Timestamp of the entry
    pub timestamp: DateTime<Utc>,
    /// Service name
    pub service: String,
    /// Process ID that generated the entry
    pub pid: Option<u32>,
    /// Source stream
    pub stream: Stream,
    /// Log message
    pub message: String,
}

impl JournalEntry {
    /// Create a new journal entry.
    pub fn new(service: &str, message: &str, stream: Stream) -> Self {
        Self {
            timestamp: Utc::now(),
            service: service.to_string(),
            pid: None,
            stream,
            message: message.to_string(),
        }
    }

    /// Create a journal entry with PID.
    pub fn with_pid(mut self, pid: u32) -> Self {
        self.pid = Some(pid);
        self
    }

    /// Format the entry for the log file.
    pub fn format(&self) -> String {
        let pid_str = self.pid.map(|p| format!("[{}]", p)).unwrap_or_default();
        format!(
            "{} {}{} {}: {}",
            self.timestamp.format("%Y-%m-%dT%H:%M:%S%.3fZ"),
            self.service,
            pid_str,
            self.stream,
            self.message
        )
    }
}

#[derive(Debug, Default)]
struct ServiceLogs {
    entries: VecDeque<JournalEntry>,
}

impl ServiceLogs {
    fn add(&mut self, entry: JournalEntry) {
        self.entries.push_back(entry);
        while self.entries.len() > MAX_MEMORY_ENTRIES {
            self.entries.pop_front();
        }
    }

    fn get_entries(&self, limit: Option<usize>) -> Vec<JournalEntry> {
        match limit {
            Some(n) => self.entries.iter().rev().take(n).rev().cloned().collect(),
            None => self.entries.iter().cloned().collect(),
        }
    }
}

/// Journal for storing and retrieving service output.
pub struct Journal {
    /// In-memory logs per service
    logs: RwLock<HashMap<String, ServiceLogs>>,
    /// Per-service log file overrides
    paths: RwLock<HashMap<String, PathBuf>>,
    /// Directory for persistent log files
    log_dir: PathBuf,
}

impl Journal {
    /// Create a new journal.
    pub fn new(log_dir: PathBuf) -> Self {
        Self {
            logs: RwLock::new(HashMap::new()),
            paths: RwLock::new(HashMap::new()),
            log_dir,
        }
    }

    /// Directory holding the default log files.
    pub fn log_dir(&self) -> &Path {
        &self.log_dir
    }

    /// Ensure the log directory exists.
    pub fn ensure_dir(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.log_dir)
    }

    /// Send a service's output to `path` instead of `<log_dir>/<service>.log`.
    pub async fn set_log_file(&self, service: &str, path: PathBuf) {
        self.paths.write().await.insert(service.to_string(), path);
    }

    /// Get the log file path for a service.
    pub async fn log_path(&self, service: &str) -> PathBuf {
        match self.paths.read().await.get(service) {
            Some(path) => path.clone(),
            None => self.log_dir.join(format!("{}.log", service)),
        }
    }

    /// Add a log entry.
    pub async fn log(&self, entry: JournalEntry) {
        let path = self.log_path(&entry.service).await;

        if let Err(e) = write_line(&path, &entry.format()) {
            tracing::warn!(service = %entry.service, path = %path.display(), error = %e, "Failed to write log entry to file");
        }

        let mut logs = self.logs.write().await;
        logs.entry(entry.service.clone()).or_default().add(entry);
    }

    /// Get recent in-memory entries for a service.
    pub async fn get_logs(&self, service: &str, limit: Option<usize>) -> Vec<JournalEntry> {
        let logs = self.logs.read().await;
        logs.get(service)
            .map(|l| l.get_entries(limit))
            .unwrap_or_default()
    }

    /// Last `lines` in-memory lines of a service's output, formatted.
    ///
    /// Output from before the supervisor started lives only in the log file.
    pub async fn tail(&self, service: &str, lines: usize) -> Vec<String> {
        if lines == 0 {
            return Vec::new();
        }
        self.get_logs(service, Some(lines))
            .await
            .iter()
            .map(JournalEntry::format)
            .collect()
    }
}

fn write_line(path: &Path, line: &str) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    writeln!(file, "{}", line)
}
