//! Append-only lifecycle event log.
//!
//! Every state transition is written as one JSON line to
//! `<state_dir>/events.jsonl` and synced before the transition is considered
//! done. The file outlives the supervisor process so a restarted supervisor
//! keeps appending to the same history.

use crate::error::EventLogError;
use crate::service::ServiceState;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use uuid::Uuid;

/// File name of the event log inside the state directory.
pub const EVENT_LOG_FILE: &str = "events.jsonl";

/// One recorded state transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LifecycleEvent {
    pub timestamp: DateTime<Utc>,
    /// Supervisor run that produced the event
    pub run_id: Uuid,
    pub service: String,
    pub from: ServiceState,
    pub to: ServiceState,
    pub reason: String,
}

impl LifecycleEvent {
    /// Format the event for display.
    pub fn format(&self) -> String {
        format!(
            "{} {} {} -> {}: {}",
            self.timestamp.format("%Y-%m-%d %H:%M:%S"),
            self.service,
            self.from,
            self.to,
            self.reason
        )
    }
}

/// Durable sink for lifecycle events.
pub struct EventLog {
    path: PathBuf,
    run_id: Uuid,
    file: Mutex<File>,
}

impl EventLog {
    /// Open (or create) the event log in `state_dir`.
    pub fn open(state_dir: &Path) -> Result<Self, EventLogError> {
        let path = state_dir.join(EVENT_LOG_FILE);
        std::fs::create_dir_all(state_dir).map_err(|source| EventLogError::Write {
            path: path.clone(),
            source,
        })?;

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|source| EventLogError::Write {
                path: path.clone(),
                source,
            })?;

        Ok(Self {
            path,
            run_id: Uuid::new_v4(),
            file: Mutex::new(file),
        })
    }

    /// Path of the log file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// ID stamped on every event of this supervisor run.
    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    /// Append one transition and sync it to disk.
    pub fn record(
        &self,
        service: &str,
        from: ServiceState,
        to: ServiceState,
        reason: &str,
    ) -> Result<LifecycleEvent, EventLogError> {
        let event = LifecycleEvent {
            timestamp: Utc::now(),
            run_id: self.run_id,
            service: service.to_string(),
            from,
            to,
            reason: reason.to_string(),
        };

        let mut line = serde_json::to_string(&event)?;
        line.push('\n');

        let write_err = |source| EventLogError::Write {
            path: self.path.clone(),
            source,
        };
        // A poisoned lock still guards a valid append-mode file
        let mut file = self.file.lock().unwrap_or_else(|e| e.into_inner());
        file.write_all(line.as_bytes()).map_err(write_err)?;
        file.flush().map_err(write_err)?;
        file.sync_data().map_err(write_err)?;

        tracing::info!(
            service = %event.service,
            from = %event.from,
            to = %event.to,
            reason = %event.reason,
            "State transition"
        );
        Ok(event)
    }

    /// Read every event in the log at `path`.
    pub fn read_all(path: &Path) -> Result<Vec<LifecycleEvent>, EventLogError> {
        let file = match File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => {
                return Err(EventLogError::Read {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };

        let mut events = Vec::new();
        for (idx, line) in BufReader::new(file).lines().enumerate() {
            let line = line.map_err(|source| EventLogError::Read {
                path: path.to_path_buf(),
                source,
            })?;
            if line.trim().is_empty() {
                continue;
            }
            let event = serde_json::from_str(&line).map_err(|source| EventLogError::Corrupt {
                path: path.to_path_buf(),
                line: idx + 1,
                source,
            })?;
            events.push(event);
        }
        Ok(events)
    }

    /// Events of one service, oldest first.
    pub fn read_service(path: &Path, service: &str) -> Result<Vec<LifecycleEvent>, EventLogError> {
        Ok(Self::read_all(path)?
            .into_iter()
            .filter(|e| e.service == service)
            .collect())
    }

    /// Events recorded by this log instance's file, oldest first.
    pub fn events(&self) -> Result<Vec<LifecycleEvent>, EventLogError> {
        Self::read_all(&self.path)
    }
}
