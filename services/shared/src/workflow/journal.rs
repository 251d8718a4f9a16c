use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use super::error::{RuntimeError, WorkflowFailure};
use super::task::{SearchAttributes, WorkflowSignal};

/// One entry in a workflow instance's append-only event log. The journal is
/// the single source of truth for replay: durable calls are memoized against
/// it, and terminal events close the instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum JournalEvent {
    Started {
        workflow_name: String,
        input: serde_json::Value,
        search_attributes: SearchAttributes,
        started_at: DateTime<Utc>,
    },
    ActivityCompleted {
        seq: u64,
        name: String,
        result: serde_json::Value,
        completed_at: DateTime<Utc>,
    },
    ActivityFailed {
        seq: u64,
        name: String,
        kind: String,
        error: String,
        failed_at: DateTime<Utc>,
    },
    TimerStarted {
        seq: u64,
        fire_at: DateTime<Utc>,
    },
    TimerFired {
        seq: u64,
    },
    SignalReceived {
        signal: WorkflowSignal,
    },
    SearchAttributesUpserted {
        attributes: SearchAttributes,
    },
    CancelRequested {
        reason: Option<String>,
        requested_at: DateTime<Utc>,
    },
    Completed {
        output: serde_json::Value,
        completed_at: DateTime<Utc>,
    },
    Failed {
        failure: WorkflowFailure,
        failed_at: DateTime<Utc>,
    },
    Cancelled {
        cancelled_at: DateTime<Utc>,
    },
    Terminated {
        reason: String,
        terminated_at: DateTime<Utc>,
    },
}

impl JournalEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JournalEvent::Completed { .. }
                | JournalEvent::Failed { .. }
                | JournalEvent::Cancelled { .. }
                | JournalEvent::Terminated { .. }
        )
    }
}

/// Append-only JSONL journal for one workflow instance.
pub struct Journal {
    path: PathBuf,
    file: File,
}

impl Journal {
    /// Create a fresh journal. Fails if one already exists for the id.
    pub fn create(dir: &Path, workflow_id: &str) -> Result<Self, RuntimeError> {
        std::fs::create_dir_all(dir)?;
        let path = journal_path(dir, workflow_id);
        let file = OpenOptions::new()
            .create_new(true)
            .append(true)
            .open(&path)
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::AlreadyExists {
                    RuntimeError::WorkflowAlreadyExists {
                        workflow_id: workflow_id.to_string(),
                    }
                } else {
                    RuntimeError::Io(e)
                }
            })?;
        Ok(Self { path, file })
    }

    /// Open an existing journal for appending.
    pub fn open(dir: &Path, workflow_id: &str) -> Result<Self, RuntimeError> {
        let path = journal_path(dir, workflow_id);
        let file = OpenOptions::new().append(true).open(&path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                RuntimeError::WorkflowNotFound {
                    workflow_id: workflow_id.to_string(),
                }
            } else {
                RuntimeError::Io(e)
            }
        })?;
        Ok(Self { path, file })
    }

    pub fn append(&mut self, event: &JournalEvent) -> Result<(), RuntimeError> {
        let line = serde_json::to_string(event)?;
        writeln!(self.file, "{}", line)?;
        self.file.flush()?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

pub fn journal_path(dir: &Path, workflow_id: &str) -> PathBuf {
    let safe: String = workflow_id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' {
                c
            } else {
                '_'
            }
        })
        .collect();
    dir.join(format!("{}.journal", safe))
}

/// Read a full journal from disk. Trailing partial lines (from a crash mid
/// write) are skipped.
pub fn read_journal(path: &Path) -> Result<Vec<JournalEvent>, RuntimeError> {
    let file = File::open(path)?;
    let reader = BufReader::new(file);
    let mut events = Vec::new();
    for line in reader.lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str(&line) {
            Ok(event) => events.push(event),
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "Skipping malformed journal line");
            }
        }
    }
    Ok(events)
}

/// Enumerate `(workflow_id, path)` pairs for all journals under `dir`.
pub fn list_journals(dir: &Path) -> Result<Vec<(String, PathBuf)>, RuntimeError> {
    let mut journals = Vec::new();
    if !dir.exists() {
        return Ok(journals);
    }
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("journal") {
            continue;
        }
        if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
            journals.push((stem.to_string(), path.clone()));
        }
    }
    Ok(journals)
}
