//! Query history
//!
//! Ring buffer of executed statements with their outcome, persisted to
//! `~/.vizdb/history.jsonl`, one JSON record per line so multi-line SQL
//! needs no escaping beyond JSON's own.
//!
//! Persistence is best-effort: I/O failures are logged at debug level and
//! never fail the statement that produced the entry.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::io::Write;
use std::path::PathBuf;

/// How a recorded statement ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HistoryOutcome {
    Succeeded,
    Failed,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub sql: String,
    pub profile: String,
    pub executed_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub outcome: HistoryOutcome,
    /// Rows streamed or affected, when known
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rows: Option<u64>,
}

pub struct QueryHistory {
    entries: VecDeque<HistoryEntry>,
    capacity: usize,
    /// File path for persistence (`None` = in-memory only)
    path: Option<PathBuf>,
}

impl QueryHistory {
    /// Create an in-memory-only history (no persistence).
    pub fn new(capacity: usize) -> Self {
        Self::load_from(None, capacity)
    }

    /// Load history from `<config dir>/history.jsonl`
    pub fn load(capacity: usize) -> Self {
        let path = crate::config::config_dir()
            .ok()
            .map(|dir| dir.join("history.jsonl"));
        Self::load_from(path, capacity)
    }

    pub fn load_from(path: Option<PathBuf>, capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let mut entries: VecDeque<HistoryEntry> = path
            .as_ref()
            .and_then(|p| std::fs::read_to_string(p).ok())
            .map(|content| {
                content
                    .lines()
                    .filter(|line| !line.trim().is_empty())
                    // A torn last line from a crash is skipped, not fatal
                    .filter_map(|line| serde_json::from_str(line).ok())
                    .collect()
            })
            .unwrap_or_default();

        // Trim to capacity (keep newest)
        while entries.len() > capacity {
            entries.pop_front();
        }

        Self {
            entries,
            capacity,
            path,
        }
    }

    /// Record an executed statement. Skips empty SQL, collapses a repeat of
    /// the newest entry, drops the oldest at capacity.
    pub fn push(&mut self, mut entry: HistoryEntry) {
        entry.sql = entry.sql.trim().to_string();
        if entry.sql.is_empty() {
            return;
        }
        if let Some(last) = self.entries.back_mut()
            && last.sql == entry.sql
            && last.profile == entry.profile
        {
            *last = entry;
            self.save();
            return;
        }
        if self.entries.len() == self.capacity {
            self.entries.pop_front();
            self.entries.push_back(entry);
            self.save();
        } else {
            self.append(&entry);
            self.entries.push_back(entry);
        }
    }

    pub fn entries(&self) -> impl DoubleEndedIterator<Item = &HistoryEntry> {
        self.entries.iter()
    }

    /// Newest first
    pub fn recent(&self, count: usize) -> Vec<&HistoryEntry> {
        self.entries.iter().rev().take(count).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn append(&self, entry: &HistoryEntry) {
        let Some(path) = &self.path else { return };
        let result = (|| -> std::io::Result<()> {
            if let Some(dir) = path.parent() {
                std::fs::create_dir_all(dir)?;
            }
            let mut file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)?;
            writeln!(file, "{}", serde_json::to_string(entry)?)
        })();
        if let Err(e) = result {
            tracing::debug!(error = %e, path = %path.display(), "history append failed");
        }
    }

    /// Rewrite the whole file
    fn save(&self) {
        let Some(path) = &self.path else { return };
        let result = (|| -> std::io::Result<()> {
            if let Some(dir) = path.parent() {
                std::fs::create_dir_all(dir)?;
            }
            let mut content = String::new();
            for entry in &self.entries {
                content.push_str(&serde_json::to_string(entry)?);
                content.push('\n');
            }
            std::fs::write(path, content)
        })();
        if let Err(e) = result {
            tracing::debug!(error = %e, path = %path.display(), "history save failed");
        }
    }
}
