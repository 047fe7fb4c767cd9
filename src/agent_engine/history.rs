use std::collections::VecDeque;
use std::io::Write;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::action::Action;
use crate::errors::DeskPilotResult;
use crate::perception::ScreenSummary;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub ts: i64,
    pub action: Action,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub error: Option<String>,
    pub reasoning: String,
    pub screen: ScreenSummary,
}

/// Bounded log of executed actions, oldest evicted first. Optionally mirrored
/// line-by-line into a JSONL journal.
pub struct ActionHistory {
    pub session_id: String,
    capacity: usize,
    entries: VecDeque<HistoryEntry>,
    journal: Option<PathBuf>,
}

impl ActionHistory {
    pub fn new(capacity: usize) -> Self {
        Self {
            session_id: uuid::Uuid::new_v4().to_string(),
            capacity: capacity.max(1),
            entries: VecDeque::new(),
            journal: None,
        }
    }

    /// Journal into `session_<id>.jsonl` under the platform data directory.
    pub fn with_default_journal(capacity: usize) -> Self {
        let mut history = Self::new(capacity);
        let path = data_dir_or_cwd().join(format!("session_{}.jsonl", history.session_id));
        history.journal = Some(path);
        history
    }

    pub fn with_journal(capacity: usize, path: PathBuf) -> Self {
        let mut history = Self::new(capacity);
        history.journal = Some(path);
        history
    }

    pub fn push(&mut self, entry: HistoryEntry) {
        if let Err(e) = self.append_journal(&entry) {
            tracing::warn!(error = %e, "history journal write failed");
        }
        if self.entries.len() == self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(entry);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn last(&self) -> Option<&HistoryEntry> {
        self.entries.back()
    }

    /// The `n` most recent entries, oldest first.
    pub fn recent(&self, n: usize) -> Vec<HistoryEntry> {
        let skip = self.entries.len().saturating_sub(n);
        self.entries.iter().skip(skip).cloned().collect()
    }

    pub fn journal_path(&self) -> Option<&PathBuf> {
        self.journal.as_ref()
    }

    fn append_journal(&self, entry: &HistoryEntry) -> DeskPilotResult<()> {
        let Some(path) = &self.journal else {
            return Ok(());
        };
        let line = serde_json::to_string(entry)?;
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)?;
        writeln!(file, "{}", line)?;
        tracing::trace!(path = %path.display(), "history entry journaled");
        Ok(())
    }
}

/// `<local data dir>/deskpilot/sessions`, falling back to the working directory.
fn data_dir_or_cwd() -> PathBuf {
    if let Some(base) = dirs::data_local_dir() {
        let d = base.join("deskpilot").join("sessions");
        if std::fs::create_dir_all(&d).is_ok() {
            return d;
        }
    }
    std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."))
}
