use quorum_common::types::{LogIndex, Term};
use serde::{Deserialize, Serialize};

/// Command written by a newly elected leader to commit entries of earlier terms.
pub const NOOP_COMMAND: &str = "NOOP";

/// A single log entry in the Raft log. Its index is its 1-based position.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub term: Term,                // Term in which the leader created the entry
    pub command: String,           // e.g. "CREATE"
    pub key: String,               // Record key the command targets
    pub value: Option<String>,     // New value, for writes
    pub old_value: Option<String>, // Previous value, for compare-and-swap style commands
}

impl LogEntry {
    pub fn new(
        term: Term,
        command: impl Into<String>,
        key: impl Into<String>,
        value: Option<String>,
        old_value: Option<String>,
    ) -> Self {
        Self {
            term,
            command: command.into(),
            key: key.into(),
            value,
            old_value,
        }
    }

    pub fn noop(term: Term) -> Self {
        Self::new(term, NOOP_COMMAND, "", None, None)
    }

    pub fn is_noop(&self) -> bool {
        self.command == NOOP_COMMAND
    }
}

/// Append-only sequence of entries with conflict truncation.
#[derive(Debug, Default, Clone)]
pub struct RaftLog {
    entries: Vec<LogEntry>,
}

impl RaftLog {
    /// Create an empty Raft log
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an entry and return its index
    pub fn append(&mut self, entry: LogEntry) -> LogIndex {
        self.entries.push(entry);
        self.last_index()
    }

    /// Remove the entry at `index` and everything after it
    pub fn truncate_from(&mut self, index: LogIndex) {
        if index == 0 {
            self.entries.clear();
        } else {
            self.entries.truncate((index - 1) as usize);
        }
    }

    /// Get a specific log entry by Raft index (1-based)
    pub fn entry_at(&self, index: LogIndex) -> Option<&LogEntry> {
        if index == 0 {
            return None;
        }
        self.entries.get((index - 1) as usize)
    }

    /// Term of the entry at `index`. Index 0 is the empty prefix with term 0.
    pub fn term_at(&self, index: LogIndex) -> Option<Term> {
        if index == 0 {
            return Some(0);
        }
        self.entry_at(index).map(|e| e.term)
    }

    /// True if the log holds an entry at `index` with `term`
    pub fn matches(&self, index: LogIndex, term: Term) -> bool {
        self.term_at(index) == Some(term)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Returns the last log index, or 0 if the log is empty
    pub fn last_index(&self) -> LogIndex {
        self.entries.len() as LogIndex
    }

    /// Returns the term of the last entry, or 0 if empty
    pub fn last_term(&self) -> Term {
        self.entries.last().map(|e| e.term).unwrap_or(0)
    }

    /// Up to `max` entries starting at `index`
    pub fn entries_from(&self, index: LogIndex, max: usize) -> Vec<LogEntry> {
        if index == 0 || index > self.last_index() {
            return Vec::new();
        }
        let start = (index - 1) as usize;
        let end = (start + max).min(self.entries.len());
        self.entries[start..end].to_vec()
    }

    /// First index holding the same term as the entry at `index`.
    pub fn first_index_of_term(&self, index: LogIndex) -> LogIndex {
        let Some(term) = self.entry_at(index).map(|e| e.term) else {
            return index;
        };
        let mut first = index;
        while first > 1 && self.term_at(first - 1) == Some(term) {
            first -= 1;
        }
        first
    }

    /// Owned copy of every entry
    pub fn entries(&self) -> Vec<LogEntry> {
        self.entries.clone()
    }
}
