use super::log::LogEntry;
use quorum_common::types::LogIndex;
use std::collections::HashMap;
use tracing::warn;

/// Trait for any Raft-compatible state machine.
/// Committed entries are handed over exactly once, in index order.
pub trait StateMachine: Send + Sync {
    fn apply(&mut self, index: LogIndex, entry: &LogEntry) -> ApplyOutcome;

    fn get(&self, key: &str) -> Option<String>;
}

/// Result of applying one committed entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyOutcome {
    Applied,
    Skipped,
    Rejected(String),
}

//
// In-Memory Key-Value Store
//

/// Commands that the key-value store can handle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KvCommand {
    Create,
    Update,
    Delete,
}

impl KvCommand {
    pub fn parse(command: &str) -> Option<Self> {
        match command.to_ascii_uppercase().as_str() {
            "CREATE" => Some(KvCommand::Create),
            "UPDATE" => Some(KvCommand::Update),
            "DELETE" => Some(KvCommand::Delete),
            _ => None,
        }
    }
}

#[derive(Debug, Default)]
pub struct KeyValueStore {
    data: HashMap<String, String>,
    last_applied: LogIndex,
}

impl KeyValueStore {
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn last_applied(&self) -> LogIndex {
        self.last_applied
    }

    fn check_old_value(&self, entry: &LogEntry) -> Result<(), String> {
        match (&entry.old_value, self.data.get(&entry.key)) {
            (None, _) => Ok(()),
            (Some(expected), Some(current)) if expected == current => Ok(()),
            (Some(expected), current) => Err(format!(
                "key {} holds {:?}, expected {}",
                entry.key, current, expected
            )),
        }
    }

    fn execute(&mut self, command: KvCommand, entry: &LogEntry) -> Result<(), String> {
        match command {
            KvCommand::Create => {
                if self.data.contains_key(&entry.key) {
                    return Err(format!("key {} already exists", entry.key));
                }
                let value = entry.value.clone().ok_or("CREATE without a value")?;
                self.data.insert(entry.key.clone(), value);
            }
            KvCommand::Update => {
                if !self.data.contains_key(&entry.key) {
                    return Err(format!("key {} does not exist", entry.key));
                }
                self.check_old_value(entry)?;
                let value = entry.value.clone().ok_or("UPDATE without a value")?;
                self.data.insert(entry.key.clone(), value);
            }
            KvCommand::Delete => {
                self.check_old_value(entry)?;
                if self.data.remove(&entry.key).is_none() {
                    return Err(format!("key {} does not exist", entry.key));
                }
            }
        }
        Ok(())
    }
}

impl StateMachine for KeyValueStore {
    fn apply(&mut self, index: LogIndex, entry: &LogEntry) -> ApplyOutcome {
        self.last_applied = index;
        if entry.is_noop() {
            return ApplyOutcome::Skipped;
        }
        let Some(command) = KvCommand::parse(&entry.command) else {
            warn!(index, command = %entry.command, "unknown command in log");
            return ApplyOutcome::Rejected(format!("unknown command {}", entry.command));
        };
        match self.execute(command, entry) {
            Ok(()) => ApplyOutcome::Applied,
            Err(reason) => ApplyOutcome::Rejected(reason),
        }
    }

    fn get(&self, key: &str) -> Option<String> {
        self.data.get(key).cloned()
    }
}
