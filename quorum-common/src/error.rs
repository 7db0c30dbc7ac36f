use crate::types::{LogIndex, NodeId};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum QuorumError {
    #[error("I/O Error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization Error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("Codec Error: {0}")]
    Codec(#[from] bincode::Error),

    #[error("Configuration Error: {0}")]
    Config(String),

    #[error("Not the leader (last known leader: {leader_id:?})")]
    NotLeader { leader_id: Option<NodeId> },

    #[error("Entry {index} was not committed within {waited_ms}ms")]
    CommitTimeout { index: LogIndex, waited_ms: u64 },

    #[error("Leadership lost before entry {index} was committed")]
    LeadershipLost { index: LogIndex },

    #[error("Node is stopped")]
    Stopped,

    #[error("Node is already running")]
    AlreadyRunning,

    #[error("Transport Error: {0}")]
    Transport(String),
}

impl QuorumError {
    /// True when the caller should redirect to another node rather than retry here.
    pub fn is_not_leader(&self) -> bool {
        matches!(self, QuorumError::NotLeader { .. })
    }

    pub fn leader_hint(&self) -> Option<NodeId> {
        match self {
            QuorumError::NotLeader { leader_id } => *leader_id,
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, QuorumError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_leader_carries_hint() {
        let err = QuorumError::NotLeader { leader_id: Some(3) };
        assert!(err.is_not_leader());
        assert_eq!(err.leader_hint(), Some(3));

        let err = QuorumError::CommitTimeout { index: 4, waited_ms: 100 };
        assert!(!err.is_not_leader());
        assert_eq!(err.leader_hint(), None);
        assert_eq!(err.to_string(), "Entry 4 was not committed within 100ms");
    }
}
