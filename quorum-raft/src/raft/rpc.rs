use super::log::LogEntry;
use quorum_common::error::Result;
use quorum_common::types::{LogIndex, NodeId, Term};
use serde::{Deserialize, Serialize};

/// Sent by leader to replicate log entries or as heartbeat
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppendEntriesRequest {
    pub term: Term,              // Leader’s term
    pub leader_id: NodeId,       // Leader's ID
    pub prev_log_index: LogIndex, // Index of log entry before new ones
    pub prev_log_term: Term,     // Term of that entry
    pub entries: Vec<LogEntry>,  // New log entries to store
    pub leader_commit: LogIndex, // Leader’s commit index
}

impl AppendEntriesRequest {
    pub fn is_heartbeat(&self) -> bool {
        self.entries.is_empty()
    }

    /// Index of the last entry carried, or `prev_log_index` for a heartbeat
    pub fn last_index(&self) -> LogIndex {
        self.prev_log_index + self.entries.len() as LogIndex
    }
}

/// Response from follower to AppendEntries RPC
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppendEntriesResponse {
    pub term: Term,    // Current term (may be newer)
    pub success: bool, // True if follower appended entries
    pub match_index: Option<LogIndex>,
    /// Where the leader should resume when the consistency check failed
    pub conflict_index: Option<LogIndex>,
}

impl AppendEntriesResponse {
    pub fn success(term: Term, match_index: LogIndex) -> Self {
        Self {
            term,
            success: true,
            match_index: Some(match_index),
            conflict_index: None,
        }
    }

    pub fn rejected(term: Term, conflict_index: Option<LogIndex>) -> Self {
        Self {
            term,
            success: false,
            match_index: None,
            conflict_index,
        }
    }
}

/// RequestVote RPC: Candidate → Peer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestVoteRequest {
    pub term: Term,
    pub candidate_id: NodeId,
    pub last_log_index: LogIndex,
    pub last_log_term: Term,
}

/// Response to RequestVote
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestVoteResponse {
    pub term: Term,
    pub vote_granted: bool,
    pub voter_id: NodeId,
}

/// Everything a node can be asked over the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RaftRequest {
    RequestVote(RequestVoteRequest),
    AppendEntries(AppendEntriesRequest),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RaftResponse {
    RequestVote(RequestVoteResponse),
    AppendEntries(AppendEntriesResponse),
}

impl RaftRequest {
    pub fn term(&self) -> Term {
        match self {
            RaftRequest::RequestVote(req) => req.term,
            RaftRequest::AppendEntries(req) => req.term,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(bytes)?)
    }
}

impl RaftResponse {
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(bytes)?)
    }
}
