pub mod raft;

pub use raft::log::{LogEntry, RaftLog, NOOP_COMMAND};
pub use raft::node::RaftNode;
pub use raft::state::NodeRole;
pub use raft::state_machine::{ApplyOutcome, KeyValueStore, StateMachine};
