// Raft consensus: replicated log, leader election and the node that runs them
pub mod election;
pub mod log;
pub mod node;
pub mod replication;
pub mod rpc;
pub mod state;
pub mod state_machine;
pub mod transport;
