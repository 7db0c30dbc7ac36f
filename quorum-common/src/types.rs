pub type NodeId = u64;
pub type Term = u64;
pub type LogIndex = u64;

/// Value reported by `get_leader_id` when no leader is known.
pub const UNKNOWN_LEADER: i64 = -1;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeAddress {
    pub host: String,
    pub port: u16,
    pub node_id: NodeId,
}

impl NodeAddress {
    /// `host:port` form used for peer addressing.
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Timing knobs for elections, heartbeats and RPCs. All values in milliseconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    pub election_timeout_min_ms: u64,
    pub election_timeout_max_ms: u64,
    /// Added per node id to every election timeout. 0 keeps plain randomized timeouts.
    pub election_stagger_ms: u64,
    pub heartbeat_interval_ms: u64,
    pub rpc_timeout_ms: u64,
    pub commit_timeout_ms: u64,
    pub max_entries_per_append: usize,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            election_timeout_min_ms: 150,
            election_timeout_max_ms: 300,
            election_stagger_ms: 0,
            heartbeat_interval_ms: 50,
            rpc_timeout_ms: 100,
            commit_timeout_ms: 3000,
            max_entries_per_append: 64,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    pub nodes: Vec<NodeAddress>,
    #[serde(default)]
    pub timing: TimingConfig,
}

impl ClusterConfig {
    pub fn node(&self, id: NodeId) -> Option<&NodeAddress> {
        self.nodes.iter().find(|n| n.node_id == id)
    }

    /// Addresses of every node except `id`.
    pub fn peers_of(&self, id: NodeId) -> Vec<String> {
        self.nodes
            .iter()
            .filter(|n| n.node_id != id)
            .map(NodeAddress::addr)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn three_nodes() -> ClusterConfig {
        ClusterConfig {
            nodes: (0..3)
                .map(|id| NodeAddress {
                    host: "127.0.0.1".into(),
                    port: 5050 + id as u16,
                    node_id: id,
                })
                .collect(),
            timing: TimingConfig::default(),
        }
    }

    #[test]
    fn test_node_address_serialization() {
        let node = NodeAddress {
            host: "127.0.0.1".into(),
            port: 8080,
            node_id: 1,
        };

        let json = serde_json::to_string(&node).unwrap();
        let deserialized: NodeAddress = serde_json::from_str(&json).unwrap();
        assert_eq!(node, deserialized);
        assert_eq!(deserialized.addr(), "127.0.0.1:8080");
    }

    #[test]
    fn test_peers_exclude_self() {
        let config = three_nodes();
        assert_eq!(
            config.peers_of(1),
            vec!["127.0.0.1:5050".to_string(), "127.0.0.1:5052".to_string()]
        );
        assert_eq!(config.node(2).map(|n| n.port), Some(5052));
        assert!(config.node(7).is_none());
    }

    #[test]
    fn test_timing_defaults_fill_missing_fields() {
        let timing: TimingConfig = serde_json::from_str(r#"{"heartbeat_interval_ms": 20}"#).unwrap();
        assert_eq!(timing.heartbeat_interval_ms, 20);
        assert_eq!(timing.election_timeout_min_ms, 150);
        assert_eq!(timing.max_entries_per_append, 64);
    }
}
