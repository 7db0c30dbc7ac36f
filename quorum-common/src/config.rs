use crate::error::{QuorumError, Result};
use crate::types::ClusterConfig;
use std::collections::HashSet;
use std::fs;
use std::path::Path;

/// Loads and validates a cluster configuration from a JSON file.
pub fn load_config(path: impl AsRef<Path>) -> Result<ClusterConfig> {
    let data = fs::read_to_string(path)?;
    let config: ClusterConfig = serde_json::from_str(&data)?;
    config.validate()?;
    Ok(config)
}

impl ClusterConfig {
    pub fn validate(&self) -> Result<()> {
        if self.nodes.is_empty() {
            return Err(QuorumError::Config("cluster has no nodes".into()));
        }

        let mut ids = HashSet::new();
        let mut addrs = HashSet::new();
        for node in &self.nodes {
            if !ids.insert(node.node_id) {
                return Err(QuorumError::Config(format!(
                    "duplicate node id {}",
                    node.node_id
                )));
            }
            if !addrs.insert(node.addr()) {
                return Err(QuorumError::Config(format!(
                    "duplicate node address {}",
                    node.addr()
                )));
            }
        }

        let t = &self.timing;
        if t.election_timeout_min_ms == 0 || t.heartbeat_interval_ms == 0 || t.rpc_timeout_ms == 0 {
            return Err(QuorumError::Config("timeouts must be non-zero".into()));
        }
        if t.election_timeout_min_ms > t.election_timeout_max_ms {
            return Err(QuorumError::Config(
                "election_timeout_min_ms exceeds election_timeout_max_ms".into(),
            ));
        }
        if t.heartbeat_interval_ms >= t.election_timeout_min_ms {
            return Err(QuorumError::Config(
                "heartbeat interval must be shorter than the election timeout".into(),
            ));
        }
        if t.max_entries_per_append == 0 {
            return Err(QuorumError::Config(
                "max_entries_per_append must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const CONFIG: &str = r#"{
        "nodes": [
            {"host": "127.0.0.1", "port": 5050, "node_id": 0},
            {"host": "127.0.0.1", "port": 5051, "node_id": 1},
            {"host": "127.0.0.1", "port": 5052, "node_id": 2}
        ],
        "timing": {"election_stagger_ms": 100}
    }"#;

    #[test]
    fn test_load_config_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(CONFIG.as_bytes()).unwrap();

        let config = load_config(file.path()).unwrap();
        assert_eq!(config.nodes.len(), 3);
        assert_eq!(config.timing.election_stagger_ms, 100);
        assert_eq!(config.timing.heartbeat_interval_ms, 50);
    }

    #[test]
    fn test_missing_file_is_io_error() {
        let err = load_config("/definitely/not/here.json").unwrap_err();
        assert!(matches!(err, QuorumError::Io(_)));
    }

    #[test]
    fn test_rejects_duplicate_ids() {
        let mut config: ClusterConfig = serde_json::from_str(CONFIG).unwrap();
        config.nodes[2].node_id = 0;
        assert!(matches!(config.validate(), Err(QuorumError::Config(_))));
    }

    #[test]
    fn test_rejects_heartbeat_slower_than_election() {
        let mut config: ClusterConfig = serde_json::from_str(CONFIG).unwrap();
        config.timing.heartbeat_interval_ms = 200;
        assert!(config.validate().is_err());

        config.timing.heartbeat_interval_ms = 50;
        config.timing.election_timeout_min_ms = 400;
        assert!(config.validate().is_err());
    }
}
