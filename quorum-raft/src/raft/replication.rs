//! Leader-side bookkeeping of what each follower holds.

use quorum_common::types::LogIndex;
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerProgress {
    pub next_index: LogIndex,  // Next entry to send
    pub match_index: LogIndex, // Highest entry known replicated
}

/// Per-peer `next_index`/`match_index`, alive only while leading.
#[derive(Debug, Clone)]
pub struct ReplicationTracker {
    peers: HashMap<String, PeerProgress>,
}

impl ReplicationTracker {
    /// Every peer starts at `next_index = last_index + 1`, `match_index = 0`
    pub fn new(peers: &[String], last_index: LogIndex) -> Self {
        let peers = peers
            .iter()
            .map(|p| {
                (
                    p.clone(),
                    PeerProgress {
                        next_index: last_index + 1,
                        match_index: 0,
                    },
                )
            })
            .collect();
        Self { peers }
    }

    pub fn progress(&self, peer: &str) -> Option<PeerProgress> {
        self.peers.get(peer).copied()
    }

    /// Follower acknowledged everything up to `match_index`.
    /// Returns false when nothing moved, e.g. for a re-delivered response.
    pub fn record_success(&mut self, peer: &str, match_index: LogIndex) -> bool {
        let Some(progress) = self.peers.get_mut(peer) else {
            return false;
        };
        if match_index <= progress.match_index && progress.next_index == progress.match_index + 1 {
            return false;
        }
        progress.match_index = progress.match_index.max(match_index);
        progress.next_index = progress.match_index + 1;
        true
    }

    /// Follower failed the consistency check for a request sent at `sent_next`.
    pub fn record_rejection(
        &mut self,
        peer: &str,
        sent_next: LogIndex,
        conflict_index: Option<LogIndex>,
    ) {
        let Some(progress) = self.peers.get_mut(peer) else {
            return;
        };
        // A stale rejection must not undo progress made since.
        if progress.next_index != sent_next {
            return;
        }
        let stepped = sent_next.saturating_sub(1);
        let target = match conflict_index {
            Some(hint) if hint < sent_next => hint,
            _ => stepped,
        };
        progress.next_index = target.max(progress.match_index + 1).max(1);
    }

    /// Highest index stored on a majority, counting the leader's own `leader_last_index`.
    pub fn majority_match(&self, leader_last_index: LogIndex, quorum: usize) -> LogIndex {
        let mut indexes: Vec<LogIndex> = self.peers.values().map(|p| p.match_index).collect();
        indexes.push(leader_last_index);
        indexes.sort_unstable_by(|a, b| b.cmp(a));
        indexes
            .get(quorum.saturating_sub(1))
            .copied()
            .unwrap_or(0)
    }

    /// True if `peer` has not yet acknowledged `last_index`
    pub fn lags(&self, peer: &str, last_index: LogIndex) -> bool {
        self.peers
            .get(peer)
            .map(|p| p.match_index < last_index)
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peers() -> Vec<String> {
        (1..=4).map(|i| format!("127.0.0.1:{}", 5050 + i)).collect()
    }

    #[test]
    fn test_initial_progress() {
        let tracker = ReplicationTracker::new(&peers(), 7);
        let p = tracker.progress("127.0.0.1:5051").unwrap();
        assert_eq!(p.next_index, 8);
        assert_eq!(p.match_index, 0);
        assert!(tracker.progress("127.0.0.1:9999").is_none());
    }

    #[test]
    fn test_duplicate_success_is_idempotent() {
        let mut tracker = ReplicationTracker::new(&peers(), 3);
        assert!(tracker.record_success("127.0.0.1:5051", 3));
        assert!(!tracker.record_success("127.0.0.1:5051", 3));
        // Reordered older ack does not move match_index backwards
        assert!(!tracker.record_success("127.0.0.1:5051", 2));

        let p = tracker.progress("127.0.0.1:5051").unwrap();
        assert_eq!(p.match_index, 3);
        assert_eq!(p.next_index, 4);
    }

    #[test]
    fn test_rejection_uses_conflict_hint() {
        let mut tracker = ReplicationTracker::new(&peers(), 10);
        tracker.record_rejection("127.0.0.1:5052", 11, Some(4));
        assert_eq!(tracker.progress("127.0.0.1:5052").unwrap().next_index, 4);

        tracker.record_rejection("127.0.0.1:5052", 4, None);
        assert_eq!(tracker.progress("127.0.0.1:5052").unwrap().next_index, 3);
    }

    #[test]
    fn test_rejection_never_passes_match_index() {
        let mut tracker = ReplicationTracker::new(&peers(), 10);
        tracker.record_success("127.0.0.1:5053", 6);
        tracker.record_rejection("127.0.0.1:5053", 7, Some(1));
        assert_eq!(tracker.progress("127.0.0.1:5053").unwrap().next_index, 7);
    }

    #[test]
    fn test_stale_rejection_ignored() {
        let mut tracker = ReplicationTracker::new(&peers(), 10);
        tracker.record_rejection("127.0.0.1:5054", 11, Some(5));
        tracker.record_rejection("127.0.0.1:5054", 11, Some(2));
        assert_eq!(tracker.progress("127.0.0.1:5054").unwrap().next_index, 5);
    }

    #[test]
    fn test_majority_match() {
        let mut tracker = ReplicationTracker::new(&peers(), 5);
        assert_eq!(tracker.majority_match(5, 3), 0);

        tracker.record_success("127.0.0.1:5051", 5);
        assert_eq!(tracker.majority_match(5, 3), 0);

        tracker.record_success("127.0.0.1:5052", 4);
        assert_eq!(tracker.majority_match(5, 3), 4);

        tracker.record_success("127.0.0.1:5053", 5);
        assert_eq!(tracker.majority_match(5, 3), 5);
        assert!(tracker.lags("127.0.0.1:5054", 5));
        assert!(!tracker.lags("127.0.0.1:5051", 5));
    }
}
