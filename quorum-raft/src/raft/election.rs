//! Election timer and vote counting.

use quorum_common::types::{LogIndex, NodeId, Term, TimingConfig};
use rand::Rng;
use std::collections::HashSet;
use std::time::Duration;

/// Produces randomized election timeouts for one node.
#[derive(Debug, Clone)]
pub struct ElectionTimer {
    min_ms: u64,
    max_ms: u64,
    stagger: Duration,
}

impl ElectionTimer {
    pub fn new(node_id: NodeId, timing: &TimingConfig) -> Self {
        Self {
            min_ms: timing.election_timeout_min_ms,
            max_ms: timing.election_timeout_max_ms.max(timing.election_timeout_min_ms),
            stagger: Duration::from_millis(timing.election_stagger_ms.saturating_mul(node_id)),
        }
    }

    /// A fresh timeout, drawn anew on every reset
    pub fn next_timeout(&self) -> Duration {
        let ms = rand::thread_rng().gen_range(self.min_ms..=self.max_ms);
        Duration::from_millis(ms) + self.stagger
    }
}

/// Votes collected by a candidate in its current term.
#[derive(Debug, Clone)]
pub struct VoteTally {
    term: Term,
    granted: HashSet<NodeId>,
    quorum: usize,
}

impl VoteTally {
    /// Starts a tally that already counts the candidate's own vote
    pub fn new(term: Term, self_id: NodeId, cluster_size: usize) -> Self {
        let mut granted = HashSet::new();
        granted.insert(self_id);
        Self {
            term,
            granted,
            quorum: quorum_size(cluster_size),
        }
    }

    pub fn term(&self) -> Term {
        self.term
    }

    /// Records a granted vote; repeated votes from one node count once.
    pub fn record(&mut self, voter: NodeId) {
        self.granted.insert(voter);
    }

    pub fn votes(&self) -> usize {
        self.granted.len()
    }

    pub fn has_quorum(&self) -> bool {
        self.granted.len() >= self.quorum
    }
}

/// ⌊N/2⌋+1
pub fn quorum_size(cluster_size: usize) -> usize {
    cluster_size / 2 + 1
}

/// Raft's up-to-date rule: higher last term wins, equal terms compare length.
pub fn candidate_log_is_up_to_date(
    candidate_last_index: LogIndex,
    candidate_last_term: Term,
    own_last_index: LogIndex,
    own_last_term: Term,
) -> bool {
    candidate_last_term > own_last_term
        || (candidate_last_term == own_last_term && candidate_last_index >= own_last_index)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_within_window() {
        let timer = ElectionTimer::new(3, &TimingConfig::default());
        for _ in 0..100 {
            let t = timer.next_timeout();
            assert!(t >= Duration::from_millis(150));
            assert!(t <= Duration::from_millis(300));
        }
    }

    #[test]
    fn test_stagger_scales_with_id() {
        let timing = TimingConfig {
            election_stagger_ms: 500,
            ..TimingConfig::default()
        };
        let first = ElectionTimer::new(0, &timing);
        let second = ElectionTimer::new(1, &timing);
        for _ in 0..50 {
            assert!(first.next_timeout() < second.next_timeout());
        }
    }

    #[test]
    fn test_timeouts_vary() {
        let timer = ElectionTimer::new(0, &TimingConfig::default());
        let samples: HashSet<Duration> = (0..50).map(|_| timer.next_timeout()).collect();
        assert!(samples.len() > 1);
    }

    #[test]
    fn test_tally_needs_strict_majority() {
        let mut tally = VoteTally::new(2, 0, 5);
        assert!(!tally.has_quorum());
        tally.record(1);
        tally.record(1);
        assert_eq!(tally.votes(), 2);
        assert!(!tally.has_quorum());
        tally.record(4);
        assert!(tally.has_quorum());
        assert_eq!(tally.term(), 2);
    }

    #[test]
    fn test_single_node_cluster_wins_alone() {
        assert!(VoteTally::new(1, 0, 1).has_quorum());
        assert_eq!(quorum_size(4), 3);
    }

    #[test]
    fn test_up_to_date_rule() {
        assert!(candidate_log_is_up_to_date(1, 3, 10, 2));
        assert!(candidate_log_is_up_to_date(5, 2, 5, 2));
        assert!(!candidate_log_is_up_to_date(4, 2, 5, 2));
        assert!(!candidate_log_is_up_to_date(10, 1, 1, 2));
    }
}
