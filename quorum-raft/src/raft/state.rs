//! Mutable consensus state of one node and every transition on it.
//!
//! `RaftState` is plain data: no I/O, no tasks. The node wraps it in a mutex and
//! drives it from timers, inbound RPCs and client calls, so each method here is
//! one atomic step of the protocol.

use super::election::{candidate_log_is_up_to_date, ElectionTimer, VoteTally};
use super::log::{LogEntry, RaftLog};
use super::replication::ReplicationTracker;
use super::rpc::{
    AppendEntriesRequest, AppendEntriesResponse, RequestVoteRequest, RequestVoteResponse,
};
use super::state_machine::{ApplyOutcome, KeyValueStore, StateMachine};
use quorum_common::error::{QuorumError, Result};
use quorum_common::types::{LogIndex, NodeId, Term, TimingConfig};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Role of the node in the cluster
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeRole {
    Follower,
    Candidate,
    Leader,
}

/// Role plus the data that only exists in that role.
#[derive(Debug)]
pub enum Role {
    Follower,
    Candidate(VoteTally),
    Leader(ReplicationTracker),
}

impl Role {
    pub fn kind(&self) -> NodeRole {
        match self {
            Role::Follower => NodeRole::Follower,
            Role::Candidate(_) => NodeRole::Candidate,
            Role::Leader(_) => NodeRole::Leader,
        }
    }
}

/// What waiters on the node care about; published after every transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Progress {
    pub term: Term,
    pub role: NodeRole,
    pub leader_id: Option<NodeId>,
    pub commit_index: LogIndex,
}

pub struct RaftState {
    id: NodeId,
    peers: Vec<String>,
    current_term: Term,
    voted_for: Option<NodeId>,
    role: Role,
    leader_id: Option<NodeId>,
    commit_index: LogIndex,
    last_applied: LogIndex,
    log: RaftLog,
    timer: ElectionTimer,
    election_deadline: Instant,
    running: bool,
    max_entries_per_append: usize,
    state_machine: Box<dyn StateMachine>,
}

impl RaftState {
    pub fn new(id: NodeId, peers: Vec<String>, timing: &TimingConfig) -> Self {
        Self::with_state_machine(id, peers, timing, Box::new(KeyValueStore::default()))
    }

    pub fn with_state_machine(
        id: NodeId,
        peers: Vec<String>,
        timing: &TimingConfig,
        state_machine: Box<dyn StateMachine>,
    ) -> Self {
        let timer = ElectionTimer::new(id, timing);
        let election_deadline = Instant::now() + timer.next_timeout();
        Self {
            id,
            peers,
            current_term: 0,
            voted_for: None,
            role: Role::Follower,
            leader_id: None,
            commit_index: 0,
            last_applied: 0,
            log: RaftLog::new(),
            timer,
            election_deadline,
            running: false,
            max_entries_per_append: timing.max_entries_per_append.max(1),
            state_machine,
        }
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn peers(&self) -> &[String] {
        &self.peers
    }

    pub fn current_term(&self) -> Term {
        self.current_term
    }

    pub fn voted_for(&self) -> Option<NodeId> {
        self.voted_for
    }

    pub fn role(&self) -> NodeRole {
        self.role.kind()
    }

    pub fn is_leader(&self) -> bool {
        matches!(self.role, Role::Leader(_))
    }

    pub fn leader_id(&self) -> Option<NodeId> {
        self.leader_id
    }

    pub fn commit_index(&self) -> LogIndex {
        self.commit_index
    }

    pub fn last_applied(&self) -> LogIndex {
        self.last_applied
    }

    pub fn log(&self) -> &RaftLog {
        &self.log
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn election_deadline(&self) -> Instant {
        self.election_deadline
    }

    pub fn state_machine(&self) -> &dyn StateMachine {
        self.state_machine.as_ref()
    }

    pub fn progress(&self) -> Progress {
        Progress {
            term: self.current_term,
            role: self.role(),
            leader_id: self.leader_id,
            commit_index: self.commit_index,
        }
    }

    fn cluster_size(&self) -> usize {
        self.peers.len() + 1
    }

    fn quorum(&self) -> usize {
        self.cluster_size() / 2 + 1
    }

    pub fn reset_election_timer(&mut self) {
        self.election_deadline = Instant::now() + self.timer.next_timeout();
    }

    /// Node (re)starts: fresh timer, always as follower.
    pub fn start(&mut self) {
        self.running = true;
        self.role = Role::Follower;
        self.reset_election_timer();
    }

    /// Node stops: term, vote and log stay, leadership is given up.
    pub fn stop(&mut self) {
        self.running = false;
        if !matches!(self.role, Role::Follower) {
            info!(node = self.id, term = self.current_term, "stepping down on stop");
        }
        self.role = Role::Follower;
        self.leader_id = None;
    }

    /// Adopt `term` as follower. The vote is kept when the term does not change.
    pub fn become_follower(&mut self, term: Term) {
        self.adopt_term(term);
        self.reset_election_timer();
    }

    /// Like `become_follower`, but leaves the election deadline alone.
    fn adopt_term(&mut self, term: Term) {
        if term > self.current_term {
            self.current_term = term;
            self.voted_for = None;
            self.leader_id = None;
        }
        if !matches!(self.role, Role::Follower) {
            info!(node = self.id, term = self.current_term, "became follower");
        }
        self.role = Role::Follower;
    }

    /// Timer check; returns the vote request to broadcast if an election started.
    pub fn tick(&mut self, now: Instant) -> Option<RequestVoteRequest> {
        if !self.running {
            return None;
        }
        if self.is_leader() {
            self.reset_election_timer();
            return None;
        }
        if now < self.election_deadline {
            return None;
        }
        Some(self.start_election())
    }

    /// Starts an election: new term, vote for self, fresh timeout
    pub fn start_election(&mut self) -> RequestVoteRequest {
        self.current_term += 1;
        self.voted_for = Some(self.id);
        self.leader_id = None;
        self.reset_election_timer();

        let tally = VoteTally::new(self.current_term, self.id, self.cluster_size());
        let won = tally.has_quorum();
        self.role = Role::Candidate(tally);
        info!(
            node = self.id,
            term = self.current_term,
            "election timeout, starting election"
        );

        let request = RequestVoteRequest {
            term: self.current_term,
            candidate_id: self.id,
            last_log_index: self.log.last_index(),
            last_log_term: self.log.last_term(),
        };
        if won {
            self.become_leader();
        }
        request
    }

    /// Handles a vote response; returns true if this vote won the election.
    pub fn handle_vote_response(
        &mut self,
        request_term: Term,
        response: &RequestVoteResponse,
    ) -> bool {
        if !self.running {
            return false;
        }
        if response.term > self.current_term {
            self.become_follower(response.term);
            return false;
        }
        if request_term != self.current_term || !response.vote_granted {
            return false;
        }

        let won = match &mut self.role {
            Role::Candidate(tally) if tally.term() == request_term => {
                tally.record(response.voter_id);
                tally.has_quorum()
            }
            _ => false,
        };
        if won {
            self.become_leader();
        }
        won
    }

    /// Transition to leader role
    pub fn become_leader(&mut self) {
        let tracker = ReplicationTracker::new(&self.peers, self.log.last_index());
        self.role = Role::Leader(tracker);
        self.leader_id = Some(self.id);

        // Noop in our own term lets entries of earlier terms commit.
        let index = self.log.append(LogEntry::noop(self.current_term));
        info!(
            node = self.id,
            term = self.current_term,
            noop_index = index,
            "became leader"
        );
        self.advance_commit_index();
    }

    /// Handles RequestVote RPC
    pub fn handle_request_vote(&mut self, req: &RequestVoteRequest) -> RequestVoteResponse {
        if req.term < self.current_term {
            debug!(
                node = self.id,
                candidate = req.candidate_id,
                term = req.term,
                "rejecting stale vote request"
            );
            return RequestVoteResponse {
                term: self.current_term,
                vote_granted: false,
                voter_id: self.id,
            };
        }
        // Only a granted vote pushes the deadline back
        if req.term > self.current_term {
            self.adopt_term(req.term);
        }

        let free_to_vote = match self.voted_for {
            None => true,
            Some(id) => id == req.candidate_id,
        };
        let up_to_date = candidate_log_is_up_to_date(
            req.last_log_index,
            req.last_log_term,
            self.log.last_index(),
            self.log.last_term(),
        );

        let vote_granted = free_to_vote && up_to_date;
        if vote_granted {
            self.voted_for = Some(req.candidate_id);
            self.reset_election_timer();
            info!(
                node = self.id,
                candidate = req.candidate_id,
                term = req.term,
                "granted vote"
            );
        } else {
            debug!(
                node = self.id,
                candidate = req.candidate_id,
                term = req.term,
                free_to_vote,
                up_to_date,
                "denied vote"
            );
        }

        RequestVoteResponse {
            term: self.current_term,
            vote_granted,
            voter_id: self.id,
        }
    }

    /// Handles AppendEntries RPC as a follower
    pub fn handle_append_entries(&mut self, req: &AppendEntriesRequest) -> AppendEntriesResponse {
        // 1. Reject if term is older
        if req.term < self.current_term {
            return AppendEntriesResponse::rejected(self.current_term, None);
        }

        // 2. Adopt term and leader, whatever role we were in
        if req.term > self.current_term || !matches!(self.role, Role::Follower) {
            self.become_follower(req.term);
        }
        if self.leader_id != Some(req.leader_id) {
            info!(
                node = self.id,
                leader = req.leader_id,
                term = req.term,
                "following new leader"
            );
        }
        self.leader_id = Some(req.leader_id);
        self.reset_election_timer();

        // 3. Validate previous entry consistency
        if !self.log.matches(req.prev_log_index, req.prev_log_term) {
            let conflict_index = if req.prev_log_index > self.log.last_index() {
                self.log.last_index() + 1
            } else {
                self.log.first_index_of_term(req.prev_log_index)
            };
            debug!(
                node = self.id,
                prev_log_index = req.prev_log_index,
                conflict_index,
                "log inconsistency"
            );
            return AppendEntriesResponse::rejected(self.current_term, Some(conflict_index));
        }

        // 4. Append new entries, overwriting conflicting ones
        for (offset, entry) in req.entries.iter().enumerate() {
            let index = req.prev_log_index + 1 + offset as LogIndex;
            match self.log.term_at(index) {
                Some(term) if term == entry.term => continue,
                Some(_) => {
                    if index <= self.commit_index {
                        error!(
                            node = self.id,
                            index,
                            commit_index = self.commit_index,
                            "refusing to truncate committed entry"
                        );
                        return AppendEntriesResponse::rejected(self.current_term, None);
                    }
                    self.log.truncate_from(index);
                    self.log.append(entry.clone());
                }
                None => {
                    self.log.append(entry.clone());
                }
            }
        }

        // 5. Update commit index
        let last_new_index = req.last_index();
        if req.leader_commit > self.commit_index {
            let target = req.leader_commit.min(last_new_index);
            if target > self.commit_index {
                self.commit_index = target;
                self.apply_committed();
            }
        }

        AppendEntriesResponse::success(self.current_term, last_new_index)
    }

    /// Called by the leader to append a new client command.
    pub fn append_client_entry(
        &mut self,
        command: &str,
        key: &str,
        value: Option<String>,
        old_value: Option<String>,
    ) -> Result<(LogIndex, Term)> {
        if !self.running || !self.is_leader() {
            return Err(QuorumError::NotLeader {
                leader_id: self.leader_id,
            });
        }

        let entry = LogEntry::new(self.current_term, command, key, value, old_value);
        let index = self.log.append(entry);
        debug!(node = self.id, index, term = self.current_term, "appended client entry");

        // A lone node is its own majority.
        self.advance_commit_index();
        Ok((index, self.current_term))
    }

    /// Builds the next AppendEntries for `peer`; None unless leading.
    pub fn prepare_append_entries(&self, peer: &str) -> Option<AppendEntriesRequest> {
        if !self.running {
            return None;
        }
        let Role::Leader(tracker) = &self.role else {
            return None;
        };
        let progress = tracker.progress(peer)?;

        let prev_log_index = progress.next_index.saturating_sub(1);
        let prev_log_term = self.log.term_at(prev_log_index).unwrap_or(0);
        let entries = self
            .log
            .entries_from(progress.next_index, self.max_entries_per_append);

        Some(AppendEntriesRequest {
            term: self.current_term,
            leader_id: self.id,
            prev_log_index,
            prev_log_term,
            entries,
            leader_commit: self.commit_index,
        })
    }

    /// Called when a follower responds to an AppendEntries RPC.
    /// Returns true when the peer still lags and should get another batch right away.
    pub fn handle_append_entries_response(
        &mut self,
        peer: &str,
        request: &AppendEntriesRequest,
        response: &AppendEntriesResponse,
    ) -> bool {
        if !self.running {
            return false;
        }
        if response.term > self.current_term {
            info!(
                node = self.id,
                peer,
                term = response.term,
                "observed higher term, stepping down"
            );
            self.become_follower(response.term);
            return false;
        }
        if request.term != self.current_term {
            return false;
        }

        let last_index = self.log.last_index();
        let Role::Leader(tracker) = &mut self.role else {
            return false;
        };

        if response.success {
            let sent = request.last_index();
            let matched = match response.match_index {
                Some(index) if index > sent => {
                    warn!(
                        node = self.id,
                        peer,
                        index,
                        sent,
                        "peer acknowledged entries it was never sent"
                    );
                    sent
                }
                Some(index) => index,
                None => sent,
            };
            let moved = tracker.record_success(peer, matched);
            let lagging = tracker.lags(peer, last_index);
            if moved {
                self.advance_commit_index();
            }
            moved && lagging
        } else {
            tracker.record_rejection(peer, request.prev_log_index + 1, response.conflict_index);
            false
        }
    }

    /// Check if a log index is safely replicated on majority → commit it
    fn advance_commit_index(&mut self) {
        let quorum = self.quorum();
        let Role::Leader(tracker) = &self.role else {
            return;
        };
        let candidate = tracker.majority_match(self.log.last_index(), quorum);

        if candidate > self.commit_index && self.log.term_at(candidate) == Some(self.current_term) {
            self.commit_index = candidate;
            debug!(
                node = self.id,
                commit_index = self.commit_index,
                "commit index advanced"
            );
            self.apply_committed();
        }
    }

    /// Applies all entries between last_applied..=commit_index to the state machine
    fn apply_committed(&mut self) {
        while self.last_applied < self.commit_index {
            let next = self.last_applied + 1;
            let Some(entry) = self.log.entry_at(next) else {
                break;
            };
            if let ApplyOutcome::Rejected(reason) = self.state_machine.apply(next, entry) {
                warn!(node = self.id, index = next, %reason, "state machine rejected entry");
            }
            self.last_applied = next;
        }
    }
}
