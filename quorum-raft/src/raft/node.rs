//! A running Raft node.
//!
//! `RaftNode` owns one mutex-guarded [`RaftState`] and the tasks that drive it:
//! - the election timer,
//! - one replication driver per peer (idle unless leading),
//! - the RPC accept loop, which lives inside [`RaftNode::start_server`].
//!
//! The lock is only ever held for a single state transition. Network calls,
//! sleeps and client waits all happen with the lock released.

use super::log::LogEntry;
use super::rpc::{RaftRequest, RaftResponse, RequestVoteRequest};
use super::state::{NodeRole, Progress, RaftState};
use super::state_machine::{KeyValueStore, StateMachine};
use super::transport::{self, RpcHandler};
use parking_lot::Mutex;
use quorum_common::error::{QuorumError, Result};
use quorum_common::metrics::{MetricsCollector, NoopMetrics};
use quorum_common::types::{LogIndex, NodeId, Term, TimingConfig, UNKNOWN_LEADER};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Handles of one start/stop cycle.
struct RunHandle {
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

struct NodeInner {
    id: NodeId,
    peers: Vec<String>,
    timing: TimingConfig,
    state: Mutex<RaftState>,
    progress: watch::Sender<Progress>,
    replicate: watch::Sender<u64>,
    run: Mutex<Option<RunHandle>>,
    bind_addr: Mutex<Option<String>>,
    metrics: Arc<dyn MetricsCollector>,
}

/// Cheap to clone; all clones drive the same node.
#[derive(Clone)]
pub struct RaftNode {
    inner: Arc<NodeInner>,
}

impl RaftNode {
    /// Create an un-started follower with default timing
    pub fn new(id: NodeId, peers: Vec<String>) -> Self {
        Self::with_config(id, peers, TimingConfig::default())
    }

    pub fn with_config(id: NodeId, peers: Vec<String>, timing: TimingConfig) -> Self {
        Self::with_components(
            id,
            peers,
            timing,
            Box::new(KeyValueStore::default()),
            Arc::new(NoopMetrics),
        )
    }

    pub fn with_components(
        id: NodeId,
        peers: Vec<String>,
        timing: TimingConfig,
        state_machine: Box<dyn StateMachine>,
        metrics: Arc<dyn MetricsCollector>,
    ) -> Self {
        let state = RaftState::with_state_machine(id, peers.clone(), &timing, state_machine);
        let (progress, _) = watch::channel(state.progress());
        let (replicate, _) = watch::channel(0);
        Self {
            inner: Arc::new(NodeInner {
                id,
                peers,
                timing,
                state: Mutex::new(state),
                progress,
                replicate,
                run: Mutex::new(None),
                bind_addr: Mutex::new(None),
                metrics,
            }),
        }
    }

    pub fn id(&self) -> NodeId {
        self.inner.id
    }

    /// Listens for RPCs on `bind_addr` and runs timers until [`stop`](Self::stop).
    pub async fn start_server(&self, bind_addr: &str) -> Result<()> {
        if self.is_running() {
            return Err(QuorumError::AlreadyRunning);
        }
        let listener = TcpListener::bind(bind_addr).await?;
        let local_addr = listener.local_addr()?.to_string();

        let shutdown = {
            let mut run = self.inner.run.lock();
            if run.is_some() {
                return Err(QuorumError::AlreadyRunning);
            }
            self.inner.update(|state| state.start());

            let (tx, rx) = watch::channel(false);
            let mut tasks = Vec::with_capacity(self.inner.peers.len() + 1);
            tasks.push(tokio::spawn(run_election_timer(
                self.inner.clone(),
                rx.clone(),
            )));
            for peer in &self.inner.peers {
                tasks.push(tokio::spawn(replicate_to_peer(
                    self.inner.clone(),
                    peer.clone(),
                    rx.clone(),
                )));
            }
            *self.inner.bind_addr.lock() = Some(local_addr.clone());
            *run = Some(RunHandle { shutdown: tx, tasks });
            rx
        };

        info!(
            node = self.inner.id,
            addr = %local_addr,
            peers = self.inner.peers.len(),
            "raft node listening"
        );
        let handler = Arc::new(RunHandler {
            inner: self.inner.clone(),
            shutdown: shutdown.clone(),
        });
        transport::serve(listener, handler, shutdown, self.inner.rpc_timeout()).await;
        info!(node = self.inner.id, "raft server exited");
        Ok(())
    }

    /// Halts timers, replication and the listener. Log and term are kept.
    pub fn stop(&self) {
        let Some(run) = self.inner.run.lock().take() else {
            return;
        };
        run.shutdown.send_replace(true);
        for task in run.tasks {
            task.abort();
        }
        self.inner.update(|state| state.stop());
        info!(node = self.inner.id, "raft node stopped");
    }

    pub fn is_running(&self) -> bool {
        self.inner.run.lock().is_some()
    }

    /// Address the listener of the last `start_server` call is bound to
    pub fn bind_address(&self) -> Option<String> {
        self.inner.bind_addr.lock().clone()
    }

    /// Last known leader, or -1 if unknown
    pub fn get_leader_id(&self) -> i64 {
        self.inner
            .state
            .lock()
            .leader_id()
            .map(|id| id as i64)
            .unwrap_or(UNKNOWN_LEADER)
    }

    pub fn role(&self) -> NodeRole {
        self.inner.state.lock().role()
    }

    pub fn current_term(&self) -> Term {
        self.inner.state.lock().current_term()
    }

    pub fn commit_index(&self) -> LogIndex {
        self.inner.state.lock().commit_index()
    }

    pub fn last_applied(&self) -> LogIndex {
        self.inner.state.lock().last_applied()
    }

    /// Copy of the whole log at call time
    pub fn get_log_entries(&self) -> Vec<LogEntry> {
        self.inner.state.lock().log().entries()
    }

    /// Locally applied value for `key`; may lag the leader.
    pub fn get_value(&self, key: &str) -> Option<String> {
        self.inner.state.lock().state_machine().get(key)
    }

    /// Appends a command on the leader and waits until a majority stores it.
    ///
    /// Fails with `NotLeader` without touching the log when this node is not
    /// leading; with `CommitTimeout`, `LeadershipLost` or `Stopped` when the
    /// entry was appended but could not be confirmed.
    pub async fn replicate_log_entry(
        &self,
        command: &str,
        key: &str,
        value: Option<&str>,
        old_value: Option<&str>,
    ) -> Result<LogIndex> {
        let mut shutdown = match self.inner.run.lock().as_ref() {
            Some(run) => run.shutdown.subscribe(),
            None => return Err(QuorumError::Stopped),
        };
        let mut progress = self.inner.progress.subscribe();

        let (index, term) = self.inner.update(|state| {
            state.append_client_entry(
                command,
                key,
                value.map(str::to_string),
                old_value.map(str::to_string),
            )
        })?;
        self.inner.trigger_replication();

        let timeout = Duration::from_millis(self.inner.timing.commit_timeout_ms);
        let deadline = tokio::time::sleep(timeout);
        tokio::pin!(deadline);

        loop {
            progress.borrow_and_update();
            if let Some(outcome) = self.inner.commit_outcome(index, term) {
                return outcome;
            }
            tokio::select! {
                changed = progress.changed() => {
                    if changed.is_err() {
                        return Err(QuorumError::Stopped);
                    }
                }
                _ = shutdown.changed() => return Err(QuorumError::Stopped),
                _ = &mut deadline => {
                    warn!(node = self.inner.id, index, "entry not committed in time");
                    return Err(QuorumError::CommitTimeout {
                        index,
                        waited_ms: self.inner.timing.commit_timeout_ms,
                    });
                }
            }
        }
    }
}

impl NodeInner {
    /// Runs one transition under the lock and publishes what changed.
    fn update<R>(&self, f: impl FnOnce(&mut RaftState) -> R) -> R {
        let mut state = self.state.lock();
        let before = state.progress();
        let out = f(&mut state);
        let after = state.progress();

        if after != before {
            self.progress.send_replace(after);
            if after.term != before.term {
                self.metrics.observe_gauge("raft.term", after.term as f64);
            }
            if after.commit_index != before.commit_index {
                self.metrics
                    .observe_gauge("raft.commit_index", after.commit_index as f64);
            }
            if after.role == NodeRole::Leader && before.role != NodeRole::Leader {
                self.metrics.inc_counter("raft.elections_won");
                self.trigger_replication();
            }
        }
        out
    }

    fn trigger_replication(&self) {
        self.replicate.send_modify(|round| *round = round.wrapping_add(1));
    }

    fn rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.timing.rpc_timeout_ms)
    }

    /// Final answer for a pending client write, if there is one yet.
    fn commit_outcome(&self, index: LogIndex, term: Term) -> Option<Result<LogIndex>> {
        let state = self.state.lock();
        if state.commit_index() >= index {
            return Some(if state.log().term_at(index) == Some(term) {
                Ok(index)
            } else {
                Err(QuorumError::LeadershipLost { index })
            });
        }
        if !state.is_running() {
            return Some(Err(QuorumError::Stopped));
        }
        if state.current_term() != term || !state.is_leader() {
            return Some(Err(QuorumError::LeadershipLost { index }));
        }
        None
    }
}

/// RPC entry point of one start/stop cycle. Goes quiet once that cycle is
/// stopped, even if the node has been started again since.
struct RunHandler {
    inner: Arc<NodeInner>,
    shutdown: watch::Receiver<bool>,
}

impl RpcHandler for RunHandler {
    fn handle(&self, request: RaftRequest) -> Option<RaftResponse> {
        if *self.shutdown.borrow() {
            return None;
        }
        self.inner.dispatch(request)
    }
}

impl NodeInner {
    fn dispatch(&self, request: RaftRequest) -> Option<RaftResponse> {
        self.update(|state| {
            if !state.is_running() {
                return None;
            }
            Some(match request {
                RaftRequest::RequestVote(req) => {
                    RaftResponse::RequestVote(state.handle_request_vote(&req))
                }
                RaftRequest::AppendEntries(req) => {
                    RaftResponse::AppendEntries(state.handle_append_entries(&req))
                }
            })
        })
    }
}

async fn run_election_timer(inner: Arc<NodeInner>, mut shutdown: watch::Receiver<bool>) {
    loop {
        let deadline = inner.state.lock().election_deadline();
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = tokio::time::sleep_until(deadline) => {}
        }

        let Some(request) = inner.update(|state| state.tick(Instant::now())) else {
            continue;
        };
        inner.metrics.inc_counter("raft.elections_started");
        for peer in &inner.peers {
            tokio::spawn(solicit_vote(inner.clone(), peer.clone(), request.clone()));
        }
    }
}

async fn solicit_vote(inner: Arc<NodeInner>, peer: String, request: RequestVoteRequest) {
    let term = request.term;
    match transport::call(&peer, &RaftRequest::RequestVote(request), inner.rpc_timeout()).await {
        Ok(RaftResponse::RequestVote(response)) => {
            inner.update(|state| state.handle_vote_response(term, &response));
        }
        Ok(other) => warn!(node = inner.id, %peer, ?other, "unexpected reply to vote request"),
        Err(err) => {
            inner.metrics.inc_counter("raft.rpc_failures");
            debug!(node = inner.id, %peer, term, %err, "vote request failed");
        }
    }
}

/// Heartbeats and log pushes to one peer. Does nothing while not leading.
async fn replicate_to_peer(inner: Arc<NodeInner>, peer: String, mut shutdown: watch::Receiver<bool>) {
    let mut ticker =
        tokio::time::interval(Duration::from_millis(inner.timing.heartbeat_interval_ms));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut trigger = inner.replicate.subscribe();
    let mut catching_up = false;

    loop {
        if !catching_up {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = ticker.tick() => {}
                changed = trigger.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
        catching_up = false;

        let request = inner.state.lock().prepare_append_entries(&peer);
        let Some(request) = request else {
            continue;
        };
        if !request.is_heartbeat() {
            debug!(
                node = inner.id,
                %peer,
                from = request.prev_log_index + 1,
                to = request.last_index(),
                "sending entries"
            );
        }
        let rpc = RaftRequest::AppendEntries(request.clone());
        match transport::call(&peer, &rpc, inner.rpc_timeout()).await {
            Ok(RaftResponse::AppendEntries(response)) => {
                catching_up = inner
                    .update(|state| state.handle_append_entries_response(&peer, &request, &response));
            }
            Ok(other) => warn!(node = inner.id, %peer, ?other, "unexpected reply to append entries"),
            Err(err) => {
                inner.metrics.inc_counter("raft.rpc_failures");
                debug!(node = inner.id, %peer, %err, "append entries failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[derive(Default)]
    struct CountingMetrics {
        counters: Mutex<HashMap<String, u64>>,
    }

    impl MetricsCollector for CountingMetrics {
        fn inc_counter(&self, name: &str) {
            *self.counters.lock().entry(name.to_string()).or_default() += 1;
        }

        fn observe_gauge(&self, _name: &str, _value: f64) {}
    }

    async fn wait_for(limit: Duration, mut check: impl FnMut() -> bool) -> bool {
        let start = Instant::now();
        while start.elapsed() < limit {
            if check() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        check()
    }

    fn spawn_server(node: &RaftNode, addr: &str) -> JoinHandle<Result<()>> {
        let node = node.clone();
        let addr = addr.to_string();
        tokio::spawn(async move { node.start_server(&addr).await })
    }

    #[tokio::test]
    async fn test_unstarted_node_refuses_writes() {
        let node = RaftNode::new(0, vec!["127.0.0.1:1".into()]);
        assert_eq!(node.get_leader_id(), UNKNOWN_LEADER);
        assert_eq!(node.role(), NodeRole::Follower);

        let err = node
            .replicate_log_entry("CREATE", "1", Some("10"), None)
            .await
            .unwrap_err();
        assert!(matches!(err, QuorumError::Stopped));
        assert!(node.get_log_entries().is_empty());
    }

    #[tokio::test]
    async fn test_single_node_elects_itself_and_commits() {
        let metrics = Arc::new(CountingMetrics::default());
        let node = RaftNode::with_components(
            0,
            vec![],
            TimingConfig::default(),
            Box::new(KeyValueStore::default()),
            metrics.clone(),
        );
        let server = spawn_server(&node, "127.0.0.1:0");

        assert!(wait_for(Duration::from_secs(2), || node.get_leader_id() == 0).await);
        let index = node
            .replicate_log_entry("CREATE", "1", Some("10"), None)
            .await
            .unwrap();
        assert_eq!(index, 2);
        assert_eq!(node.get_value("1"), Some("10".into()));
        assert_eq!(node.last_applied(), 2);
        assert_eq!(metrics.counters.lock().get("raft.elections_won"), Some(&1));

        node.stop();
        server.await.unwrap().unwrap();
        assert!(!node.is_running());
    }

    #[tokio::test]
    async fn test_stop_is_idempotent_and_keeps_state() {
        let node = RaftNode::new(0, vec![]);
        let server = spawn_server(&node, "127.0.0.1:0");
        assert!(wait_for(Duration::from_secs(2), || node.role() == NodeRole::Leader).await);
        let term = node.current_term();

        node.stop();
        node.stop();
        server.await.unwrap().unwrap();

        assert_eq!(node.role(), NodeRole::Follower);
        assert_eq!(node.get_leader_id(), UNKNOWN_LEADER);
        assert_eq!(node.current_term(), term);
        assert_eq!(node.get_log_entries().len(), 1);
        let addr = node.bind_address().unwrap();
        assert!(addr.starts_with("127.0.0.1:"));
        assert_ne!(addr, "127.0.0.1:0");
    }

    #[tokio::test]
    async fn test_double_start_rejected() {
        let node = RaftNode::new(0, vec![]);
        let server = spawn_server(&node, "127.0.0.1:0");
        assert!(wait_for(Duration::from_secs(1), || node.is_running()).await);

        let err = node.start_server("127.0.0.1:0").await.unwrap_err();
        assert!(matches!(err, QuorumError::AlreadyRunning));

        node.stop();
        server.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_leader_without_quorum_times_out() {
        let timing = TimingConfig {
            commit_timeout_ms: 300,
            ..TimingConfig::default()
        };
        // Two silent peers: this node can never win an election, so force leadership.
        let node = RaftNode::with_config(0, vec!["127.0.0.1:1".into(), "127.0.0.1:2".into()], timing);
        let server = spawn_server(&node, "127.0.0.1:0");
        assert!(wait_for(Duration::from_secs(1), || node.is_running()).await);
        node.inner.update(|state| {
            state.start_election();
            state.become_leader();
        });

        let err = node
            .replicate_log_entry("CREATE", "k", Some("v"), None)
            .await
            .unwrap_err();
        assert!(matches!(err, QuorumError::CommitTimeout { .. }));
        // Entry stays in the log, uncommitted
        assert_eq!(node.get_log_entries().last().unwrap().key, "k");
        assert_eq!(node.commit_index(), 0);

        node.stop();
        server.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_stop_fails_pending_write() {
        let timing = TimingConfig {
            commit_timeout_ms: 10_000,
            ..TimingConfig::default()
        };
        let node = RaftNode::with_config(0, vec!["127.0.0.1:1".into(), "127.0.0.1:2".into()], timing);
        let server = spawn_server(&node, "127.0.0.1:0");
        assert!(wait_for(Duration::from_secs(1), || node.is_running()).await);
        node.inner.update(|state| {
            state.start_election();
            state.become_leader();
        });

        let writer = node.clone();
        let pending = tokio::spawn(async move {
            writer
                .replicate_log_entry("CREATE", "k", Some("v"), None)
                .await
        });
        tokio::time::sleep(Duration::from_millis(100)).await;
        node.stop();

        let err = tokio::time::timeout(Duration::from_secs(2), pending)
            .await
            .unwrap()
            .unwrap()
            .unwrap_err();
        assert!(matches!(
            err,
            QuorumError::Stopped | QuorumError::LeadershipLost { .. }
        ));
        server.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_connection_from_before_stop_is_not_served_after_restart() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};
        use tokio::net::TcpStream;

        let node = RaftNode::new(0, vec![]);
        let server = spawn_server(&node, "127.0.0.1:0");
        assert!(wait_for(Duration::from_secs(1), || node.is_running()).await);
        let mut stale = TcpStream::connect(node.bind_address().unwrap())
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        node.stop();
        server.await.unwrap().unwrap();
        let restarted = spawn_server(&node, "127.0.0.1:0");
        assert!(wait_for(Duration::from_secs(1), || node.is_running()).await);

        let vote = RaftRequest::RequestVote(RequestVoteRequest {
            term: 50,
            candidate_id: 9,
            last_log_index: 100,
            last_log_term: 49,
        })
        .encode()
        .unwrap();
        let _ = stale.write_u32(vote.len() as u32).await;
        let _ = stale.write_all(&vote).await;

        assert!(stale.read_u32().await.is_err());
        assert!(node.current_term() < 50);

        node.stop();
        restarted.await.unwrap().unwrap();
    }
}
