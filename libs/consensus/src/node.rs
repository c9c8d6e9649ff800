//! Core node implementation: elections, replication, reconciliation,
//! and the commit-apply drain
//!
//! All state mutations happen under one node-wide lock; network I/O
//! happens strictly outside it, with RPC results folded back in under
//! the lock. Handlers are synchronous so both the HTTP layer and the
//! in-process transport call them directly.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use rand::Rng;
use tokio::task::JoinSet;
use tokio::time::{interval, sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::command::Command;
use crate::config::{PeerSpec, RaftConfig};
use crate::health::PeerHealthTracker;
use crate::log;
use crate::machine::StateMachine;
use crate::rpc::{
    AppendEntriesRequest, AppendEntriesResponse, ChallengeRequest, ChallengeResponse,
    FullLogResponse, HeartbeatAck, HeartbeatPing, LogSummary, RequestVoteRequest,
    RequestVoteResponse, StateReport, SyncResponse, VictoryAnnouncement, VictoryResponse,
};
use crate::state::{NodeState, PersistentState, RaftRole, StateFile};
use crate::transport::RaftTransport;
use crate::types::{LogEntry, LogIndex, NodeId, Term};
use crate::{RaftError, Result};

/// One replica of a scheduling shard.
///
/// Construct with [`RaftNode::new`], wire the returned `Arc` into a
/// transport/server, then call [`RaftNode::start`] to launch the
/// background loops. [`RaftNode::shutdown`] stops them.
pub struct RaftNode {
    config: RaftConfig,
    state: RwLock<NodeState>,
    machine: Mutex<Box<dyn StateMachine>>,
    health: PeerHealthTracker,
    transport: Arc<dyn RaftTransport>,
    storage: StateFile,
    cancel: CancellationToken,
    started: AtomicBool,
}

impl std::fmt::Debug for RaftNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RaftNode")
            .field("node_id", &self.config.node_id)
            .field("shard", &self.config.shard)
            .finish()
    }
}

impl RaftNode {
    pub fn new(
        config: RaftConfig,
        machine: Box<dyn StateMachine>,
        transport: Arc<dyn RaftTransport>,
    ) -> Result<Arc<Self>> {
        let storage = StateFile::new(&config.state_path);
        let persistent = match storage.load()? {
            Some(loaded) => {
                info!(
                    node_id = %config.node_id,
                    term = loaded.current_term,
                    log_len = loaded.log.len(),
                    "restored persisted state"
                );
                loaded
            }
            None => {
                let mut fresh = PersistentState::default();
                fresh.peers = config.peers.clone();
                fresh.replication_factor = config.replication_factor;
                fresh
            }
        };

        let health = PeerHealthTracker::new(config.peer_health_window);
        let state = NodeState::new(persistent);

        Ok(Arc::new(Self {
            config,
            state: RwLock::new(state),
            machine: Mutex::new(machine),
            health,
            transport,
            storage,
            cancel: CancellationToken::new(),
            started: AtomicBool::new(false),
        }))
    }

    pub fn id(&self) -> &NodeId {
        &self.config.node_id
    }

    pub fn config(&self) -> &RaftConfig {
        &self.config
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Launch the election ticker, heartbeat broadcaster, consistency
    /// loop, and apply drainer. The highest-priority replica also kicks
    /// off an election after a short grace period instead of waiting out
    /// a full timeout.
    pub fn start(self: &Arc<Self>) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }
        {
            let mut st = self.state.write();
            st.election_deadline = Instant::now() + self.random_election_timeout();
        }
        tokio::spawn(Arc::clone(self).election_loop());
        tokio::spawn(Arc::clone(self).heartbeat_loop());
        tokio::spawn(Arc::clone(self).consistency_loop());
        tokio::spawn(Arc::clone(self).apply_loop());

        if self.outranks_all_peers() {
            let node = Arc::clone(self);
            tokio::spawn(async move {
                sleep(node.config.startup_grace).await;
                if !node.cancel.is_cancelled() && !node.is_leader() && node.leader_id().is_none() {
                    info!(node_id = %node.config.node_id, "highest priority, electing at startup");
                    node.run_election().await;
                }
            });
        }
    }

    pub fn shutdown(&self) {
        info!(node_id = %self.config.node_id, "shutting down");
        self.cancel.cancel();
    }

    // ------------------------------------------------------------------
    // Client interface

    pub fn is_leader(&self) -> bool {
        self.state.read().role == RaftRole::Leader
    }

    pub fn leader_id(&self) -> Option<NodeId> {
        self.state.read().leader_id.clone()
    }

    /// URL of the recognized leader, for coordinator retries.
    pub fn leader_url(&self) -> Option<String> {
        let st = self.state.read();
        self.leader_url_locked(&st)
    }

    pub fn current_term(&self) -> Term {
        self.state.read().persistent.current_term
    }

    /// Append a command to the local log. Leader only; the entry is
    /// persisted before this returns.
    pub fn append_log(&self, command: Command) -> Result<LogEntry> {
        if self.cancel.is_cancelled() {
            return Err(RaftError::ShuttingDown);
        }
        let mut st = self.state.write();
        if st.role != RaftRole::Leader {
            return Err(RaftError::NotLeader {
                leader: self.leader_url_locked(&st),
            });
        }
        let entry = LogEntry::new(
            st.persistent.current_term,
            st.persistent.last_log_index() + 1,
            command,
        );
        st.persistent.log.push(entry.clone());
        self.storage.save(&st.persistent)?;
        debug!(
            node_id = %self.config.node_id,
            index = entry.index,
            op = entry.command.op_name(),
            "appended entry"
        );
        Ok(entry)
    }

    /// Replicate an appended entry and try to commit it. Returns true
    /// once the entry is committed under the current quorum rule.
    pub async fn replicate_log(self: &Arc<Self>, entry: &LogEntry) -> bool {
        self.replicate_with_counts(entry).await.0
    }

    /// The full write path: append, replicate, apply locally on commit.
    pub async fn propose(self: &Arc<Self>, command: Command) -> Result<LogEntry> {
        let entry = self.append_log(command)?;
        let (committed, got, needed) = self.replicate_with_counts(&entry).await;
        if committed {
            Ok(entry)
        } else {
            Err(RaftError::NoQuorum { needed, got })
        }
    }

    /// Add or update a peer. Membership changes are persisted so they
    /// survive restarts.
    pub fn add_peer(&self, peer: PeerSpec) -> Result<()> {
        let mut st = self.state.write();
        if peer.node_id == self.config.node_id {
            return Err(RaftError::InvalidPeer("cannot add self as a peer".into()));
        }
        let clash = st
            .persistent
            .peers
            .iter()
            .any(|p| p.node_id != peer.node_id && p.priority == peer.priority);
        if clash || peer.priority == self.config.priority {
            return Err(RaftError::InvalidPeer(format!(
                "priority {} already taken",
                peer.priority
            )));
        }
        let next = st.persistent.last_log_index() + 1;
        st.persistent.peers.retain(|p| p.node_id != peer.node_id);
        st.persistent.peers.push(peer.clone());
        if st.role == RaftRole::Leader {
            st.next_index.insert(peer.node_id.clone(), next);
            st.match_index.insert(peer.node_id.clone(), 0);
        }
        self.storage.save(&st.persistent)?;
        info!(node_id = %self.config.node_id, peer = %peer.node_id, "added peer");
        Ok(())
    }

    pub fn remove_peer(&self, node_id: &str) -> Result<()> {
        let mut st = self.state.write();
        let before = st.persistent.peers.len();
        st.persistent.peers.retain(|p| p.node_id != node_id);
        if st.persistent.peers.len() == before {
            return Err(RaftError::UnknownPeer(node_id.to_string()));
        }
        st.next_index.remove(node_id);
        st.match_index.remove(node_id);
        self.storage.save(&st.persistent)?;
        self.health.forget(node_id);
        info!(node_id = %self.config.node_id, peer = %node_id, "removed peer");
        Ok(())
    }

    /// Node status for `GET /raft/state`.
    pub fn state_report(&self) -> StateReport {
        let st = self.state.read();
        StateReport {
            role: st.role,
            term: st.persistent.current_term,
            leader: self.leader_url_locked(&st),
            node_id: self.config.node_id.clone(),
            shard: self.config.shard.clone(),
            priority: self.config.priority,
            commit_index: st.persistent.commit_index,
            last_applied: st.persistent.last_applied,
            log_length: st.persistent.log.len(),
            healthy_peers: self.health.healthy_among(&st.persistent.peers),
        }
    }

    // ------------------------------------------------------------------
    // RPC handlers (synchronous, called by both transports)

    pub fn handle_request_vote(&self, req: &RequestVoteRequest) -> RequestVoteResponse {
        let mut st = self.state.write();
        if req.term > st.persistent.current_term {
            st.become_follower(req.term, None);
        }

        let mut granted = false;
        if req.term == st.persistent.current_term {
            let can_vote = match &st.persistent.voted_for {
                None => true,
                Some(v) => v == &req.candidate_id,
            };
            let log_ok = req.last_log_term > st.persistent.last_log_term()
                || (req.last_log_term == st.persistent.last_log_term()
                    && req.last_log_index >= st.persistent.last_log_index());
            if can_vote && log_ok {
                st.persistent.voted_for = Some(req.candidate_id.clone());
                st.election_deadline = Instant::now() + self.random_election_timeout();
                granted = true;
            }
        }

        self.persist_or_log(&st.persistent);
        debug!(
            node_id = %self.config.node_id,
            candidate = %req.candidate_id,
            term = req.term,
            granted,
            "vote request"
        );
        RequestVoteResponse {
            term: st.persistent.current_term,
            vote_granted: granted,
            node_id: self.config.node_id.clone(),
        }
    }

    pub fn handle_append_entries(&self, req: &AppendEntriesRequest) -> AppendEntriesResponse {
        let mut challenge_due = false;
        let response = {
            let mut st = self.state.write();
            if req.term < st.persistent.current_term {
                debug!(
                    node_id = %self.config.node_id,
                    from = %req.leader_id,
                    their_term = req.term,
                    our_term = st.persistent.current_term,
                    "rejecting stale-term append"
                );
                return AppendEntriesResponse {
                    term: st.persistent.current_term,
                    success: false,
                    node_id: self.config.node_id.clone(),
                };
            }

            st.become_follower(req.term, Some(req.leader_id.clone()));
            st.election_deadline = Instant::now() + self.random_election_timeout();
            if let Some(spec) = st.persistent.peer(&req.leader_id) {
                if spec.priority < self.config.priority {
                    challenge_due = true;
                }
            }

            let success = if !log::contiguous_after(req.prev_log_index, &req.entries) {
                warn!(
                    node_id = %self.config.node_id,
                    from = %req.leader_id,
                    prev_log_index = req.prev_log_index,
                    "rejecting append with a gapped entry batch"
                );
                false
            } else if log::matches(
                &st.persistent.log,
                req.prev_log_index,
                req.prev_log_term,
            ) {
                if let Some(truncated_at) = log::merge_entries(&mut st.persistent.log, &req.entries)
                {
                    // The repair rewrote indices we may have applied or
                    // committed; rewind both watermarks so the
                    // replacements reach the state machine (applies are
                    // idempotent under replay)
                    st.persistent.commit_index = st
                        .persistent
                        .commit_index
                        .min(st.persistent.last_log_index());
                    if st.persistent.last_applied >= truncated_at {
                        st.persistent.last_applied = truncated_at - 1;
                    }
                }
                if req.leader_commit > st.persistent.commit_index {
                    st.persistent.commit_index =
                        req.leader_commit.min(st.persistent.last_log_index());
                }
                true
            } else {
                debug!(
                    node_id = %self.config.node_id,
                    prev_log_index = req.prev_log_index,
                    "log mismatch, asking leader to back up"
                );
                false
            };

            self.persist_or_log(&st.persistent);
            AppendEntriesResponse {
                term: st.persistent.current_term,
                success,
                node_id: self.config.node_id.clone(),
            }
        };

        if challenge_due {
            self.schedule_challenge();
        }
        if response.success {
            self.apply_ready();
        }
        response
    }

    pub fn handle_heartbeat(&self, req: &HeartbeatPing) -> HeartbeatAck {
        let mut challenge_due = false;
        {
            let mut st = self.state.write();
            if req.term >= st.persistent.current_term {
                let term_changed = req.term > st.persistent.current_term;
                st.become_follower(req.term, Some(req.leader_id.clone()));
                st.election_deadline = Instant::now() + self.random_election_timeout();
                if let Some(spec) = st.persistent.peer(&req.leader_id) {
                    if spec.priority < self.config.priority {
                        challenge_due = true;
                    }
                }
                if term_changed {
                    self.persist_or_log(&st.persistent);
                }
            }
            // Stale pings change nothing; the deposed leader learns its
            // term is old from append responses.
        }
        if challenge_due {
            self.schedule_challenge();
        }
        HeartbeatAck::ok()
    }

    pub fn handle_challenge(self: &Arc<Self>, req: &ChallengeRequest) -> ChallengeResponse {
        let outranked = self.config.priority > req.priority;
        let (role, leader_url, leader_outranks_us) = {
            let st = self.state.read();
            let leader_outranks = st
                .leader_id
                .as_ref()
                .and_then(|id| st.persistent.peer(id))
                .map(|p| p.priority > self.config.priority)
                .unwrap_or(false);
            (st.role, self.leader_url_locked(&st), leader_outranks)
        };

        debug!(
            node_id = %self.config.node_id,
            challenger = %req.candidate_id,
            their_priority = req.priority,
            outranked,
            "bully challenge"
        );

        if outranked {
            if role == RaftRole::Leader {
                // Squash the takeover inside the challenger's wait window
                let node = Arc::clone(self);
                tokio::spawn(async move { node.broadcast_victory().await });
            } else if !leader_outranks_us {
                // We dominate the challenger and nobody above us leads,
                // so claim the round ourselves
                self.schedule_challenge();
            }
        }

        ChallengeResponse {
            alive: outranked,
            priority: self.config.priority,
            leader: leader_url,
        }
    }

    pub fn handle_victory(&self, req: &VictoryAnnouncement) -> VictoryResponse {
        let mut st = self.state.write();
        if req.priority < self.config.priority {
            if st.role == RaftRole::Leader {
                warn!(
                    node_id = %self.config.node_id,
                    from = %req.leader_id,
                    "ignoring victory from lower-priority node while leading"
                );
                return VictoryResponse::ok();
            }
            // Accept the claim for now but contest it
            st.leader_id = Some(req.leader_id.clone());
            st.role = RaftRole::Follower;
            st.election_deadline = Instant::now();
            warn!(
                node_id = %self.config.node_id,
                from = %req.leader_id,
                "victory from lower-priority node, scheduling challenge"
            );
            return VictoryResponse::ok();
        }

        info!(
            node_id = %self.config.node_id,
            leader = %req.leader_id,
            "accepting leader"
        );
        let term = st.persistent.current_term;
        st.become_follower(term, Some(req.leader_id.clone()));
        st.election_deadline = Instant::now() + self.random_election_timeout();
        VictoryResponse::ok()
    }

    /// Full log for a follower catching up (`GET /raft/sync`).
    pub fn handle_log_sync(&self, follower: &str) -> SyncResponse {
        let st = self.state.read();
        debug!(
            node_id = %self.config.node_id,
            follower,
            entries = st.persistent.log.len(),
            "serving log sync"
        );
        SyncResponse {
            missing_entries: st.persistent.log.clone(),
        }
    }

    pub fn log_summary(&self) -> LogSummary {
        let st = self.state.read();
        LogSummary {
            last_index: st.persistent.last_log_index(),
            last_term: st.persistent.last_log_term(),
            commit_index: st.persistent.commit_index,
        }
    }

    pub fn full_log(&self) -> FullLogResponse {
        let st = self.state.read();
        FullLogResponse {
            entries: st.persistent.log.clone(),
        }
    }

    // ------------------------------------------------------------------
    // Elections

    async fn election_loop(self: Arc<Self>) {
        let mut tick = interval(self.config.tick_interval);
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = tick.tick() => {
                    let due = {
                        let st = self.state.read();
                        st.role != RaftRole::Leader && Instant::now() >= st.election_deadline
                    };
                    if due {
                        self.run_election().await;
                    }
                }
            }
        }
    }

    async fn run_election(self: &Arc<Self>) {
        let wait_window = self.random_election_timeout();
        let (term, higher) = {
            let mut st = self.state.write();
            st.begin_candidacy(&self.config.node_id);
            // Keep the ticker quiet for the whole challenge round plus
            // the victory wait
            st.election_deadline =
                Instant::now() + self.config.challenge_timeout + wait_window;
            self.persist_or_log(&st.persistent);
            let higher: Vec<PeerSpec> = st
                .persistent
                .peers
                .iter()
                .filter(|p| p.priority > self.config.priority)
                .cloned()
                .collect();
            (st.persistent.current_term, higher)
        };
        info!(
            node_id = %self.config.node_id,
            term,
            higher_peers = higher.len(),
            "starting election"
        );

        if !higher.is_empty() {
            let request = ChallengeRequest {
                candidate_id: self.config.node_id.clone(),
                candidate_url: self.config.public_url.clone(),
                priority: self.config.priority,
            };
            let mut set = JoinSet::new();
            for peer in higher {
                let node = Arc::clone(self);
                let req = request.clone();
                set.spawn(async move {
                    let result =
                        timeout(node.config.challenge_timeout, node.transport.challenge(&peer, req))
                            .await;
                    (peer, result)
                });
            }

            let mut any_alive = false;
            while let Some(joined) = set.join_next().await {
                let Ok((peer, result)) = joined else { continue };
                match result {
                    Ok(Ok(resp)) => {
                        self.health.mark_up(&peer.node_id);
                        if resp.alive {
                            any_alive = true;
                        }
                    }
                    Ok(Err(err)) => {
                        debug!(peer = %peer.node_id, error = %err, "challenge failed");
                        self.health.mark_down(&peer.node_id);
                    }
                    Err(_) => {
                        debug!(peer = %peer.node_id, "challenge timed out");
                        self.health.mark_down(&peer.node_id);
                    }
                }
            }

            if any_alive {
                debug!(
                    node_id = %self.config.node_id,
                    "higher-priority peer alive, waiting for victory"
                );
                let deadline = Instant::now() + wait_window;
                // A higher peer answered but may still die before
                // announcing; claim the round ourselves if the window
                // passes quietly
                while Instant::now() < deadline {
                    if self.cancel.is_cancelled() {
                        return;
                    }
                    {
                        let st = self.state.read();
                        if st.role != RaftRole::Candidate {
                            return;
                        }
                    }
                    sleep(self.config.tick_interval).await;
                }
            }
        }

        self.become_leader().await;
    }

    async fn become_leader(self: &Arc<Self>) {
        {
            let mut st = self.state.write();
            if st.role != RaftRole::Candidate {
                return;
            }
            st.become_leader(&self.config.node_id);
            self.persist_or_log(&st.persistent);
            info!(
                node_id = %self.config.node_id,
                term = st.persistent.current_term,
                "became leader"
            );
        }

        self.recover_log().await;
        {
            let mut st = self.state.write();
            if st.role != RaftRole::Leader {
                return;
            }
            st.reset_replication_indices();
        }
        // Fold in divergent writes from every reachable peer before the
        // first outbound append; pushing first would truncate them away
        self.reconcile_divergent().await;
        self.broadcast_victory().await;
        self.sync_peers().await;
        self.apply_ready();
    }

    /// Query every peer's log position and adopt the most advanced log
    /// before replicating anything, so a fresh leader does not overwrite
    /// entries it missed while down.
    async fn recover_log(self: &Arc<Self>) {
        let peers = self.live_peers();
        if peers.is_empty() {
            return;
        }

        let mut set = JoinSet::new();
        for peer in peers {
            let node = Arc::clone(self);
            set.spawn(async move {
                let result = timeout(node.config.rpc_timeout, node.transport.log_summary(&peer)).await;
                (peer, result)
            });
        }

        let (our_index, our_term) = {
            let st = self.state.read();
            (st.persistent.last_log_index(), st.persistent.last_log_term())
        };
        let mut best: Option<(PeerSpec, LogSummary)> = None;
        while let Some(joined) = set.join_next().await {
            let Ok((peer, result)) = joined else { continue };
            match result {
                Ok(Ok(summary)) => {
                    self.health.mark_up(&peer.node_id);
                    let ahead_of_us = (summary.last_index, summary.last_term) > (our_index, our_term);
                    let ahead_of_best = best
                        .as_ref()
                        .map(|(_, b)| (summary.last_index, summary.last_term) > (b.last_index, b.last_term))
                        .unwrap_or(true);
                    if ahead_of_us && ahead_of_best {
                        best = Some((peer, summary));
                    }
                }
                Ok(Err(err)) => {
                    debug!(peer = %peer.node_id, error = %err, "log summary failed");
                    self.health.mark_down(&peer.node_id);
                }
                Err(_) => {
                    self.health.mark_down(&peer.node_id);
                }
            }
        }

        let Some((donor, summary)) = best else { return };
        info!(
            node_id = %self.config.node_id,
            donor = %donor.node_id,
            donor_last_index = summary.last_index,
            our_last_index = our_index,
            "adopting more advanced log"
        );
        match timeout(
            self.config.rpc_timeout,
            self.transport.pull_log(&donor, &self.config.node_id),
        )
        .await
        {
            Ok(Ok(sync)) => {
                let mut st = self.state.write();
                if st.role != RaftRole::Leader {
                    return;
                }
                let ours = std::mem::take(&mut st.persistent.log);
                st.persistent.log = sync.missing_entries;
                // Writes the donor never saw are re-appended at the
                // tail, same as a reconcile donation
                let orphans = log::missing_writes(&st.persistent.log, &ours);
                let rescued = orphans.len();
                for mut entry in orphans {
                    entry.index = st.persistent.last_log_index() + 1;
                    st.persistent.log.push(entry);
                }
                let len = st.persistent.last_log_index();
                if rescued > 0 {
                    st.persistent.commit_index = len;
                    warn!(
                        node_id = %self.config.node_id,
                        rescued,
                        "kept local writes missing from adopted log"
                    );
                } else {
                    let adopted_commit = summary.commit_index.min(len);
                    st.persistent.commit_index =
                        st.persistent.commit_index.max(adopted_commit);
                }
                // The apply watermark only holds up to the first position
                // where the adopted log disagrees with what we held
                let agreed = ours
                    .iter()
                    .zip(st.persistent.log.iter())
                    .take_while(|(old, new)| old.same_write(new))
                    .count() as u64;
                st.persistent.last_applied = st.persistent.last_applied.min(agreed);
                self.persist_or_log(&st.persistent);
            }
            Ok(Err(err)) => {
                warn!(donor = %donor.node_id, error = %err, "log adoption failed");
                self.health.mark_down(&donor.node_id);
            }
            Err(_) => {
                warn!(donor = %donor.node_id, "log adoption timed out");
                self.health.mark_down(&donor.node_id);
            }
        }
    }

    async fn broadcast_victory(self: &Arc<Self>) {
        let announcement = VictoryAnnouncement {
            leader_id: self.config.node_id.clone(),
            leader_url: self.config.public_url.clone(),
            priority: self.config.priority,
        };
        let mut set = JoinSet::new();
        for peer in self.live_peers() {
            let node = Arc::clone(self);
            let ann = announcement.clone();
            set.spawn(async move {
                let result = timeout(node.config.rpc_timeout, node.transport.victory(&peer, ann)).await;
                (peer, result)
            });
        }
        while let Some(joined) = set.join_next().await {
            let Ok((peer, result)) = joined else { continue };
            match result {
                Ok(Ok(_)) => self.health.mark_up(&peer.node_id),
                Ok(Err(err)) => {
                    debug!(peer = %peer.node_id, error = %err, "victory delivery failed");
                    self.health.mark_down(&peer.node_id);
                }
                Err(_) => self.health.mark_down(&peer.node_id),
            }
        }
    }

    /// Follower sees a lower-priority leader: contest leadership at the
    /// next ticker pass.
    fn schedule_challenge(&self) {
        let mut st = self.state.write();
        if st.role == RaftRole::Leader {
            return;
        }
        st.election_deadline = Instant::now();
        debug!(node_id = %self.config.node_id, "scheduled challenge against lower-priority leader");
    }

    // ------------------------------------------------------------------
    // Replication

    /// The quorum bar is computed from peer health once, when the write
    /// begins; failures during this write shrink the next write's bar,
    /// not this one's.
    async fn replicate_with_counts(self: &Arc<Self>, entry: &LogEntry) -> (bool, usize, usize) {
        let (targets, quorum) = {
            let st = self.state.read();
            if st.role != RaftRole::Leader {
                return (false, 0, 0);
            }
            let ordered = self.health.order_targets(&st.persistent.peers);
            let fanout = st
                .persistent
                .replication_factor
                .saturating_sub(1)
                .min(ordered.len());
            (
                ordered.into_iter().take(fanout).collect::<Vec<_>>(),
                self.health.quorum(&st.persistent.peers),
            )
        };

        let mut acks = 1usize; // the leader holds the entry already
        let mut set = JoinSet::new();
        for peer in targets {
            let node = Arc::clone(self);
            let target = entry.index;
            set.spawn(async move { node.replicate_to_peer(peer, target).await });
        }
        while let Some(joined) = set.join_next().await {
            if matches!(joined, Ok(true)) {
                acks += 1;
            }
        }

        let committed = {
            let mut st = self.state.write();
            if acks >= quorum
                && st.role == RaftRole::Leader
                && entry.term == st.persistent.current_term
            {
                if entry.index > st.persistent.commit_index {
                    st.persistent.commit_index =
                        entry.index.min(st.persistent.last_log_index());
                    self.persist_or_log(&st.persistent);
                    info!(
                        node_id = %self.config.node_id,
                        index = entry.index,
                        acks,
                        quorum,
                        "committed entry"
                    );
                }
                st.persistent.commit_index >= entry.index
            } else {
                warn!(
                    node_id = %self.config.node_id,
                    index = entry.index,
                    acks,
                    quorum,
                    "entry not committed"
                );
                false
            }
        };

        if committed {
            self.apply_ready();
            // Push the new commit index out right away
            self.sync_peers().await;
        }
        (committed, acks, quorum)
    }

    /// Drive one peer up to at least `target`. Carries all entries from
    /// the peer's next_index and probes backward on mismatch, so one
    /// call repairs an arbitrarily long gap.
    async fn replicate_to_peer(self: Arc<Self>, peer: PeerSpec, target: LogIndex) -> bool {
        loop {
            if self.cancel.is_cancelled() {
                return false;
            }
            let (req, sent_up_to) = {
                let st = self.state.read();
                if st.role != RaftRole::Leader {
                    return false;
                }
                let next = st
                    .next_index
                    .get(&peer.node_id)
                    .copied()
                    .unwrap_or(st.persistent.last_log_index() + 1);
                let prev_index = next.saturating_sub(1);
                let prev_term = log::term_at(&st.persistent.log, prev_index).unwrap_or(0);
                let entries = log::entries_from(&st.persistent.log, next);
                let sent_up_to = prev_index + entries.len() as u64;
                (
                    AppendEntriesRequest {
                        term: st.persistent.current_term,
                        leader_id: self.config.node_id.clone(),
                        entries,
                        prev_log_index: prev_index,
                        prev_log_term: prev_term,
                        leader_commit: st.persistent.commit_index,
                    },
                    sent_up_to,
                )
            };

            let response = timeout(
                self.config.rpc_timeout,
                self.transport.append_entries(&peer, req),
            )
            .await;
            match response {
                Ok(Ok(resp)) => {
                    if resp.term > self.current_term() {
                        self.step_down(resp.term);
                        return false;
                    }
                    self.health.mark_up(&peer.node_id);
                    if resp.success {
                        let mut st = self.state.write();
                        st.next_index.insert(peer.node_id.clone(), sent_up_to + 1);
                        let matched = st.match_index.entry(peer.node_id.clone()).or_insert(0);
                        *matched = (*matched).max(sent_up_to);
                        let advanced = self.try_advance_commit(&mut st);
                        drop(st);
                        if advanced {
                            self.apply_ready();
                        }
                        return sent_up_to >= target;
                    }
                    // Log mismatch: back up one entry and retry with
                    // more history
                    let mut st = self.state.write();
                    let slot = st.next_index.entry(peer.node_id.clone()).or_insert(1);
                    if *slot <= 1 {
                        // prev_log_index 0 cannot mismatch; give up on
                        // this cycle
                        return false;
                    }
                    *slot -= 1;
                }
                Ok(Err(err)) => {
                    debug!(peer = %peer.node_id, error = %err, "append entries failed");
                    self.health.mark_down(&peer.node_id);
                    return false;
                }
                Err(_) => {
                    debug!(peer = %peer.node_id, "append entries timed out");
                    self.health.mark_down(&peer.node_id);
                    return false;
                }
            }
        }
    }

    /// Commit everything a quorum of match indices covers, current-term
    /// entries only. Lets an older write commit once quorum returns.
    fn try_advance_commit(&self, st: &mut NodeState) -> bool {
        let quorum = self.health.quorum(&st.persistent.peers);
        let last = st.persistent.last_log_index();
        let mut advanced = false;
        let mut candidate = st.persistent.commit_index + 1;
        while candidate <= last {
            let replicas = 1 + st
                .match_index
                .values()
                .filter(|&&matched| matched >= candidate)
                .count();
            let current_term_entry =
                log::term_at(&st.persistent.log, candidate) == Some(st.persistent.current_term);
            if replicas >= quorum && current_term_entry {
                st.persistent.commit_index = candidate;
                advanced = true;
                candidate += 1;
            } else {
                break;
            }
        }
        if advanced {
            self.persist_or_log(&st.persistent);
            debug!(
                node_id = %self.config.node_id,
                commit_index = st.persistent.commit_index,
                "advanced commit index"
            );
        }
        advanced
    }

    /// One append round to every peer, empty when a peer is caught up.
    /// Used after commits, by the heartbeat tick, and by the consistency
    /// loop.
    async fn sync_peers(self: &Arc<Self>) {
        if !self.is_leader() {
            return;
        }
        let mut set = JoinSet::new();
        for peer in self.live_peers() {
            let node = Arc::clone(self);
            set.spawn(async move { node.replicate_to_peer(peer, 0).await });
        }
        while set.join_next().await.is_some() {}
    }

    // ------------------------------------------------------------------
    // Background loops

    async fn heartbeat_loop(self: Arc<Self>) {
        let mut tick = interval(self.config.heartbeat_interval);
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = tick.tick() => {
                    if self.is_leader() {
                        self.heartbeat_round().await;
                    }
                }
            }
        }
    }

    /// Lagging peers get an append round; caught-up peers get the cheap
    /// liveness ping.
    async fn heartbeat_round(self: &Arc<Self>) {
        let (laggards, current, ping) = {
            let st = self.state.read();
            if st.role != RaftRole::Leader {
                return;
            }
            let last = st.persistent.last_log_index();
            let mut laggards = Vec::new();
            let mut current = Vec::new();
            for peer in &st.persistent.peers {
                let next = st.next_index.get(&peer.node_id).copied().unwrap_or(last + 1);
                if next <= last {
                    laggards.push(peer.clone());
                } else {
                    current.push(peer.clone());
                }
            }
            (
                laggards,
                current,
                HeartbeatPing {
                    term: st.persistent.current_term,
                    leader_id: self.config.node_id.clone(),
                },
            )
        };

        let mut set = JoinSet::new();
        for peer in laggards {
            let node = Arc::clone(self);
            set.spawn(async move {
                node.replicate_to_peer(peer, 0).await;
            });
        }
        for peer in current {
            let node = Arc::clone(self);
            let req = ping.clone();
            set.spawn(async move {
                match timeout(node.config.rpc_timeout, node.transport.heartbeat(&peer, req)).await {
                    Ok(Ok(_)) => node.health.mark_up(&peer.node_id),
                    Ok(Err(err)) => {
                        debug!(peer = %peer.node_id, error = %err, "heartbeat failed");
                        node.health.mark_down(&peer.node_id);
                    }
                    Err(_) => node.health.mark_down(&peer.node_id),
                }
            });
        }
        while set.join_next().await.is_some() {}
    }

    async fn consistency_loop(self: Arc<Self>) {
        let mut tick = interval(self.config.reconcile_interval);
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = tick.tick() => {
                    if self.is_leader() {
                        // Merge before distributing: pushing first would
                        // truncate the divergent entries this pass is
                        // meant to rescue
                        self.reconcile_divergent().await;
                        self.sync_peers().await;
                    }
                }
            }
        }
    }

    /// Reverse reconciliation: pull every peer's full log and merge
    /// writes the leader has never seen. Donated entries keep their
    /// original term and are re-indexed at the leader's tail, so the
    /// identity diff converges and donors stop re-donating. This is an
    /// eventual-consistency repair, not a linearizable path.
    async fn reconcile_divergent(self: &Arc<Self>) {
        let mut set = JoinSet::new();
        for peer in self.live_peers() {
            let node = Arc::clone(self);
            set.spawn(async move {
                let result = timeout(node.config.rpc_timeout, node.transport.full_log(&peer)).await;
                (peer, result)
            });
        }

        let mut merged_any = false;
        while let Some(joined) = set.join_next().await {
            let Ok((peer, result)) = joined else { continue };
            let full = match result {
                Ok(Ok(full)) => {
                    self.health.mark_up(&peer.node_id);
                    full
                }
                Ok(Err(err)) => {
                    debug!(peer = %peer.node_id, error = %err, "full log fetch failed");
                    self.health.mark_down(&peer.node_id);
                    continue;
                }
                Err(_) => {
                    self.health.mark_down(&peer.node_id);
                    continue;
                }
            };

            let mut st = self.state.write();
            if st.role != RaftRole::Leader {
                return;
            }
            let missing = log::missing_writes(&st.persistent.log, &full.entries);
            if missing.is_empty() {
                continue;
            }
            let count = missing.len();
            for mut entry in missing {
                entry.index = st.persistent.last_log_index() + 1;
                st.persistent.log.push(entry);
            }
            st.persistent.commit_index = st.persistent.last_log_index();
            self.persist_or_log(&st.persistent);
            merged_any = true;
            warn!(
                node_id = %self.config.node_id,
                donor = %peer.node_id,
                merged = count,
                "merged divergent entries from peer"
            );
        }

        if merged_any {
            self.apply_ready();
            self.sync_peers().await;
        }
    }

    async fn apply_loop(self: Arc<Self>) {
        let mut tick = interval(self.config.apply_interval);
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = tick.tick() => self.apply_ready(),
            }
        }
    }

    /// Drain committed-but-unapplied entries through the state machine
    /// in strict index order, then persist the watermark. Runs under the
    /// state lock so each index is applied exactly once.
    fn apply_ready(&self) {
        let mut st = self.state.write();
        let mut applied = 0usize;
        while st.persistent.last_applied < st.persistent.commit_index {
            let next = st.persistent.last_applied + 1;
            let Some(entry) = st.persistent.entry_at(next).cloned() else {
                warn!(
                    node_id = %self.config.node_id,
                    index = next,
                    "commit index ahead of log, stopping drain"
                );
                break;
            };
            if let Err(err) = self.machine.lock().apply(&entry) {
                warn!(
                    node_id = %self.config.node_id,
                    index = next,
                    error = %err,
                    "state machine rejected entry"
                );
            }
            st.persistent.last_applied = next;
            applied += 1;
        }
        if applied > 0 {
            self.persist_or_log(&st.persistent);
            debug!(
                node_id = %self.config.node_id,
                applied,
                last_applied = st.persistent.last_applied,
                "applied committed entries"
            );
        }
    }

    // ------------------------------------------------------------------
    // Helpers

    fn step_down(&self, term: Term) {
        let mut st = self.state.write();
        if term > st.persistent.current_term {
            info!(
                node_id = %self.config.node_id,
                new_term = term,
                "higher term observed, stepping down"
            );
            st.become_follower(term, None);
            st.election_deadline = Instant::now() + self.random_election_timeout();
            self.persist_or_log(&st.persistent);
        }
    }

    fn live_peers(&self) -> Vec<PeerSpec> {
        self.state.read().persistent.peers.clone()
    }

    fn outranks_all_peers(&self) -> bool {
        let st = self.state.read();
        st.persistent
            .peers
            .iter()
            .all(|p| p.priority < self.config.priority)
    }

    fn leader_url_locked(&self, st: &NodeState) -> Option<String> {
        let id = st.leader_id.as_ref()?;
        if id == &self.config.node_id {
            return Some(self.config.public_url.clone());
        }
        st.persistent.peer(id).map(|p| p.url.clone())
    }

    fn random_election_timeout(&self) -> Duration {
        let min = self.config.election_timeout_min.as_millis() as u64;
        let max = self.config.election_timeout_max.as_millis() as u64;
        Duration::from_millis(rand::thread_rng().gen_range(min..max))
    }

    fn persist_or_log(&self, persistent: &PersistentState) {
        if let Err(err) = self.storage.save(persistent) {
            error!(
                node_id = %self.config.node_id,
                error = %err,
                "failed to persist state"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::machine::{MemoryScheduleStore, SharedScheduleStore};
    use crate::transport::InMemoryNetwork;
    use tempfile::TempDir;

    fn entry(term: Term, index: LogIndex, name: &str) -> LogEntry {
        LogEntry::new(term, index, Command::CreateGroup { name: name.into() })
    }

    fn test_node(
        dir: &TempDir,
        network: &InMemoryNetwork,
        id: &str,
        priority: u64,
        peers: Vec<PeerSpec>,
    ) -> Arc<RaftNode> {
        let config = RaftConfig::builder()
            .node_id(id)
            .shard("events")
            .public_url(format!("http://127.0.0.1/{id}"))
            .priority(priority)
            .peers(peers)
            .state_path(dir.path().join(format!("{id}.json")))
            .build();
        let node = RaftNode::new(
            config,
            Box::new(MemoryScheduleStore::new()),
            network.transport_for(id),
        )
        .unwrap();
        network.register(Arc::clone(&node));
        node
    }

    fn force_leader(node: &Arc<RaftNode>) {
        let mut st = node.state.write();
        st.begin_candidacy(&node.config.node_id);
        st.become_leader(&node.config.node_id);
    }

    #[tokio::test]
    async fn test_vote_granted_once_per_term() {
        let dir = TempDir::new().unwrap();
        let network = InMemoryNetwork::new();
        let node = test_node(&dir, &network, "events-1", 10, vec![]);

        let mut req = RequestVoteRequest {
            term: 1,
            candidate_id: "events-2".to_string(),
            last_log_index: 0,
            last_log_term: 0,
        };
        assert!(node.handle_request_vote(&req).vote_granted);

        // Same term, different candidate: refused
        req.candidate_id = "events-3".to_string();
        assert!(!node.handle_request_vote(&req).vote_granted);

        // Same candidate again: idempotent grant
        req.candidate_id = "events-2".to_string();
        assert!(node.handle_request_vote(&req).vote_granted);
    }

    #[tokio::test]
    async fn test_vote_rejects_shorter_log() {
        let dir = TempDir::new().unwrap();
        let network = InMemoryNetwork::new();
        let node = test_node(&dir, &network, "events-1", 10, vec![]);
        {
            let mut st = node.state.write();
            st.persistent.log = vec![entry(1, 1, "a"), entry(2, 2, "b")];
        }

        let req = RequestVoteRequest {
            term: 3,
            candidate_id: "events-2".to_string(),
            last_log_index: 1,
            last_log_term: 2,
        };
        let resp = node.handle_request_vote(&req);
        assert!(!resp.vote_granted);
        assert_eq!(resp.term, 3);
    }

    #[tokio::test]
    async fn test_append_rejects_stale_term() {
        let dir = TempDir::new().unwrap();
        let network = InMemoryNetwork::new();
        let node = test_node(&dir, &network, "events-1", 10, vec![]);
        {
            let mut st = node.state.write();
            st.persistent.current_term = 5;
        }

        let req = AppendEntriesRequest::empty(3, "events-2".to_string(), 0, 0, 0);
        let resp = node.handle_append_entries(&req);
        assert!(!resp.success);
        assert_eq!(resp.term, 5);
    }

    #[tokio::test]
    async fn test_append_repairs_gap_in_one_round() {
        let dir = TempDir::new().unwrap();
        let network = InMemoryNetwork::new();
        let node = test_node(&dir, &network, "events-1", 10, vec![]);

        // Mismatch first: leader probes at prev 2
        let probe = AppendEntriesRequest {
            term: 1,
            leader_id: "events-2".to_string(),
            entries: vec![entry(1, 3, "c")],
            prev_log_index: 2,
            prev_log_term: 1,
            leader_commit: 0,
        };
        assert!(!node.handle_append_entries(&probe).success);

        // Backed-up request carries the whole history
        let repair = AppendEntriesRequest {
            term: 1,
            leader_id: "events-2".to_string(),
            entries: vec![entry(1, 1, "a"), entry(1, 2, "b"), entry(1, 3, "c")],
            prev_log_index: 0,
            prev_log_term: 0,
            leader_commit: 2,
        };
        let resp = node.handle_append_entries(&repair);
        assert!(resp.success);

        let st = node.state.read();
        assert_eq!(st.persistent.last_log_index(), 3);
        assert_eq!(st.persistent.commit_index, 2);
        assert_eq!(st.persistent.last_applied, 2);
    }

    #[tokio::test]
    async fn test_commit_clamped_to_log_end() {
        let dir = TempDir::new().unwrap();
        let network = InMemoryNetwork::new();
        let node = test_node(&dir, &network, "events-1", 10, vec![]);

        let req = AppendEntriesRequest {
            term: 1,
            leader_id: "events-2".to_string(),
            entries: vec![entry(1, 1, "a")],
            prev_log_index: 0,
            prev_log_term: 0,
            leader_commit: 10,
        };
        assert!(node.handle_append_entries(&req).success);
        assert_eq!(node.state.read().persistent.commit_index, 1);
    }

    #[tokio::test]
    async fn test_append_rejects_gapped_batch() {
        let dir = TempDir::new().unwrap();
        let network = InMemoryNetwork::new();
        let node = test_node(&dir, &network, "events-1", 10, vec![]);

        // A batch with a hole in it is refused without touching the log
        let gapped = AppendEntriesRequest {
            term: 1,
            leader_id: "events-2".to_string(),
            entries: vec![entry(1, 1, "a"), entry(1, 3, "c")],
            prev_log_index: 0,
            prev_log_term: 0,
            leader_commit: 2,
        };
        let resp = node.handle_append_entries(&gapped);
        assert!(!resp.success);
        {
            let st = node.state.read();
            assert_eq!(st.persistent.last_log_index(), 0);
            assert_eq!(st.persistent.commit_index, 0);
        }

        // Same for a batch that does not continue from prev
        let offset = AppendEntriesRequest {
            term: 1,
            leader_id: "events-2".to_string(),
            entries: vec![entry(1, 2, "b")],
            prev_log_index: 0,
            prev_log_term: 0,
            leader_commit: 0,
        };
        assert!(!node.handle_append_entries(&offset).success);

        // A well-formed round is still accepted afterwards
        let ok = AppendEntriesRequest {
            term: 1,
            leader_id: "events-2".to_string(),
            entries: vec![entry(1, 1, "a"), entry(1, 2, "b")],
            prev_log_index: 0,
            prev_log_term: 0,
            leader_commit: 1,
        };
        assert!(node.handle_append_entries(&ok).success);
        assert_eq!(node.state.read().persistent.commit_index, 1);
    }

    #[tokio::test]
    async fn test_truncating_repair_rewinds_apply_watermark() {
        let dir = TempDir::new().unwrap();
        let network = InMemoryNetwork::new();
        let store = SharedScheduleStore::new();
        let config = RaftConfig::builder()
            .node_id("events-1")
            .shard("events")
            .public_url("http://127.0.0.1/events-1")
            .priority(10)
            .state_path(dir.path().join("events-1.json"))
            .build();
        let node = RaftNode::new(
            config,
            Box::new(store.clone()),
            network.transport_for("events-1"),
        )
        .unwrap();
        network.register(Arc::clone(&node));

        // A write applied while diverged
        {
            let mut st = node.state.write();
            st.persistent.log = vec![entry(1, 1, "stray")];
            st.persistent.commit_index = 1;
        }
        node.apply_ready();
        assert!(store.view().has_group("stray"));

        // The leader's history replaces index 1
        let repair = AppendEntriesRequest {
            term: 2,
            leader_id: "events-2".to_string(),
            entries: vec![entry(2, 1, "major")],
            prev_log_index: 0,
            prev_log_term: 0,
            leader_commit: 1,
        };
        assert!(node.handle_append_entries(&repair).success);

        {
            let st = node.state.read();
            assert_eq!(st.persistent.last_applied, 1);
            assert_eq!(st.persistent.commit_index, 1);
        }
        // The replacement reached the store; the divergent write stays
        // until reconciliation re-donates it
        let view = store.view();
        assert!(view.has_group("major"));
        assert!(view.has_group("stray"));
    }

    #[tokio::test]
    async fn test_append_log_requires_leadership() {
        let dir = TempDir::new().unwrap();
        let network = InMemoryNetwork::new();
        let node = test_node(&dir, &network, "events-1", 10, vec![]);

        let err = node
            .append_log(Command::CreateGroup { name: "chess".into() })
            .unwrap_err();
        assert!(matches!(err, RaftError::NotLeader { .. }));
    }

    #[tokio::test]
    async fn test_challenge_response_reports_rank() {
        let dir = TempDir::new().unwrap();
        let network = InMemoryNetwork::new();
        let node = test_node(&dir, &network, "events-1", 30, vec![]);

        let resp = node.handle_challenge(&ChallengeRequest {
            candidate_id: "events-2".to_string(),
            candidate_url: "http://127.0.0.1/events-2".to_string(),
            priority: 20,
        });
        assert!(resp.alive);
        assert_eq!(resp.priority, 30);
    }

    #[tokio::test]
    async fn test_victory_from_higher_priority_is_adopted() {
        let dir = TempDir::new().unwrap();
        let network = InMemoryNetwork::new();
        let peers = vec![PeerSpec::new("events-3", "http://127.0.0.1/events-3", 30)];
        let node = test_node(&dir, &network, "events-1", 10, peers);

        let resp = node.handle_victory(&VictoryAnnouncement {
            leader_id: "events-3".to_string(),
            leader_url: "http://127.0.0.1/events-3".to_string(),
            priority: 30,
        });
        assert!(resp.ack);
        assert_eq!(node.leader_id().as_deref(), Some("events-3"));
        assert_eq!(
            node.leader_url().as_deref(),
            Some("http://127.0.0.1/events-3")
        );
    }

    #[tokio::test]
    async fn test_victory_from_lower_priority_triggers_challenge() {
        let dir = TempDir::new().unwrap();
        let network = InMemoryNetwork::new();
        let peers = vec![PeerSpec::new("events-0", "http://127.0.0.1/events-0", 5)];
        let node = test_node(&dir, &network, "events-1", 10, peers);
        {
            node.state.write().election_deadline = Instant::now() + Duration::from_secs(60);
        }

        node.handle_victory(&VictoryAnnouncement {
            leader_id: "events-0".to_string(),
            leader_url: "http://127.0.0.1/events-0".to_string(),
            priority: 5,
        });
        // Challenge scheduled: the deadline is already due
        let st = node.state.read();
        assert!(st.election_deadline <= Instant::now());
        assert_eq!(st.leader_id.as_deref(), Some("events-0"));
    }

    #[tokio::test]
    async fn test_replicate_commits_with_quorum() {
        let dir = TempDir::new().unwrap();
        let network = InMemoryNetwork::new();
        let peers = |skip: &str| -> Vec<PeerSpec> {
            [
                ("events-1", 10u64),
                ("events-2", 20),
                ("events-3", 30),
            ]
            .iter()
            .filter(|(id, _)| *id != skip)
            .map(|(id, pri)| PeerSpec::new(*id, format!("http://127.0.0.1/{id}"), *pri))
            .collect()
        };
        let a = test_node(&dir, &network, "events-1", 10, peers("events-1"));
        let b = test_node(&dir, &network, "events-2", 20, peers("events-2"));
        let c = test_node(&dir, &network, "events-3", 30, peers("events-3"));

        force_leader(&a);
        let entry = a
            .append_log(Command::CreateGroup { name: "chess".into() })
            .unwrap();
        assert!(a.replicate_log(&entry).await);

        assert_eq!(a.state.read().persistent.commit_index, 1);
        // Followers received the entry and the commit broadcast
        assert_eq!(b.state.read().persistent.last_log_index(), 1);
        assert_eq!(b.state.read().persistent.commit_index, 1);
        assert_eq!(c.state.read().persistent.last_log_index(), 1);
    }

    #[tokio::test]
    async fn test_replicate_fails_without_quorum() {
        let dir = TempDir::new().unwrap();
        let network = InMemoryNetwork::new();
        let peers = vec![
            PeerSpec::new("events-2", "http://127.0.0.1/events-2", 20),
            PeerSpec::new("events-3", "http://127.0.0.1/events-3", 30),
        ];
        let a = test_node(&dir, &network, "events-1", 10, peers);
        // Mark both peers recently healthy so quorum stays at 2, then
        // cut the network before replicating
        a.health.mark_up("events-2");
        a.health.mark_up("events-3");
        network.disconnect("events-2");
        network.disconnect("events-3");

        force_leader(&a);
        let entry = a
            .append_log(Command::CreateGroup { name: "chess".into() })
            .unwrap();
        assert!(!a.replicate_log(&entry).await);
        assert_eq!(a.state.read().persistent.commit_index, 0);
    }

    #[tokio::test]
    async fn test_add_and_remove_peer_persisted() {
        let dir = TempDir::new().unwrap();
        let network = InMemoryNetwork::new();
        let node = test_node(&dir, &network, "events-1", 10, vec![]);

        node.add_peer(PeerSpec::new("events-2", "http://127.0.0.1/events-2", 20))
            .unwrap();
        let reloaded = StateFile::new(dir.path().join("events-1.json"))
            .load()
            .unwrap()
            .unwrap();
        assert_eq!(reloaded.peers.len(), 1);

        let err = node
            .add_peer(PeerSpec::new("events-3", "http://127.0.0.1/events-3", 20))
            .unwrap_err();
        assert!(matches!(err, RaftError::InvalidPeer(_)));

        node.remove_peer("events-2").unwrap();
        assert!(matches!(
            node.remove_peer("events-2").unwrap_err(),
            RaftError::UnknownPeer(_)
        ));
    }

    #[tokio::test]
    async fn test_state_report_shape() {
        let dir = TempDir::new().unwrap();
        let network = InMemoryNetwork::new();
        let node = test_node(&dir, &network, "events-1", 10, vec![]);

        let report = node.state_report();
        assert_eq!(report.role, RaftRole::Follower);
        assert_eq!(report.node_id, "events-1");
        assert_eq!(report.shard, "events");
        assert!(report.leader.is_none());
    }

    #[tokio::test]
    async fn test_apply_drain_is_exactly_once() {
        let dir = TempDir::new().unwrap();
        let network = InMemoryNetwork::new();
        let node = test_node(&dir, &network, "events-1", 10, vec![]);
        {
            let mut st = node.state.write();
            st.persistent.log = vec![entry(1, 1, "a"), entry(1, 2, "b")];
            st.persistent.commit_index = 2;
        }

        node.apply_ready();
        node.apply_ready();
        let st = node.state.read();
        assert_eq!(st.persistent.last_applied, 2);
    }
}
