//! Node state, role management, and the durable state file

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Instant;

use serde::{Deserialize, Serialize};

use crate::config::PeerSpec;
use crate::log;
use crate::types::{LogEntry, LogIndex, NodeId, Term};
use crate::Result;

/// The role a node can be in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RaftRole {
    /// Accepts log entries from the leader
    Follower,
    /// Attempting to become leader
    Candidate,
    /// Accepts client writes and replicates the log
    Leader,
}

impl std::fmt::Display for RaftRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RaftRole::Follower => write!(f, "follower"),
            RaftRole::Candidate => write!(f, "candidate"),
            RaftRole::Leader => write!(f, "leader"),
        }
    }
}

/// Durable node state, written to the state file before any vote or
/// append-entries response leaves the node
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistentState {
    /// Latest term this node has seen (starts at 0, increases monotonically)
    pub current_term: Term,

    /// Candidate that received this node's vote in the current term
    pub voted_for: Option<NodeId>,

    /// The replicated log, 1-based and contiguous
    pub log: Vec<LogEntry>,

    /// Highest index known committed on this node
    pub commit_index: LogIndex,

    /// Highest index handed to the state machine
    pub last_applied: LogIndex,

    /// Current peer set, excluding self. Persisted so membership changes
    /// survive restarts.
    pub peers: Vec<PeerSpec>,

    /// Replication fan-out per write, counting the leader
    pub replication_factor: usize,
}

impl Default for PersistentState {
    fn default() -> Self {
        Self {
            current_term: 0,
            voted_for: None,
            log: Vec::new(),
            commit_index: 0,
            last_applied: 0,
            peers: Vec::new(),
            replication_factor: 3,
        }
    }
}

impl PersistentState {
    pub fn last_log_index(&self) -> LogIndex {
        log::last_index(&self.log)
    }

    pub fn last_log_term(&self) -> Term {
        log::last_term(&self.log)
    }

    pub fn entry_at(&self, index: LogIndex) -> Option<&LogEntry> {
        log::entry_at(&self.log, index)
    }

    /// Raise the term if the observed one is newer; a new term clears the
    /// vote.
    pub fn observe_term(&mut self, term: Term) -> bool {
        if term > self.current_term {
            self.current_term = term;
            self.voted_for = None;
            true
        } else {
            false
        }
    }

    pub fn peer(&self, id: &str) -> Option<&PeerSpec> {
        self.peers.iter().find(|p| p.node_id == id)
    }
}

/// One JSON file per node holding the full [`PersistentState`].
///
/// Writes go to a sibling temp file first and are renamed into place, so
/// a crash mid-write leaves the previous image intact.
#[derive(Debug, Clone)]
pub struct StateFile {
    path: PathBuf,
}

impl StateFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the persisted image, or `None` on first boot.
    pub fn load(&self) -> Result<Option<PersistentState>> {
        if !self.path.exists() {
            return Ok(None);
        }
        let bytes = fs::read(&self.path)?;
        let state = serde_json::from_slice(&bytes)?;
        Ok(Some(state))
    }

    pub fn save(&self, state: &PersistentState) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(state)?;
        let tmp = self.path.with_extension("tmp");
        fs::write(&tmp, &bytes)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

/// Complete in-memory node state, guarded by the node-wide lock
#[derive(Debug)]
pub struct NodeState {
    /// Current role of this node
    pub role: RaftRole,

    /// Current leader, if known
    pub leader_id: Option<NodeId>,

    /// Durable state
    pub persistent: PersistentState,

    /// Per-peer index of the next entry to send (leader only)
    pub next_index: HashMap<NodeId, LogIndex>,

    /// Per-peer highest index known replicated (leader only)
    pub match_index: HashMap<NodeId, LogIndex>,

    /// When the election ticker should act next
    pub election_deadline: Instant,
}

impl NodeState {
    pub fn new(persistent: PersistentState) -> Self {
        Self {
            role: RaftRole::Follower,
            leader_id: None,
            persistent,
            next_index: HashMap::new(),
            match_index: HashMap::new(),
            election_deadline: Instant::now(),
        }
    }

    /// Transition to follower at the given term.
    pub fn become_follower(&mut self, term: Term, leader: Option<NodeId>) {
        self.role = RaftRole::Follower;
        self.persistent.observe_term(term);
        self.leader_id = leader;
        self.next_index.clear();
        self.match_index.clear();
    }

    /// Start a candidacy: bump the term, vote for self.
    pub fn begin_candidacy(&mut self, self_id: &str) {
        self.role = RaftRole::Candidate;
        self.persistent.current_term += 1;
        self.persistent.voted_for = Some(self_id.to_string());
        self.leader_id = None;
        self.next_index.clear();
        self.match_index.clear();
    }

    /// Transition to leader and reset the replication indices.
    pub fn become_leader(&mut self, self_id: &str) {
        self.role = RaftRole::Leader;
        self.leader_id = Some(self_id.to_string());
        self.reset_replication_indices();
    }

    /// Point every peer's next_index at the tail of the current log.
    pub fn reset_replication_indices(&mut self) {
        let next = self.persistent.last_log_index() + 1;
        self.next_index = self
            .persistent
            .peers
            .iter()
            .map(|p| (p.node_id.clone(), next))
            .collect();
        self.match_index = self
            .persistent
            .peers
            .iter()
            .map(|p| (p.node_id.clone(), 0))
            .collect();
    }
}
