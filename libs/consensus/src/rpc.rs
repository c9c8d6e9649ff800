//! Wire messages for the `/raft/*` JSON RPC surface
//!
//! Field names here are the wire schema; the HTTP layer serializes these
//! structs as-is.

use serde::{Deserialize, Serialize};

use crate::state::RaftRole;
use crate::types::{LogEntry, LogIndex, NodeId, Term};

/// RequestVote - kept at the wire for Raft-style vote bookkeeping
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestVoteRequest {
    /// Candidate's term
    pub term: Term,

    /// Candidate requesting the vote
    pub candidate_id: NodeId,

    /// Index of the candidate's last log entry
    pub last_log_index: LogIndex,

    /// Term of the candidate's last log entry
    pub last_log_term: Term,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestVoteResponse {
    /// Current term, for the candidate to update itself
    pub term: Term,

    /// True if the candidate received the vote
    pub vote_granted: bool,

    /// Responder's id
    pub node_id: NodeId,
}

/// AppendEntries - replicates log entries and asserts leadership
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppendEntriesRequest {
    /// Leader's term
    pub term: Term,

    /// So the follower can record who leads
    pub leader_id: NodeId,

    /// Entries to store (empty to assert authority only)
    pub entries: Vec<LogEntry>,

    /// Index of the entry immediately preceding `entries`
    pub prev_log_index: LogIndex,

    /// Term of the `prev_log_index` entry
    pub prev_log_term: Term,

    /// Leader's commit index
    pub leader_commit: LogIndex,
}

impl AppendEntriesRequest {
    /// An empty round that only asserts authority and pushes the commit
    /// index forward.
    pub fn empty(
        term: Term,
        leader_id: NodeId,
        prev_log_index: LogIndex,
        prev_log_term: Term,
        leader_commit: LogIndex,
    ) -> Self {
        Self {
            term,
            leader_id,
            entries: vec![],
            prev_log_index,
            prev_log_term,
            leader_commit,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppendEntriesResponse {
    /// Current term, for the leader to update itself
    pub term: Term,

    /// True if the follower held the entry at prev_log_index/prev_log_term
    pub success: bool,

    /// Responder's id
    pub node_id: NodeId,
}

/// Lightweight liveness ping from the leader
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatPing {
    pub term: Term,
    pub leader_id: NodeId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatAck {
    pub status: String,
}

impl HeartbeatAck {
    pub fn ok() -> Self {
        Self {
            status: "ok".to_string(),
        }
    }
}

/// Bully challenge, sent to every higher-priority peer before a
/// candidate claims leadership
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChallengeRequest {
    pub candidate_id: NodeId,
    pub candidate_url: String,
    pub priority: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChallengeResponse {
    /// The responder is alive and outranks the challenger
    pub alive: bool,

    /// Responder's own priority
    pub priority: u64,

    /// URL of the leader the responder currently recognizes, if any
    pub leader: Option<String>,
}

/// Broadcast by a node that won its challenge round
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VictoryAnnouncement {
    pub leader_id: NodeId,
    pub leader_url: String,
    pub priority: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VictoryResponse {
    pub status: String,
    pub ack: bool,
}

impl VictoryResponse {
    pub fn ok() -> Self {
        Self {
            status: "ok".to_string(),
            ack: true,
        }
    }
}

/// Full-log pull used by followers catching up (`GET /raft/sync`)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncResponse {
    pub missing_entries: Vec<LogEntry>,
}

/// Cheap log position probe (`GET /raft/log/summary`)
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct LogSummary {
    pub last_index: LogIndex,
    pub last_term: Term,
    pub commit_index: LogIndex,
}

/// Complete log dump used by reverse reconciliation (`GET /raft/log/full`)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FullLogResponse {
    pub entries: Vec<LogEntry>,
}

/// Node status for the coordinator (`GET /raft/state`)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateReport {
    pub role: RaftRole,
    pub term: Term,

    /// URL of the recognized leader, if any
    pub leader: Option<String>,

    pub node_id: NodeId,
    pub shard: String,

    // Supplemental fields the coordinator may ignore
    pub priority: u64,
    pub commit_index: LogIndex,
    pub last_applied: LogIndex,
    pub log_length: usize,
    pub healthy_peers: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::Command;

    #[test]
    fn test_empty_round_creation() {
        let req = AppendEntriesRequest::empty(5, "events-1".to_string(), 10, 5, 8);
        assert!(req.is_empty());
        assert_eq!(req.term, 5);
        assert_eq!(req.leader_id, "events-1");
    }

    #[test]
    fn test_append_entries_wire_shape() {
        let req = AppendEntriesRequest {
            term: 5,
            leader_id: "events-1".to_string(),
            entries: vec![LogEntry::new(
                5,
                11,
                Command::CreateGroup {
                    name: "chess".into(),
                },
            )],
            prev_log_index: 10,
            prev_log_term: 5,
            leader_commit: 8,
        };
        let value = serde_json::to_value(&req).unwrap();
        assert_eq!(value["prev_log_index"], 10);
        assert_eq!(value["entries"][0]["index"], 11);
        assert_eq!(value["entries"][0]["command"]["op"], "create_group");
    }

    #[test]
    fn test_challenge_wire_shape() {
        let resp = ChallengeResponse {
            alive: true,
            priority: 30,
            leader: None,
        };
        let value = serde_json::to_value(&resp).unwrap();
        assert_eq!(value["alive"], true);
        assert_eq!(value["priority"], 30);
        assert!(value["leader"].is_null());
    }

    #[test]
    fn test_state_report_role_casing() {
        let report = StateReport {
            role: RaftRole::Leader,
            term: 3,
            leader: Some("http://127.0.0.1:7101".to_string()),
            node_id: "events-1".to_string(),
            shard: "events".to_string(),
            priority: 30,
            commit_index: 4,
            last_applied: 4,
            log_length: 4,
            healthy_peers: 2,
        };
        let value = serde_json::to_value(&report).unwrap();
        assert_eq!(value["role"], "leader");
    }
}
