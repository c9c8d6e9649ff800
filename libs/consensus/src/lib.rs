//! Hybrid Raft/Bully consensus for Tandem's scheduling shards
//!
//! This library keeps one shard of the scheduling data (users, groups,
//! events) consistent across a small set of replicas. It combines a Raft
//! replicated log with Bully-style priority elections: terms and log
//! matching come from Raft, while leadership is steered toward the peer
//! with the highest configured priority.
//!
//! # Features
//!
//! - Priority-based leader election layered on Raft terms
//! - Log replication with backward-probing repair
//! - Dynamic quorum over recently healthy peers
//! - Periodic reconciliation that merges divergent follower logs
//! - Pluggable state machine applied exactly once per index
//!
//! # Example
//!
//! ```no_run
//! use tandem_consensus::{
//!     Command, InMemoryNetwork, MemoryScheduleStore, RaftConfig, RaftNode,
//! };
//!
//! # async fn example() -> tandem_consensus::Result<()> {
//! let network = InMemoryNetwork::new();
//! let config = RaftConfig::builder()
//!     .node_id("events-1")
//!     .shard("events")
//!     .priority(10)
//!     .state_path("/var/lib/tandem/events-1.json")
//!     .build();
//!
//! let store = MemoryScheduleStore::new();
//! let node = RaftNode::new(config, Box::new(store), network.transport_for("events-1"))?;
//! network.register(node.clone());
//! node.start();
//!
//! // Propose a command (only works on the leader)
//! node.propose(Command::CreateGroup { name: "book-club".into() }).await?;
//! # Ok(())
//! # }
//! ```

mod command;
mod config;
mod health;
mod log;
mod machine;
mod node;
mod rpc;
mod state;
mod transport;
mod types;

pub use command::Command;
pub use config::{PeerSpec, RaftConfig, RaftConfigBuilder};
pub use health::PeerHealthTracker;
pub use machine::{ApplyError, EventRow, MemoryScheduleStore, SharedScheduleStore, StateMachine};
pub use node::RaftNode;
pub use rpc::{
    AppendEntriesRequest, AppendEntriesResponse, ChallengeRequest, ChallengeResponse,
    FullLogResponse, HeartbeatAck, HeartbeatPing, LogSummary, RequestVoteRequest,
    RequestVoteResponse, StateReport, SyncResponse, VictoryAnnouncement, VictoryResponse,
};
pub use state::{NodeState, PersistentState, RaftRole, StateFile};
pub use transport::{InMemoryNetwork, InMemoryTransport, RaftTransport, TransportError};
pub use types::{LogEntry, LogIndex, NodeId, Term};

/// Result type for Raft operations
pub type Result<T> = std::result::Result<T, RaftError>;

/// Errors that can occur during Raft operations
#[derive(Debug, thiserror::Error)]
pub enum RaftError {
    #[error("Not the leader (current leader: {leader:?})")]
    NotLeader { leader: Option<String> },

    #[error("Quorum not reached (needed {needed}, got {got})")]
    NoQuorum { needed: usize, got: usize },

    #[error("Node is shutting down")]
    ShuttingDown,

    #[error("Storage error: {0}")]
    Storage(#[from] std::io::Error),

    #[error("Codec error: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("Unknown peer: {0}")]
    UnknownPeer(NodeId),

    #[error("Invalid peer: {0}")]
    InvalidPeer(String),
}
