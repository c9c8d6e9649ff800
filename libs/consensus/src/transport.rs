//! Outbound RPC abstraction
//!
//! The node drives all peer traffic through [`RaftTransport`], so the
//! consensus core never names a wire protocol. The HTTP implementation
//! lives in the networking crate; [`InMemoryNetwork`] here routes calls
//! between nodes of a single process and powers the cluster tests,
//! including partition injection.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::{DashMap, DashSet};

use crate::config::PeerSpec;
use crate::node::RaftNode;
use crate::rpc::{
    AppendEntriesRequest, AppendEntriesResponse, ChallengeRequest, ChallengeResponse,
    FullLogResponse, HeartbeatAck, HeartbeatPing, LogSummary, SyncResponse, VictoryAnnouncement,
    VictoryResponse,
};
use crate::types::NodeId;

/// Errors surfaced by an outbound RPC. All of them mean "mark the peer
/// unhealthy and retry later"; none are fatal.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("Peer unreachable: {0}")]
    Unreachable(String),

    #[error("RPC timed out after {0:?}")]
    Timeout(Duration),

    #[error("Protocol error: {0}")]
    Protocol(String),
}

/// Peer-to-peer RPC surface used by the consensus loops.
///
/// Request-vote is absent on purpose: it exists at the wire for
/// handler-side bookkeeping, but elections are driven by the Bully
/// challenge, so nothing here sends votes.
#[async_trait]
pub trait RaftTransport: Send + Sync + 'static {
    async fn append_entries(
        &self,
        peer: &PeerSpec,
        req: AppendEntriesRequest,
    ) -> Result<AppendEntriesResponse, TransportError>;

    async fn heartbeat(
        &self,
        peer: &PeerSpec,
        req: HeartbeatPing,
    ) -> Result<HeartbeatAck, TransportError>;

    async fn challenge(
        &self,
        peer: &PeerSpec,
        req: ChallengeRequest,
    ) -> Result<ChallengeResponse, TransportError>;

    async fn victory(
        &self,
        peer: &PeerSpec,
        req: VictoryAnnouncement,
    ) -> Result<VictoryResponse, TransportError>;

    /// Pull the peer's full log on behalf of `follower` (`GET /raft/sync`).
    async fn pull_log(
        &self,
        peer: &PeerSpec,
        follower: &str,
    ) -> Result<SyncResponse, TransportError>;

    async fn log_summary(&self, peer: &PeerSpec) -> Result<LogSummary, TransportError>;

    async fn full_log(&self, peer: &PeerSpec) -> Result<FullLogResponse, TransportError>;
}

#[derive(Debug, Default)]
struct NetworkInner {
    nodes: DashMap<NodeId, Arc<RaftNode>>,
    severed: DashSet<NodeId>,
}

/// In-process message routing between registered nodes.
///
/// Used by the cluster tests and by single-process multi-replica setups.
/// Partitions are injected per node: a disconnected node can neither
/// send nor receive until reconnected.
#[derive(Debug, Clone, Default)]
pub struct InMemoryNetwork {
    inner: Arc<NetworkInner>,
}

impl InMemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Transport handle for the node with the given id. The node itself
    /// can be registered afterwards.
    pub fn transport_for(&self, node_id: impl Into<NodeId>) -> Arc<InMemoryTransport> {
        Arc::new(InMemoryTransport {
            from: node_id.into(),
            inner: Arc::clone(&self.inner),
        })
    }

    pub fn register(&self, node: Arc<RaftNode>) {
        self.inner.nodes.insert(node.id().clone(), node);
    }

    /// Cut the node off from everyone else.
    pub fn disconnect(&self, node_id: &str) {
        self.inner.severed.insert(node_id.to_string());
    }

    pub fn reconnect(&self, node_id: &str) {
        self.inner.severed.remove(node_id);
    }
}

/// One node's view of an [`InMemoryNetwork`].
#[derive(Debug)]
pub struct InMemoryTransport {
    from: NodeId,
    inner: Arc<NetworkInner>,
}

impl InMemoryTransport {
    fn route(&self, peer: &PeerSpec) -> Result<Arc<RaftNode>, TransportError> {
        if self.inner.severed.contains(&self.from) {
            return Err(TransportError::Unreachable(self.from.clone()));
        }
        if self.inner.severed.contains(&peer.node_id) {
            return Err(TransportError::Unreachable(peer.node_id.clone()));
        }
        self.inner
            .nodes
            .get(&peer.node_id)
            .map(|n| Arc::clone(&n))
            .ok_or_else(|| TransportError::Unreachable(peer.node_id.clone()))
    }
}

#[async_trait]
impl RaftTransport for InMemoryTransport {
    async fn append_entries(
        &self,
        peer: &PeerSpec,
        req: AppendEntriesRequest,
    ) -> Result<AppendEntriesResponse, TransportError> {
        Ok(self.route(peer)?.handle_append_entries(&req))
    }

    async fn heartbeat(
        &self,
        peer: &PeerSpec,
        req: HeartbeatPing,
    ) -> Result<HeartbeatAck, TransportError> {
        Ok(self.route(peer)?.handle_heartbeat(&req))
    }

    async fn challenge(
        &self,
        peer: &PeerSpec,
        req: ChallengeRequest,
    ) -> Result<ChallengeResponse, TransportError> {
        Ok(self.route(peer)?.handle_challenge(&req))
    }

    async fn victory(
        &self,
        peer: &PeerSpec,
        req: VictoryAnnouncement,
    ) -> Result<VictoryResponse, TransportError> {
        Ok(self.route(peer)?.handle_victory(&req))
    }

    async fn pull_log(
        &self,
        peer: &PeerSpec,
        follower: &str,
    ) -> Result<SyncResponse, TransportError> {
        Ok(self.route(peer)?.handle_log_sync(follower))
    }

    async fn log_summary(&self, peer: &PeerSpec) -> Result<LogSummary, TransportError> {
        Ok(self.route(peer)?.log_summary())
    }

    async fn full_log(&self, peer: &PeerSpec) -> Result<FullLogResponse, TransportError> {
        Ok(self.route(peer)?.full_log())
    }
}
