//! Outbound RPC client: `RaftTransport` over reqwest

use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::trace;

use tandem_consensus::{
    AppendEntriesRequest, AppendEntriesResponse, ChallengeRequest, ChallengeResponse,
    FullLogResponse, HeartbeatAck, HeartbeatPing, LogSummary, PeerSpec, RaftTransport,
    SyncResponse, TransportError, VictoryAnnouncement, VictoryResponse,
};

use crate::NetworkError;

/// HTTP implementation of the consensus transport.
///
/// One instance per node; reqwest pools connections internally. Every
/// request carries the configured timeout, so a dead peer costs at most
/// one timeout per RPC. The node layers its own `rpc_timeout` on top,
/// whichever is shorter wins.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
    timeout: Duration,
}

impl HttpTransport {
    pub fn new(timeout: Duration) -> Result<Self, NetworkError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { client, timeout })
    }

    fn url(peer: &PeerSpec, path: &str) -> String {
        format!("{}{}", peer.url.trim_end_matches('/'), path)
    }

    fn map_error(&self, peer: &PeerSpec, err: reqwest::Error) -> TransportError {
        if err.is_timeout() {
            TransportError::Timeout(self.timeout)
        } else if err.is_connect() {
            TransportError::Unreachable(peer.node_id.clone())
        } else {
            TransportError::Protocol(err.to_string())
        }
    }

    async fn post<R, T>(&self, peer: &PeerSpec, path: &str, body: &R) -> Result<T, TransportError>
    where
        R: Serialize + Sync,
        T: DeserializeOwned,
    {
        trace!(peer = %peer.node_id, path, "rpc post");
        let response = self
            .client
            .post(Self::url(peer, path))
            .json(body)
            .send()
            .await
            .map_err(|e| self.map_error(peer, e))?;
        Self::decode(peer, path, response).await
    }

    async fn get<T>(&self, peer: &PeerSpec, path: &str) -> Result<T, TransportError>
    where
        T: DeserializeOwned,
    {
        trace!(peer = %peer.node_id, path, "rpc get");
        let response = self
            .client
            .get(Self::url(peer, path))
            .send()
            .await
            .map_err(|e| self.map_error(peer, e))?;
        Self::decode(peer, path, response).await
    }

    async fn decode<T: DeserializeOwned>(
        peer: &PeerSpec,
        path: &str,
        response: reqwest::Response,
    ) -> Result<T, TransportError> {
        let status = response.status();
        if !status.is_success() {
            return Err(TransportError::Protocol(format!(
                "{} returned {status} for {path}",
                peer.node_id
            )));
        }
        response
            .json()
            .await
            .map_err(|e| TransportError::Protocol(e.to_string()))
    }
}

#[async_trait]
impl RaftTransport for HttpTransport {
    async fn append_entries(
        &self,
        peer: &PeerSpec,
        req: AppendEntriesRequest,
    ) -> Result<AppendEntriesResponse, TransportError> {
        self.post(peer, "/raft/append_entries", &req).await
    }

    async fn heartbeat(
        &self,
        peer: &PeerSpec,
        req: HeartbeatPing,
    ) -> Result<HeartbeatAck, TransportError> {
        self.post(peer, "/raft/heartbeat", &req).await
    }

    async fn challenge(
        &self,
        peer: &PeerSpec,
        req: ChallengeRequest,
    ) -> Result<ChallengeResponse, TransportError> {
        self.post(peer, "/raft/bully/challenge", &req).await
    }

    async fn victory(
        &self,
        peer: &PeerSpec,
        req: VictoryAnnouncement,
    ) -> Result<VictoryResponse, TransportError> {
        self.post(peer, "/raft/bully/victory", &req).await
    }

    async fn pull_log(
        &self,
        peer: &PeerSpec,
        follower: &str,
    ) -> Result<SyncResponse, TransportError> {
        self.get(peer, &format!("/raft/sync?follower={follower}")).await
    }

    async fn log_summary(&self, peer: &PeerSpec) -> Result<LogSummary, TransportError> {
        self.get(peer, "/raft/log/summary").await
    }

    async fn full_log(&self, peer: &PeerSpec) -> Result<FullLogResponse, TransportError> {
        self.get(peer, "/raft/log/full").await
    }
}
