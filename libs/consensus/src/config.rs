//! Node configuration

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::types::NodeId;

/// A peer replica of the same shard.
///
/// The priority is configured explicitly and persisted with the peer set;
/// it is never derived from the URL. Priorities must be pairwise distinct
/// within a shard so the Bully ordering is total.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerSpec {
    pub node_id: NodeId,
    pub url: String,
    pub priority: u64,
}

impl PeerSpec {
    pub fn new(node_id: impl Into<NodeId>, url: impl Into<String>, priority: u64) -> Self {
        Self {
            node_id: node_id.into(),
            url: url.into(),
            priority,
        }
    }
}

/// Configuration for one shard replica
#[derive(Debug, Clone)]
pub struct RaftConfig {
    /// Logical node id, e.g. `events-1`
    pub node_id: NodeId,

    /// Shard this replica belongs to (`events`, `groups`, `users`)
    pub shard: String,

    /// Base URL peers and the coordinator use to reach this node
    pub public_url: String,

    /// Bully election priority; highest healthy priority should lead
    pub priority: u64,

    /// Seed peer set for the first boot. Once a state file exists, the
    /// persisted peer set takes precedence so membership changes survive
    /// restarts.
    pub peers: Vec<PeerSpec>,

    /// Replication fan-out per write, counting the leader itself.
    /// Bounded by cluster size at runtime.
    pub replication_factor: usize,

    /// Path of the JSON state file for this node
    pub state_path: PathBuf,

    /// Minimum election timeout
    ///
    /// The actual timeout is randomized between min and max on every
    /// reset so replicas do not stampede.
    pub election_timeout_min: Duration,

    /// Maximum election timeout
    pub election_timeout_max: Duration,

    /// How often the leader re-asserts itself with AppendEntries
    ///
    /// Must stay well below the election timeout minimum.
    pub heartbeat_interval: Duration,

    /// A peer counts toward quorum only if it answered within this window
    pub peer_health_window: Duration,

    /// Interval of the leader's consistency pass (peer sync plus reverse
    /// reconciliation)
    pub reconcile_interval: Duration,

    /// Interval of the commit-apply drain
    pub apply_interval: Duration,

    /// Timeout for one Bully challenge round trip
    pub challenge_timeout: Duration,

    /// Timeout for every other outbound RPC
    pub rpc_timeout: Duration,

    /// Delay before the highest-priority node kicks off its startup
    /// election
    pub startup_grace: Duration,

    /// Poll interval of the election deadline checker
    pub tick_interval: Duration,
}

impl RaftConfig {
    pub fn builder() -> RaftConfigBuilder {
        RaftConfigBuilder::new()
    }
}

/// Builder for RaftConfig
pub struct RaftConfigBuilder {
    config: RaftConfig,
}

impl RaftConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: RaftConfig {
                node_id: String::new(),
                shard: "events".to_string(),
                public_url: String::new(),
                priority: 0,
                peers: Vec::new(),
                replication_factor: 3,
                state_path: PathBuf::new(),

                // Seconds-scale timings: peers are processes on commodity
                // hosts, not datacenter neighbors
                election_timeout_min: Duration::from_secs(2),
                election_timeout_max: Duration::from_secs(4),
                heartbeat_interval: Duration::from_secs(1),
                peer_health_window: Duration::from_secs(5),
                reconcile_interval: Duration::from_secs(5),
                apply_interval: Duration::from_millis(200),
                challenge_timeout: Duration::from_secs(3),
                rpc_timeout: Duration::from_secs(3),
                startup_grace: Duration::from_millis(500),
                tick_interval: Duration::from_millis(100),
            },
        }
    }

    pub fn node_id(mut self, id: impl Into<NodeId>) -> Self {
        self.config.node_id = id.into();
        self
    }

    pub fn shard(mut self, shard: impl Into<String>) -> Self {
        self.config.shard = shard.into();
        self
    }

    pub fn public_url(mut self, url: impl Into<String>) -> Self {
        self.config.public_url = url.into();
        self
    }

    pub fn priority(mut self, priority: u64) -> Self {
        self.config.priority = priority;
        self
    }

    pub fn peer(mut self, peer: PeerSpec) -> Self {
        self.config.peers.push(peer);
        self
    }

    pub fn peers(mut self, peers: Vec<PeerSpec>) -> Self {
        self.config.peers = peers;
        self
    }

    pub fn replication_factor(mut self, factor: usize) -> Self {
        self.config.replication_factor = factor;
        self
    }

    pub fn state_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.state_path = path.into();
        self
    }

    pub fn election_timeout(mut self, min: Duration, max: Duration) -> Self {
        self.config.election_timeout_min = min;
        self.config.election_timeout_max = max;
        self
    }

    pub fn heartbeat_interval(mut self, interval: Duration) -> Self {
        self.config.heartbeat_interval = interval;
        self
    }

    pub fn peer_health_window(mut self, window: Duration) -> Self {
        self.config.peer_health_window = window;
        self
    }

    pub fn reconcile_interval(mut self, interval: Duration) -> Self {
        self.config.reconcile_interval = interval;
        self
    }

    pub fn apply_interval(mut self, interval: Duration) -> Self {
        self.config.apply_interval = interval;
        self
    }

    pub fn challenge_timeout(mut self, timeout: Duration) -> Self {
        self.config.challenge_timeout = timeout;
        self
    }

    pub fn rpc_timeout(mut self, timeout: Duration) -> Self {
        self.config.rpc_timeout = timeout;
        self
    }

    pub fn startup_grace(mut self, grace: Duration) -> Self {
        self.config.startup_grace = grace;
        self
    }

    pub fn tick_interval(mut self, interval: Duration) -> Self {
        self.config.tick_interval = interval;
        self
    }

    pub fn build(self) -> RaftConfig {
        // Validate configuration
        assert!(!self.config.node_id.is_empty(), "node_id must be set");
        assert!(
            self.config.state_path.as_os_str().len() > 0,
            "state_path must be set"
        );
        assert!(
            self.config.election_timeout_min < self.config.election_timeout_max,
            "election_timeout_min must be less than election_timeout_max"
        );
        assert!(
            self.config.heartbeat_interval < self.config.election_timeout_min,
            "heartbeat_interval must be less than election_timeout_min"
        );
        assert!(
            self.config.replication_factor >= 1,
            "replication_factor must be at least 1"
        );

        let mut priorities: Vec<u64> = self.config.peers.iter().map(|p| p.priority).collect();
        priorities.push(self.config.priority);
        priorities.sort_unstable();
        priorities.dedup();
        assert!(
            priorities.len() == self.config.peers.len() + 1,
            "priorities must be pairwise distinct within a shard"
        );

        let mut ids: Vec<&NodeId> = self.config.peers.iter().map(|p| &p.node_id).collect();
        ids.push(&self.config.node_id);
        ids.sort_unstable();
        ids.dedup();
        assert!(
            ids.len() == self.config.peers.len() + 1,
            "node ids must be unique within a shard"
        );

        self.config
    }
}

impl Default for RaftConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}
