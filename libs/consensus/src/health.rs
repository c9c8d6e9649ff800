//! Peer health tracking and the dynamic quorum rule
//!
//! A peer counts as healthy while its last successful contact is within
//! the configured window. Quorum is computed over the healthy subset, so
//! a shard keeps accepting writes while a minority is dark. The known
//! trade-off: a slow-but-alive minority can shrink quorums on both sides
//! of a partition. Health is never persisted; it is rebuilt from live
//! traffic after a restart.

use std::time::{Duration, Instant};

use dashmap::DashMap;

use crate::config::PeerSpec;
use crate::types::NodeId;

#[derive(Debug)]
pub struct PeerHealthTracker {
    window: Duration,
    last_contact: DashMap<NodeId, Instant>,
}

impl PeerHealthTracker {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            last_contact: DashMap::new(),
        }
    }

    /// Record a successful round trip.
    pub fn mark_up(&self, id: &str) {
        self.last_contact.insert(id.to_string(), Instant::now());
    }

    /// Record a failed round trip. The peer stops counting toward quorum
    /// immediately rather than waiting out the window.
    pub fn mark_down(&self, id: &str) {
        self.last_contact.remove(id);
    }

    /// Drop a peer entirely (membership change).
    pub fn forget(&self, id: &str) {
        self.last_contact.remove(id);
    }

    pub fn is_healthy(&self, id: &str) -> bool {
        self.last_contact
            .get(id)
            .map(|at| at.elapsed() <= self.window)
            .unwrap_or(false)
    }

    /// How many of the given peers are currently healthy.
    pub fn healthy_among(&self, peers: &[PeerSpec]) -> usize {
        peers.iter().filter(|p| self.is_healthy(&p.node_id)).count()
    }

    /// Write quorum over self plus the currently healthy peers:
    /// `floor((1 + healthy) / 2) + 1`.
    pub fn quorum(&self, peers: &[PeerSpec]) -> usize {
        let cluster = 1 + self.healthy_among(peers);
        cluster / 2 + 1
    }

    /// Peers ordered healthy-first for replication targeting; relative
    /// order within each group is preserved.
    pub fn order_targets(&self, peers: &[PeerSpec]) -> Vec<PeerSpec> {
        let (healthy, rest): (Vec<PeerSpec>, Vec<PeerSpec>) = peers
            .iter()
            .cloned()
            .partition(|p| self.is_healthy(&p.node_id));
        healthy.into_iter().chain(rest).collect()
    }
}
