//! Multi-node cluster behavior over the in-process network: elections,
//! replication, failover, partition repair.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tandem_consensus::{
    Command, InMemoryNetwork, PeerSpec, RaftConfig, RaftNode, RaftRole, SharedScheduleStore,
};
use tempfile::TempDir;
use tokio::time::sleep;
use tracing_subscriber::EnvFilter;

const NODES: [(&str, u64); 3] = [("events-1", 10), ("events-2", 20), ("events-3", 30)];

fn node_url(id: &str) -> String {
    format!("http://127.0.0.1/{id}")
}

// Quiet by default; RUST_LOG=debug narrates a failing scenario
fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}

fn shard_config(dir: &TempDir, id: &str, priority: u64, peers: Vec<PeerSpec>) -> RaftConfig {
    RaftConfig::builder()
        .node_id(id)
        .shard("events")
        .public_url(node_url(id))
        .priority(priority)
        .peers(peers)
        .state_path(dir.path().join(format!("{id}.json")))
        .election_timeout(Duration::from_millis(250), Duration::from_millis(500))
        .heartbeat_interval(Duration::from_millis(100))
        .peer_health_window(Duration::from_millis(400))
        .reconcile_interval(Duration::from_millis(250))
        .apply_interval(Duration::from_millis(50))
        .challenge_timeout(Duration::from_millis(150))
        .rpc_timeout(Duration::from_millis(150))
        .startup_grace(Duration::from_millis(50))
        .tick_interval(Duration::from_millis(20))
        .build()
}

struct Cluster {
    network: InMemoryNetwork,
    nodes: Vec<Arc<RaftNode>>,
    stores: Vec<SharedScheduleStore>,
    _dir: TempDir,
}

impl Cluster {
    fn start() -> Self {
        init_logging();
        let dir = TempDir::new().unwrap();
        let network = InMemoryNetwork::new();
        let mut nodes = Vec::new();
        let mut stores = Vec::new();
        for (id, priority) in NODES {
            let peers = NODES
                .iter()
                .filter(|(other, _)| *other != id)
                .map(|(other, pri)| PeerSpec::new(*other, node_url(other), *pri))
                .collect();
            let store = SharedScheduleStore::new();
            let node = RaftNode::new(
                shard_config(&dir, id, priority, peers),
                Box::new(store.clone()),
                network.transport_for(id),
            )
            .unwrap();
            network.register(Arc::clone(&node));
            node.start();
            nodes.push(node);
            stores.push(store);
        }
        Self {
            network,
            nodes,
            stores,
            _dir: dir,
        }
    }

    fn node(&self, id: &str) -> &Arc<RaftNode> {
        self.nodes.iter().find(|n| n.id() == id).unwrap()
    }

    fn store(&self, id: &str) -> &SharedScheduleStore {
        let pos = self.nodes.iter().position(|n| n.id() == id).unwrap();
        &self.stores[pos]
    }

    fn leader(&self) -> Option<Arc<RaftNode>> {
        self.nodes.iter().find(|n| n.is_leader()).map(Arc::clone)
    }

    fn shutdown(&self) {
        for node in &self.nodes {
            node.shutdown();
        }
    }
}

async fn wait_until(what: &str, mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while Instant::now() < deadline {
        if condition() {
            return;
        }
        sleep(Duration::from_millis(20)).await;
    }
    panic!("timed out waiting for {what}");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_startup_elects_highest_priority() {
    let cluster = Cluster::start();

    wait_until("events-3 to lead", || cluster.node("events-3").is_leader()).await;
    let url = node_url("events-3");
    wait_until("followers to recognize the leader", || {
        cluster.node("events-1").leader_url().as_deref() == Some(url.as_str())
            && cluster.node("events-2").leader_url().as_deref() == Some(url.as_str())
    })
    .await;

    assert!(!cluster.node("events-1").is_leader());
    assert!(!cluster.node("events-2").is_leader());
    cluster.shutdown();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_propose_commits_and_applies_everywhere() {
    let cluster = Cluster::start();
    wait_until("leader", || cluster.leader().is_some()).await;

    let leader = cluster.leader().unwrap();
    leader
        .propose(Command::CreateGroup {
            name: "chess".into(),
        })
        .await
        .unwrap();
    leader
        .propose(Command::CreateUser {
            username: "ada".into(),
        })
        .await
        .unwrap();

    wait_until("all replicas to apply both writes", || {
        NODES.iter().all(|(id, _)| {
            let view = cluster.store(id).view();
            view.has_group("chess") && view.has_user("ada")
        })
    })
    .await;

    let report = leader.state_report();
    assert_eq!(report.role, RaftRole::Leader);
    assert_eq!(report.commit_index, 2);
    assert_eq!(report.last_applied, 2);
    cluster.shutdown();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_follower_rejects_propose_with_leader_hint() {
    let cluster = Cluster::start();
    wait_until("events-3 to lead", || cluster.node("events-3").is_leader()).await;
    wait_until("events-1 to learn the leader", || {
        cluster.node("events-1").leader_url().is_some()
    })
    .await;

    let err = cluster
        .node("events-1")
        .propose(Command::CreateGroup {
            name: "chess".into(),
        })
        .await
        .unwrap_err();
    let msg = err.to_string();
    assert!(msg.contains("Not the leader"), "unexpected error: {msg}");
    assert!(msg.contains("events-3"), "missing leader hint: {msg}");
    cluster.shutdown();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_write_commits_while_one_peer_dark() {
    let cluster = Cluster::start();
    wait_until("events-3 to lead", || cluster.node("events-3").is_leader()).await;

    cluster.network.disconnect("events-1");
    // Let the dark peer fall out of the health window so quorum shrinks
    // from 2-of-3 to 2-of-2
    sleep(Duration::from_millis(500)).await;

    let leader = cluster.node("events-3");
    leader
        .propose(Command::CreateGroup {
            name: "degraded".into(),
        })
        .await
        .unwrap();

    wait_until("the healthy follower to apply", || {
        cluster.store("events-2").view().has_group("degraded")
    })
    .await;
    assert!(!cluster.store("events-1").view().has_group("degraded"));

    // The rejoined peer catches up within a consistency cycle
    cluster.network.reconnect("events-1");
    wait_until("the rejoined peer to catch up", || {
        cluster.store("events-1").view().has_group("degraded")
    })
    .await;
    cluster.shutdown();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_failover_to_next_priority() {
    let cluster = Cluster::start();
    wait_until("events-3 to lead", || cluster.node("events-3").is_leader()).await;

    cluster.network.disconnect("events-3");
    wait_until("events-2 to take over", || {
        cluster.node("events-2").is_leader()
    })
    .await;
    sleep(Duration::from_millis(500)).await;

    cluster
        .node("events-2")
        .propose(Command::CreateUser {
            username: "grace".into(),
        })
        .await
        .unwrap();
    wait_until("the write to reach events-1", || {
        cluster.store("events-1").view().has_user("grace")
    })
    .await;

    // The old leader reclaims its seat on rejoin and picks up the write
    cluster.network.reconnect("events-3");
    wait_until("events-3 to reclaim leadership", || {
        cluster.node("events-3").is_leader()
    })
    .await;
    wait_until("events-3 to pick up the failover-era write", || {
        cluster.store("events-3").view().has_user("grace")
    })
    .await;
    cluster.shutdown();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_partition_heals_and_merges_divergent_writes() {
    let cluster = Cluster::start();
    wait_until("events-3 to lead", || cluster.node("events-3").is_leader()).await;

    // Shared prefix everyone holds
    cluster
        .node("events-3")
        .propose(Command::CreateUser {
            username: "seed".into(),
        })
        .await
        .unwrap();
    wait_until("the seed write to land everywhere", || {
        NODES
            .iter()
            .all(|(id, _)| cluster.store(id).view().has_user("seed"))
    })
    .await;

    // Isolate events-2; the majority side keeps committing
    cluster.network.disconnect("events-2");
    let majority = cluster.node("events-3");
    for name in ["major-1", "major-2"] {
        majority
            .propose(Command::CreateUser {
                username: name.into(),
            })
            .await
            .unwrap();
    }

    // The isolated node elects itself and accepts a write under a
    // quorum of one
    wait_until("events-2 to lead its own partition", || {
        cluster.node("events-2").is_leader()
    })
    .await;
    sleep(Duration::from_millis(500)).await;
    cluster
        .node("events-2")
        .propose(Command::CreateUser {
            username: "stray".into(),
        })
        .await
        .unwrap();

    // Heal: the highest-priority node reclaims leadership and the
    // reconciliation pass folds the stray write back in
    cluster.network.reconnect("events-2");
    wait_until("events-3 to lead again", || {
        cluster.node("events-3").is_leader()
    })
    .await;
    wait_until("every replica to hold all four writes", || {
        NODES.iter().all(|(id, _)| {
            let view = cluster.store(id).view();
            ["seed", "major-1", "major-2", "stray"]
                .iter()
                .all(|u| view.has_user(u))
        })
    })
    .await;

    // Logs converge to the same length as well
    wait_until("log lengths to converge", || {
        let lengths: Vec<usize> = cluster
            .nodes
            .iter()
            .map(|n| n.state_report().log_length)
            .collect();
        lengths.iter().all(|&l| l == lengths[0])
    })
    .await;
    cluster.shutdown();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_restart_preserves_log_and_membership() {
    init_logging();
    let dir = TempDir::new().unwrap();
    let network = InMemoryNetwork::new();
    let store = SharedScheduleStore::new();
    let node = RaftNode::new(
        shard_config(&dir, "solo-1", 10, vec![]),
        Box::new(store.clone()),
        network.transport_for("solo-1"),
    )
    .unwrap();
    network.register(Arc::clone(&node));
    node.start();

    wait_until("the single node to lead", || node.is_leader()).await;
    node.propose(Command::CreateGroup {
        name: "chess".into(),
    })
    .await
    .unwrap();
    node.propose(Command::CreateUser {
        username: "ada".into(),
    })
    .await
    .unwrap();
    wait_until("both writes applied", || store.view().has_user("ada")).await;

    node.add_peer(PeerSpec::new("solo-2", node_url("solo-2"), 20))
        .unwrap();
    let term_before = node.current_term();
    node.shutdown();
    sleep(Duration::from_millis(100)).await;

    // Same state file, fresh process
    let network = InMemoryNetwork::new();
    let store = SharedScheduleStore::new();
    let node = RaftNode::new(
        shard_config(&dir, "solo-1", 10, vec![]),
        Box::new(store.clone()),
        network.transport_for("solo-1"),
    )
    .unwrap();
    network.register(Arc::clone(&node));

    let report = node.state_report();
    assert_eq!(report.log_length, 2);
    assert_eq!(report.commit_index, 2);
    assert_eq!(report.last_applied, 2);
    assert!(node.current_term() >= term_before);

    // The applied watermark survives, so a fresh in-memory view is not
    // replayed; membership added at runtime survives too
    assert!(!store.view().has_user("ada"));
    assert_eq!(store.view().apply_count(), 0);
    node.remove_peer("solo-2").unwrap();
    node.shutdown();
}
