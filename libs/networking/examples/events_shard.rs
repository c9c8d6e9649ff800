//! One replica of a Tandem schedule shard, served over HTTP.
//!
//! Wires a consensus node to the in-memory schedule store and exposes the
//! Raft RPC surface on the given address. Start three of these to get a
//! replicated shard:
//!
//! Run with:
//!   cargo run --example events_shard -- --node-id events-1 \
//!     --listen 127.0.0.1:7101 --priority 10 \
//!     --peer events-2,http://127.0.0.1:7102,20 \
//!     --peer events-3,http://127.0.0.1:7103,30
//!
//! The highest-priority replica takes leadership shortly after startup.
//! Poke `GET /raft/state` on any replica to watch the cluster settle.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tandem_consensus::{PeerSpec, RaftConfig, RaftNode, SharedScheduleStore};
use tandem_networking::{serve, HttpTransport};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(author, version, about = "One replica of a Tandem schedule shard")]
struct Opt {
    /// Logical node id, e.g. events-1
    #[arg(long)]
    node_id: String,

    /// Address to bind the RPC listener on
    #[arg(long)]
    listen: SocketAddr,

    /// Base URL peers use to reach this node (defaults to http://<listen>)
    #[arg(long)]
    public_url: Option<String>,

    /// Election priority; must be distinct per replica within the shard
    #[arg(long)]
    priority: u64,

    /// Shard this replica belongs to
    #[arg(long, default_value = "events")]
    shard: String,

    /// Path of the JSON state file (defaults to ./<node-id>.state.json)
    #[arg(long)]
    state_path: Option<PathBuf>,

    /// Peer replica as `id,url,priority`; repeat once per peer
    #[arg(long = "peer", value_parser = parse_peer)]
    peers: Vec<PeerSpec>,

    /// Replication fan-out per write, counting this node
    #[arg(long, default_value_t = 3)]
    replication_factor: usize,

    /// Timeout for outbound RPCs, in milliseconds
    #[arg(long, default_value_t = 3000)]
    rpc_timeout_ms: u64,
}

fn parse_peer(raw: &str) -> Result<PeerSpec, String> {
    let mut parts = raw.splitn(3, ',');
    let (Some(id), Some(url), Some(priority)) = (parts.next(), parts.next(), parts.next()) else {
        return Err(format!("expected `id,url,priority`, got `{raw}`"));
    };
    let priority: u64 = priority
        .trim()
        .parse()
        .map_err(|e| format!("bad priority in `{raw}`: {e}"))?;
    Ok(PeerSpec::new(id.trim(), url.trim(), priority))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let opt = Opt::parse();

    let public_url = opt
        .public_url
        .clone()
        .unwrap_or_else(|| format!("http://{}", opt.listen));
    let state_path = opt
        .state_path
        .clone()
        .unwrap_or_else(|| PathBuf::from(format!("{}.state.json", opt.node_id)));

    let config = RaftConfig::builder()
        .node_id(opt.node_id.as_str())
        .shard(opt.shard.as_str())
        .public_url(public_url)
        .priority(opt.priority)
        .peers(opt.peers.clone())
        .replication_factor(opt.replication_factor)
        .state_path(state_path)
        .rpc_timeout(Duration::from_millis(opt.rpc_timeout_ms))
        .build();

    let store = SharedScheduleStore::new();
    let transport = Arc::new(HttpTransport::new(Duration::from_millis(opt.rpc_timeout_ms))?);
    let node = RaftNode::new(config, Box::new(store.clone()), transport)?;

    node.start();
    let server = tokio::spawn(serve(node.clone(), opt.listen, node.cancellation_token()));

    tokio::signal::ctrl_c().await?;
    node.shutdown();
    server.await??;

    Ok(())
}
