//! HTTP JSON RPC surface for the Tandem consensus layer
//!
//! Two halves, mirroring the node's two directions of traffic:
//!
//! - [`serve`] / [`serve_on`]: a hyper server exposing a node's `/raft/*`
//!   handlers to its peers and to the coordinator.
//! - [`HttpTransport`]: a reqwest client implementing the consensus
//!   crate's `RaftTransport`, used for every outbound RPC.
//!
//! Wire bodies are the serde structs from `tandem_consensus::rpc`,
//! serialized as-is.

mod client;
mod server;

pub use client::HttpTransport;
pub use server::{serve, serve_on};

/// Errors from the HTTP server side. Client-side failures surface as
/// `tandem_consensus::TransportError` through the transport trait.
#[derive(Debug, thiserror::Error)]
pub enum NetworkError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP client construction failed: {0}")]
    Client(#[from] reqwest::Error),
}
