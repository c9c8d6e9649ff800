//! Hyper server exposing a node's `/raft/*` endpoints

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use tandem_consensus::{
    AppendEntriesRequest, ChallengeRequest, HeartbeatPing, RaftNode, RequestVoteRequest,
    VictoryAnnouncement,
};

use crate::NetworkError;

async fn read_json<T: DeserializeOwned>(req: Request<Incoming>) -> Result<T, String> {
    let bytes = req
        .into_body()
        .collect()
        .await
        .map(|c| c.to_bytes())
        .map_err(|e| e.to_string())?;
    serde_json::from_slice(&bytes).map_err(|e| e.to_string())
}

fn json_response<T: Serialize>(status: StatusCode, body: &T) -> Response<String> {
    let json = serde_json::to_string(body).unwrap_or_else(|_| "{}".to_string());
    match Response::builder()
        .status(status)
        .header("content-type", "application/json")
        .body(json)
    {
        Ok(resp) => resp,
        Err(_) => Response::new(String::new()),
    }
}

fn error_response(status: StatusCode, msg: &str) -> Response<String> {
    json_response(status, &serde_json::json!({ "error": msg }))
}

fn query_param<'a>(query: Option<&'a str>, key: &str) -> Option<&'a str> {
    query?
        .split('&')
        .filter_map(|pair| pair.split_once('='))
        .find(|(k, _)| *k == key)
        .map(|(_, v)| v)
}

async fn route(node: Arc<RaftNode>, req: Request<Incoming>) -> Result<Response<String>, Infallible> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let query = req.uri().query().map(str::to_string);

    let response = match (method, path.as_str()) {
        (Method::POST, "/raft/request_vote") => {
            match read_json::<RequestVoteRequest>(req).await {
                Ok(body) => json_response(StatusCode::OK, &node.handle_request_vote(&body)),
                Err(e) => error_response(StatusCode::BAD_REQUEST, &e),
            }
        }

        (Method::POST, "/raft/append_entries") => {
            match read_json::<AppendEntriesRequest>(req).await {
                Ok(body) => json_response(StatusCode::OK, &node.handle_append_entries(&body)),
                Err(e) => error_response(StatusCode::BAD_REQUEST, &e),
            }
        }

        (Method::POST, "/raft/heartbeat") => match read_json::<HeartbeatPing>(req).await {
            Ok(body) => json_response(StatusCode::OK, &node.handle_heartbeat(&body)),
            Err(e) => error_response(StatusCode::BAD_REQUEST, &e),
        },

        (Method::POST, "/raft/bully/challenge") => {
            match read_json::<ChallengeRequest>(req).await {
                Ok(body) => json_response(StatusCode::OK, &node.handle_challenge(&body)),
                Err(e) => error_response(StatusCode::BAD_REQUEST, &e),
            }
        }

        (Method::POST, "/raft/bully/victory") => {
            match read_json::<VictoryAnnouncement>(req).await {
                Ok(body) => json_response(StatusCode::OK, &node.handle_victory(&body)),
                Err(e) => error_response(StatusCode::BAD_REQUEST, &e),
            }
        }

        (Method::GET, "/raft/sync") => {
            let follower = query_param(query.as_deref(), "follower").unwrap_or("unknown");
            json_response(StatusCode::OK, &node.handle_log_sync(follower))
        }

        (Method::GET, "/raft/log/summary") => json_response(StatusCode::OK, &node.log_summary()),

        (Method::GET, "/raft/log/full") => json_response(StatusCode::OK, &node.full_log()),

        (Method::GET, "/raft/state") => json_response(StatusCode::OK, &node.state_report()),

        _ => error_response(StatusCode::NOT_FOUND, "not found"),
    };

    Ok(response)
}

/// Bind and serve a node's RPC surface until the token is cancelled.
pub async fn serve(
    node: Arc<RaftNode>,
    addr: SocketAddr,
    cancel: CancellationToken,
) -> Result<(), NetworkError> {
    let listener = TcpListener::bind(addr).await?;
    serve_on(node, listener, cancel).await
}

/// Serve on an already-bound listener. Tests bind port 0 and read the
/// local address before handing the listener over.
pub async fn serve_on(
    node: Arc<RaftNode>,
    listener: TcpListener,
    cancel: CancellationToken,
) -> Result<(), NetworkError> {
    let addr = listener.local_addr()?;
    info!(node_id = %node.id(), %addr, "raft rpc server listening");

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, remote) = accepted?;
                debug!(%remote, "accepted connection");
                let node = Arc::clone(&node);
                let service = hyper::service::service_fn(move |req| {
                    let node = Arc::clone(&node);
                    async move { route(node, req).await }
                });
                tokio::spawn(async move {
                    let conn = hyper::server::conn::http1::Builder::new()
                        .serve_connection(TokioIo::new(stream), service);
                    if let Err(err) = conn.await {
                        warn!(error = %err, "rpc connection error");
                    }
                });
            }
            _ = cancel.cancelled() => {
                info!(node_id = %node.id(), "raft rpc server shutting down");
                return Ok(());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_query_param() {
        assert_eq!(
            query_param(Some("follower=events-2"), "follower"),
            Some("events-2")
        );
        assert_eq!(
            query_param(Some("a=1&follower=events-2&b=2"), "follower"),
            Some("events-2")
        );
        assert_eq!(query_param(Some("a=1"), "follower"), None);
        assert_eq!(query_param(None, "follower"), None);
    }
}
