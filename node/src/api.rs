use std::convert::Infallible;
use std::net::SocketAddr;

use http_body_util::Full;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{body::Bytes, Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde_json::json;
use tokio::net::TcpListener;

use ringdir_lib::{ChunkId, NodeId};

use crate::network_client::NetworkClient;
use crate::node::LookupNode;
use crate::storage::StorageBackend;

fn format_response(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(body.into()));
    *response.status_mut() = status;
    response.headers_mut().insert(
        hyper::header::CONTENT_TYPE,
        hyper::header::HeaderValue::from_static("application/json"),
    );
    response
}

fn error(status: StatusCode, message: impl std::fmt::Display) -> Response<Full<Bytes>> {
    format_response(status, json!({ "error": message.to_string() }).to_string())
}

fn not_found() -> Response<Full<Bytes>> {
    error(StatusCode::NOT_FOUND, "Not Found")
}

fn ping() -> Response<Full<Bytes>> {
    format_response(StatusCode::OK, json!({ "message": "pong" }).to_string())
}

fn overlay<T: NetworkClient, S: StorageBackend>(node: &LookupNode<T, S>) -> Response<Full<Bytes>> {
    let ring = node.ring();
    let body = json!({
        "node_id": node.me,
        "stats": node.stats(),
        "predecessor": ring.predecessor(),
        "successor": ring.successor(),
        "superpeers": ring.superpeers(),
        "peers": ring.peers(),
    });
    format_response(StatusCode::OK, body.to_string())
}

/// Chunk IDs are accepted in decimal or as `0x`-prefixed hex.
fn parse_chunk_id(raw: &str) -> Option<ChunkId> {
    match raw.strip_prefix("0x") {
        Some(hex) => ChunkId::from_str_radix(hex, 16).ok(),
        None => raw.parse().ok(),
    }
}

async fn chunk<T: NetworkClient, S: StorageBackend>(
    node: &LookupNode<T, S>,
    raw: &str,
) -> Response<Full<Bytes>> {
    let Some(chunk) = parse_chunk_id(raw) else {
        return error(StatusCode::BAD_REQUEST, format!("invalid chunk ID {}", raw));
    };
    match node.get(chunk).await {
        Ok(Some(locations)) => format_response(StatusCode::OK, json!(locations).to_string()),
        Ok(None) => not_found(),
        Err(e) => error(StatusCode::SERVICE_UNAVAILABLE, e),
    }
}

async fn backups<T: NetworkClient, S: StorageBackend>(
    node: &LookupNode<T, S>,
    raw: &str,
) -> Response<Full<Bytes>> {
    let Ok(id) = raw.parse::<u16>() else {
        return error(StatusCode::BAD_REQUEST, format!("invalid node ID {}", raw));
    };
    match node.get_all_backup_ranges(NodeId(id)).await {
        Ok(ranges) => format_response(StatusCode::OK, json!(ranges).to_string()),
        Err(e) => error(StatusCode::SERVICE_UNAVAILABLE, e),
    }
}

async fn handler<T: NetworkClient, S: StorageBackend>(
    node: LookupNode<T, S>,
    req: Request<hyper::body::Incoming>,
) -> Result<Response<Full<Bytes>>, Infallible> {
    if req.method() != Method::GET {
        return Ok(not_found());
    }
    let path = req.uri().path();
    let response = match path {
        "/ping" => ping(),
        "/overlay" => overlay(&node),
        _ => {
            if let Some(raw) = path.strip_prefix("/chunks/") {
                chunk(&node, raw).await
            } else if let Some(raw) = path.strip_prefix("/backups/") {
                backups(&node, raw).await
            } else {
                not_found()
            }
        }
    };
    Ok(response)
}

/// Serves the read-only introspection API on `port`.
pub async fn run<T: NetworkClient, S: StorageBackend>(
    node: LookupNode<T, S>,
    port: u16,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let addr: SocketAddr = ([127, 0, 0, 1], port).into();
    let listener = TcpListener::bind(addr).await?;

    log_info!(node.me, "API is listening on http://{}", addr);
    loop {
        let (tcp, _) = listener.accept().await?;
        let io = TokioIo::new(tcp);
        let node = node.clone();
        tokio::task::spawn(async move {
            let service = service_fn(move |req| handler(node.clone(), req));
            if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
                log::warn!("Error serving API connection: {:?}", err);
            }
        });
    }
}
