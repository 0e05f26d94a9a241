//! HTTP RPC surface: thin wrappers over synchronous, thread-safe core
//! queries. JSON shapes live here, never in the core.

use crate::chain::chainstate::ChainstateManager;
use crate::consensus::params::Network;
use crate::metrics;
use crate::net::connman::ConnMan;
use crate::net::peer::ConnType;
use crate::primitives::Hash256;
use crate::timedata::unix_now;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tracing::info;

pub struct RpcState {
    pub chainstate: Arc<ChainstateManager>,
    pub connman: Arc<ConnMan>,
    pub network: Network,
    pub started_at: u64,
}

/// RPC errors carry a stable taxonomy code plus a human message.
#[derive(Debug)]
pub struct RpcError {
    pub status: StatusCode,
    pub code: &'static str,
    pub message: String,
}

impl RpcError {
    fn not_found(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            code,
            message: message.into(),
        }
    }

    fn bad_request(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            code,
            message: message.into(),
        }
    }
}

impl IntoResponse for RpcError {
    fn into_response(self) -> Response {
        let body = Json(json!({ "error": { "code": self.code, "message": self.message } }));
        (self.status, body).into_response()
    }
}

type RpcResult<T> = Result<Json<T>, RpcError>;

pub fn router(state: Arc<RpcState>) -> Router {
    Router::new()
        .route("/getinfo", get(getinfo))
        .route("/getblockcount", get(getblockcount))
        .route("/getblockhash/:height", get(getblockhash))
        .route("/getblockheader/:id", get(getblockheader))
        .route("/getbestblockhash", get(getbestblockhash))
        .route("/getpeerinfo", get(getpeerinfo))
        .route("/getnetworkinfo", get(getnetworkinfo))
        .route("/addnode", post(addnode))
        .route("/disconnectnode", post(disconnectnode))
        .route("/invalidateblock", post(invalidateblock))
        .route("/reconsiderblock", post(reconsiderblock))
        .route("/generate", post(generate))
        .route("/metrics", get(metrics_text))
        .with_state(state)
}

pub async fn serve(state: Arc<RpcState>, listener: tokio::net::TcpListener) {
    let app = router(state);
    if let Err(err) = axum::serve(listener, app).await {
        tracing::error!(%err, "rpc server stopped");
    }
}

async fn getinfo(State(state): State<Arc<RpcState>>) -> Json<serde_json::Value> {
    let tip = state.chainstate.tip();
    Json(json!({
        "version": env!("CARGO_PKG_VERSION"),
        "network": state.network.name(),
        "blocks": tip.height,
        "bestblockhash": tip.id.to_string(),
        "headers": state.chainstate.header_count(),
        "orphans": state.chainstate.orphan_count(),
        "peers": state.connman.peer_count(),
        "initial_download": state.chainstate.is_initial_download(),
        "uptime": unix_now().saturating_sub(state.started_at),
    }))
}

async fn getblockcount(State(state): State<Arc<RpcState>>) -> Json<u32> {
    Json(state.chainstate.tip().height)
}

async fn getbestblockhash(State(state): State<Arc<RpcState>>) -> Json<String> {
    Json(state.chainstate.tip().id.to_string())
}

async fn getblockhash(
    State(state): State<Arc<RpcState>>,
    Path(height): Path<u32>,
) -> RpcResult<String> {
    state
        .chainstate
        .block_hash_at(height)
        .map(|id| Json(id.to_string()))
        .ok_or_else(|| RpcError::not_found("block-height-out-of-range", "no block at that height"))
}

#[derive(Serialize)]
struct HeaderJson {
    hash: String,
    height: u32,
    version: i32,
    previousblockhash: String,
    miner: String,
    time: u32,
    bits: String,
    nonce: u32,
    pow_commitment: String,
    chainwork: String,
    on_active_chain: bool,
    failed: bool,
    failed_child: bool,
}

async fn getblockheader(
    State(state): State<Arc<RpcState>>,
    Path(id): Path<String>,
) -> RpcResult<HeaderJson> {
    let id: Hash256 = id
        .parse()
        .map_err(|_| RpcError::bad_request("bad-block-id", "malformed block id"))?;
    let info = state
        .chainstate
        .header_info(&id)
        .ok_or_else(|| RpcError::not_found("block-not-found", "unknown block id"))?;
    Ok(Json(HeaderJson {
        hash: info.id.to_string(),
        height: info.height,
        version: info.header.version,
        previousblockhash: info.header.prev_id.to_string(),
        miner: info.header.miner.to_string(),
        time: info.header.time,
        bits: format!("{:08x}", info.header.bits),
        nonce: info.header.nonce,
        pow_commitment: info.header.pow_commitment.to_string(),
        chainwork: format!("{}", info.chain_work),
        on_active_chain: info.on_active_chain,
        failed: info.failed,
        failed_child: info.failed_child,
    }))
}

async fn getpeerinfo(State(state): State<Arc<RpcState>>) -> Json<serde_json::Value> {
    Json(json!(state.connman.peer_stats()))
}

async fn getnetworkinfo(State(state): State<Arc<RpcState>>) -> Json<serde_json::Value> {
    Json(json!({
        "network": state.network.name(),
        "port": state.connman.cfg.port,
        "user_agent": state.connman.cfg.user_agent,
        "connections": state.connman.peer_count(),
        "known_addresses": state.connman.addrman_len(),
    }))
}

#[derive(Deserialize)]
struct AddNodeReq {
    addr: String,
}

async fn addnode(
    State(state): State<Arc<RpcState>>,
    Json(req): Json<AddNodeReq>,
) -> RpcResult<serde_json::Value> {
    let addr: std::net::SocketAddr = req
        .addr
        .parse()
        .map_err(|_| RpcError::bad_request("bad-address", "expected host:port"))?;
    let connman = Arc::clone(&state.connman);
    tokio::spawn(async move {
        connman.connect_outbound(addr, ConnType::Manual).await;
    });
    Ok(Json(json!({ "queued": addr.to_string() })))
}

#[derive(Deserialize)]
struct DisconnectReq {
    #[serde(default)]
    id: Option<u64>,
    #[serde(default)]
    addr: Option<String>,
}

async fn disconnectnode(
    State(state): State<Arc<RpcState>>,
    Json(req): Json<DisconnectReq>,
) -> RpcResult<serde_json::Value> {
    let peer = match (req.id, req.addr) {
        (Some(id), _) => state.connman.get_peer(id),
        (None, Some(addr)) => {
            let addr: std::net::SocketAddr = addr
                .parse()
                .map_err(|_| RpcError::bad_request("bad-address", "expected host:port"))?;
            state.connman.find_peer_by_addr(&addr)
        }
        (None, None) => {
            return Err(RpcError::bad_request("bad-request", "need id or addr"));
        }
    };
    let peer =
        peer.ok_or_else(|| RpcError::not_found("peer-not-found", "no such peer"))?;
    state.connman.disconnect_peer(&peer, "rpc disconnectnode");
    Ok(Json(json!({ "disconnected": peer.id })))
}

#[derive(Deserialize)]
struct BlockIdReq {
    id: String,
}

async fn invalidateblock(
    State(state): State<Arc<RpcState>>,
    Json(req): Json<BlockIdReq>,
) -> RpcResult<serde_json::Value> {
    let id: Hash256 = req
        .id
        .parse()
        .map_err(|_| RpcError::bad_request("bad-block-id", "malformed block id"))?;
    state
        .chainstate
        .invalidate(&id)
        .map_err(|e| RpcError::bad_request("invalidate-failed", e.to_string()))?;
    info!(block = %id, "block invalidated via rpc");
    Ok(Json(json!({ "invalidated": id.to_string(), "height": state.chainstate.tip().height })))
}

async fn reconsiderblock(
    State(state): State<Arc<RpcState>>,
    Json(req): Json<BlockIdReq>,
) -> RpcResult<serde_json::Value> {
    let id: Hash256 = req
        .id
        .parse()
        .map_err(|_| RpcError::bad_request("bad-block-id", "malformed block id"))?;
    state
        .chainstate
        .reconsider(&id)
        .map_err(|e| RpcError::bad_request("reconsider-failed", e.to_string()))?;
    state.chainstate.activate_best_chain();
    Ok(Json(json!({ "reconsidered": id.to_string(), "height": state.chainstate.tip().height })))
}

#[derive(Deserialize)]
struct GenerateReq {
    #[serde(default = "one")]
    count: u32,
}

fn one() -> u32 {
    1
}

/// Regtest-only: grind and accept `count` headers on the current tip.
async fn generate(
    State(state): State<Arc<RpcState>>,
    Json(req): Json<GenerateReq>,
) -> RpcResult<Vec<String>> {
    if state.network != Network::Regtest {
        return Err(RpcError::bad_request(
            "wrong-network",
            "generate is regtest-only",
        ));
    }
    let chainstate = Arc::clone(&state.chainstate);
    let count = req.count.min(1000);
    let ids = tokio::task::spawn_blocking(move || {
        let mut out = Vec::new();
        for _ in 0..count {
            let tip = chainstate.tip();
            let mut header = crate::primitives::header::BlockHeader {
                version: 1,
                prev_id: tip.id,
                miner: crate::primitives::Hash160::ZERO,
                time: unix_now().max(tip.time as u64 + 1) as u32,
                bits: chainstate.params().pow_limit_bits,
                nonce: 0,
                pow_commitment: Hash256::ZERO,
            };
            if chainstate.pow().mine_header(&mut header).is_err() {
                break;
            }
            if !chainstate.accept_header(&header, None).is_accepted() {
                break;
            }
            chainstate.activate_best_chain();
            out.push(header.id().to_string());
        }
        out
    })
    .await
    .map_err(|e| RpcError::bad_request("generate-failed", e.to_string()))?;
    Ok(Json(ids))
}

async fn metrics_text() -> String {
    metrics::gather_text()
}
