//! HTTP RPC surface (axum).
//!
//! Serves the same endpoints the production seed exposes so any node can
//! act as a sync source for its peers, plus the farmer-facing challenge
//! and submission hooks and the operator views.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};

use crate::block::{hash_block, parse_hash32, Block, BlockJson, ProofJson, TxJson};
use crate::context::NodeContext;
use crate::error::NodeError;
use crate::metrics;

pub fn router(ctx: Arc<NodeContext>) -> Router {
    let cors = CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any);
    Router::new()
        .route("/status", get(get_status))
        .route("/chainTip", get(get_chain_tip))
        .route("/blocks/range", get(get_blocks_range))
        .route("/blocks/recent", get(get_recent_blocks))
        .route("/block/:height", get(get_block_by_height))
        .route("/challenge", get(get_challenge))
        .route("/submitBlock", post(submit_block))
        .route("/tx", post(submit_tx))
        .route("/health", get(get_health))
        .route("/metrics", get(get_metrics))
        .route("/peers", get(get_peers))
        .layer(cors)
        .with_state(ctx)
}

// =================== DTOs ===================

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct StatusResponse {
    height: u64,
    difficulty: u64,
    tip_hash: String,
}

/// The production seed emits string-encoded numbers here; keep the shape.
#[derive(Debug, Serialize)]
struct ChainTipResponse {
    height: String,
    difficulty: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct BlocksRangeResponse {
    blocks: Vec<BlockJson>,
    tip_height: u64,
    eof: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockSummary {
    pub height: u64,
    pub hash: String,
    pub timestamp: i64,
    pub difficulty: u64,
    pub farmer_addr: String,
    pub tx_count: usize,
    pub txs: Vec<TxJson>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockDetail {
    pub height: u64,
    pub hash: String,
    pub prev_hash: String,
    pub timestamp: i64,
    pub difficulty: u64,
    pub challenge: String,
    pub farmer_addr: String,
    pub tx_count: usize,
    pub txs: Vec<TxJson>,
}

impl BlockSummary {
    fn from_block(b: &Block) -> Self {
        BlockSummary {
            height: b.height,
            hash: hex::encode(hash_block(b)),
            timestamp: b.timestamp,
            difficulty: b.difficulty,
            farmer_addr: b.farmer_addr.clone(),
            tx_count: b.txs.len(),
            txs: b.txs.iter().map(TxJson::from).collect(),
        }
    }
}

impl BlockDetail {
    fn from_block(b: &Block) -> Self {
        BlockDetail {
            height: b.height,
            hash: hex::encode(hash_block(b)),
            prev_hash: hex::encode(b.prev_hash),
            timestamp: b.timestamp,
            difficulty: b.difficulty,
            challenge: hex::encode(b.challenge),
            farmer_addr: b.farmer_addr.clone(),
            tx_count: b.txs.len(),
            txs: b.txs.iter().map(TxJson::from).collect(),
        }
    }
}

#[derive(Debug, Serialize)]
struct VdfBundle {
    seed: String,
    iterations: u64,
    output: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ChallengeResponse {
    challenge: String,
    difficulty: u64,
    height: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    vdf: Option<VdfBundle>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SubmitBlockBody {
    proof: ProofJson,
    farmer_addr: String,
    farmer_pub_key: String,
    #[serde(default)]
    #[allow(dead_code)]
    vdf_seed: Option<String>,
    #[serde(default)]
    #[allow(dead_code)]
    vdf_iterations: Option<u64>,
    #[serde(default)]
    #[allow(dead_code)]
    vdf_output: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RangeParams {
    #[serde(default)]
    from: u64,
    #[serde(default)]
    limit: u32,
}

#[derive(Debug, Deserialize)]
struct RecentParams {
    #[serde(default = "default_recent_count")]
    count: usize,
}

fn default_recent_count() -> usize {
    10
}

fn error_status(e: &NodeError) -> StatusCode {
    match e {
        NodeError::ShuttingDown => StatusCode::SERVICE_UNAVAILABLE,
        NodeError::Rejected(_)
        | NodeError::InvalidProof(_)
        | NodeError::InvalidTransaction(_)
        | NodeError::Codec(_) => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn err_response(e: NodeError) -> (StatusCode, Json<ErrorBody>) {
    (error_status(&e), Json(ErrorBody { error: e.to_string() }))
}

// =================== Handlers ===================

async fn get_status(State(ctx): State<Arc<NodeContext>>) -> impl IntoResponse {
    let guard = ctx.state.read();
    match guard.as_ref() {
        Some(state) => {
            let (height, difficulty, tip_hash) = state.get_status();
            Json(StatusResponse { height, difficulty, tip_hash: hex::encode(tip_hash) })
                .into_response()
        }
        None => err_response(NodeError::ShuttingDown).into_response(),
    }
}

async fn get_chain_tip(State(ctx): State<Arc<NodeContext>>) -> impl IntoResponse {
    let guard = ctx.state.read();
    match guard.as_ref() {
        Some(state) => {
            let (height, difficulty, _) = state.get_status();
            Json(ChainTipResponse {
                height: height.to_string(),
                difficulty: difficulty.to_string(),
            })
            .into_response()
        }
        None => err_response(NodeError::ShuttingDown).into_response(),
    }
}

async fn get_blocks_range(
    State(ctx): State<Arc<NodeContext>>,
    Query(params): Query<RangeParams>,
) -> impl IntoResponse {
    let guard = ctx.state.read();
    match guard.as_ref() {
        Some(state) => {
            let (blocks, tip_height, eof) = state.blocks_range(params.from, params.limit);
            Json(BlocksRangeResponse { blocks, tip_height, eof }).into_response()
        }
        None => err_response(NodeError::ShuttingDown).into_response(),
    }
}

async fn get_recent_blocks(
    State(ctx): State<Arc<NodeContext>>,
    Query(params): Query<RecentParams>,
) -> impl IntoResponse {
    let guard = ctx.state.read();
    match guard.as_ref() {
        Some(state) => {
            let blocks: Vec<BlockSummary> = state
                .recent_blocks(params.count.min(100))
                .iter()
                .map(BlockSummary::from_block)
                .collect();
            Json(blocks).into_response()
        }
        None => err_response(NodeError::ShuttingDown).into_response(),
    }
}

async fn get_block_by_height(
    State(ctx): State<Arc<NodeContext>>,
    Path(height): Path<u64>,
) -> impl IntoResponse {
    let guard = ctx.state.read();
    match guard.as_ref() {
        Some(state) => match state.block_at(height) {
            Some(block) => Json(BlockDetail::from_block(block)).into_response(),
            None => (
                StatusCode::NOT_FOUND,
                Json(ErrorBody {
                    error: format!(
                        "block {height} not found (tip: {})",
                        state.current_height()
                    ),
                }),
            )
                .into_response(),
        },
        None => err_response(NodeError::ShuttingDown).into_response(),
    }
}

async fn get_challenge(State(ctx): State<Arc<NodeContext>>) -> impl IntoResponse {
    let guard = ctx.state.read();
    match guard.as_ref() {
        Some(state) => {
            let (challenge, difficulty, height) = state.get_current_challenge();
            let vdf = state.current_vdf().map(|v| VdfBundle {
                seed: hex::encode(&v.seed),
                iterations: v.iterations,
                output: hex::encode(&v.output),
            });
            Json(ChallengeResponse { challenge: hex::encode(challenge), difficulty, height, vdf })
                .into_response()
        }
        None => err_response(NodeError::ShuttingDown).into_response(),
    }
}

async fn submit_block(
    State(ctx): State<Arc<NodeContext>>,
    Json(body): Json<SubmitBlockBody>,
) -> impl IntoResponse {
    let result = (|| -> Result<u64, NodeError> {
        let challenge = parse_hash32(&body.proof.challenge)?;
        let proof = body.proof.clone().into_proof(challenge)?;
        let pubkey = hex::decode(&body.farmer_pub_key)
            .map_err(|_| NodeError::Rejected("invalid farmerPubKey hex".into()))?;

        let mut guard = ctx.state.write();
        let state = guard.as_mut().ok_or(NodeError::ShuttingDown)?;
        state.accept_block(proof, &body.farmer_addr, &pubkey)
    })();

    match result {
        Ok(height) => Json(serde_json::json!({ "accepted": true, "height": height })).into_response(),
        Err(e) => err_response(e).into_response(),
    }
}

async fn submit_tx(
    State(ctx): State<Arc<NodeContext>>,
    Json(body): Json<TxJson>,
) -> impl IntoResponse {
    let result = (|| -> Result<(), NodeError> {
        let tx = body.into_transaction()?;
        let guard = ctx.state.read();
        let state = guard.as_ref().ok_or(NodeError::ShuttingDown)?;
        state.validate_transaction(&tx)?;
        state.mempool().add(tx)
    })();

    match result {
        Ok(()) => Json(serde_json::json!({ "queued": true })).into_response(),
        Err(e) => err_response(e).into_response(),
    }
}

async fn get_health(State(ctx): State<Arc<NodeContext>>) -> impl IntoResponse {
    let guard = ctx.state.read();
    match guard.as_ref() {
        Some(state) => Json(state.health_stats()).into_response(),
        None => err_response(NodeError::ShuttingDown).into_response(),
    }
}

async fn get_metrics() -> impl IntoResponse {
    metrics::gather()
}

async fn get_peers(State(ctx): State<Arc<NodeContext>>) -> impl IntoResponse {
    Json(serde_json::json!({
        "connected": Vec::<String>::new(),
        "known": ctx.config.bootnodes.clone(),
        "banned": ctx.gate.banned_peers(),
    }))
}
