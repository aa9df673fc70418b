//! Operator HTTP API for a node.

use axum::Router;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use lockstep_core::{Amount, NodeId, Outcome, Transfer};
use serde::{Deserialize, Serialize};

use crate::actor::{HandleError, NodeHandle};

pub fn router(handle: NodeHandle) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/status", get(status))
        .route("/ledger", get(ledger))
        .route("/transfer", post(transfer))
        .with_state(handle)
}

async fn health() -> &'static str {
    "ok"
}

async fn status(State(handle): State<NodeHandle>) -> Response {
    match handle.status().await {
        Ok(status) => axum::Json(status).into_response(),
        Err(err) => unavailable(&err),
    }
}

async fn ledger(State(handle): State<NodeHandle>) -> Response {
    match handle.ledger().await {
        Ok(blocks) => axum::Json(blocks).into_response(),
        Err(err) => unavailable(&err),
    }
}

#[derive(Deserialize)]
struct TransferBody {
    dst: NodeId,
    amount: Amount,
}

#[derive(Serialize)]
struct TransferResult {
    outcome: &'static str,
}

/// Initiate a transfer and wait for its outcome. When a peer is
/// unreachable the request stalls with the protocol — that is the
/// operator's signal, alongside `unreachable_peers` in `/status`.
async fn transfer(
    State(handle): State<NodeHandle>,
    axum::Json(body): axum::Json<TransferBody>,
) -> Response {
    match handle
        .transfer(Transfer {
            dst: body.dst,
            amount: body.amount,
        })
        .await
    {
        Ok(Outcome::Committed) => axum::Json(TransferResult {
            outcome: "committed",
        })
        .into_response(),
        Ok(Outcome::Aborted) => axum::Json(TransferResult { outcome: "aborted" }).into_response(),
        Err(HandleError::Rejected(err)) => {
            (StatusCode::CONFLICT, err.to_string()).into_response()
        }
        Err(err @ HandleError::Closed) => unavailable(&err),
    }
}

fn unavailable(err: &HandleError) -> Response {
    (StatusCode::SERVICE_UNAVAILABLE, err.to_string()).into_response()
}
