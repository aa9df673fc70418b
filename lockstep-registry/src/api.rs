//! Operator HTTP API for the registry.

use axum::Router;
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use serde::Serialize;

use crate::Registry;

#[derive(Serialize)]
struct Account {
    id: u32,
    balance: u64,
}

pub fn router(registry: Registry) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/accounts", get(accounts))
        .with_state(registry)
}

async fn health() -> &'static str {
    "ok"
}

async fn accounts(State(registry): State<Registry>) -> impl IntoResponse {
    let accounts: Vec<Account> = registry
        .accounts()
        .into_iter()
        .map(|(id, balance)| Account { id, balance })
        .collect();
    axum::Json(accounts)
}
