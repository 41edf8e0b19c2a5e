//! Admin HTTP surface
//!
//! Two routes only: hex replay (re-inject a raw payload as if it had
//! arrived on the stream, with the sentinel offset and no cursor effect)
//! and a stats snapshot.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::json;
use tower_http::cors::CorsLayer;
use tracing::{info, warn};

use crate::store::SafeStore;
use crate::stream::receiver::TradeReceiver;

#[derive(Clone)]
pub struct AdminState {
    pub receiver: Arc<TradeReceiver>,
    pub store: Arc<SafeStore>,
}

pub fn router(state: AdminState) -> Router {
    Router::new()
        .route("/admin/replay/hex", post(replay_hex))
        .route("/admin/stats", get(stats))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn replay_hex(State(state): State<AdminState>, body: String) -> impl IntoResponse {
    let raw = match hex::decode(body.trim()) {
        Ok(raw) if !raw.is_empty() => raw,
        _ => {
            warn!("replay rejected: body is not valid hex");
            return (StatusCode::BAD_REQUEST, "Invalid Hex").into_response();
        }
    };

    info!(bytes = raw.len(), "admin replay accepted");
    let receiver = state.receiver.clone();
    // May block on backpressure; keep it off the async executor
    let joined = tokio::task::spawn_blocking(move || receiver.on_replay(&raw)).await;
    match joined {
        Ok(()) => (StatusCode::OK, "Replay injected into buffer.").into_response(),
        Err(_) => (StatusCode::INTERNAL_SERVER_ERROR, "Replay failed").into_response(),
    }
}

async fn stats(State(state): State<AdminState>) -> impl IntoResponse {
    let snapshot = match state.store.snapshot() {
        Ok(s) => s,
        Err(e) => {
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": e.to_string() })),
            )
                .into_response()
        }
    };
    let rx = state.receiver.stats();
    Json(json!({
        "receiver": {
            "received": rx.received.load(Ordering::Relaxed),
            "valid": rx.valid.load(Ordering::Relaxed),
            "invalid": rx.invalid.load(Ordering::Relaxed),
            "replayed": rx.replayed.load(Ordering::Relaxed),
        },
        "store": snapshot,
    }))
    .into_response()
}
