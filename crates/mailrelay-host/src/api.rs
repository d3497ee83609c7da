use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::Json;
use serde_json::{Value, json};

use crate::router::{OnlinePeer, PeerStatus, Relay};

/// GET /health - Liveness plus registry/queue sizes.
pub async fn health(State(relay): State<Arc<Relay>>) -> Json<Value> {
    let stats = relay.stats().await;
    Json(json!({
        "status": "ok",
        "online": stats.online,
        "queued": stats.queued,
    }))
}

/// GET {path}/peers - Everyone currently connected.
pub async fn list_peers(State(relay): State<Arc<Relay>>) -> Json<Vec<OnlinePeer>> {
    Json(relay.online_peers().await)
}

/// GET {path}/peers/{email} - Presence and pending mail for one identity.
pub async fn peer_status(
    State(relay): State<Arc<Relay>>,
    Path(email): Path<String>,
) -> Result<Json<PeerStatus>, (StatusCode, String)> {
    relay
        .peer_status(&email)
        .await
        .map(Json)
        .ok_or_else(|| (StatusCode::NOT_FOUND, format!("unknown peer: {email}")))
}
