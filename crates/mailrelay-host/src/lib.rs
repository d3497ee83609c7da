pub mod api;
pub mod config;
pub mod error;
pub mod queue;
pub mod registry;
pub mod router;
pub mod ws;

use std::sync::Arc;

use axum::routing::get;

pub use config::RelayConfig;
pub use error::RelayError;
pub use router::Relay;

/// HTTP surface of a relay: the WebSocket endpoint plus the status API
/// mounted under the same path.
pub fn app(relay: Arc<Relay>) -> axum::Router {
    let path = relay.config().path.trim_end_matches('/').to_string();
    axum::Router::new()
        .route("/health", get(api::health))
        .route(&path, get(ws::ws_handler))
        .route(&format!("{path}/peers"), get(api::list_peers))
        .route(&format!("{path}/peers/{{email}}"), get(api::peer_status))
        .with_state(relay)
}
