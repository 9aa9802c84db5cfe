pub mod plugins;
pub mod registry;
pub mod router;
pub mod socket;
pub mod state;

use axum::{
    extract::{ConnectInfo, State, WebSocketUpgrade},
    response::IntoResponse,
    routing::get,
    Router,
};
use state::HubState;
use std::net::SocketAddr;
use std::sync::Arc;

pub fn app(hub: Arc<HubState>) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(|| async { "ok" }))
        .with_state(hub)
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    State(hub): State<Arc<HubState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| async move {
        socket::handle_socket(hub, socket, addr).await;
    })
}
