use crate::registry::{heartbeat_ack, Peer, PeerRole, PeerStatus};
use crate::router;
use crate::state::HubState;
use axum::extract::ws::{Message, WebSocket};
use chrono::Utc;
use scf_core::response::codes;
use scf_core::wire::{decode_envelope, Envelope, ErrorPayload, Msg, WelcomePayload};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

const WRITE_TIMEOUT: Duration = Duration::from_secs(5);
const OUTBOUND_QUEUE: usize = 256;

pub async fn handle_socket(hub: Arc<HubState>, socket: WebSocket, remote: SocketAddr) {
    use futures_util::{SinkExt, StreamExt};

    let (mut ws_sender, mut ws_receiver) = socket.split();
    let (tx, mut rx) = mpsc::channel::<Message>(OUTBOUND_QUEUE);
    let write_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            let is_close = matches!(msg, Message::Close(_));
            let send = ws_sender.send(msg);
            match tokio::time::timeout(WRITE_TIMEOUT, send).await {
                Ok(Ok(())) => {}
                _ => return,
            }
            if is_close {
                return;
            }
        }
    });

    let peer_id = hub.registry.next_peer_id();
    let peer = Arc::new(Peer::new(peer_id, tx.clone()));
    hub.registry.insert(peer.clone()).await;
    info!(event = "peer_connected", peer_id = peer_id, remote = %remote);

    let welcome = Envelope::new(
        hub.next_envelope_id(),
        Msg::Welcome(WelcomePayload {
            peer_id,
            server_time: Utc::now().to_rfc3339(),
        }),
    );
    peer.send_envelope(&welcome).await;

    start_ping(hub.clone(), peer.clone());

    let mut close_reason = "disconnect";
    while let Some(result) = ws_receiver.next().await {
        let msg = match result {
            Ok(value) => value,
            Err(err) => {
                warn!(event = "read_error", peer_id = peer_id, error = %err);
                close_reason = "read_error";
                break;
            }
        };
        let data = match msg {
            Message::Text(text) => text.into_bytes(),
            Message::Binary(bytes) => bytes,
            Message::Close(_) => {
                info!(event = "peer_close", peer_id = peer_id);
                break;
            }
            Message::Pong(_) => {
                peer.record_pong().await;
                continue;
            }
            Message::Ping(_) => {
                peer.touch().await;
                continue;
            }
        };
        if data.len() > hub.max_frame_bytes {
            warn!(event = "frame_too_large", peer_id = peer_id, size = data.len());
            send_terminal_error(&peer, "PROTOCOL_ERROR", "frame exceeds max size").await;
            close_reason = "frame_too_large";
            break;
        }
        let envelope = match decode_envelope(&data, hub.max_frame_bytes) {
            Ok(value) => value,
            Err(err) => {
                warn!(event = "frame_invalid", peer_id = peer_id, error = %err);
                send_terminal_error(&peer, "PROTOCOL_ERROR", &err.to_string()).await;
                close_reason = "frame_invalid";
                break;
            }
        };
        peer.touch().await;
        handle_envelope(&hub, &peer, envelope).await;
    }

    teardown(&hub, &peer, close_reason).await;
    drop(tx);
    let _ = write_task.await;
}

async fn handle_envelope(hub: &Arc<HubState>, peer: &Arc<Peer>, envelope: Envelope) {
    let role = {
        let state = peer.state.lock().await;
        state.role
    };
    match envelope.msg {
        Msg::Register(payload) => {
            if payload.identity.trim().is_empty() {
                send_error(peer, "invalid_register", "identity must not be empty").await;
                return;
            }
            let evicted = hub
                .registry
                .bind_endpoint(peer, &payload.identity, payload.capabilities)
                .await;
            if let Some(old) = evicted {
                evict(hub, &old).await;
            }
            let ack = Envelope::new(
                envelope.id,
                Msg::Welcome(WelcomePayload {
                    peer_id: peer.peer_id,
                    server_time: Utc::now().to_rfc3339(),
                }),
            );
            peer.send_envelope(&ack).await;
        }
        Msg::Heartbeat(_) => {
            // Echo with the sender's id so it can compute RTT.
            peer.send_envelope(&heartbeat_ack(&envelope.id)).await;
        }
        Msg::Command(command) => {
            if role != PeerRole::Admin {
                warn!(event = "role_violation", peer_id = peer.peer_id, command = %command.command);
                send_error(peer, "role_violation", "admin role required").await;
                return;
            }
            router::dispatch_admin(hub, peer, &envelope.id, command).await;
        }
        Msg::Response(response) => {
            if role != PeerRole::Endpoint {
                warn!(event = "role_violation", peer_id = peer.peer_id);
                send_error(peer, "role_violation", "endpoint role required").await;
                return;
            }
            hub.router.on_response(hub, peer, &envelope.id, response).await;
        }
        Msg::Event(event) => {
            info!(
                event = "endpoint_event",
                peer_id = peer.peer_id,
                kind = %event.kind,
                data = %event.data
            );
        }
        Msg::Welcome(_) | Msg::Error(_) => {
            debug!(event = "unexpected_envelope", peer_id = peer.peer_id, r#type = envelope.type_name());
        }
    }
}

async fn evict(hub: &Arc<HubState>, old: &Arc<Peer>) {
    warn!(event = "endpoint_evicted", peer_id = old.peer_id);
    let notice = Envelope::new(
        hub.next_envelope_id(),
        Msg::Error(ErrorPayload {
            code: codes::EVICTED.to_string(),
            message: "identity re-registered from another connection".to_string(),
        }),
    );
    old.send_envelope(&notice).await;
    hub.router
        .fail_endpoint_pending(hub, old.peer_id, codes::DISCONNECT)
        .await;
    old.close("evicted").await;
    hub.registry.remove(old.peer_id).await;
}

async fn teardown(hub: &Arc<HubState>, peer: &Arc<Peer>, reason: &str) {
    let was_endpoint = {
        let state = peer.state.lock().await;
        state.role == PeerRole::Endpoint
    };
    if hub.registry.remove(peer.peer_id).await.is_some() {
        info!(
            event = "peer_disconnected",
            peer_id = peer.peer_id,
            reason = reason
        );
    }
    if was_endpoint {
        hub.router
            .fail_endpoint_pending(hub, peer.peer_id, codes::DISCONNECT)
            .await;
    }
}

async fn send_error(peer: &Arc<Peer>, code: &str, message: &str) {
    let envelope = Envelope::new(
        format!("err-{}", peer.peer_id),
        Msg::Error(ErrorPayload {
            code: code.to_string(),
            message: message.to_string(),
        }),
    );
    peer.send_envelope(&envelope).await;
}

async fn send_terminal_error(peer: &Arc<Peer>, code: &str, message: &str) {
    send_error(peer, code, message).await;
    peer.close(code).await;
}

fn start_ping(hub: Arc<HubState>, peer: Arc<Peer>) {
    let interval = Duration::from_secs(hub.config.heartbeat.interval_s);
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            {
                let mut state = peer.state.lock().await;
                if state.status != PeerStatus::Connected {
                    return;
                }
                state.ping_sent = Some(std::time::Instant::now());
            }
            if peer.sender.send(Message::Ping(Vec::new())).await.is_err() {
                return;
            }
        }
    });
}

/// Marks endpoints silent past the stale threshold, fails their pending
/// commands, and closes them. The threshold is heartbeat interval times
/// the configured stale multiplier.
pub fn start_stale_reaper(hub: Arc<HubState>) {
    let threshold = Duration::from_secs_f64(hub.config.stale_threshold_s());
    let interval = threshold / 2;
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            for peer in hub.registry.all_peers().await {
                let (is_endpoint, last) = {
                    let state = peer.state.lock().await;
                    (state.role == PeerRole::Endpoint, state.last_heartbeat)
                };
                if !is_endpoint || last.elapsed() <= threshold {
                    continue;
                }
                warn!(event = "endpoint_stale", peer_id = peer.peer_id);
                {
                    let mut state = peer.state.lock().await;
                    state.status = PeerStatus::Stale;
                }
                hub.router
                    .fail_endpoint_pending(&hub, peer.peer_id, codes::STALE_ENDPOINT)
                    .await;
                peer.close("stale").await;
                hub.registry.remove(peer.peer_id).await;
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use scf_core::Config;
    use serde_json::json;
    use std::time::Instant;

    #[tokio::test]
    async fn silent_endpoint_is_reaped_and_pending_fails_stale() {
        let mut config = Config::default();
        config.heartbeat.interval_s = 1;
        config.heartbeat.stale_multiplier = 1.0;
        let hub = Arc::new(HubState::new(config));

        let (admin_tx, mut admin_rx) = mpsc::channel(16);
        let admin = Arc::new(Peer::new(hub.registry.next_peer_id(), admin_tx));
        hub.registry.insert(admin.clone()).await;

        let (endpoint_tx, _endpoint_rx) = mpsc::channel(16);
        let endpoint = Arc::new(Peer::new(hub.registry.next_peer_id(), endpoint_tx));
        hub.registry.insert(endpoint.clone()).await;
        hub.registry
            .bind_endpoint(&endpoint, "quiet", vec!["echo".to_string()])
            .await;

        hub.router
            .forward(
                &hub,
                &admin,
                "s1",
                json!({"target_identity": "quiet", "inner_command": "echo", "timeout_s": 30.0}),
            )
            .await;
        assert_eq!(hub.router.pending_count().await, 1);

        // Backdate the endpoint far past the one-second threshold.
        {
            let mut state = endpoint.state.lock().await;
            state.last_heartbeat = Instant::now()
                .checked_sub(Duration::from_secs(30))
                .expect("backdate");
        }
        start_stale_reaper(hub.clone());

        let envelope = tokio::time::timeout(Duration::from_secs(3), async {
            loop {
                match admin_rx.recv().await.expect("admin frame") {
                    Message::Text(text) => {
                        break serde_json::from_str::<Envelope>(&text).expect("envelope")
                    }
                    _ => continue,
                }
            }
        })
        .await
        .expect("stale failure delivered");
        assert_eq!(envelope.id, "s1");
        match envelope.msg {
            Msg::Response(response) => {
                assert_eq!(response.error_code(), Some(codes::STALE_ENDPOINT));
            }
            other => panic!("expected response, got {other:?}"),
        }
        assert!(hub.registry.by_identity("quiet").await.is_none());
        assert_eq!(hub.router.pending_count().await, 0);
    }
}

