use crate::registry::Peer;
use crate::state::HubState;
use scf_core::response::{codes, CommandResponse, ErrorInfo};
use scf_core::wire::{CommandPayload, Envelope, Msg};
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, info, warn};

/// Extra time the hub waits beyond the forwarded timeout before it
/// synthesizes a TIMEOUT on the endpoint's behalf.
pub const HUB_GRACE_S: f64 = 2.0;

#[derive(Debug, Deserialize)]
struct ForwardParams {
    target_identity: String,
    inner_command: String,
    #[serde(default)]
    inner_params: Value,
    #[serde(default)]
    timeout_s: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct BroadcastParams {
    inner_command: String,
    #[serde(default)]
    inner_params: Value,
    #[serde(default)]
    timeout_s: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct DisconnectParams {
    peer_id: u64,
}

struct PendingCommand {
    original_id: String,
    admin_peer_id: u64,
    endpoint_peer_id: u64,
    endpoint_identity: String,
    inner_command: String,
    issued_at: Instant,
    aggregate: Option<Arc<BroadcastState>>,
}

struct BroadcastState {
    admin_peer_id: u64,
    original_id: String,
    expected: usize,
    results: AsyncMutex<BTreeMap<String, CommandResponse>>,
}

impl BroadcastState {
    async fn record(&self, hub: &Arc<HubState>, identity: String, response: CommandResponse) {
        let finished = {
            let mut results = self.results.lock().await;
            results.insert(identity, response);
            results.len() >= self.expected
        };
        if !finished {
            return;
        }
        let pairs: Vec<Value> = {
            let results = self.results.lock().await;
            results
                .iter()
                .map(|(identity, response)| json!({"identity": identity, "response": response}))
                .collect()
        };
        let response = CommandResponse::success("broadcast_command", json!({"results": pairs}));
        send_admin_response(hub, self.admin_peer_id, &self.original_id, response).await;
    }
}

pub struct Router {
    pending: AsyncMutex<HashMap<String, PendingCommand>>,
}

impl Router {
    pub fn new() -> Self {
        Self {
            pending: AsyncMutex::new(HashMap::new()),
        }
    }

    pub async fn pending_count(&self) -> usize {
        self.pending.lock().await.len()
    }

    #[allow(clippy::too_many_arguments)]
    async fn dispatch_one(
        &self,
        hub: &Arc<HubState>,
        admin_peer_id: u64,
        original_id: &str,
        target_identity: &str,
        target: &Arc<Peer>,
        command: &str,
        params: Value,
        timeout_s: f64,
        aggregate: Option<Arc<BroadcastState>>,
    ) -> bool {
        let correlation_id = format!("fwd-{admin_peer_id}-{original_id}");
        let pending = PendingCommand {
            original_id: original_id.to_string(),
            admin_peer_id,
            endpoint_peer_id: target.peer_id,
            endpoint_identity: target_identity.to_string(),
            inner_command: command.to_string(),
            issued_at: Instant::now(),
            aggregate,
        };
        self.pending.lock().await.insert(correlation_id.clone(), pending);

        let envelope = Envelope::new(
            correlation_id.clone(),
            Msg::Command(CommandPayload {
                command: command.to_string(),
                params,
                timeout_s: Some(timeout_s),
            }),
        );
        if !target.send_envelope(&envelope).await {
            warn!(event = "forward_send_failed", identity = target_identity);
            if let Some(pending) = self.pending.lock().await.remove(&correlation_id) {
                let response = CommandResponse::error(
                    &pending.inner_command,
                    ErrorInfo::disconnect(target_identity),
                );
                deliver(hub, pending, response).await;
            }
            return false;
        }

        let hub = hub.clone();
        let deadline = Duration::from_secs_f64(timeout_s + HUB_GRACE_S);
        tokio::spawn(async move {
            tokio::time::sleep(deadline).await;
            let expired = hub.router.pending.lock().await.remove(&correlation_id);
            if let Some(pending) = expired {
                hub.stats.timeouts_total.fetch_add(1, Ordering::SeqCst);
                info!(
                    event = "forward_timeout",
                    identity = %pending.endpoint_identity,
                    command = %pending.inner_command
                );
                let response = CommandResponse::error(
                    &pending.inner_command,
                    ErrorInfo::timeout(timeout_s)
                        .with_details(json!({"target_identity": pending.endpoint_identity})),
                );
                deliver(&hub, pending, response).await;
            }
        });
        true
    }

    pub async fn forward(&self, hub: &Arc<HubState>, admin: &Arc<Peer>, original_id: &str, params: Value) {
        let params: ForwardParams = match serde_json::from_value(params) {
            Ok(value) => value,
            Err(err) => {
                let response = CommandResponse::error(
                    "forward_command",
                    ErrorInfo::invalid_params(format!("bad forward params: {err}")),
                );
                send_admin_response(hub, admin.peer_id, original_id, response).await;
                return;
            }
        };
        let target = match hub.registry.by_identity(&params.target_identity).await {
            Some(peer) => peer,
            None => {
                let response = CommandResponse::error(
                    &params.inner_command,
                    ErrorInfo::unknown_target(&params.target_identity),
                );
                send_admin_response(hub, admin.peer_id, original_id, response).await;
                return;
            }
        };
        hub.stats.forwarded_total.fetch_add(1, Ordering::SeqCst);
        let timeout_s = params
            .timeout_s
            .unwrap_or(hub.config.command.default_timeout_s);
        self.dispatch_one(
            hub,
            admin.peer_id,
            original_id,
            &params.target_identity,
            &target,
            &params.inner_command,
            params.inner_params,
            timeout_s,
            None,
        )
        .await;
    }

    pub async fn broadcast(&self, hub: &Arc<HubState>, admin: &Arc<Peer>, original_id: &str, params: Value) {
        let params: BroadcastParams = match serde_json::from_value(params) {
            Ok(value) => value,
            Err(err) => {
                let response = CommandResponse::error(
                    "broadcast_command",
                    ErrorInfo::invalid_params(format!("bad broadcast params: {err}")),
                );
                send_admin_response(hub, admin.peer_id, original_id, response).await;
                return;
            }
        };
        let endpoints = hub.registry.endpoints().await;
        hub.stats.broadcasts_total.fetch_add(1, Ordering::SeqCst);
        if endpoints.is_empty() {
            let response = CommandResponse::success("broadcast_command", json!({"results": []}));
            send_admin_response(hub, admin.peer_id, original_id, response).await;
            return;
        }
        let timeout_s = params
            .timeout_s
            .unwrap_or(hub.config.command.default_timeout_s);
        let aggregate = Arc::new(BroadcastState {
            admin_peer_id: admin.peer_id,
            original_id: original_id.to_string(),
            expected: endpoints.len(),
            results: AsyncMutex::new(BTreeMap::new()),
        });
        for (identity, target) in endpoints {
            let fanout_id = format!("{original_id}:{identity}");
            self.dispatch_one(
                hub,
                admin.peer_id,
                &fanout_id,
                &identity,
                &target,
                &params.inner_command,
                params.inner_params.clone(),
                timeout_s,
                Some(aggregate.clone()),
            )
            .await;
        }
    }

    pub async fn on_response(
        &self,
        hub: &Arc<HubState>,
        from: &Arc<Peer>,
        correlation_id: &str,
        response: CommandResponse,
    ) {
        let pending = {
            let mut pending = self.pending.lock().await;
            match pending.get(correlation_id) {
                Some(entry) if entry.endpoint_peer_id == from.peer_id => {
                    pending.remove(correlation_id)
                }
                Some(_) => {
                    warn!(event = "response_peer_mismatch", correlation_id = correlation_id);
                    return;
                }
                None => {
                    debug!(event = "late_response_discarded", correlation_id = correlation_id);
                    return;
                }
            }
        };
        if let Some(pending) = pending {
            hub.stats.responses_routed.fetch_add(1, Ordering::SeqCst);
            debug!(
                event = "response_routed",
                correlation_id = correlation_id,
                elapsed_ms = pending.issued_at.elapsed().as_millis() as u64
            );
            deliver(hub, pending, response).await;
        }
    }

    /// Fails every pending command targeting the given endpoint. Used on
    /// disconnect, stale eviction, and identity replacement.
    pub async fn fail_endpoint_pending(&self, hub: &Arc<HubState>, endpoint_peer_id: u64, code: &str) {
        let failed: Vec<PendingCommand> = {
            let mut pending = self.pending.lock().await;
            let keys: Vec<String> = pending
                .iter()
                .filter(|(_, entry)| entry.endpoint_peer_id == endpoint_peer_id)
                .map(|(key, _)| key.clone())
                .collect();
            keys.into_iter().filter_map(|key| pending.remove(&key)).collect()
        };
        for entry in failed {
            let error = match code {
                codes::STALE_ENDPOINT => ErrorInfo::stale_endpoint(&entry.endpoint_identity),
                _ => ErrorInfo::disconnect(&entry.endpoint_identity),
            };
            let response = CommandResponse::error(&entry.inner_command, error);
            deliver(hub, entry, response).await;
        }
    }
}

async fn deliver(hub: &Arc<HubState>, pending: PendingCommand, response: CommandResponse) {
    match pending.aggregate {
        Some(aggregate) => {
            aggregate
                .record(hub, pending.endpoint_identity, response)
                .await;
        }
        None => {
            send_admin_response(hub, pending.admin_peer_id, &pending.original_id, response).await;
        }
    }
}

async fn send_admin_response(
    hub: &Arc<HubState>,
    admin_peer_id: u64,
    original_id: &str,
    response: CommandResponse,
) {
    let Some(admin) = hub.registry.get(admin_peer_id).await else {
        // Admin disconnect drops responses on return.
        debug!(event = "admin_gone", admin_peer_id = admin_peer_id);
        return;
    };
    let envelope = Envelope::new(original_id, Msg::Response(response));
    if !admin.send_envelope(&envelope).await {
        warn!(event = "admin_send_failed", admin_peer_id = admin_peer_id);
    }
}

/// Admin command dispatch: hub built-ins, then the plugin table.
pub async fn dispatch_admin(hub: &Arc<HubState>, admin: &Arc<Peer>, original_id: &str, command: CommandPayload) {
    let started = Instant::now();
    match command.command.as_str() {
        "forward_command" => {
            hub.router.forward(hub, admin, original_id, command.params).await;
        }
        "broadcast_command" => {
            hub.router.broadcast(hub, admin, original_id, command.params).await;
        }
        "list_clients" => {
            let clients = hub.registry.endpoint_snapshots().await;
            let response = CommandResponse::success("list_clients", json!({"clients": clients}))
                .with_execution_time(started.elapsed().as_secs_f64());
            send_admin_response(hub, admin.peer_id, original_id, response).await;
        }
        "get_stats" => {
            let (total, endpoints, admins) = hub.registry.counts().await;
            let data = json!({
                "uptime_s": hub.uptime_s(),
                "started_at": hub.stats.started_at.to_rfc3339(),
                "peers": {"total": total, "endpoints": endpoints, "admins": admins},
                "pending_commands": hub.router.pending_count().await,
                "forwarded_total": hub.stats.forwarded_total.load(Ordering::SeqCst),
                "broadcasts_total": hub.stats.broadcasts_total.load(Ordering::SeqCst),
                "responses_routed": hub.stats.responses_routed.load(Ordering::SeqCst),
                "timeouts_total": hub.stats.timeouts_total.load(Ordering::SeqCst),
            });
            let response = CommandResponse::success("get_stats", data)
                .with_execution_time(started.elapsed().as_secs_f64());
            send_admin_response(hub, admin.peer_id, original_id, response).await;
        }
        "disconnect_client" => {
            let response = disconnect_client(hub, command.params).await
                .with_execution_time(started.elapsed().as_secs_f64());
            send_admin_response(hub, admin.peer_id, original_id, response).await;
        }
        "reload_plugins" => {
            let report = hub.commands.reload(&crate::plugins::catalog());
            let response = CommandResponse::success("reload_plugins", report)
                .with_execution_time(started.elapsed().as_secs_f64());
            send_admin_response(hub, admin.peer_id, original_id, response).await;
        }
        name => {
            let response = match hub.commands.lookup(name) {
                Some(run) => {
                    let snapshot = hub_snapshot(hub).await;
                    match run(&snapshot, command.params) {
                        Ok(data) => CommandResponse::success(name, data),
                        Err(error) => CommandResponse::error(name, error),
                    }
                }
                None => CommandResponse::error(name, ErrorInfo::unknown_command(name)),
            }
            .with_execution_time(started.elapsed().as_secs_f64());
            send_admin_response(hub, admin.peer_id, original_id, response).await;
        }
    }
}

async fn disconnect_client(hub: &Arc<HubState>, params: Value) -> CommandResponse {
    let params: DisconnectParams = match serde_json::from_value(params) {
        Ok(value) => value,
        Err(err) => {
            return CommandResponse::error(
                "disconnect_client",
                ErrorInfo::invalid_params(format!("bad disconnect params: {err}")),
            );
        }
    };
    let Some(peer) = hub.registry.get(params.peer_id).await else {
        return CommandResponse::error(
            "disconnect_client",
            ErrorInfo::new(
                codes::UNKNOWN_TARGET,
                "RoutingError",
                format!("no peer {}", params.peer_id),
            ),
        );
    };
    hub.router
        .fail_endpoint_pending(hub, peer.peer_id, codes::DISCONNECT)
        .await;
    peer.close("admin_disconnect").await;
    hub.registry.remove(peer.peer_id).await;
    info!(event = "client_disconnected_by_admin", peer_id = params.peer_id);
    CommandResponse::success("disconnect_client", json!({"peer_id": params.peer_id}))
}

pub async fn hub_snapshot(hub: &Arc<HubState>) -> Value {
    let (total, endpoints, admins) = hub.registry.counts().await;
    json!({
        "uptime_s": hub.uptime_s(),
        "peers": {"total": total, "endpoints": endpoints, "admins": admins},
        "clients": hub.registry.endpoint_snapshots().await,
        "pending_commands": hub.router.pending_count().await,
        "forwarded_total": hub.stats.forwarded_total.load(Ordering::SeqCst),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::Peer;
    use axum::extract::ws::Message;
    use scf_core::Config;
    use tokio::sync::mpsc;

    fn hub() -> Arc<HubState> {
        Arc::new(HubState::new(Config::default()))
    }

    async fn connect_admin(hub: &Arc<HubState>) -> (Arc<Peer>, mpsc::Receiver<Message>) {
        let (tx, rx) = mpsc::channel(32);
        let peer = Arc::new(Peer::new(hub.registry.next_peer_id(), tx));
        hub.registry.insert(peer.clone()).await;
        (peer, rx)
    }

    async fn connect_endpoint(
        hub: &Arc<HubState>,
        identity: &str,
    ) -> (Arc<Peer>, mpsc::Receiver<Message>) {
        let (peer, rx) = connect_admin(hub).await;
        hub.registry
            .bind_endpoint(&peer, identity, vec!["echo".to_string()])
            .await;
        (peer, rx)
    }

    fn envelope_from(msg: Message) -> Envelope {
        match msg {
            Message::Text(text) => serde_json::from_str(&text).expect("envelope"),
            other => panic!("expected text frame, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn forward_to_unknown_target_fails_immediately() {
        let hub = hub();
        let (admin, mut admin_rx) = connect_admin(&hub).await;
        hub.router
            .forward(
                &hub,
                &admin,
                "a2",
                json!({"target_identity": "ghost", "inner_command": "echo"}),
            )
            .await;
        let envelope = envelope_from(admin_rx.recv().await.expect("response"));
        assert_eq!(envelope.id, "a2");
        match envelope.msg {
            Msg::Response(response) => {
                assert_eq!(response.error_code(), Some(codes::UNKNOWN_TARGET));
            }
            other => panic!("expected response, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn forward_round_trip_restores_admin_id() {
        let hub = hub();
        let (admin, mut admin_rx) = connect_admin(&hub).await;
        let (endpoint, mut endpoint_rx) = connect_endpoint(&hub, "u1").await;

        hub.router
            .forward(
                &hub,
                &admin,
                "a1",
                json!({"target_identity": "u1", "inner_command": "echo", "inner_params": {"x": 42}}),
            )
            .await;

        let inner = envelope_from(endpoint_rx.recv().await.expect("forwarded"));
        let correlation_id = inner.id.clone();
        assert!(correlation_id.starts_with("fwd-"));
        match &inner.msg {
            Msg::Command(cmd) => {
                assert_eq!(cmd.command, "echo");
                assert_eq!(cmd.params["x"], 42);
            }
            other => panic!("expected command, got {other:?}"),
        }

        let response = CommandResponse::success("echo", json!({"received": {"x": 42}}));
        hub.router
            .on_response(&hub, &endpoint, &correlation_id, response)
            .await;

        let back = envelope_from(admin_rx.recv().await.expect("admin response"));
        assert_eq!(back.id, "a1");
        match back.msg {
            Msg::Response(response) => {
                assert!(response.success);
                assert_eq!(response.data["received"]["x"], 42);
            }
            other => panic!("expected response, got {other:?}"),
        }
        assert_eq!(hub.router.pending_count().await, 0);
    }

    #[tokio::test]
    async fn late_response_is_discarded() {
        let hub = hub();
        let (endpoint, _endpoint_rx) = connect_endpoint(&hub, "u1").await;
        hub.router
            .on_response(
                &hub,
                &endpoint,
                "fwd-9-gone",
                CommandResponse::success("echo", Value::Null),
            )
            .await;
        assert_eq!(hub.stats.responses_routed.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn endpoint_disconnect_fails_pending_with_disconnect() {
        let hub = hub();
        let (admin, mut admin_rx) = connect_admin(&hub).await;
        let (endpoint, _endpoint_rx) = connect_endpoint(&hub, "u1").await;

        hub.router
            .forward(
                &hub,
                &admin,
                "a5",
                json!({"target_identity": "u1", "inner_command": "sleep10", "timeout_s": 30.0}),
            )
            .await;
        hub.router
            .fail_endpoint_pending(&hub, endpoint.peer_id, codes::DISCONNECT)
            .await;

        let envelope = envelope_from(admin_rx.recv().await.expect("failure response"));
        assert_eq!(envelope.id, "a5");
        match envelope.msg {
            Msg::Response(response) => {
                assert_eq!(response.error_code(), Some(codes::DISCONNECT));
                assert_eq!(response.metadata.command, "sleep10");
            }
            other => panic!("expected response, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn forward_deadline_synthesizes_timeout() {
        let hub = hub();
        let (admin, mut admin_rx) = connect_admin(&hub).await;
        let (_endpoint, mut endpoint_rx) = connect_endpoint(&hub, "u1").await;

        hub.router
            .forward(
                &hub,
                &admin,
                "a3",
                json!({"target_identity": "u1", "inner_command": "sleep10", "timeout_s": 0.0}),
            )
            .await;
        // The endpoint receives the command but never answers.
        let _ = endpoint_rx.recv().await.expect("forwarded");

        let envelope = tokio::time::timeout(
            Duration::from_secs_f64(HUB_GRACE_S + 1.0),
            admin_rx.recv(),
        )
        .await
        .expect("deadline fires")
        .expect("timeout response");
        assert_eq!(envelope_from(envelope).id, "a3");
        assert_eq!(hub.stats.timeouts_total.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn broadcast_aggregates_in_identity_order() {
        let hub = hub();
        let (admin, mut admin_rx) = connect_admin(&hub).await;
        let (ep_b, mut rx_b) = connect_endpoint(&hub, "beta").await;
        let (ep_a, mut rx_a) = connect_endpoint(&hub, "alpha").await;

        hub.router
            .broadcast(
                &hub,
                &admin,
                "b1",
                json!({"inner_command": "echo", "inner_params": {}}),
            )
            .await;

        let to_a = envelope_from(rx_a.recv().await.expect("fanout a"));
        let to_b = envelope_from(rx_b.recv().await.expect("fanout b"));
        // beta answers before alpha; result order must still be by identity.
        hub.router
            .on_response(&hub, &ep_b, &to_b.id, CommandResponse::success("echo", json!("from-beta")))
            .await;
        hub.router
            .on_response(&hub, &ep_a, &to_a.id, CommandResponse::success("echo", json!("from-alpha")))
            .await;

        let envelope = envelope_from(admin_rx.recv().await.expect("aggregate"));
        assert_eq!(envelope.id, "b1");
        match envelope.msg {
            Msg::Response(response) => {
                let results = response.data["results"].as_array().expect("results");
                assert_eq!(results.len(), 2);
                assert_eq!(results[0]["identity"], "alpha");
                assert_eq!(results[1]["identity"], "beta");
            }
            other => panic!("expected response, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn broadcast_with_no_endpoints_answers_empty() {
        let hub = hub();
        let (admin, mut admin_rx) = connect_admin(&hub).await;
        hub.router
            .broadcast(&hub, &admin, "b0", json!({"inner_command": "echo"}))
            .await;
        let envelope = envelope_from(admin_rx.recv().await.expect("response"));
        assert_eq!(envelope.id, "b0");
        match envelope.msg {
            Msg::Response(response) => {
                assert!(response.success);
                assert_eq!(response.data["results"], json!([]));
            }
            other => panic!("expected response, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn admin_dispatch_reports_unknown_command() {
        let hub = hub();
        let (admin, mut admin_rx) = connect_admin(&hub).await;
        dispatch_admin(
            &hub,
            &admin,
            "q1",
            CommandPayload {
                command: "no_such_admin_op".to_string(),
                params: Value::Null,
                timeout_s: None,
            },
        )
        .await;
        let envelope = envelope_from(admin_rx.recv().await.expect("response"));
        match envelope.msg {
            Msg::Response(response) => {
                assert_eq!(response.error_code(), Some(codes::UNKNOWN_COMMAND));
            }
            other => panic!("expected response, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn list_clients_and_stats_reflect_registry() {
        let hub = hub();
        let (admin, mut admin_rx) = connect_admin(&hub).await;
        let (_endpoint, _rx) = connect_endpoint(&hub, "u1").await;

        dispatch_admin(
            &hub,
            &admin,
            "q2",
            CommandPayload {
                command: "list_clients".to_string(),
                params: Value::Null,
                timeout_s: None,
            },
        )
        .await;
        let envelope = envelope_from(admin_rx.recv().await.expect("response"));
        match envelope.msg {
            Msg::Response(response) => {
                let clients = response.data["clients"].as_array().expect("clients");
                assert_eq!(clients.len(), 1);
                assert_eq!(clients[0]["identity"], "u1");
                assert_eq!(clients[0]["status"], "connected");
            }
            other => panic!("expected response, got {other:?}"),
        }

        dispatch_admin(
            &hub,
            &admin,
            "q3",
            CommandPayload {
                command: "get_stats".to_string(),
                params: Value::Null,
                timeout_s: None,
            },
        )
        .await;
        let envelope = envelope_from(admin_rx.recv().await.expect("response"));
        match envelope.msg {
            Msg::Response(response) => {
                assert_eq!(response.data["peers"]["endpoints"], 1);
                assert_eq!(response.data["pending_commands"], 0);
            }
            other => panic!("expected response, got {other:?}"),
        }
    }
}
