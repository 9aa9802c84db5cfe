use crate::Endpoint;
use futures_util::{SinkExt, StreamExt};
use rand::Rng;
use scf_core::config::ReconnectConfig;
use scf_core::response::codes;
use scf_core::wire::{
    decode_envelope, encode_frame, Envelope, Msg, RegisterPayload, DEFAULT_MAX_FRAME_BYTES,
    PROTOCOL_VERSION,
};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};

const REGISTER_ACK_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    Evicted,
    OutboundClosed,
}

/// Exponential backoff with jitter. Resets to the initial delay after a
/// successful registration handshake.
pub struct Backoff {
    config: ReconnectConfig,
    current_s: f64,
    pub attempts: u32,
}

impl Backoff {
    pub fn new(config: ReconnectConfig) -> Self {
        let current_s = config.initial_s;
        Self {
            config,
            current_s,
            attempts: 0,
        }
    }

    pub fn next_delay(&mut self) -> Duration {
        self.attempts += 1;
        let jitter = self.config.jitter;
        let factor = if jitter > 0.0 {
            1.0 + rand::thread_rng().gen_range(-jitter..=jitter)
        } else {
            1.0
        };
        let delay = (self.current_s * factor).max(0.0);
        self.current_s = (self.current_s * self.config.multiplier).min(self.config.max_s);
        Duration::from_secs_f64(delay)
    }

    pub fn reset(&mut self) {
        self.current_s = self.config.initial_s;
        self.attempts = 0;
    }
}

/// Connection lifecycle: dial, register, serve the session, reconnect
/// with backoff on loss. Returns only when the endpoint must stop.
pub async fn run(endpoint: Arc<Endpoint>, outbound_rx: &mut mpsc::Receiver<Envelope>) -> ExitReason {
    let reconnect = endpoint
        .config
        .read()
        .expect("config poisoned")
        .reconnect
        .clone();
    let mut backoff = Backoff::new(reconnect);
    loop {
        let hub_url = endpoint
            .config
            .read()
            .expect("config poisoned")
            .endpoint
            .hub_url
            .clone();
        if let Err(err) = url::Url::parse(&hub_url) {
            error!(event = "bad_hub_url", url = %hub_url, error = %err);
            tokio::time::sleep(backoff.next_delay()).await;
            continue;
        }
        let ws_url = format!("{}/ws", hub_url.trim_end_matches('/'));

        let (ws, _) = match connect_async(&ws_url).await {
            Ok(value) => value,
            Err(err) => {
                let delay = backoff.next_delay();
                warn!(
                    event = "hub_connect_failed",
                    url = %ws_url,
                    error = %err,
                    attempt = backoff.attempts,
                    retry_in_s = delay.as_secs_f64()
                );
                tokio::time::sleep(delay).await;
                continue;
            }
        };

        match session(&endpoint, ws, &mut backoff, outbound_rx).await {
            SessionEnd::Reconnect => {
                endpoint.scheduler.cancel_all();
                let delay = backoff.next_delay();
                info!(event = "hub_disconnected", retry_in_s = delay.as_secs_f64());
                tokio::time::sleep(delay).await;
            }
            SessionEnd::Exit(reason) => {
                endpoint.scheduler.cancel_all();
                return reason;
            }
        }
    }
}

enum SessionEnd {
    Reconnect,
    Exit(ExitReason),
}

async fn session(
    endpoint: &Arc<Endpoint>,
    mut ws: tokio_tungstenite::WebSocketStream<
        tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
    >,
    backoff: &mut Backoff,
    outbound_rx: &mut mpsc::Receiver<Envelope>,
) -> SessionEnd {
    let identity = endpoint
        .config
        .read()
        .expect("config poisoned")
        .endpoint
        .identity
        .clone();
    let register_id = format!("reg-{}", backoff.attempts);
    let register = Envelope::new(
        register_id.clone(),
        Msg::Register(RegisterPayload {
            identity: identity.clone(),
            capabilities: endpoint.registry.names(),
            version: PROTOCOL_VERSION.to_string(),
        }),
    );
    if send(&mut ws, &register).await.is_err() {
        return SessionEnd::Reconnect;
    }

    // Wait for the hub to ack the registration before serving traffic.
    let peer_id = match await_welcome(&mut ws, &register_id).await {
        Some(peer_id) => peer_id,
        None => {
            let _ = ws.close(None).await;
            return SessionEnd::Reconnect;
        }
    };
    backoff.reset();
    info!(event = "registered", identity = %identity, peer_id = peer_id);

    let mut heartbeat_interval = current_heartbeat_interval(endpoint);
    let mut ticker = tokio::time::interval(heartbeat_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ticker.tick().await;
    let mut heartbeats_in_flight: HashMap<String, Instant> = HashMap::new();
    let mut heartbeat_counter: u64 = 0;

    loop {
        tokio::select! {
            incoming = ws.next() => {
                let msg = match incoming {
                    Some(Ok(value)) => value,
                    Some(Err(err)) => {
                        warn!(event = "read_error", error = %err);
                        return SessionEnd::Reconnect;
                    }
                    None => return SessionEnd::Reconnect,
                };
                let data = match msg {
                    Message::Text(text) => text.into_bytes(),
                    Message::Binary(bytes) => bytes,
                    Message::Close(_) => {
                        info!(event = "hub_closed");
                        return SessionEnd::Reconnect;
                    }
                    Message::Ping(_) | Message::Pong(_) => continue,
                    Message::Frame(_) => continue,
                };
                let envelope = match decode_envelope(&data, DEFAULT_MAX_FRAME_BYTES) {
                    Ok(value) => value,
                    Err(err) => {
                        warn!(event = "frame_invalid", error = %err);
                        let _ = ws.close(None).await;
                        return SessionEnd::Reconnect;
                    }
                };
                let type_name = envelope.type_name();
                match envelope.msg {
                    Msg::Command(command) => {
                        debug!(event = "command_received", id = %envelope.id, command = %command.command);
                        tokio::spawn(endpoint.scheduler.clone().dispatch(envelope.id, command));
                    }
                    Msg::Heartbeat(_) => {
                        if let Some(sent) = heartbeats_in_flight.remove(&envelope.id) {
                            let rtt_ms = sent.elapsed().as_secs_f64() * 1000.0;
                            endpoint.health.record_heartbeat_rtt(rtt_ms);
                        }
                    }
                    Msg::Error(payload) => {
                        if payload.code == codes::EVICTED {
                            error!(event = "evicted", message = %payload.message);
                            return SessionEnd::Exit(ExitReason::Evicted);
                        }
                        warn!(event = "hub_error", code = %payload.code, message = %payload.message);
                    }
                    Msg::Welcome(_) => {}
                    _ => {
                        debug!(event = "unexpected_envelope", r#type = type_name);
                    }
                }
            }
            outgoing = outbound_rx.recv() => {
                let Some(envelope) = outgoing else {
                    return SessionEnd::Exit(ExitReason::OutboundClosed);
                };
                if send(&mut ws, &envelope).await.is_err() {
                    return SessionEnd::Reconnect;
                }
            }
            _ = ticker.tick() => {
                heartbeat_counter += 1;
                let id = format!("hb-{heartbeat_counter}");
                heartbeats_in_flight.insert(id.clone(), Instant::now());
                let heartbeat = Envelope::new(id, Msg::Heartbeat(Default::default()));
                if send(&mut ws, &heartbeat).await.is_err() {
                    return SessionEnd::Reconnect;
                }
                let stale_cutoff = heartbeat_interval * 4;
                heartbeats_in_flight.retain(|_, sent| sent.elapsed() < stale_cutoff);

                // Heartbeat cadence is live-reloadable.
                let configured = current_heartbeat_interval(endpoint);
                if configured != heartbeat_interval {
                    info!(event = "heartbeat_interval_changed", interval_s = configured.as_secs());
                    heartbeat_interval = configured;
                    ticker = tokio::time::interval(heartbeat_interval);
                    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                    ticker.tick().await;
                }
            }
        }
    }
}

fn current_heartbeat_interval(endpoint: &Arc<Endpoint>) -> Duration {
    let interval_s = endpoint
        .config
        .read()
        .expect("config poisoned")
        .heartbeat
        .interval_s;
    Duration::from_secs(interval_s.max(1))
}

async fn await_welcome(
    ws: &mut tokio_tungstenite::WebSocketStream<
        tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
    >,
    register_id: &str,
) -> Option<u64> {
    let deadline = Instant::now() + REGISTER_ACK_TIMEOUT;
    loop {
        let remaining = deadline.checked_duration_since(Instant::now())?;
        let msg = match tokio::time::timeout(remaining, ws.next()).await {
            Ok(Some(Ok(value))) => value,
            Ok(Some(Err(err))) => {
                warn!(event = "register_read_error", error = %err);
                return None;
            }
            Ok(None) => return None,
            Err(_) => {
                warn!(event = "register_ack_timeout");
                return None;
            }
        };
        let data = match msg {
            Message::Text(text) => text.into_bytes(),
            Message::Binary(bytes) => bytes,
            Message::Close(_) => return None,
            _ => continue,
        };
        let envelope = match decode_envelope(&data, DEFAULT_MAX_FRAME_BYTES) {
            Ok(value) => value,
            Err(err) => {
                warn!(event = "register_ack_invalid", error = %err);
                return None;
            }
        };
        match envelope.msg {
            // The ack carries the register envelope's id; the accept-time
            // welcome has a hub-generated id and is also acceptable.
            Msg::Welcome(welcome) if envelope.id == register_id => return Some(welcome.peer_id),
            Msg::Welcome(welcome) => {
                debug!(event = "accept_welcome", peer_id = welcome.peer_id);
                continue;
            }
            Msg::Error(payload) => {
                warn!(event = "register_rejected", code = %payload.code);
                return None;
            }
            _ => continue,
        }
    }
}

async fn send(
    ws: &mut tokio_tungstenite::WebSocketStream<
        tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
    >,
    envelope: &Envelope,
) -> Result<(), ()> {
    let text = encode_frame(envelope, DEFAULT_MAX_FRAME_BYTES).map_err(|err| {
        warn!(event = "encode_error", error = %err);
    })?;
    ws.send(Message::Text(text)).await.map_err(|err| {
        warn!(event = "send_error", error = %err);
    })
}
