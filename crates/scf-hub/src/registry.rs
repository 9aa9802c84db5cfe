use axum::extract::ws::Message;
use chrono::{DateTime, Utc};
use scf_core::wire::{encode_frame, Envelope, Msg, DEFAULT_MAX_FRAME_BYTES};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, Mutex as AsyncMutex, RwLock};
use tracing::{info, warn};

const LATENCY_EMA_ALPHA: f64 = 0.2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerRole {
    Admin,
    Endpoint,
}

impl PeerRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            PeerRole::Admin => "admin",
            PeerRole::Endpoint => "endpoint",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerStatus {
    Connected,
    Stale,
    Closing,
}

impl PeerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PeerStatus::Connected => "connected",
            PeerStatus::Stale => "stale",
            PeerStatus::Closing => "closing",
        }
    }
}

pub struct PeerState {
    pub role: PeerRole,
    pub identity: String,
    pub capabilities: Vec<String>,
    pub status: PeerStatus,
    pub last_heartbeat: Instant,
    pub last_heartbeat_at: DateTime<Utc>,
    pub latency_ms: Option<f64>,
    pub ping_sent: Option<Instant>,
}

pub struct Peer {
    pub peer_id: u64,
    pub connected_at: DateTime<Utc>,
    pub sender: mpsc::Sender<Message>,
    pub state: AsyncMutex<PeerState>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct PeerSnapshot {
    pub peer_id: u64,
    pub role: String,
    pub identity: String,
    pub capabilities: Vec<String>,
    pub connected_at: String,
    pub last_heartbeat_at: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<f64>,
    pub status: String,
}

impl Peer {
    pub fn new(peer_id: u64, sender: mpsc::Sender<Message>) -> Self {
        let now = Utc::now();
        Self {
            peer_id,
            connected_at: now,
            sender,
            state: AsyncMutex::new(PeerState {
                role: PeerRole::Admin,
                identity: String::new(),
                capabilities: Vec::new(),
                status: PeerStatus::Connected,
                last_heartbeat: Instant::now(),
                last_heartbeat_at: now,
                latency_ms: None,
                ping_sent: None,
            }),
        }
    }

    pub async fn touch(&self) {
        let mut state = self.state.lock().await;
        state.last_heartbeat = Instant::now();
        state.last_heartbeat_at = Utc::now();
    }

    pub async fn record_pong(&self) {
        let mut state = self.state.lock().await;
        state.last_heartbeat = Instant::now();
        state.last_heartbeat_at = Utc::now();
        if let Some(sent) = state.ping_sent.take() {
            let rtt_ms = sent.elapsed().as_secs_f64() * 1000.0;
            state.latency_ms = Some(match state.latency_ms {
                Some(ema) => ema + LATENCY_EMA_ALPHA * (rtt_ms - ema),
                None => rtt_ms,
            });
        }
    }

    pub async fn send_envelope(&self, envelope: &Envelope) -> bool {
        let text = match encode_frame(envelope, DEFAULT_MAX_FRAME_BYTES) {
            Ok(value) => value,
            Err(err) => {
                warn!(event = "encode_error", peer_id = self.peer_id, error = %err);
                return false;
            }
        };
        self.sender.send(Message::Text(text)).await.is_ok()
    }

    pub async fn close(&self, reason: &str) {
        {
            let mut state = self.state.lock().await;
            state.status = PeerStatus::Closing;
        }
        let _ = self
            .sender
            .send(Message::Close(Some(axum::extract::ws::CloseFrame {
                code: 1000,
                reason: reason.to_string().into(),
            })))
            .await;
    }

    pub async fn snapshot(&self) -> PeerSnapshot {
        let state = self.state.lock().await;
        PeerSnapshot {
            peer_id: self.peer_id,
            role: state.role.as_str().to_string(),
            identity: state.identity.clone(),
            capabilities: state.capabilities.clone(),
            connected_at: self.connected_at.to_rfc3339(),
            last_heartbeat_at: state.last_heartbeat_at.to_rfc3339(),
            latency_ms: state.latency_ms,
            status: state.status.as_str().to_string(),
        }
    }
}

pub struct SessionRegistry {
    peers: RwLock<HashMap<u64, Arc<Peer>>>,
    identities: RwLock<HashMap<String, u64>>,
    peer_counter: AtomicU64,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self {
            peers: RwLock::new(HashMap::new()),
            identities: RwLock::new(HashMap::new()),
            peer_counter: AtomicU64::new(0),
        }
    }

    pub fn next_peer_id(&self) -> u64 {
        self.peer_counter.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub async fn insert(&self, peer: Arc<Peer>) {
        self.peers.write().await.insert(peer.peer_id, peer);
    }

    pub async fn get(&self, peer_id: u64) -> Option<Arc<Peer>> {
        self.peers.read().await.get(&peer_id).cloned()
    }

    pub async fn by_identity(&self, identity: &str) -> Option<Arc<Peer>> {
        let peer_id = *self.identities.read().await.get(identity)?;
        self.get(peer_id).await
    }

    /// Commits the identity binding for a registering endpoint. Returns
    /// the previously bound peer so the caller can run the eviction
    /// path; the old binding is severed before this returns.
    pub async fn bind_endpoint(
        &self,
        peer: &Arc<Peer>,
        identity: &str,
        capabilities: Vec<String>,
    ) -> Option<Arc<Peer>> {
        let previous_identity = {
            let state = peer.state.lock().await;
            state.identity.clone()
        };
        let prior = {
            let mut identities = self.identities.write().await;
            if !previous_identity.is_empty() && previous_identity != identity {
                if identities.get(&previous_identity) == Some(&peer.peer_id) {
                    identities.remove(&previous_identity);
                }
            }
            identities.insert(identity.to_string(), peer.peer_id)
        };
        let evicted = match prior {
            Some(old_id) if old_id != peer.peer_id => self.peers.read().await.get(&old_id).cloned(),
            _ => None,
        };
        {
            let mut state = peer.state.lock().await;
            state.role = PeerRole::Endpoint;
            state.identity = identity.to_string();
            state.capabilities = capabilities;
        }
        info!(
            event = "endpoint_registered",
            peer_id = peer.peer_id,
            identity = identity,
            evicted = evicted.as_ref().map(|old| old.peer_id)
        );
        evicted
    }

    /// Drops the peer from the table; the identity binding is released
    /// only when it still points at this peer (an evicted peer must not
    /// unbind its replacement).
    pub async fn remove(&self, peer_id: u64) -> Option<Arc<Peer>> {
        let peer = self.peers.write().await.remove(&peer_id)?;
        let identity = {
            let mut state = peer.state.lock().await;
            state.status = PeerStatus::Closing;
            state.identity.clone()
        };
        if !identity.is_empty() {
            let mut identities = self.identities.write().await;
            if identities.get(&identity) == Some(&peer_id) {
                identities.remove(&identity);
            }
        }
        Some(peer)
    }

    pub async fn endpoints(&self) -> Vec<(String, Arc<Peer>)> {
        let identities = self.identities.read().await;
        let peers = self.peers.read().await;
        let mut out: Vec<(String, Arc<Peer>)> = identities
            .iter()
            .filter_map(|(identity, peer_id)| {
                peers.get(peer_id).map(|peer| (identity.clone(), peer.clone()))
            })
            .collect();
        out.sort_by(|a, b| a.0.cmp(&b.0));
        out
    }

    pub async fn find_by_capability(&self, capability: &str) -> Vec<String> {
        let mut matching = Vec::new();
        for (identity, peer) in self.endpoints().await {
            let state = peer.state.lock().await;
            if state.capabilities.iter().any(|name| name == capability) {
                matching.push(identity);
            }
        }
        matching
    }

    pub async fn all_peers(&self) -> Vec<Arc<Peer>> {
        self.peers.read().await.values().cloned().collect()
    }

    pub async fn endpoint_snapshots(&self) -> Vec<PeerSnapshot> {
        let mut snapshots = Vec::new();
        for (_, peer) in self.endpoints().await {
            snapshots.push(peer.snapshot().await);
        }
        snapshots
    }

    pub async fn counts(&self) -> (usize, usize, usize) {
        let total = self.peers.read().await.len();
        let endpoints = self.identities.read().await.len();
        (total, endpoints, total.saturating_sub(endpoints))
    }
}

pub fn heartbeat_ack(envelope_id: &str) -> Envelope {
    Envelope::new(envelope_id, Msg::Heartbeat(Default::default()))
}
