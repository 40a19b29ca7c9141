//! # Relay Server Module
//!
//! Accepts terminal sockets and routes envelopes between a master and its
//! slaves.
//!
//! ## Architecture
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        Relay Server                                     │
//! │                                                                         │
//! │  POST /register ──► validate type ──► JWT {sub, deviceType, master}    │
//! │                                                                         │
//! │  GET /ws?token= ──► validate JWT ──► attach device                     │
//! │                                          │                              │
//! │         ┌────────────────────────────────┼───────────────┐             │
//! │         ▼                                ▼               ▼              │
//! │  ┌──────────────┐              ┌──────────────┐  ┌──────────────┐      │
//! │  │   MASTER     │◄── always ───│   SLAVE #1   │  │   SLAVE #2   │      │
//! │  │  (dev-m)     │              │ master=dev-m │  │ master=dev-m │      │
//! │  └──────┬───────┘              └──────────────┘  └──────────────┘      │
//! │         │ targetDevice set ──► that slave only        ▲                 │
//! │         └ targetDevice absent ──► every slave ────────┘                 │
//! │                                                                         │
//! │  Slave attach/detach ──► __system_slave_connected/disconnected         │
//! │                          to its master                                  │
//! │  Every socket ──► __system_heartbeat each heartbeat interval           │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use axum::{
    extract::{
        rejection::JsonRejection,
        ws::{Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::{mpsc, RwLock};
use tokio::time::{interval_at, Instant};
use tracing::{debug, info, warn};

use tandem_core::protocol::{
    message_types, HeartbeatPayload, RegisterRequest, RegisterResponse, SlaveLifecyclePayload,
};
use tandem_core::{MessageEnvelope, Role};

use crate::auth::{Claims, TokenIssuer};
use crate::config::RelayConfig;
use crate::error::RelayError;

/// `from` of every envelope the relay itself produces.
pub const RELAY_ID: &str = "relay";

/// Max message size (1MB).
const MAX_MESSAGE_SIZE: usize = 1024 * 1024;

// =============================================================================
// Connected Devices
// =============================================================================

/// A terminal with a live socket.
#[derive(Debug, Clone)]
pub struct ConnectedDevice {
    pub device_id: String,
    pub device_name: String,
    pub role: Role,
    pub master_device_id: Option<String>,
    pub connected_at: DateTime<Utc>,
    session: u64,
    tx: mpsc::UnboundedSender<String>,
}

impl ConnectedDevice {
    fn is_slave_of(&self, master: &str) -> bool {
        self.role == Role::Slave && self.master_device_id.as_deref() == Some(master)
    }

    fn send(&self, text: &str) -> bool {
        self.tx.send(text.to_string()).is_ok()
    }
}

// =============================================================================
// Relay State
// =============================================================================

/// Shared state for the relay server.
pub struct RelayState {
    config: RelayConfig,
    tokens: TokenIssuer,
    devices: RwLock<HashMap<String, ConnectedDevice>>,
    next_session: AtomicU64,
}

impl RelayState {
    pub fn new(config: RelayConfig) -> Self {
        let tokens = TokenIssuer::new(config.jwt_secret.clone(), config.token_lifetime_secs);
        RelayState {
            config,
            tokens,
            devices: RwLock::new(HashMap::new()),
            next_session: AtomicU64::new(1),
        }
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    /// Validates a registration and issues its socket token.
    pub fn register(&self, request: &RegisterRequest) -> Result<RegisterResponse, RelayError> {
        if request.device_id.trim().is_empty() {
            return Err(RelayError::InvalidRequest("deviceId is required".to_string()));
        }
        if request.device_type == Role::Slave
            && request.master_device_id.as_deref().map_or(true, |m| m.trim().is_empty())
        {
            return Err(RelayError::InvalidRequest(
                "masterDeviceId is required for slaves".to_string(),
            ));
        }

        let token = self.tokens.issue(request)?;
        info!(
            device_id = %request.device_id,
            role = %request.device_type,
            master = ?request.master_device_id,
            "Device registered"
        );
        Ok(RegisterResponse::ok(token))
    }

    pub fn validate_token(&self, token: &str) -> Result<Claims, RelayError> {
        self.tokens.validate(token)
    }

    /// Returns the number of connected devices.
    pub async fn device_count(&self) -> usize {
        self.devices.read().await.len()
    }

    /// Returns connected device IDs.
    pub async fn device_ids(&self) -> Vec<String> {
        let mut ids: Vec<_> = self.devices.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Attaches a socket for `claims`. A second socket for the same device
    /// replaces the first.
    ///
    /// Returns the session id and the stream of texts to write to the socket.
    pub async fn attach(&self, claims: &Claims) -> (u64, mpsc::UnboundedReceiver<String>) {
        let session = self.next_session.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        let device = ConnectedDevice {
            device_id: claims.sub.clone(),
            device_name: claims.device_name.clone(),
            role: claims.device_type,
            master_device_id: claims.master_device_id.clone(),
            connected_at: Utc::now(),
            session,
            tx,
        };

        let mut devices = self.devices.write().await;
        if devices.insert(device.device_id.clone(), device.clone()).is_some() {
            info!(device_id = %device.device_id, "Replaced existing socket");
        }

        match device.role {
            Role::Slave => {
                if let Some(master) = device.master_device_id.as_deref().and_then(|m| devices.get(m)) {
                    notify(master, message_types::SLAVE_CONNECTED, &device);
                }
            }
            Role::Master => {
                for slave in devices.values().filter(|d| d.is_slave_of(&device.device_id)) {
                    notify(&device, message_types::SLAVE_CONNECTED, slave);
                }
            }
        }

        info!(
            device_id = %device.device_id,
            role = %device.role,
            session,
            "Device attached"
        );
        (session, rx)
    }

    /// Removes `device_id` if `session` is still its live socket.
    pub async fn detach(&self, device_id: &str, session: u64) {
        let mut devices = self.devices.write().await;
        if devices.get(device_id).map(|d| d.session) != Some(session) {
            return;
        }
        let Some(device) = devices.remove(device_id) else {
            return;
        };

        if device.role == Role::Slave {
            if let Some(master) = device.master_device_id.as_deref().and_then(|m| devices.get(m)) {
                notify(master, message_types::SLAVE_DISCONNECTED, &device);
            }
        }
        info!(device_id = %device_id, "Device detached");
    }

    /// Routes an envelope sent by `sender`. Returns the number of sockets it
    /// was written to.
    pub async fn route(&self, sender: &str, envelope: &MessageEnvelope) -> usize {
        if envelope.is_system() {
            debug!(from = %sender, kind = %envelope.message_type, "Consumed system message");
            return 0;
        }

        let text = match envelope.to_json() {
            Ok(text) => text,
            Err(e) => {
                warn!(from = %sender, "Failed to encode envelope: {}", e);
                return 0;
            }
        };

        let devices = self.devices.read().await;
        let Some(origin) = devices.get(sender) else {
            return 0;
        };

        let delivered = match origin.role {
            Role::Master => devices
                .values()
                .filter(|d| d.is_slave_of(sender))
                .filter(|d| match envelope.target_device.as_deref() {
                    Some(target) => d.device_id == target,
                    None => true,
                })
                .filter(|d| d.send(&text))
                .count(),
            Role::Slave => origin
                .master_device_id
                .as_deref()
                .and_then(|m| devices.get(m))
                .map_or(0, |master| usize::from(master.send(&text))),
        };

        if delivered == 0 {
            debug!(from = %sender, kind = %envelope.message_type, target = ?envelope.target_device, "No recipient online");
        }
        delivered
    }
}

/// Sends a slave presence notice to `master`.
fn notify(master: &ConnectedDevice, kind: &str, slave: &ConnectedDevice) {
    let payload = SlaveLifecyclePayload {
        device_id: slave.device_id.clone(),
        device_name: slave.device_name.clone(),
    };
    match MessageEnvelope::with_payload(RELAY_ID, kind, &payload).map(|e| e.targeting(&master.device_id)) {
        Ok(envelope) => match envelope.to_json() {
            Ok(text) => {
                master.send(&text);
            }
            Err(e) => warn!("Failed to encode presence notice: {}", e),
        },
        Err(e) => warn!("Failed to build presence notice: {}", e),
    }
}

// =============================================================================
// HTTP Handlers
// =============================================================================

/// Builds the relay router.
pub fn router(state: Arc<RelayState>) -> Router {
    Router::new()
        .route("/register", post(register_handler))
        .route("/ws", get(ws_handler))
        .route("/health", get(health_handler))
        .with_state(state)
}

/// Health check endpoint.
async fn health_handler() -> impl IntoResponse {
    "OK"
}

async fn register_handler(
    State(state): State<Arc<RelayState>>,
    request: Result<Json<RegisterRequest>, JsonRejection>,
) -> Result<Json<RegisterResponse>, RelayError> {
    let Json(request) = request.map_err(|e| RelayError::InvalidRequest(e.body_text()))?;
    state.register(&request).map(Json)
}

#[derive(Debug, Deserialize)]
struct WsParams {
    token: String,
}

/// WebSocket upgrade handler.
async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<RelayState>>,
    Query(params): Query<WsParams>,
) -> Result<Response, RelayError> {
    let claims = state.validate_token(&params.token)?;
    debug!(device_id = %claims.sub, "Socket upgrade accepted");
    Ok(ws
        .max_message_size(MAX_MESSAGE_SIZE)
        .on_upgrade(move |socket| handle_socket(socket, state, claims))
        .into_response())
}

// =============================================================================
// Socket Handling
// =============================================================================

/// Handles one terminal socket.
async fn handle_socket(socket: WebSocket, state: Arc<RelayState>, claims: Claims) {
    let device_id = claims.sub.clone();
    let (mut sender, mut receiver) = socket.split();
    let (session, mut outgoing_rx) = state.attach(&claims).await;

    // Outgoing message task
    let writer = tokio::spawn(async move {
        while let Some(text) = outgoing_rx.recv().await {
            if sender.send(Message::Text(text.into())).await.is_err() {
                break;
            }
        }
        let _ = sender.send(Message::Close(None)).await;
    });

    // Heartbeat task
    let heartbeat_state = state.clone();
    let heartbeat_device = device_id.clone();
    let heartbeat = tokio::spawn(async move {
        let period = heartbeat_state.config().heartbeat_interval();
        let mut ticker = interval_at(Instant::now() + period, period);
        loop {
            ticker.tick().await;
            if !send_heartbeat(&heartbeat_state, &heartbeat_device, session).await {
                break;
            }
        }
    });

    // Main receive loop
    loop {
        match receiver.next().await {
            Some(Ok(Message::Text(text))) => match MessageEnvelope::from_json(text.as_str()) {
                Ok(envelope) => {
                    state.route(&device_id, &envelope).await;
                }
                Err(e) => debug!(device_id = %device_id, "Invalid message format: {}", e),
            },
            Some(Ok(Message::Close(_))) => {
                info!(device_id = %device_id, "Client requested close");
                break;
            }
            Some(Ok(_)) => {}
            Some(Err(e)) => {
                warn!(device_id = %device_id, "WebSocket error: {}", e);
                break;
            }
            None => {
                info!(device_id = %device_id, "Client disconnected");
                break;
            }
        }
    }

    // Cleanup
    heartbeat.abort();
    state.detach(&device_id, session).await;
    writer.abort();
}

/// Queues a heartbeat for the device's live session. False once the
/// session is gone.
async fn send_heartbeat(state: &RelayState, device_id: &str, session: u64) -> bool {
    let devices = state.devices.read().await;
    let Some(device) = devices.get(device_id).filter(|d| d.session == session) else {
        return false;
    };
    let envelope = match MessageEnvelope::with_payload(RELAY_ID, message_types::HEARTBEAT, &HeartbeatPayload::now()) {
        Ok(envelope) => envelope.targeting(device_id),
        Err(e) => {
            warn!("Failed to build heartbeat: {}", e);
            return true;
        }
    };
    match envelope.to_json() {
        Ok(text) => device.send(&text),
        Err(e) => {
            warn!("Failed to encode heartbeat: {}", e);
            true
        }
    }
}
