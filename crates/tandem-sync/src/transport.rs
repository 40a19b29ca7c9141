//! # Link Transport
//!
//! The [`LinkConnector`] seam separates the two link flavours from the
//! connection state machine.
//!
//! ## Handshake
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        Link Handshakes                                  │
//! │                                                                         │
//! │  MASTER-SERVER LINK (MasterServerConnector)                            │
//! │  ──────────────────                                                    │
//! │  1. POST {baseURL}/register   (ApiManager, per-address breaker)       │
//! │       { type, deviceId, deviceName, masterDeviceId? }                  │
//! │     ◄── { success, token, error? }                                     │
//! │  2. open ws(s)://{host}/ws?token={token}                               │
//! │                                                                         │
//! │  KERNEL LINK (KernelConnector)                                         │
//! │  ───────────                                                           │
//! │  1. build ws(s)://{host}{path}?deviceId={id}&token={token}             │
//! │  2. open                                                               │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! An open link is a pair of channels. A pump task moves text frames
//! between them and the WebSocket; dropping the outbound sender closes the
//! socket, and the inbound receiver yields `None` once the socket is gone.

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message as WsMessage};
use tracing::{debug, info, warn};
use url::Url;

use std::sync::Arc;

use tandem_core::protocol::{RegisterRequest, RegisterResponse};
use tandem_core::Role;

use crate::api::{ApiManager, HttpMethod, ServerAddress};
use crate::error::{SyncError, SyncResult};

/// Inbound frames buffered per link before the pump waits.
const INBOUND_BUFFER: usize = 256;

// =============================================================================
// Identity & Channels
// =============================================================================

/// Who this terminal is, as presented during a handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkIdentity {
    pub device_id: String,
    pub device_name: String,
    pub role: Role,
    pub master_device_id: Option<String>,
    /// Pre-shared token (kernel link).
    pub token: Option<String>,
}

/// Both directions of an open link.
#[derive(Debug)]
pub struct LinkChannel {
    pub outbound: mpsc::UnboundedSender<String>,
    pub inbound: mpsc::Receiver<SyncResult<String>>,
}

/// Handshake and socket opening for one link flavour.
#[async_trait]
pub trait LinkConnector: Send + Sync {
    /// Performs the handshake with `address` and returns the socket URL.
    async fn register(&self, address: &ServerAddress, identity: &LinkIdentity) -> SyncResult<String>;

    /// Opens the socket.
    async fn open(&self, url: &str) -> SyncResult<LinkChannel>;
}

// =============================================================================
// Master-Server Link
// =============================================================================

/// Registers with the relay over HTTP, then opens `/ws?token=`.
///
/// Registration goes through [`ApiManager::call_address`], so an address
/// that keeps refusing trips its breaker like any other call.
#[derive(Debug, Clone)]
pub struct MasterServerConnector {
    api: Arc<ApiManager>,
    server: String,
}

impl MasterServerConnector {
    pub fn new(api: Arc<ApiManager>, server: impl Into<String>) -> Self {
        MasterServerConnector {
            api,
            server: server.into(),
        }
    }
}

#[async_trait]
impl LinkConnector for MasterServerConnector {
    async fn register(&self, address: &ServerAddress, identity: &LinkIdentity) -> SyncResult<String> {
        let request = RegisterRequest {
            device_type: identity.role,
            device_id: identity.device_id.clone(),
            device_name: identity.device_name.clone(),
            master_device_id: match identity.role {
                Role::Slave => identity.master_device_id.clone(),
                Role::Master => None,
            },
        };

        debug!(address = %address.address_name, "Registering with relay");
        let response = match self
            .api
            .call_address(
                &self.server,
                &address.address_name,
                "/register",
                HttpMethod::Post,
                Some(serde_json::to_value(&request)?),
            )
            .await
        {
            Ok(response) => response,
            Err(SyncError::Business { status, body }) => {
                return Err(SyncError::RegistrationFailed(rejection_reason(status, &body)))
            }
            Err(e) => return Err(e),
        };

        let body: RegisterResponse = serde_json::from_value(response.body).map_err(|e| {
            SyncError::RegistrationFailed(format!("HTTP {}: {}", response.status, e))
        })?;
        if !body.success {
            return Err(SyncError::RegistrationFailed(
                body.error.unwrap_or_else(|| format!("rejected with HTTP {}", response.status)),
            ));
        }
        let token = body
            .token
            .ok_or_else(|| SyncError::RegistrationFailed("response carried no token".into()))?;

        socket_url(&address.base_url, "/ws", &[("token", token.as_str())])
    }

    async fn open(&self, url: &str) -> SyncResult<LinkChannel> {
        open_websocket(url).await
    }
}

/// The relay rejects with a `RegisterResponse` body; fall back to the raw body.
fn rejection_reason(status: u16, body: &str) -> String {
    serde_json::from_str::<RegisterResponse>(body)
        .ok()
        .and_then(|response| response.error)
        .unwrap_or_else(|| format!("rejected with HTTP {}: {}", status, body))
}

// =============================================================================
// Kernel Link
// =============================================================================

/// Builds the kernel socket URL directly from the address.
#[derive(Debug, Clone)]
pub struct KernelConnector {
    path: String,
}

impl KernelConnector {
    pub fn new(path: impl Into<String>) -> Self {
        KernelConnector { path: path.into() }
    }
}

#[async_trait]
impl LinkConnector for KernelConnector {
    async fn register(&self, address: &ServerAddress, identity: &LinkIdentity) -> SyncResult<String> {
        let token = identity.token.as_deref().unwrap_or_default();
        socket_url(
            &address.base_url,
            &self.path,
            &[("deviceId", identity.device_id.as_str()), ("token", token)],
        )
    }

    async fn open(&self, url: &str) -> SyncResult<LinkChannel> {
        open_websocket(url).await
    }
}

// =============================================================================
// Helpers
// =============================================================================

/// `{base with ws(s) scheme}{path}?{query}`.
pub fn socket_url(base_url: &str, path: &str, query: &[(&str, &str)]) -> SyncResult<String> {
    let mut url = Url::parse(base_url)?;
    let scheme = match url.scheme() {
        "http" | "ws" => "ws",
        "https" | "wss" => "wss",
        other => {
            return Err(SyncError::InvalidUrl(format!(
                "unsupported scheme '{}' in {}",
                other, base_url
            )))
        }
    };
    url.set_scheme(scheme)
        .map_err(|_| SyncError::InvalidUrl(format!("cannot use {} as a socket URL", base_url)))?;

    let joined = format!("{}{}", url.path().trim_end_matches('/'), path);
    url.set_path(&joined);
    if !query.is_empty() {
        let mut pairs = url.query_pairs_mut();
        for (key, value) in query {
            pairs.append_pair(key, value);
        }
    }
    Ok(url.into())
}

/// Opens a WebSocket and spawns its pump task.
pub async fn open_websocket(url: &str) -> SyncResult<LinkChannel> {
    let (ws_stream, response) = connect_async(url).await?;
    debug!(status = ?response.status(), "WebSocket handshake complete");

    let (mut write, mut read) = ws_stream.split();
    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<String>();
    let (inbound_tx, inbound_rx) = mpsc::channel::<SyncResult<String>>(INBOUND_BUFFER);

    tokio::spawn(async move {
        loop {
            tokio::select! {
                outgoing = outbound_rx.recv() => match outgoing {
                    Some(text) => {
                        if let Err(e) = write.send(WsMessage::Text(text.into())).await {
                            let _ = inbound_tx.send(Err(SyncError::from(e))).await;
                            break;
                        }
                    }
                    None => {
                        let _ = write.send(WsMessage::Close(None)).await;
                        break;
                    }
                },

                incoming = read.next() => match incoming {
                    Some(Ok(WsMessage::Text(text))) => {
                        if inbound_tx.send(Ok(text.as_str().to_owned())).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(WsMessage::Ping(data))) => {
                        let _ = write.send(WsMessage::Pong(data)).await;
                    }
                    Some(Ok(WsMessage::Close(frame))) => {
                        info!(?frame, "Received close frame");
                        break;
                    }
                    Some(Ok(WsMessage::Binary(_))) => {
                        warn!("Received unexpected binary message");
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        let _ = inbound_tx.send(Err(SyncError::from(e))).await;
                        break;
                    }
                    None => break,
                },
            }
        }
        debug!("WebSocket pump stopped");
    });

    Ok(LinkChannel {
        outbound: outbound_tx,
        inbound: inbound_rx,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::tests::FakeTransport;
    use crate::api::{HttpResponse, ServerConfig};
    use crate::breaker::{BreakerConfig, BreakerState};
    use crate::request_queue::RequestQueue;
    use serde_json::json;
    use std::time::Duration;

    #[test]
    fn test_master_socket_url() {
        let url = socket_url("http://10.0.0.5:8080", "/ws", &[("token", "abc.def")]).unwrap();
        assert_eq!(url, "ws://10.0.0.5:8080/ws?token=abc.def");

        let url = socket_url("https://relay.example.com/pos/", "/ws", &[("token", "t")]).unwrap();
        assert_eq!(url, "wss://relay.example.com/pos/ws?token=t");
    }

    #[test]
    fn test_rejects_unknown_scheme() {
        assert!(socket_url("ftp://host", "/ws", &[]).is_err());
    }

    fn relay_api(transport: Arc<FakeTransport>) -> Arc<ApiManager> {
        let api = ApiManager::new(
            transport,
            BreakerConfig {
                threshold: 1,
                timeout: Duration::from_secs(30),
            },
            RequestQueue::new(8, 2),
        );
        api.register_server(ServerConfig {
            name: "relay".into(),
            addresses: vec![ServerAddress::new("lan", "http://relay.local", Duration::from_secs(5))],
            retry_count: 0,
            retry_interval: Duration::from_millis(100),
        });
        Arc::new(api)
    }

    fn slave_identity() -> LinkIdentity {
        LinkIdentity {
            device_id: "slave-1".into(),
            device_name: "Customer Display".into(),
            role: Role::Slave,
            master_device_id: Some("master-1".into()),
            token: None,
        }
    }

    #[tokio::test]
    async fn test_registration_yields_socket_url() {
        let transport = Arc::new(FakeTransport::default());
        transport.script(
            "http://relay.local",
            Ok(HttpResponse {
                status: 200,
                body: json!({ "success": true, "token": "abc" }),
            }),
        );
        let connector = MasterServerConnector::new(relay_api(transport.clone()), "relay");
        let address = ServerAddress::new("lan", "http://relay.local", Duration::from_secs(5));

        let url = connector.register(&address, &slave_identity()).await.unwrap();
        assert_eq!(url, "ws://relay.local/ws?token=abc");

        let calls = transport.calls.lock().unwrap();
        assert_eq!(calls[0].url, "http://relay.local/register");
        let body = calls[0].body.as_ref().unwrap();
        assert_eq!(body["type"], "slave");
        assert_eq!(body["masterDeviceId"], "master-1");
    }

    #[tokio::test]
    async fn test_registration_rejection_keeps_breaker_closed() {
        let transport = Arc::new(FakeTransport::default());
        transport.script(
            "http://relay.local",
            Ok(HttpResponse {
                status: 401,
                body: json!({ "success": false, "error": "unknown master" }),
            }),
        );
        let api = relay_api(transport);
        let connector = MasterServerConnector::new(api.clone(), "relay");
        let address = ServerAddress::new("lan", "http://relay.local", Duration::from_secs(5));

        match connector.register(&address, &slave_identity()).await {
            Err(SyncError::RegistrationFailed(reason)) => assert_eq!(reason, "unknown master"),
            other => panic!("expected rejection, got {:?}", other),
        }
        assert_eq!(api.breaker_state("relay", 0).unwrap(), BreakerState::Closed);
    }

    #[tokio::test]
    async fn test_unreachable_relay_trips_breaker() {
        let transport = Arc::new(FakeTransport::default());
        transport.script("http://relay.local", Err(SyncError::ConnectionFailed("refused".into())));
        let api = relay_api(transport.clone());
        let connector = MasterServerConnector::new(api.clone(), "relay");
        let address = ServerAddress::new("lan", "http://relay.local", Duration::from_secs(5));

        assert!(connector.register(&address, &slave_identity()).await.is_err());
        assert_eq!(api.breaker_state("relay", 0).unwrap(), BreakerState::Open);
        assert!(matches!(
            connector.register(&address, &slave_identity()).await,
            Err(SyncError::BreakerOpen)
        ));
        assert_eq!(transport.called_urls().len(), 1);
    }

    #[tokio::test]
    async fn test_kernel_url() {
        let connector = KernelConnector::new("/terminal/ws");
        let address = ServerAddress::new("lan", "http://kernel.local:9000", Duration::from_secs(5));
        let identity = LinkIdentity {
            device_id: "dev 1".into(),
            device_name: "Register".into(),
            role: Role::Master,
            master_device_id: None,
            token: Some("secret".into()),
        };
        let url = connector.register(&address, &identity).await.unwrap();
        assert_eq!(url, "ws://kernel.local:9000/terminal/ws?deviceId=dev+1&token=secret");
    }
}
