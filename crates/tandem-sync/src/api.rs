//! # Resilient HTTP Client
//!
//! [`ApiManager`] executes a logical request against one of several physical
//! addresses of a named server.
//!
//! ## Address Selection
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    run_api("kernel", ...)                               │
//! │                                                                         │
//! │   addresses: [A, B, C]      last success: B                            │
//! │                                                                         │
//! │   attempt 1 ──► B   (sticky success first)                             │
//! │   attempt 2 ──► C                                                      │
//! │   attempt 3 ──► A   (wrap-around)                                      │
//! │                                                                         │
//! │   open breaker  ──► skipped, does not consume an attempt               │
//! │                     (at most one skip per address)                     │
//! │   2xx           ──► remember index, return response + telemetry        │
//! │   502/503/504,  ──► retry after retry_interval                         │
//! │   transport err                                                        │
//! │   other status  ──► Business error, no retry                           │
//! │   exhausted     ──► AllServersFailed + telemetry                       │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The whole call (all attempts) passes through one [`RequestQueue`] slot.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::breaker::{BreakerConfig, BreakerState, CircuitBreaker};
use crate::error::{SyncError, SyncResult};
use crate::request_queue::RequestQueue;

// =============================================================================
// Server Configuration
// =============================================================================

/// One physical address of a logical server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerAddress {
    pub address_name: String,
    /// Base URL without trailing slash, e.g. `http://10.0.0.5:8080`.
    pub base_url: String,
    /// Per-attempt timeout.
    pub timeout: Duration,
}

impl ServerAddress {
    pub fn new(address_name: impl Into<String>, base_url: impl Into<String>, timeout: Duration) -> Self {
        ServerAddress {
            address_name: address_name.into(),
            base_url: base_url.into(),
            timeout,
        }
    }
}

/// A logical server with its failover addresses and retry policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    pub name: String,
    pub addresses: Vec<ServerAddress>,
    /// Extra attempts after the first.
    pub retry_count: u32,
    pub retry_interval: Duration,
}

// =============================================================================
// HTTP Transport Seam
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpMethod {
    Get,
    Post,
    Put,
    Delete,
}

impl std::fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HttpMethod::Get => write!(f, "GET"),
            HttpMethod::Post => write!(f, "POST"),
            HttpMethod::Put => write!(f, "PUT"),
            HttpMethod::Delete => write!(f, "DELETE"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: HttpMethod,
    pub url: String,
    pub body: Option<Value>,
    pub timeout: Duration,
}

#[derive(Debug, Clone, PartialEq)]
pub struct HttpResponse {
    pub status: u16,
    /// Parsed JSON body; non-JSON bodies arrive as a string value.
    pub body: Value,
}

/// Sends one HTTP request. Any response (including non-2xx) is `Ok`;
/// `Err` means the server was not reached.
#[async_trait]
pub trait HttpTransport: Send + Sync {
    async fn send(&self, request: HttpRequest) -> SyncResult<HttpResponse>;
}

/// [`HttpTransport`] backed by `reqwest`.
#[derive(Debug, Clone, Default)]
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    async fn send(&self, request: HttpRequest) -> SyncResult<HttpResponse> {
        let method = match request.method {
            HttpMethod::Get => reqwest::Method::GET,
            HttpMethod::Post => reqwest::Method::POST,
            HttpMethod::Put => reqwest::Method::PUT,
            HttpMethod::Delete => reqwest::Method::DELETE,
        };
        let mut builder = self
            .client
            .request(method, &request.url)
            .timeout(request.timeout);
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }

        let response = builder.send().await.map_err(|e| {
            if e.is_timeout() {
                SyncError::Timeout(request.timeout.as_millis() as u64)
            } else {
                SyncError::from(e)
            }
        })?;

        let status = response.status().as_u16();
        let text = response.text().await?;
        let body = if text.is_empty() {
            Value::Null
        } else {
            serde_json::from_str(&text).unwrap_or(Value::String(text))
        };
        Ok(HttpResponse { status, body })
    }
}

// =============================================================================
// Telemetry
// =============================================================================

/// What happened at one address during one call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AttemptRecord {
    pub address_name: String,
    pub address_index: usize,
    /// 1-based attempt number; 0 for skipped addresses.
    pub attempt: u32,
    pub skipped: bool,
    /// Absent for attempts that do not go through a breaker (link connects).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub breaker_state: Option<BreakerState>,
    pub elapsed_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Successful response annotated with per-attempt telemetry.
#[derive(Debug, Clone)]
pub struct ApiResponse {
    pub status: u16,
    pub body: Value,
    pub address_name: String,
    pub telemetry: Vec<AttemptRecord>,
}

// =============================================================================
// ApiManager
// =============================================================================

struct ServerEntry {
    config: ServerConfig,
    breakers: Vec<CircuitBreaker>,
    last_success: AtomicUsize,
}

/// Multi-address HTTP client with per-address breakers.
pub struct ApiManager {
    transport: Arc<dyn HttpTransport>,
    breaker_config: BreakerConfig,
    queue: RequestQueue,
    servers: RwLock<HashMap<String, Arc<ServerEntry>>>,
}

impl ApiManager {
    pub fn new(
        transport: Arc<dyn HttpTransport>,
        breaker_config: BreakerConfig,
        queue: RequestQueue,
    ) -> Self {
        ApiManager {
            transport,
            breaker_config,
            queue,
            servers: RwLock::new(HashMap::new()),
        }
    }

    /// Registers or replaces a server. Replacing recreates every breaker
    /// and resets the sticky-success index.
    pub fn register_server(&self, config: ServerConfig) {
        let breakers = config
            .addresses
            .iter()
            .enumerate()
            .map(|(i, addr)| {
                CircuitBreaker::new(format!("{}#{}:{}", config.name, i, addr.address_name), self.breaker_config)
            })
            .collect();
        info!(
            server = %config.name,
            addresses = config.addresses.len(),
            "Registered server"
        );
        let entry = Arc::new(ServerEntry {
            config,
            breakers,
            last_success: AtomicUsize::new(0),
        });
        let mut servers = self.servers.write().unwrap_or_else(|p| p.into_inner());
        servers.insert(entry.config.name.clone(), entry);
    }

    /// Current address list of `server`.
    pub fn addresses(&self, server: &str) -> SyncResult<Vec<ServerAddress>> {
        Ok(self.entry(server)?.config.addresses.clone())
    }

    pub fn has_server(&self, server: &str) -> bool {
        self.entry(server).is_ok()
    }

    /// Index of the address that last answered successfully.
    pub fn last_success_index(&self, server: &str) -> SyncResult<usize> {
        Ok(self.entry(server)?.last_success.load(Ordering::Acquire))
    }

    pub fn breaker_state(&self, server: &str, index: usize) -> SyncResult<BreakerState> {
        let entry = self.entry(server)?;
        entry
            .breakers
            .get(index)
            .map(CircuitBreaker::state)
            .ok_or_else(|| SyncError::Internal(format!("breaker {} not initialized for {}", index, server)))
    }

    fn entry(&self, server: &str) -> SyncResult<Arc<ServerEntry>> {
        let servers = self.servers.read().unwrap_or_else(|p| p.into_inner());
        servers
            .get(server)
            .cloned()
            .ok_or_else(|| SyncError::ServerNotConfigured(server.to_string()))
    }

    /// Executes `method path` against `server`.
    pub async fn run_api(
        &self,
        server: &str,
        path: &str,
        method: HttpMethod,
        body: Option<Value>,
    ) -> SyncResult<ApiResponse> {
        let entry = self.entry(server)?;
        self.queue
            .run(|| self.run_attempts(entry, path, method, body))
            .await
    }

    /// `POST` shorthand.
    pub async fn post(&self, server: &str, path: &str, body: Value) -> SyncResult<ApiResponse> {
        self.run_api(server, path, HttpMethod::Post, Some(body)).await
    }

    /// Executes one attempt against a single named address of `server`,
    /// through that address's breaker and the shared queue. Handshakes use
    /// this to reach the address the link is connecting to.
    pub async fn call_address(
        &self,
        server: &str,
        address_name: &str,
        path: &str,
        method: HttpMethod,
        body: Option<Value>,
    ) -> SyncResult<ApiResponse> {
        let entry = self.entry(server)?;
        let index = entry
            .config
            .addresses
            .iter()
            .position(|a| a.address_name == address_name)
            .ok_or_else(|| SyncError::ServerNotConfigured(format!("{}/{}", server, address_name)))?;
        self.queue
            .run(|| self.attempt_once(entry, index, path, method, body))
            .await
    }

    async fn attempt_once(
        &self,
        entry: Arc<ServerEntry>,
        index: usize,
        path: &str,
        method: HttpMethod,
        body: Option<Value>,
    ) -> SyncResult<ApiResponse> {
        let address = &entry.config.addresses[index];
        let breaker = &entry.breakers[index];
        let request = HttpRequest {
            method,
            url: format!("{}{}", address.base_url, path),
            body,
            timeout: address.timeout,
        };

        let started = Instant::now();
        let result = breaker
            .execute(|| async move {
                let response = self.transport.send(request).await?;
                classify(response)
            })
            .await;
        let elapsed_ms = started.elapsed().as_millis() as u64;

        match result {
            Ok(response) => {
                entry.last_success.store(index, Ordering::Release);
                Ok(ApiResponse {
                    status: response.status,
                    body: response.body,
                    address_name: address.address_name.clone(),
                    telemetry: vec![AttemptRecord {
                        address_name: address.address_name.clone(),
                        address_index: index,
                        attempt: 1,
                        skipped: false,
                        breaker_state: Some(breaker.state()),
                        elapsed_ms,
                        status: Some(response.status),
                        error: None,
                    }],
                })
            }
            Err(e) => {
                warn!(
                    server = %entry.config.name,
                    address = %address.address_name,
                    elapsed_ms,
                    breaker = ?breaker.state(),
                    "Single-address call failed: {}",
                    e
                );
                Err(e)
            }
        }
    }

    async fn run_attempts(
        &self,
        entry: Arc<ServerEntry>,
        path: &str,
        method: HttpMethod,
        body: Option<Value>,
    ) -> SyncResult<ApiResponse> {
        let config = &entry.config;
        let count = config.addresses.len();
        if count == 0 {
            return Err(SyncError::ServerNotConfigured(config.name.clone()));
        }

        let max_attempts = config.retry_count + 1;
        let mut cursor = entry.last_success.load(Ordering::Acquire);
        let mut skip_budget = count;
        let mut attempt = 0;
        let mut telemetry = Vec::new();

        while attempt < max_attempts {
            let index = cursor % count;
            cursor += 1;
            let address = &config.addresses[index];
            let breaker = &entry.breakers[index];

            if skip_budget > 0 && !breaker.allows_request() {
                skip_budget -= 1;
                debug!(server = %config.name, address = %address.address_name, "Skipping open breaker");
                telemetry.push(AttemptRecord {
                    address_name: address.address_name.clone(),
                    address_index: index,
                    attempt: 0,
                    skipped: true,
                    breaker_state: Some(breaker.state()),
                    elapsed_ms: 0,
                    status: None,
                    error: None,
                });
                continue;
            }

            attempt += 1;
            let request = HttpRequest {
                method,
                url: format!("{}{}", address.base_url, path),
                body: body.clone(),
                timeout: address.timeout,
            };
            let started = Instant::now();
            let result = breaker
                .execute(|| async move {
                    let response = self.transport.send(request).await?;
                    classify(response)
                })
                .await;
            let elapsed_ms = started.elapsed().as_millis() as u64;

            let mut record = AttemptRecord {
                address_name: address.address_name.clone(),
                address_index: index,
                attempt,
                skipped: false,
                breaker_state: Some(breaker.state()),
                elapsed_ms,
                status: None,
                error: None,
            };

            match result {
                Ok(response) => {
                    record.status = Some(response.status);
                    telemetry.push(record);
                    entry.last_success.store(index, Ordering::Release);
                    debug!(
                        server = %config.name,
                        address = %address.address_name,
                        status = response.status,
                        attempt,
                        "API call succeeded"
                    );
                    return Ok(ApiResponse {
                        status: response.status,
                        body: response.body,
                        address_name: address.address_name.clone(),
                        telemetry,
                    });
                }
                Err(e) if e.is_retryable() => {
                    if let SyncError::Unavailable(status) = e {
                        record.status = Some(status);
                    }
                    record.error = Some(e.to_string());
                    telemetry.push(record);
                    warn!(
                        server = %config.name,
                        address = %address.address_name,
                        attempt,
                        "API attempt failed: {}",
                        e
                    );
                    if attempt < max_attempts {
                        tokio::time::sleep(config.retry_interval).await;
                    }
                }
                Err(e) => return Err(e),
            }
        }

        Err(SyncError::AllServersFailed {
            server: config.name.clone(),
            attempts: telemetry,
        })
    }
}

/// 2xx passes; gateway errors are retryable; everything else is business.
fn classify(response: HttpResponse) -> SyncResult<HttpResponse> {
    match response.status {
        200..=299 => Ok(response),
        502..=504 => Err(SyncError::Unavailable(response.status)),
        status => Err(SyncError::Business {
            status,
            body: match response.body {
                Value::String(s) => s,
                other => other.to_string(),
            },
        }),
    }
}

impl std::fmt::Debug for ApiManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let servers = self.servers.read().unwrap_or_else(|p| p.into_inner());
        let mut names: Vec<_> = servers.keys().cloned().collect();
        names.sort();
        f.debug_struct("ApiManager")
            .field("servers", &names)
            .field("queue", &self.queue)
            .finish()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Mutex;

    /// Scripted transport: responses keyed by base URL, calls recorded.
    #[derive(Default)]
    pub(crate) struct FakeTransport {
        pub routes: Mutex<HashMap<String, Vec<SyncResult<HttpResponse>>>>,
        pub calls: Mutex<Vec<HttpRequest>>,
    }

    impl FakeTransport {
        pub fn script(&self, base_url: &str, result: SyncResult<HttpResponse>) {
            self.routes
                .lock()
                .unwrap()
                .entry(base_url.to_string())
                .or_default()
                .push(result);
        }

        pub fn called_urls(&self) -> Vec<String> {
            self.calls.lock().unwrap().iter().map(|r| r.url.clone()).collect()
        }
    }

    #[async_trait]
    impl HttpTransport for FakeTransport {
        async fn send(&self, request: HttpRequest) -> SyncResult<HttpResponse> {
            self.calls.lock().unwrap().push(request.clone());
            let mut routes = self.routes.lock().unwrap();
            let base = routes
                .keys()
                .find(|base| request.url.starts_with(base.as_str()))
                .cloned();
            match base.and_then(|b| {
                let queue = routes.get_mut(&b)?;
                (!queue.is_empty()).then(|| queue.remove(0))
            }) {
                Some(result) => result,
                None => Ok(HttpResponse {
                    status: 200,
                    body: json!({ "ok": true }),
                }),
            }
        }
    }

    fn ok() -> SyncResult<HttpResponse> {
        Ok(HttpResponse {
            status: 200,
            body: json!({ "ok": true }),
        })
    }

    fn refused() -> SyncResult<HttpResponse> {
        Err(SyncError::ConnectionFailed("refused".into()))
    }

    fn server(retry_count: u32) -> ServerConfig {
        ServerConfig {
            name: "kernel".into(),
            addresses: ["a", "b", "c"]
                .iter()
                .map(|n| ServerAddress::new(*n, format!("http://{}", n), Duration::from_secs(1)))
                .collect(),
            retry_count,
            retry_interval: Duration::from_millis(100),
        }
    }

    fn manager(transport: Arc<FakeTransport>) -> ApiManager {
        ApiManager::new(
            transport,
            BreakerConfig {
                threshold: 1,
                timeout: Duration::from_secs(30),
            },
            RequestQueue::new(8, 2),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_call_address_trips_only_that_breaker() {
        let transport = Arc::new(FakeTransport::default());
        let api = manager(transport.clone());
        api.register_server(server(2));

        transport.script("http://b", refused());
        let err = api
            .call_address("kernel", "b", "/register", HttpMethod::Post, None)
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::ConnectionFailed(_)));
        assert_eq!(transport.called_urls(), vec!["http://b/register".to_string()]);
        assert_eq!(api.breaker_state("kernel", 1).unwrap(), BreakerState::Open);
        assert_eq!(api.breaker_state("kernel", 0).unwrap(), BreakerState::Closed);

        // Open breaker rejects without reaching the transport.
        let err = api
            .call_address("kernel", "b", "/register", HttpMethod::Post, None)
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::BreakerOpen));
        assert_eq!(transport.called_urls().len(), 1);

        let response = api
            .call_address("kernel", "c", "/register", HttpMethod::Post, None)
            .await
            .unwrap();
        assert_eq!(response.address_name, "c");
        assert_eq!(response.telemetry.len(), 1);

        assert!(matches!(
            api.call_address("kernel", "z", "/register", HttpMethod::Post, None).await,
            Err(SyncError::ServerNotConfigured(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failover_starts_at_last_success_and_wraps() {
        let transport = Arc::new(FakeTransport::default());
        let api = manager(transport.clone());
        api.register_server(server(2));

        // Make B the sticky address.
        transport.script("http://a", refused());
        api.run_api("kernel", "/ping", HttpMethod::Get, None).await.unwrap();
        assert_eq!(api.last_success_index("kernel").unwrap(), 1);
        transport.calls.lock().unwrap().clear();

        // Reset breakers while keeping the sticky index.
        api.register_server(server(2));
        api.servers.read().unwrap()["kernel"]
            .last_success
            .store(1, Ordering::Release);

        transport.script("http://b", refused());
        transport.script("http://c", refused());
        transport.script("http://a", ok());
        let response = api.run_api("kernel", "/ping", HttpMethod::Get, None).await.unwrap();

        assert_eq!(
            transport.called_urls(),
            vec!["http://b/ping", "http://c/ping", "http://a/ping"]
        );
        assert_eq!(response.address_name, "a");
        assert_eq!(response.telemetry.len(), 3);
        assert_eq!(api.last_success_index("kernel").unwrap(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_breakers_are_skipped() {
        let transport = Arc::new(FakeTransport::default());
        let api = manager(transport.clone());
        api.register_server(server(0));

        // Threshold 1: one failure opens A.
        transport.script("http://a", refused());
        assert!(api.run_api("kernel", "/x", HttpMethod::Get, None).await.is_err());
        assert_eq!(api.breaker_state("kernel", 0).unwrap(), BreakerState::Open);

        transport.calls.lock().unwrap().clear();
        let response = api.run_api("kernel", "/x", HttpMethod::Get, None).await.unwrap();
        assert_eq!(transport.called_urls(), vec!["http://b/x"]);
        assert!(response.telemetry[0].skipped);
        assert_eq!(response.telemetry[0].address_name, "a");
    }

    #[tokio::test(start_paused = true)]
    async fn test_all_failed_reports_telemetry() {
        let transport = Arc::new(FakeTransport::default());
        let api = manager(transport.clone());
        api.register_server(server(2));
        for base in ["http://a", "http://b", "http://c"] {
            transport.script(base, Err(SyncError::Timeout(1000)));
        }

        match api.run_api("kernel", "/x", HttpMethod::Get, None).await {
            Err(SyncError::AllServersFailed { server, attempts }) => {
                assert_eq!(server, "kernel");
                assert_eq!(attempts.len(), 3);
                assert!(attempts.iter().all(|a| a.error.is_some()));
            }
            other => panic!("expected AllServersFailed, got {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_all_breakers_open_terminates() {
        let transport = Arc::new(FakeTransport::default());
        let api = manager(transport.clone());
        api.register_server(server(0));
        for _ in 0..3 {
            for base in ["http://a", "http://b", "http://c"] {
                transport.script(base, refused());
            }
        }
        let _ = api.run_api("kernel", "/x", HttpMethod::Get, None).await;
        let _ = api.run_api("kernel", "/x", HttpMethod::Get, None).await;
        let _ = api.run_api("kernel", "/x", HttpMethod::Get, None).await;

        let result = api.run_api("kernel", "/x", HttpMethod::Get, None).await;
        match result {
            Err(SyncError::AllServersFailed { attempts, .. }) => {
                assert_eq!(attempts.iter().filter(|a| a.skipped).count(), 3);
                assert_eq!(attempts.iter().filter(|a| !a.skipped).count(), 1);
            }
            other => panic!("expected AllServersFailed, got {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_business_error_is_not_retried() {
        let transport = Arc::new(FakeTransport::default());
        let api = manager(transport.clone());
        api.register_server(server(2));
        transport.script(
            "http://a",
            Ok(HttpResponse {
                status: 409,
                body: json!({ "error": "duplicate sale" }),
            }),
        );

        let err = api.run_api("kernel", "/sale", HttpMethod::Post, None).await.unwrap_err();
        assert!(matches!(err, SyncError::Business { status: 409, .. }));
        assert_eq!(transport.called_urls().len(), 1);
        assert_eq!(api.breaker_state("kernel", 0).unwrap(), BreakerState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_gateway_error_is_retried() {
        let transport = Arc::new(FakeTransport::default());
        let api = manager(transport.clone());
        api.register_server(server(1));
        transport.script(
            "http://a",
            Ok(HttpResponse {
                status: 503,
                body: Value::Null,
            }),
        );

        let response = api.run_api("kernel", "/x", HttpMethod::Get, None).await.unwrap();
        assert_eq!(response.address_name, "b");
        assert_eq!(response.telemetry[0].status, Some(503));
    }

    #[tokio::test]
    async fn test_unknown_server() {
        let api = manager(Arc::new(FakeTransport::default()));
        assert!(matches!(
            api.run_api("nope", "/", HttpMethod::Get, None).await,
            Err(SyncError::ServerNotConfigured(_))
        ));
    }

    #[tokio::test]
    async fn test_register_server_replaces_addresses() {
        let api = manager(Arc::new(FakeTransport::default()));
        api.register_server(server(0));
        let mut replacement = server(0);
        replacement.addresses.truncate(1);
        api.register_server(replacement);
        assert_eq!(api.addresses("kernel").unwrap().len(), 1);
        assert_eq!(api.last_success_index("kernel").unwrap(), 0);
    }
}
