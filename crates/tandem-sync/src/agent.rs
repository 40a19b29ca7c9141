//! # Terminal Agent
//!
//! Composition root of a terminal process. Builds every runtime component
//! from a `TerminalConfig`, keeps both links up and routes their traffic.
//!
//! ## Agent Architecture
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                       TerminalAgent Architecture                        │
//! │                                                                         │
//! │  ┌──────────────────────────────────────────────────────────────────┐  │
//! │  │                        TerminalAgent                             │  │
//! │  │                                                                  │  │
//! │  │  • One supervisor task per link (master, kernel)                 │  │
//! │  │  • Reconnects with exponential backoff after any close           │  │
//! │  │  • Raises Connected / Disconnected commands on the bus           │  │
//! │  │  • Routes inbound envelopes to sync and remote handling          │  │
//! │  └────────────────────────────┬─────────────────────────────────────┘  │
//! │                               │                                         │
//! │         ┌─────────────────────┼─────────────────────┐                  │
//! │         ▼                     ▼                     ▼                   │
//! │  ┌────────────────┐  ┌────────────────┐  ┌────────────────────────┐    │
//! │  │ StateSyncEngine│  │  RemoteBridge  │  │     ActorSystem        │    │
//! │  │                │  │                │  │                        │    │
//! │  │ SYNC_STATE     │  │ REMOTE_COMMAND │  │ Feature actors,        │    │
//! │  │ SYNC_STATE_REQ │  │ presence, acks │  │ lifecycle listeners    │    │
//! │  └────────────────┘  └────────────────┘  └────────────────────────┘    │
//! │                                                                         │
//! │  ROUTING (master link):                                                │
//! │  ──────────────────────                                                │
//! │  sync traffic ──► StateSyncEngine                                      │
//! │  SLAVE_CONNECTED (master role) ──► targeted full-sync request          │
//! │  everything else ──► RemoteBridge                                      │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::sync::Arc;

use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use serde::Serialize;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use tandem_core::protocol::{message_types, SlaveLifecyclePayload};
use tandem_core::{MessageEnvelope, Role};

use crate::actor::{Actor, ActorSystem};
use crate::api::{ApiManager, HttpTransport, ReqwestTransport};
use crate::builtin::{Connected, Disconnected, LinkConnectedPayload, LinkDisconnectedPayload};
use crate::config::TerminalConfig;
use crate::connection::{ConnectionEvent, ConnectionManager, ConnectionState};
use crate::error::SyncResult;
use crate::remote::{RemoteBridge, RemoteConfig};
use crate::request_queue::RequestQueue;
use crate::state_store::StateStore;
use crate::state_sync::{StateSyncConfig, StateSyncEngine};
use crate::transport::{KernelConnector, LinkConnector, LinkIdentity, MasterServerConnector};

// =============================================================================
// Status
// =============================================================================

/// Snapshot of one link.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LinkStatus {
    pub state: ConnectionState,
    /// Address name of the live socket.
    pub address: Option<String>,
    /// Messages waiting for the next connect.
    pub queued: usize,
    pub last_error: Option<String>,
}

impl LinkStatus {
    fn of(link: &ConnectionManager) -> Self {
        LinkStatus {
            state: link.state(),
            address: link.connected_address(),
            queued: link.queued(),
            last_error: link.last_error(),
        }
    }
}

/// Snapshot of the whole terminal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TerminalStatus {
    pub device_id: String,
    pub role: Role,
    pub master: LinkStatus,
    pub kernel: Option<LinkStatus>,
    /// Forwards still waiting for the master's acknowledgement.
    pub pending_forwards: usize,
}

// =============================================================================
// Runtime
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LinkKind {
    Master,
    Kernel,
}

impl LinkKind {
    fn name(self) -> &'static str {
        match self {
            LinkKind::Master => "master",
            LinkKind::Kernel => "kernel",
        }
    }
}

/// How a pump session ended.
enum Flow {
    Reconnect,
    Shutdown,
}

struct Runtime {
    config: TerminalConfig,
    api: Arc<ApiManager>,
    system: ActorSystem,
    store: StateStore,
    master_link: ConnectionManager,
    kernel_link: Option<ConnectionManager>,
    sync: Arc<StateSyncEngine>,
    remote: RemoteBridge,
}

impl Runtime {
    fn link(&self, kind: LinkKind) -> Option<&ConnectionManager> {
        match kind {
            LinkKind::Master => Some(&self.master_link),
            LinkKind::Kernel => self.kernel_link.as_ref(),
        }
    }

    fn server(&self, kind: LinkKind) -> &str {
        match kind {
            LinkKind::Master => &self.config.master_link.server,
            LinkKind::Kernel => &self.config.kernel_link.server,
        }
    }

    fn identity(&self, kind: LinkKind) -> LinkIdentity {
        let token = match kind {
            LinkKind::Master => None,
            LinkKind::Kernel => {
                let token = &self.config.kernel_link.token;
                (!token.is_empty()).then(|| token.clone())
            }
        };
        LinkIdentity {
            device_id: self.config.device.id.clone(),
            device_name: self.config.device.name.clone(),
            role: self.config.role(),
            master_device_id: self.config.role.master_device_id.clone(),
            token,
        }
    }

    fn backoff(&self) -> ExponentialBackoff {
        let settings = &self.config.master_link;
        ExponentialBackoff {
            initial_interval: std::time::Duration::from_millis(settings.initial_backoff_ms),
            max_interval: std::time::Duration::from_secs(settings.max_backoff_secs),
            multiplier: 2.0,
            max_elapsed_time: None,
            ..Default::default()
        }
    }

    fn on_connected(&self, kind: LinkKind, address_name: String) {
        let payload = LinkConnectedPayload {
            link: kind.name().to_string(),
            address_name,
        };
        if let Err(e) = self.system.submit_internal::<Connected>(payload) {
            warn!(link = kind.name(), "Failed to raise Connected: {}", e);
        }
        if kind == LinkKind::Master {
            match self.sync.flush_outgoing() {
                Ok(sent) if sent > 0 => debug!(sent, "Sent state held while disconnected"),
                Ok(_) => {}
                Err(e) => warn!("Resending held state failed: {}", e),
            }
            if let Err(e) = self.sync.request_full_sync(None) {
                warn!("Full state sync request failed: {}", e);
            }
        }
    }

    fn on_disconnected(&self, kind: LinkKind, reason: String) {
        let payload = LinkDisconnectedPayload {
            link: kind.name().to_string(),
            reason,
        };
        if let Err(e) = self.system.submit_internal::<Disconnected>(payload) {
            warn!(link = kind.name(), "Failed to raise Disconnected: {}", e);
        }
    }

    fn route_master(&self, envelope: &MessageEnvelope) {
        match self.sync.handle_message(envelope) {
            Ok(true) => return,
            Ok(false) => {}
            Err(e) => {
                warn!(kind = %envelope.message_type, from = %envelope.from, "Bad sync message: {}", e);
                return;
            }
        }

        if envelope.message_type == message_types::SLAVE_CONNECTED && self.system.role() == Role::Master {
            match envelope.data_as::<SlaveLifecyclePayload>() {
                Ok(slave) => {
                    if let Err(e) = self.sync.request_full_sync(Some(&slave.device_id)) {
                        warn!(slave = %slave.device_id, "Full state sync request failed: {}", e);
                    }
                }
                Err(e) => warn!("Bad slave presence payload: {}", e),
            }
        }

        match self.remote.handle_master_message(&self.system, envelope) {
            Ok(true) => {}
            Ok(false) => debug!(kind = %envelope.message_type, from = %envelope.from, "Unhandled master link message"),
            Err(e) => warn!(kind = %envelope.message_type, from = %envelope.from, "Failed to handle message: {}", e),
        }
    }

    async fn route_kernel(&self, envelope: MessageEnvelope) {
        match self.remote.handle_kernel_message(&self.system, &envelope).await {
            Ok(true) => {}
            Ok(false) => debug!(kind = %envelope.message_type, "Unhandled kernel message"),
            Err(e) => warn!(kind = %envelope.message_type, "Failed to handle kernel message: {}", e),
        }
    }
}

// =============================================================================
// Terminal Agent
// =============================================================================

/// Owns the runtime and its background tasks.
pub struct TerminalAgent {
    runtime: Arc<Runtime>,
    shutdown_tx: watch::Sender<bool>,
    supervisors: Vec<JoinHandle<()>>,
    sync_task: Option<JoinHandle<()>>,
}

impl TerminalAgent {
    /// Builds a terminal with the production HTTP client and socket connectors.
    pub fn new(config: TerminalConfig) -> SyncResult<Self> {
        let api = Self::build_api(&config, Arc::new(ReqwestTransport::new()));
        let master_connector = MasterServerConnector::new(api.clone(), config.master_link.server.clone());
        let kernel_connector = KernelConnector::new(config.kernel_link.path.clone());
        Self::with_parts(config, api, Arc::new(master_connector), Arc::new(kernel_connector))
    }

    /// `ApiManager` with every `[[servers]]` entry registered.
    pub fn build_api(config: &TerminalConfig, http: Arc<dyn HttpTransport>) -> Arc<ApiManager> {
        let api = ApiManager::new(
            http,
            config.api.breaker(),
            RequestQueue::new(config.api.queue_capacity, config.api.max_concurrent),
        );
        for server in config.server_configs() {
            api.register_server(server);
        }
        Arc::new(api)
    }

    /// Builds a terminal with caller-supplied transports.
    pub fn with_parts(
        config: TerminalConfig,
        api: Arc<ApiManager>,
        master_connector: Arc<dyn LinkConnector>,
        kernel_connector: Arc<dyn LinkConnector>,
    ) -> SyncResult<Self> {
        config.validate()?;
        let role = config.role();
        let device_id = config.device_id().to_string();

        let store = StateStore::new();
        let system = ActorSystem::new(role, config.role.slave_context(), store.clone())?;

        let master_link = ConnectionManager::new(
            config.master_link.link_config(LinkKind::Master.name()),
            master_connector,
        );
        let kernel_link = config.kernel_link.enabled.then(|| {
            ConnectionManager::new(config.kernel_link.link_config(&config.master_link), kernel_connector)
        });

        let sync = Arc::new(StateSyncEngine::new(
            StateSyncConfig::for_role(role, &config.sync),
            device_id.clone(),
            store.clone(),
            master_link.clone(),
        ));

        let remote = RemoteBridge::new(
            RemoteConfig {
                local_id: device_id,
                master_device_id: match role {
                    Role::Slave => config.role.master_device_id.clone(),
                    Role::Master => None,
                },
                ack_timeout: std::time::Duration::from_millis(config.master_link.remote_ack_timeout_ms),
                kernel_server: config.kernel_link.server.clone(),
                confirm_path: config.kernel_link.confirm_path.clone(),
            },
            master_link.clone(),
            api.clone(),
        );
        if role == Role::Slave {
            system.register_actor(remote.forwarder_actor());
        }

        let (shutdown_tx, _) = watch::channel(false);
        Ok(TerminalAgent {
            runtime: Arc::new(Runtime {
                config,
                api,
                system,
                store,
                master_link,
                kernel_link,
                sync,
                remote,
            }),
            shutdown_tx,
            supervisors: Vec::new(),
            sync_task: None,
        })
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    pub fn system(&self) -> &ActorSystem {
        &self.runtime.system
    }

    pub fn store(&self) -> &StateStore {
        &self.runtime.store
    }

    pub fn api(&self) -> &Arc<ApiManager> {
        &self.runtime.api
    }

    pub fn master_link(&self) -> &ConnectionManager {
        &self.runtime.master_link
    }

    pub fn kernel_link(&self) -> Option<&ConnectionManager> {
        self.runtime.kernel_link.as_ref()
    }

    pub fn register_actor(&self, actor: Actor) {
        self.runtime.system.register_actor(actor);
    }

    pub fn is_running(&self) -> bool {
        self.sync_task.is_some()
    }

    pub fn status(&self) -> TerminalStatus {
        let runtime = &self.runtime;
        TerminalStatus {
            device_id: runtime.config.device_id().to_string(),
            role: runtime.config.role(),
            master: LinkStatus::of(&runtime.master_link),
            kernel: runtime.kernel_link.as_ref().map(LinkStatus::of),
            pending_forwards: runtime.remote.pending_count(),
        }
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Starts the sync loop and a supervisor per link. No-op when running.
    pub fn start(&mut self) {
        if self.is_running() {
            debug!("Terminal agent already running");
            return;
        }
        let runtime = &self.runtime;
        info!(
            device_id = %runtime.config.device_id(),
            role = %runtime.config.role(),
            kernel = runtime.kernel_link.is_some(),
            "Starting terminal agent"
        );

        self.shutdown_tx.send_replace(false);
        self.sync_task = Some(runtime.sync.clone().spawn());
        self.supervisors.push(tokio::spawn(supervise(
            runtime.clone(),
            LinkKind::Master,
            self.shutdown_tx.subscribe(),
        )));
        if runtime.kernel_link.is_some() {
            self.supervisors.push(tokio::spawn(supervise(
                runtime.clone(),
                LinkKind::Kernel,
                self.shutdown_tx.subscribe(),
            )));
        }
    }

    /// Stops supervision and closes both links.
    pub async fn shutdown(&mut self) {
        info!("Shutting down terminal agent");
        self.shutdown_tx.send_replace(true);

        for supervisor in self.supervisors.drain(..) {
            let _ = supervisor.await;
        }
        if let Some(task) = self.sync_task.take() {
            task.abort();
        }

        info!("Terminal agent stopped");
    }
}

impl std::fmt::Debug for TerminalAgent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TerminalAgent")
            .field("device_id", &self.runtime.config.device_id())
            .field("role", &self.runtime.config.role())
            .field("running", &self.is_running())
            .finish()
    }
}

// =============================================================================
// Link Supervision
// =============================================================================

/// Connect, pump, back off, repeat until shutdown.
async fn supervise(runtime: Arc<Runtime>, kind: LinkKind, mut shutdown: watch::Receiver<bool>) {
    let Some(link) = runtime.link(kind).cloned() else {
        return;
    };
    let server = runtime.server(kind).to_string();
    let identity = runtime.identity(kind);
    let mut backoff = runtime.backoff();
    info!(link = kind.name(), server = %server, "Link supervisor starting");

    loop {
        if *shutdown.borrow() {
            break;
        }

        let mut events = link.subscribe();
        let outcome = match runtime.api.addresses(&server) {
            Ok(addresses) => tokio::select! {
                result = link.connect(&addresses, &identity) => result,
                _ = shutdown.changed() => break,
            },
            Err(e) => Err(e),
        };

        match outcome {
            Ok(()) => {
                backoff.reset();
                if let Flow::Shutdown = pump(&runtime, kind, &mut events, &mut shutdown).await {
                    break;
                }
            }
            Err(e) => warn!(link = kind.name(), "Link connect failed: {}", e),
        }

        let Some(delay) = backoff.next_backoff() else {
            warn!(link = kind.name(), "Reconnect backoff exhausted");
            break;
        };
        debug!(link = kind.name(), ?delay, "Waiting before reconnect");
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = shutdown.changed() => break,
        }
    }

    link.disconnect("shutdown");
    info!(link = kind.name(), "Link supervisor stopped");
}

/// Handles one connected session's events.
async fn pump(
    runtime: &Arc<Runtime>,
    kind: LinkKind,
    events: &mut broadcast::Receiver<ConnectionEvent>,
    shutdown: &mut watch::Receiver<bool>,
) -> Flow {
    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(ConnectionEvent::Message(envelope)) => match kind {
                    LinkKind::Master => runtime.route_master(&envelope),
                    LinkKind::Kernel => {
                        let runtime = runtime.clone();
                        tokio::spawn(async move { runtime.route_kernel(envelope).await });
                    }
                },
                Ok(ConnectionEvent::Connected { address_name }) => runtime.on_connected(kind, address_name),
                Ok(ConnectionEvent::Disconnected { reason }) => {
                    runtime.on_disconnected(kind, reason);
                    return Flow::Reconnect;
                }
                Ok(ConnectionEvent::HeartbeatTimeout { elapsed_ms }) => {
                    warn!(link = kind.name(), elapsed_ms, "Peer went silent");
                }
                Ok(ConnectionEvent::Error(error)) => {
                    warn!(link = kind.name(), key = %error.key, "Link error: {}", error.message);
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!(link = kind.name(), skipped, "Link event stream lagged");
                }
                Err(RecvError::Closed) => return Flow::Shutdown,
            },

            _ = shutdown.changed() => return Flow::Shutdown,
        }
    }
}
