//! # Remote Commands
//!
//! Carries commands across links and turns link notifications into bus
//! commands.
//!
//! ## Round Trips
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                     Remote Command Round Trips                          │
//! │                                                                         │
//! │  SLAVE → MASTER                                                        │
//! │  ──────────────                                                        │
//! │  slave bus: ForwardToMaster ──► RemoteForwardActor                     │
//! │     │ REMOTE_COMMAND { commandId, commandName, payload, slaveInfo }    │
//! │     ▼                                                  handler waits   │
//! │  master: rehydrate ──► stamp slaveContext ──► dispatch                 │
//! │     │ REMOTE_COMMAND_EXECUTED { commandId }                            │
//! │     ▼                                                                  │
//! │  slave: pending ack resolved ──► on_complete                           │
//! │         (no ack within remote_ack_timeout ──► on_error)               │
//! │                                                                         │
//! │  KERNEL → TERMINAL                                                     │
//! │  ─────────────────                                                     │
//! │  REMOTE_COMMAND     ──► rehydrate ──► dispatch ──► POST confirm_path   │
//! │  UNIT_DATA_CHANGED  ──► UnitDataChanged on the bus                     │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::json;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use tandem_core::protocol::{message_types, CommandConfirmation, RemoteCommandPayload, SlaveLifecyclePayload};
use tandem_core::{Command, MessageEnvelope, Role};

use crate::actor::{Actor, ActorSystem, HandlerOutput};
use crate::api::ApiManager;
use crate::builtin::{
    ForwardToMaster, SlaveConnected, SlaveDisconnected, SlavePresencePayload, UnitDataChanged, UnitDataPayload,
};
use crate::connection::ConnectionManager;
use crate::error::{SyncError, SyncResult};

/// Actor name under which forwards are reported.
pub const FORWARD_ACTOR: &str = "RemoteForwardActor";

#[derive(Debug, Clone)]
pub struct RemoteConfig {
    pub local_id: String,
    /// Slave only: the master every forward is addressed to.
    pub master_device_id: Option<String>,
    pub ack_timeout: Duration,
    /// Logical server used for kernel confirmations.
    pub kernel_server: String,
    pub confirm_path: String,
}

struct BridgeInner {
    config: RemoteConfig,
    master_link: ConnectionManager,
    api: Arc<ApiManager>,
    pending: Mutex<HashMap<String, oneshot::Sender<()>>>,
}

#[derive(Clone)]
pub struct RemoteBridge {
    inner: Arc<BridgeInner>,
}

/// Drops the pending entry however the wait ends.
struct PendingAck<'a> {
    bridge: &'a RemoteBridge,
    command_id: String,
}

impl Drop for PendingAck<'_> {
    fn drop(&mut self) {
        self.bridge.lock_pending().remove(&self.command_id);
    }
}

impl RemoteBridge {
    pub fn new(config: RemoteConfig, master_link: ConnectionManager, api: Arc<ApiManager>) -> Self {
        RemoteBridge {
            inner: Arc::new(BridgeInner {
                config,
                master_link,
                api,
                pending: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Forwards awaiting `REMOTE_COMMAND_EXECUTED`.
    pub fn pending_count(&self) -> usize {
        self.lock_pending().len()
    }

    /// Slave-side actor relaying `ForwardToMaster` commands.
    pub fn forwarder_actor(&self) -> Actor {
        let bridge = self.clone();
        Actor::new(FORWARD_ACTOR).on::<ForwardToMaster, _, _>(move |command, _system| {
            let bridge = bridge.clone();
            async move { bridge.forward(command).await }
        })
    }

    async fn forward(&self, command: Command) -> HandlerOutput {
        let payload = command.payload_as::<ForwardToMaster>()?;
        let command_id = payload.command_id.clone();
        let config = &self.inner.config;

        let mut envelope = MessageEnvelope::with_payload(&config.local_id, message_types::REMOTE_COMMAND, &payload)?;
        if let Some(master) = &config.master_device_id {
            envelope = envelope.targeting(master);
        }

        let (tx, rx) = oneshot::channel();
        self.lock_pending().insert(command_id.clone(), tx);
        let _pending = PendingAck {
            bridge: self,
            command_id: command_id.clone(),
        };

        self.inner.master_link.send(&envelope)?;
        debug!(command = %payload.command_name, id = %command_id, "Forwarded command to master");

        match tokio::time::timeout(config.ack_timeout, rx).await {
            Ok(Ok(())) => Ok(Some(json!({ "commandId": command_id }))),
            Ok(Err(_)) => Err(SyncError::ChannelError(format!("acknowledgement for {} dropped", command_id))),
            Err(_) => Err(SyncError::RemoteAckTimeout {
                command_id,
                timeout_ms: config.ack_timeout.as_millis() as u64,
            }),
        }
    }

    /// Handles remote-command and presence traffic on the master link.
    /// Returns false for unrelated messages.
    pub fn handle_master_message(&self, system: &ActorSystem, envelope: &MessageEnvelope) -> SyncResult<bool> {
        match envelope.message_type.as_str() {
            message_types::REMOTE_COMMAND_EXECUTED => {
                let confirmation: CommandConfirmation = envelope.data_as()?;
                match self.lock_pending().remove(&confirmation.command_id) {
                    Some(tx) => {
                        let _ = tx.send(());
                    }
                    None => debug!(id = %confirmation.command_id, "Late or unknown acknowledgement"),
                }
                Ok(true)
            }

            message_types::REMOTE_COMMAND => {
                if system.role() != Role::Master {
                    warn!(from = %envelope.from, "Ignoring REMOTE_COMMAND on a slave");
                    return Ok(true);
                }
                let payload: RemoteCommandPayload = envelope.data_as()?;
                let command_id = payload.command_id.clone();
                self.execute_remote(system, payload)?;

                let ack = MessageEnvelope::with_payload(
                    &self.inner.config.local_id,
                    message_types::REMOTE_COMMAND_EXECUTED,
                    &CommandConfirmation { command_id },
                )?
                .targeting(&envelope.from);
                self.inner.master_link.send(&ack)?;
                Ok(true)
            }

            message_types::SLAVE_CONNECTED | message_types::SLAVE_DISCONNECTED => {
                if system.role() != Role::Master {
                    return Ok(true);
                }
                let slave: SlaveLifecyclePayload = envelope.data_as()?;
                let presence = SlavePresencePayload {
                    device_id: slave.device_id,
                    device_name: slave.device_name,
                };
                info!(slave = %presence.device_id, kind = %envelope.message_type, "Slave presence changed");
                if envelope.message_type == message_types::SLAVE_CONNECTED {
                    system.submit_internal::<SlaveConnected>(presence)?;
                } else {
                    system.submit_internal::<SlaveDisconnected>(presence)?;
                }
                Ok(true)
            }

            _ => Ok(false),
        }
    }

    /// Handles kernel link traffic. Returns false for unrelated messages.
    pub async fn handle_kernel_message(&self, system: &ActorSystem, envelope: &MessageEnvelope) -> SyncResult<bool> {
        match envelope.message_type.as_str() {
            message_types::REMOTE_COMMAND => {
                let payload: RemoteCommandPayload = envelope.data_as()?;
                let command_id = payload.command_id.clone();
                self.execute_remote(system, payload)?;

                let config = &self.inner.config;
                let body = serde_json::to_value(CommandConfirmation {
                    command_id: command_id.clone(),
                })?;
                let response = self
                    .inner
                    .api
                    .post(&config.kernel_server, &config.confirm_path, body)
                    .await?;
                debug!(id = %command_id, address = %response.address_name, "Confirmed kernel command");
                Ok(true)
            }

            message_types::UNIT_DATA_CHANGED => {
                system.submit_internal::<UnitDataChanged>(UnitDataPayload {
                    data: envelope.data.clone(),
                })?;
                Ok(true)
            }

            _ => Ok(false),
        }
    }

    /// Rebuilds a peer's command and dispatches it locally.
    ///
    /// The original id and correlation ids are kept so both sides report
    /// the same command.
    pub fn execute_remote(&self, system: &ActorSystem, payload: RemoteCommandPayload) -> SyncResult<Command> {
        let mut command = system
            .rehydrate(&payload.command_name, payload.payload)?
            .with_request(payload.request_id, payload.session_id);
        command.id = payload.command_id;
        command.slave_context = payload.slave_info;

        system.dispatch(command.clone())?;
        debug!(command = %command.name, id = %command.id, "Executed remote command");
        Ok(command)
    }

    fn lock_pending(&self) -> std::sync::MutexGuard<'_, HashMap<String, oneshot::Sender<()>>> {
        self.inner.pending.lock().unwrap_or_else(|p| p.into_inner())
    }
}

impl std::fmt::Debug for RemoteBridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteBridge")
            .field("local_id", &self.inner.config.local_id)
            .field("pending", &self.pending_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actor::tests::{recorder, AddItem, Note, Seen};
    use crate::api::tests::FakeTransport;
    use crate::api::{ServerAddress, ServerConfig};
    use crate::breaker::BreakerConfig;
    use crate::connection::tests::{addresses, identity, FakeConnector, FakeSocket};
    use crate::connection::LinkConfig;
    use crate::request_queue::RequestQueue;
    use crate::state_store::StateStore;
    use tandem_core::{DisplayMode, SlaveContext};
    use tokio::sync::mpsc;

    fn config(master: Option<&str>) -> RemoteConfig {
        RemoteConfig {
            local_id: if master.is_some() { "slave-1" } else { "master-1" }.to_string(),
            master_device_id: master.map(str::to_string),
            ack_timeout: Duration::from_secs(10),
            kernel_server: "kernel".into(),
            confirm_path: "/terminal/command/confirm".into(),
        }
    }

    fn api(transport: Arc<FakeTransport>) -> Arc<ApiManager> {
        let api = ApiManager::new(transport, BreakerConfig::default(), RequestQueue::new(8, 2));
        api.register_server(ServerConfig {
            name: "kernel".into(),
            addresses: vec![ServerAddress::new("lan", "http://kernel", Duration::from_secs(1))],
            retry_count: 0,
            retry_interval: Duration::from_millis(100),
        });
        Arc::new(api)
    }

    async fn connected_link() -> (ConnectionManager, FakeSocket) {
        let (connector, mut sockets) = FakeConnector::new();
        let link = ConnectionManager::new(LinkConfig::default(), Arc::new(connector));
        link.connect(&addresses(&["relay"]), &identity()).await.unwrap();
        let socket = sockets.recv().await.unwrap();
        (link, socket)
    }

    fn slave_system() -> ActorSystem {
        ActorSystem::new(
            Role::Slave,
            Some(SlaveContext::new("customer-display", DisplayMode::Secondary)),
            StateStore::new(),
        )
        .unwrap()
    }

    fn master_system() -> ActorSystem {
        let system = ActorSystem::new(Role::Master, None, StateStore::new()).unwrap();
        system.register::<AddItem>().unwrap();
        system
    }

    #[tokio::test]
    async fn test_forward_completes_on_ack() {
        let (link, mut socket) = connected_link().await;
        let bridge = RemoteBridge::new(config(Some("master-1")), link, api(Arc::default()));
        let system = slave_system();
        system.register_actor(bridge.forwarder_actor());
        let (_handle, mut seen) = recorder(&system);

        let id = system
            .submit::<AddItem>(Note { text: "coke".into() }, Some("req-1".into()), None)
            .unwrap();

        let sent = socket.next_sent().await;
        assert_eq!(sent.message_type, message_types::REMOTE_COMMAND);
        assert_eq!(sent.target_device.as_deref(), Some("master-1"));
        let payload: RemoteCommandPayload = sent.data_as().unwrap();
        assert_eq!(payload.command_id, id);
        assert_eq!(payload.request_id.as_deref(), Some("req-1"));
        assert_eq!(bridge.pending_count(), 1);

        let ack = MessageEnvelope::with_payload(
            "master-1",
            message_types::REMOTE_COMMAND_EXECUTED,
            &CommandConfirmation { command_id: id.clone() },
        )
        .unwrap();
        assert!(bridge.handle_master_message(&system, &ack).unwrap());

        assert_eq!(
            seen.recv().await.unwrap(),
            Seen::Start(FORWARD_ACTOR.into(), "ForwardToMaster".into())
        );
        assert_eq!(
            seen.recv().await.unwrap(),
            Seen::Complete(
                FORWARD_ACTOR.into(),
                "ForwardToMaster".into(),
                Some(json!({ "commandId": id }))
            )
        );
        assert_eq!(bridge.pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_forward_times_out_without_ack() {
        let (link, _socket) = connected_link().await;
        let bridge = RemoteBridge::new(config(Some("master-1")), link, api(Arc::default()));
        let system = slave_system();
        system.register_actor(bridge.forwarder_actor());
        let (_handle, mut seen) = recorder(&system);

        let started = tokio::time::Instant::now();
        system.submit_internal::<AddItem>(Note { text: "coke".into() }).unwrap();

        assert!(matches!(seen.recv().await.unwrap(), Seen::Start(..)));
        match seen.recv().await.unwrap() {
            Seen::Error(actor, _, error) => {
                assert_eq!(actor, FORWARD_ACTOR);
                assert_eq!(error.key, "network.remote_ack_timeout");
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(started.elapsed(), Duration::from_secs(10));
        assert_eq!(bridge.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_master_executes_and_acknowledges() {
        let (link, mut socket) = connected_link().await;
        let bridge = RemoteBridge::new(config(None), link, api(Arc::default()));
        let system = master_system();
        let (seen_tx, mut executed) = mpsc::unbounded_channel();
        system.register_actor(Actor::new("CartActor").on::<AddItem, _, _>(move |command, _| {
            let seen_tx = seen_tx.clone();
            async move {
                let _ = seen_tx.send(command);
                Ok(None)
            }
        }));

        let payload = RemoteCommandPayload {
            command_id: "cmd12345".into(),
            command_name: "AddItem".into(),
            payload: json!({ "text": "coke" }),
            request_id: Some("req-1".into()),
            session_id: None,
            slave_info: Some(SlaveContext::new("customer-display", DisplayMode::Secondary)),
        };
        let envelope = MessageEnvelope::with_payload("slave-1", message_types::REMOTE_COMMAND, &payload).unwrap();
        assert!(bridge.handle_master_message(&system, &envelope).unwrap());

        let command = executed.recv().await.unwrap();
        assert_eq!(command.id, "cmd12345");
        assert_eq!(command.request_id, "req-1");
        assert_eq!(command.session_id, tandem_core::INTERNAL);
        assert_eq!(command.slave_context.unwrap().slave_name, "customer-display");

        let ack = socket.next_sent().await;
        assert_eq!(ack.message_type, message_types::REMOTE_COMMAND_EXECUTED);
        assert_eq!(ack.target_device.as_deref(), Some("slave-1"));
        assert_eq!(ack.data["commandId"], "cmd12345");
    }

    #[tokio::test]
    async fn test_unknown_remote_command_is_not_acknowledged() {
        let (link, mut socket) = connected_link().await;
        let bridge = RemoteBridge::new(config(None), link.clone(), api(Arc::default()));
        let system = master_system();

        let payload = RemoteCommandPayload {
            command_id: "cmd1".into(),
            command_name: "VoidSale".into(),
            payload: json!({}),
            request_id: None,
            session_id: None,
            slave_info: None,
        };
        let envelope = MessageEnvelope::with_payload("slave-1", message_types::REMOTE_COMMAND, &payload).unwrap();
        assert!(bridge.handle_master_message(&system, &envelope).is_err());

        link.disconnect("test over");
        assert!(socket.sent.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_kernel_command_is_confirmed() {
        let (link, _socket) = connected_link().await;
        let transport = Arc::new(FakeTransport::default());
        let bridge = RemoteBridge::new(config(None), link, api(transport.clone()));
        let system = master_system();

        let payload = RemoteCommandPayload {
            command_id: "k-1".into(),
            command_name: "AddItem".into(),
            payload: json!({ "text": "coke" }),
            request_id: None,
            session_id: None,
            slave_info: None,
        };
        let envelope = MessageEnvelope::with_payload("kernel", message_types::REMOTE_COMMAND, &payload).unwrap();
        assert!(bridge.handle_kernel_message(&system, &envelope).await.unwrap());

        let calls = transport.calls.lock().unwrap().clone();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].url, "http://kernel/terminal/command/confirm");
        assert_eq!(calls[0].body, Some(json!({ "commandId": "k-1" })));
    }

    #[tokio::test]
    async fn test_presence_and_unit_data_become_commands() {
        let (link, _socket) = connected_link().await;
        let bridge = RemoteBridge::new(config(None), link, api(Arc::default()));
        let system = master_system();
        let (_handle, mut seen) = recorder(&system);
        let (tx, mut names) = mpsc::unbounded_channel();
        let tx2 = tx.clone();
        system.register_actor(
            Actor::new("Watcher")
                .on::<SlaveConnected, _, _>(move |command, _| {
                    let tx = tx.clone();
                    async move {
                        let _ = tx.send(command.payload_as::<SlaveConnected>()?.device_id);
                        Ok(None)
                    }
                })
                .on::<UnitDataChanged, _, _>(move |command, _| {
                    let tx = tx2.clone();
                    async move {
                        let _ = tx.send(command.payload_as::<UnitDataChanged>()?.data["unit"].to_string());
                        Ok(None)
                    }
                }),
        );

        let joined = MessageEnvelope::with_payload(
            "relay",
            message_types::SLAVE_CONNECTED,
            &SlaveLifecyclePayload {
                device_id: "slave-9".into(),
                device_name: "Display".into(),
            },
        )
        .unwrap();
        assert!(bridge.handle_master_message(&system, &joined).unwrap());
        assert_eq!(names.recv().await.unwrap(), "slave-9");

        let unit = MessageEnvelope::new("kernel", message_types::UNIT_DATA_CHANGED, json!({ "unit": 3 }));
        assert!(bridge.handle_kernel_message(&system, &unit).await.unwrap());
        assert_eq!(names.recv().await.unwrap(), "3");
        assert!(matches!(seen.recv().await.unwrap(), Seen::Start(..)));
    }
}
