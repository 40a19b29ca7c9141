//! # Connection Manager
//!
//! Owns one socket to one counterpart. One instance exists per link (master
//! link, kernel link) per process.
//!
//! ## Connection States
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                       Connection Lifecycle                              │
//! │                                                                         │
//! │  ┌──────────────┐  connect()  ┌─────────────┐  handshake  ┌──────────┐ │
//! │  │ DISCONNECTED │ ──────────► │ REGISTERING │ ──────────► │CONNECTING│ │
//! │  └──────────────┘             └─────────────┘             └────┬─────┘ │
//! │         ▲                            ▲   next address          │       │
//! │         │                            └─────────────────────────┤ fail  │
//! │         │                                                      │ open  │
//! │         │      ┌───────────────┐  disconnect()  ┌───────────┐   ▼       │
//! │         └───── │ DISCONNECTING │ ◄───────────── │ CONNECTED │ ◄─┘       │
//! │                └───────────────┘                └───────────┘           │
//! │                                                                         │
//! │  every address failed ──► ERROR (AllServersFailed reported)            │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Message Path
//! ```text
//!  send(env) ──► connected? ──yes──► socket
//!                   │ no
//!                   ▼
//!           bounded queue (oldest dropped) ──► flushed FIFO on connect,
//!                                              cleared on disconnect and
//!                                              on every failed attempt
//!
//!  socket ──► parse ──► dedup by id ──► heartbeat? ──► HeartbeatManager
//!                                          │ no
//!                                          ▼
//!                               ConnectionEvent::Message
//! ```

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use tandem_core::{AppError, MessageEnvelope};

use crate::api::{AttemptRecord, ServerAddress};
use crate::dedup::DedupCache;
use crate::error::{SyncError, SyncResult};
use crate::heartbeat::{HeartbeatConfig, HeartbeatEvent, HeartbeatManager};
use crate::transport::{LinkChannel, LinkConnector, LinkIdentity};

/// Event channel capacity per link.
const EVENT_BUFFER: usize = 1024;

// =============================================================================
// Connection State
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ConnectionState {
    Disconnected,
    Registering,
    Connecting,
    Connected,
    Disconnecting,
    Error,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "disconnected"),
            ConnectionState::Registering => write!(f, "registering"),
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Connected => write!(f, "connected"),
            ConnectionState::Disconnecting => write!(f, "disconnecting"),
            ConnectionState::Error => write!(f, "error"),
        }
    }
}

/// Events published by a link.
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    Connected { address_name: String },
    Disconnected { reason: String },
    Message(MessageEnvelope),
    Error(AppError),
    HeartbeatTimeout { elapsed_ms: u64 },
}

// =============================================================================
// Link Configuration
// =============================================================================

#[derive(Debug, Clone)]
pub struct LinkConfig {
    /// Link name used in logs and errors (e.g. "master", "kernel").
    pub name: String,
    /// Deadline for handshake + socket open, per address.
    pub connection_timeout: Duration,
    pub queue_capacity: usize,
    pub dedup_capacity: usize,
    pub dedup_ttl: Duration,
    pub heartbeat: HeartbeatConfig,
}

impl Default for LinkConfig {
    fn default() -> Self {
        LinkConfig {
            name: "link".to_string(),
            connection_timeout: Duration::from_secs(10),
            queue_capacity: 100,
            dedup_capacity: 1000,
            dedup_ttl: Duration::from_secs(300),
            heartbeat: HeartbeatConfig::default(),
        }
    }
}

// =============================================================================
// Connection Manager
// =============================================================================

struct Slot {
    state: ConnectionState,
    outbound: Option<mpsc::UnboundedSender<String>>,
    queue: VecDeque<String>,
    /// Bumped on every install; identifies the live reader task.
    session: u64,
    /// Bumped on every teardown; invalidates in-flight connects.
    generation: u64,
    reader: Option<JoinHandle<()>>,
    address: Option<String>,
    last_error: Option<String>,
}

struct Shared {
    config: LinkConfig,
    connector: Arc<dyn LinkConnector>,
    slot: Mutex<Slot>,
    connecting: AtomicBool,
    dedup: Mutex<DedupCache>,
    events: broadcast::Sender<ConnectionEvent>,
}

struct ConnectingFlag<'a>(&'a AtomicBool);

impl Drop for ConnectingFlag<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Dual-role socket link with failover, queueing, dedup and heartbeat.
#[derive(Clone)]
pub struct ConnectionManager {
    shared: Arc<Shared>,
}

impl ConnectionManager {
    pub fn new(config: LinkConfig, connector: Arc<dyn LinkConnector>) -> Self {
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        let dedup = DedupCache::new(config.dedup_capacity, config.dedup_ttl);
        ConnectionManager {
            shared: Arc::new(Shared {
                config,
                connector,
                slot: Mutex::new(Slot {
                    state: ConnectionState::Disconnected,
                    outbound: None,
                    queue: VecDeque::new(),
                    session: 0,
                    generation: 0,
                    reader: None,
                    address: None,
                    last_error: None,
                }),
                connecting: AtomicBool::new(false),
                dedup: Mutex::new(dedup),
                events,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.shared.config.name
    }

    /// Subscribes to link events.
    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.shared.events.subscribe()
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.lock().state
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Messages waiting for the next connect.
    pub fn queued(&self) -> usize {
        self.shared.lock().queue.len()
    }

    pub fn connected_address(&self) -> Option<String> {
        self.shared.lock().address.clone()
    }

    pub fn last_error(&self) -> Option<String> {
        self.shared.lock().last_error.clone()
    }

    /// Connects to the first address that completes the handshake.
    ///
    /// No-op when already connected; fails with `ConnectInProgress` while
    /// another connect is running.
    pub async fn connect(&self, addresses: &[ServerAddress], identity: &LinkIdentity) -> SyncResult<()> {
        if self.is_connected() {
            return Ok(());
        }
        if self.shared.connecting.swap(true, Ordering::AcqRel) {
            return Err(SyncError::ConnectInProgress);
        }
        let _flag = ConnectingFlag(&self.shared.connecting);

        let name = self.shared.config.name.clone();
        if addresses.is_empty() {
            return Err(SyncError::ServerNotConfigured(name));
        }

        let generation = self.shared.lock().generation;
        let timeout = self.shared.config.connection_timeout;
        let mut attempts = Vec::with_capacity(addresses.len());

        for (index, address) in addresses.iter().enumerate() {
            if self.shared.lock().generation != generation {
                return Err(SyncError::Disconnected);
            }

            let started = Instant::now();
            let outcome = tokio::time::timeout(timeout, self.attempt(address, identity, generation)).await;
            let error = match outcome {
                Ok(Ok(channel)) => {
                    return if self.shared.install(channel, generation, address, &identity.device_id) {
                        info!(link = %name, address = %address.address_name, "Link connected");
                        self.shared.emit(ConnectionEvent::Connected {
                            address_name: address.address_name.clone(),
                        });
                        Ok(())
                    } else {
                        debug!(link = %name, "Connect superseded by disconnect");
                        Err(SyncError::Disconnected)
                    };
                }
                Ok(Err(e)) => e,
                Err(_) => SyncError::Timeout(timeout.as_millis() as u64),
            };

            warn!(
                link = %name,
                address = %address.address_name,
                "Connection attempt failed: {}",
                error
            );
            self.shared.lock().queue.clear();
            attempts.push(AttemptRecord {
                address_name: address.address_name.clone(),
                address_index: index,
                attempt: index as u32 + 1,
                skipped: false,
                breaker_state: None,
                elapsed_ms: started.elapsed().as_millis() as u64,
                status: None,
                error: Some(error.to_string()),
            });
        }

        let err = SyncError::AllServersFailed {
            server: name,
            attempts,
        };
        {
            let mut slot = self.shared.lock();
            if slot.generation == generation {
                slot.state = ConnectionState::Error;
            }
            slot.last_error = Some(err.to_string());
        }
        self.shared.emit(ConnectionEvent::Error(err.to_app_error()));
        Err(err)
    }

    async fn attempt(
        &self,
        address: &ServerAddress,
        identity: &LinkIdentity,
        generation: u64,
    ) -> SyncResult<LinkChannel> {
        self.shared.set_state_if(generation, ConnectionState::Registering);
        let url = self.shared.connector.register(address, identity).await?;
        self.shared.set_state_if(generation, ConnectionState::Connecting);
        self.shared.connector.open(&url).await
    }

    /// Sends now if connected, otherwise queues (oldest dropped when full).
    pub fn send(&self, envelope: &MessageEnvelope) -> SyncResult<()> {
        let text = envelope.to_json()?;
        let mut slot = self.shared.lock();

        let text = match slot.outbound.as_ref() {
            Some(tx) => match tx.send(text) {
                Ok(()) => return Ok(()),
                Err(mpsc::error::SendError(text)) => text,
            },
            None => text,
        };

        if slot.queue.len() >= self.shared.config.queue_capacity {
            slot.queue.pop_front();
            warn!(link = %self.shared.config.name, "Outbound queue full, dropped oldest message");
        }
        slot.queue.push_back(text);
        Ok(())
    }

    /// Closes the link. No-op while already disconnected or disconnecting.
    pub fn disconnect(&self, reason: &str) {
        let reader = {
            let mut slot = self.shared.lock();
            if matches!(
                slot.state,
                ConnectionState::Disconnected | ConnectionState::Disconnecting
            ) {
                return;
            }
            slot.state = ConnectionState::Disconnecting;
            slot.generation += 1;
            slot.outbound = None;
            slot.queue.clear();
            slot.address = None;
            slot.reader.take()
        };
        if let Some(reader) = reader {
            reader.abort();
        }

        self.shared.lock().state = ConnectionState::Disconnected;
        info!(link = %self.shared.config.name, reason, "Link disconnected");
        self.shared.emit(ConnectionEvent::Disconnected {
            reason: reason.to_string(),
        });
    }
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("name", &self.shared.config.name)
            .field("state", &self.state())
            .finish()
    }
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Slot> {
        self.slot.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn emit(&self, event: ConnectionEvent) {
        let _ = self.events.send(event);
    }

    fn set_state_if(&self, generation: u64, state: ConnectionState) {
        let mut slot = self.lock();
        if slot.generation == generation {
            slot.state = state;
        }
    }

    /// Makes `channel` the live socket and flushes the queue into it.
    /// Returns false if a disconnect happened since the connect started.
    fn install(
        self: &Arc<Self>,
        channel: LinkChannel,
        generation: u64,
        address: &ServerAddress,
        local_id: &str,
    ) -> bool {
        let LinkChannel { outbound, inbound } = channel;
        let mut slot = self.lock();
        if slot.generation != generation {
            return false;
        }

        let flushed = slot.queue.len();
        while let Some(text) = slot.queue.pop_front() {
            if outbound.send(text).is_err() {
                break;
            }
        }
        if flushed > 0 {
            debug!(link = %self.config.name, flushed, "Flushed queued messages");
        }

        slot.session += 1;
        slot.state = ConnectionState::Connected;
        slot.outbound = Some(outbound.clone());
        slot.address = Some(address.address_name.clone());
        slot.last_error = None;
        slot.reader = Some(tokio::spawn(read_loop(
            self.clone(),
            slot.session,
            inbound,
            outbound,
            local_id.to_string(),
        )));
        true
    }

    fn handle_text(&self, text: &str, heartbeat: &HeartbeatManager) {
        let envelope = match MessageEnvelope::from_json(text) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(link = %self.config.name, "Dropping unparseable message: {}", e);
                return;
            }
        };

        let fresh = self
            .dedup
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(&envelope.id);
        if !fresh {
            debug!(link = %self.config.name, id = %envelope.id, "Dropping duplicate message");
            return;
        }

        if envelope.is_heartbeat() {
            heartbeat.handle_heartbeat(&envelope);
            return;
        }

        self.emit(ConnectionEvent::Message(envelope));
    }

    /// Tears down `session` if it is still the live one.
    fn close_session(&self, session: u64, reason: &str) {
        {
            let mut slot = self.lock();
            if slot.session != session || slot.outbound.is_none() {
                return;
            }
            slot.state = ConnectionState::Disconnected;
            slot.generation += 1;
            slot.outbound = None;
            slot.queue.clear();
            slot.address = None;
            slot.reader = None;
            slot.last_error = Some(reason.to_string());
        }
        info!(link = %self.config.name, reason, "Link closed");
        self.emit(ConnectionEvent::Disconnected {
            reason: reason.to_string(),
        });
    }
}

async fn read_loop(
    shared: Arc<Shared>,
    session: u64,
    mut inbound: mpsc::Receiver<SyncResult<String>>,
    outbound: mpsc::UnboundedSender<String>,
    local_id: String,
) {
    let (mut heartbeat, mut heartbeat_events) = HeartbeatManager::new(shared.config.heartbeat.clone(), local_id);
    heartbeat.start();

    let reason = loop {
        tokio::select! {
            frame = inbound.recv() => match frame {
                Some(Ok(text)) => shared.handle_text(&text, &heartbeat),
                Some(Err(e)) => {
                    warn!(link = %shared.config.name, "Socket error: {}", e);
                    shared.emit(ConnectionEvent::Error(e.to_app_error()));
                    break e.to_string();
                }
                None => break "socket closed".to_string(),
            },

            Some(event) = heartbeat_events.recv() => match event {
                HeartbeatEvent::Reply(ack) => match ack.to_json() {
                    Ok(text) => {
                        let _ = outbound.send(text);
                    }
                    Err(e) => warn!("Failed to encode heartbeat ack: {}", e),
                },
                HeartbeatEvent::Timeout { elapsed } => {
                    let elapsed_ms = elapsed.as_millis() as u64;
                    let err = SyncError::HeartbeatTimeout { elapsed_ms };
                    shared.emit(ConnectionEvent::HeartbeatTimeout { elapsed_ms });
                    shared.emit(ConnectionEvent::Error(err.to_app_error()));
                    break err.to_string();
                }
            },
        }
    };

    heartbeat.stop();
    drop(outbound);
    shared.close_session(session, &reason);
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::json;
    use std::collections::HashSet;
    use tandem_core::protocol::message_types;
    use tandem_core::Role;

    /// Test-side end of a fake socket.
    pub(crate) struct FakeSocket {
        pub url: String,
        pub sent: mpsc::UnboundedReceiver<String>,
        pub inject: mpsc::Sender<SyncResult<String>>,
    }

    impl FakeSocket {
        pub async fn deliver(&self, envelope: &MessageEnvelope) {
            self.inject.send(Ok(envelope.to_json().unwrap())).await.unwrap();
        }

        pub async fn next_sent(&mut self) -> MessageEnvelope {
            let text = self.sent.recv().await.expect("socket closed");
            MessageEnvelope::from_json(&text).unwrap()
        }
    }

    /// In-memory connector. Sockets are handed to the test via a channel.
    pub(crate) struct FakeConnector {
        pub failing: HashSet<String>,
        pub hanging: HashSet<String>,
        sockets: mpsc::UnboundedSender<FakeSocket>,
    }

    impl FakeConnector {
        pub fn new() -> (Self, mpsc::UnboundedReceiver<FakeSocket>) {
            let (tx, rx) = mpsc::unbounded_channel();
            (
                FakeConnector {
                    failing: HashSet::new(),
                    hanging: HashSet::new(),
                    sockets: tx,
                },
                rx,
            )
        }
    }

    #[async_trait]
    impl LinkConnector for FakeConnector {
        async fn register(&self, address: &ServerAddress, _identity: &LinkIdentity) -> SyncResult<String> {
            if self.hanging.contains(&address.address_name) {
                std::future::pending::<()>().await;
            }
            if self.failing.contains(&address.address_name) {
                return Err(SyncError::RegistrationFailed("rejected".into()));
            }
            Ok(format!("ws://{}/ws", address.address_name))
        }

        async fn open(&self, url: &str) -> SyncResult<LinkChannel> {
            let (outbound, sent) = mpsc::unbounded_channel();
            let (inject, inbound) = mpsc::channel(64);
            let _ = self.sockets.send(FakeSocket {
                url: url.to_string(),
                sent,
                inject,
            });
            Ok(LinkChannel { outbound, inbound })
        }
    }

    pub(crate) fn identity() -> LinkIdentity {
        LinkIdentity {
            device_id: "dev-1".into(),
            device_name: "Register 1".into(),
            role: Role::Master,
            master_device_id: None,
            token: None,
        }
    }

    pub(crate) fn addresses(names: &[&str]) -> Vec<ServerAddress> {
        names
            .iter()
            .map(|n| ServerAddress::new(*n, format!("http://{}", n), Duration::from_secs(5)))
            .collect()
    }

    fn manager(connector: FakeConnector, queue_capacity: usize) -> ConnectionManager {
        ConnectionManager::new(
            LinkConfig {
                name: "master".into(),
                queue_capacity,
                ..LinkConfig::default()
            },
            Arc::new(connector),
        )
    }

    fn msg(n: u32) -> MessageEnvelope {
        MessageEnvelope::new("dev-1", "SYNC_STATE", json!({ "n": n }))
    }

    async fn next_event(events: &mut broadcast::Receiver<ConnectionEvent>) -> ConnectionEvent {
        tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .expect("no event")
            .expect("event channel closed")
    }

    #[tokio::test]
    async fn test_queued_messages_flush_in_order() {
        let (connector, mut sockets) = FakeConnector::new();
        let link = manager(connector, 100);

        for n in 1..=3 {
            link.send(&msg(n)).unwrap();
        }
        assert_eq!(link.queued(), 3);

        link.connect(&addresses(&["a"]), &identity()).await.unwrap();
        let mut socket = sockets.recv().await.unwrap();
        for n in 1..=3 {
            assert_eq!(socket.next_sent().await.data["n"], n);
        }
        assert_eq!(link.queued(), 0);
    }

    #[tokio::test]
    async fn test_queue_drops_oldest_on_overflow() {
        let (connector, mut sockets) = FakeConnector::new();
        let link = manager(connector, 2);
        for n in 1..=3 {
            link.send(&msg(n)).unwrap();
        }
        link.connect(&addresses(&["a"]), &identity()).await.unwrap();
        let mut socket = sockets.recv().await.unwrap();
        assert_eq!(socket.next_sent().await.data["n"], 2);
        assert_eq!(socket.next_sent().await.data["n"], 3);
    }

    #[tokio::test]
    async fn test_failover_to_next_address() {
        let (mut connector, mut sockets) = FakeConnector::new();
        connector.failing.insert("a".into());
        let link = manager(connector, 100);
        let mut events = link.subscribe();

        link.send(&msg(1)).unwrap();
        link.connect(&addresses(&["a", "b"]), &identity()).await.unwrap();

        assert_eq!(link.connected_address().as_deref(), Some("b"));
        assert_eq!(sockets.recv().await.unwrap().url, "ws://b/ws");
        // A failed attempt clears the queue.
        assert_eq!(link.queued(), 0);
        assert!(matches!(
            next_event(&mut events).await,
            ConnectionEvent::Connected { address_name } if address_name == "b"
        ));
    }

    #[tokio::test]
    async fn test_all_servers_failed() {
        let (mut connector, _sockets) = FakeConnector::new();
        connector.failing.insert("a".into());
        connector.failing.insert("b".into());
        let link = manager(connector, 100);

        match link.connect(&addresses(&["a", "b"]), &identity()).await {
            Err(SyncError::AllServersFailed { server, attempts }) => {
                assert_eq!(server, "master");
                assert_eq!(attempts.len(), 2);
            }
            other => panic!("expected AllServersFailed, got {:?}", other),
        }
        assert_eq!(link.state(), ConnectionState::Error);
    }

    #[tokio::test(start_paused = true)]
    async fn test_attempt_timeout_moves_on() {
        let (mut connector, _sockets) = FakeConnector::new();
        connector.hanging.insert("a".into());
        let link = manager(connector, 100);

        let started = Instant::now();
        link.connect(&addresses(&["a", "b"]), &identity()).await.unwrap();
        assert_eq!(started.elapsed(), Duration::from_secs(10));
        assert_eq!(link.connected_address().as_deref(), Some("b"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_in_progress() {
        let (mut connector, _sockets) = FakeConnector::new();
        connector.hanging.insert("a".into());
        let link = manager(connector, 100);

        let background = {
            let link = link.clone();
            tokio::spawn(async move { link.connect(&addresses(&["a"]), &identity()).await })
        };
        while link.state() != ConnectionState::Registering {
            tokio::task::yield_now().await;
        }

        assert!(matches!(
            link.connect(&addresses(&["b"]), &identity()).await,
            Err(SyncError::ConnectInProgress)
        ));
        assert!(background.await.unwrap().is_err());
    }

    #[tokio::test]
    async fn test_connect_while_connected_is_noop() {
        let (connector, mut sockets) = FakeConnector::new();
        let link = manager(connector, 100);
        link.connect(&addresses(&["a"]), &identity()).await.unwrap();
        link.connect(&addresses(&["b"]), &identity()).await.unwrap();

        assert_eq!(link.connected_address().as_deref(), Some("a"));
        sockets.recv().await.unwrap();
        assert!(sockets.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_duplicate_ids_delivered_once() {
        let (connector, mut sockets) = FakeConnector::new();
        let link = manager(connector, 100);
        let mut events = link.subscribe();
        link.connect(&addresses(&["a"]), &identity()).await.unwrap();
        let socket = sockets.recv().await.unwrap();
        assert!(matches!(next_event(&mut events).await, ConnectionEvent::Connected { .. }));

        let first = msg(1);
        socket.deliver(&first).await;
        socket.deliver(&first).await;
        socket.deliver(&msg(2)).await;

        match next_event(&mut events).await {
            ConnectionEvent::Message(m) => assert_eq!(m.id, first.id),
            other => panic!("unexpected {:?}", other),
        }
        match next_event(&mut events).await {
            ConnectionEvent::Message(m) => assert_eq!(m.data["n"], 2),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_heartbeat_is_intercepted_and_acked() {
        let (connector, mut sockets) = FakeConnector::new();
        let link = manager(connector, 100);
        let mut events = link.subscribe();
        link.connect(&addresses(&["a"]), &identity()).await.unwrap();
        let mut socket = sockets.recv().await.unwrap();
        next_event(&mut events).await;

        let beat = MessageEnvelope::new("relay", message_types::HEARTBEAT, json!({ "timestamp": 7 }));
        socket.deliver(&beat).await;
        socket.deliver(&msg(1)).await;

        let ack = socket.next_sent().await;
        assert_eq!(ack.message_type, message_types::HEARTBEAT_ACK);
        assert_eq!(ack.data["timestamp"], 7);

        match next_event(&mut events).await {
            ConnectionEvent::Message(m) => assert_eq!(m.message_type, "SYNC_STATE"),
            other => panic!("heartbeat leaked: {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_timeout_disconnects() {
        let (connector, mut sockets) = FakeConnector::new();
        let link = manager(connector, 100);
        let mut events = link.subscribe();
        link.connect(&addresses(&["a"]), &identity()).await.unwrap();
        let _socket = sockets.recv().await.unwrap();
        next_event(&mut events).await;

        let mut saw_timeout = false;
        loop {
            match events.recv().await.unwrap() {
                ConnectionEvent::HeartbeatTimeout { elapsed_ms } => {
                    assert_eq!(elapsed_ms, 90_000);
                    saw_timeout = true;
                }
                ConnectionEvent::Disconnected { .. } => break,
                _ => {}
            }
        }
        assert!(saw_timeout);
        assert_eq!(link.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_remote_close_disconnects() {
        let (connector, mut sockets) = FakeConnector::new();
        let link = manager(connector, 100);
        let mut events = link.subscribe();
        link.connect(&addresses(&["a"]), &identity()).await.unwrap();
        next_event(&mut events).await;

        drop(sockets.recv().await.unwrap());
        assert!(matches!(
            next_event(&mut events).await,
            ConnectionEvent::Disconnected { reason } if reason == "socket closed"
        ));
        assert!(!link.is_connected());
    }

    #[tokio::test]
    async fn test_disconnect_is_idempotent() {
        let (connector, mut sockets) = FakeConnector::new();
        let link = manager(connector, 100);
        let mut events = link.subscribe();
        link.connect(&addresses(&["a"]), &identity()).await.unwrap();
        let mut socket = sockets.recv().await.unwrap();
        next_event(&mut events).await;

        link.disconnect("user");
        link.disconnect("again");
        assert!(matches!(
            next_event(&mut events).await,
            ConnectionEvent::Disconnected { reason } if reason == "user"
        ));
        assert!(events.try_recv().is_err());

        // Socket writer side closed.
        assert!(socket.sent.recv().await.is_none());

        // Sends after disconnect are queued again.
        link.send(&msg(9)).unwrap();
        assert_eq!(link.queued(), 1);
    }
}
