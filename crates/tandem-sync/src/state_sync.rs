//! # State Sync Engine
//!
//! Keeps the tracked state buckets eventually consistent between master and
//! slaves over the master link.
//!
//! ## Protocol
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                       State Sync Protocol                               │
//! │                                                                         │
//! │  FULL SYNC (on connect / slave joined)                                 │
//! │  ─────────                                                             │
//! │  initiator                                 peer                        │
//! │     │  SYNC_STATE_REQUEST { summary }        │                         │
//! │     │  summary = incoming keys only          │                         │
//! │     │ ─────────────────────────────────────► │ compute_diff(own        │
//! │     │                                        │   outgoing buckets,     │
//! │     │  SYNC_STATE { key, stateChanged }      │   summary)              │
//! │     │ ◄───────────────────────────────────── │ one per non-empty key   │
//! │                                                                         │
//! │  INCREMENTAL                                                           │
//! │  ───────────                                                           │
//! │  local write ──► debounce (200ms, reset per write) ──► diff against    │
//! │  last sent baseline ──► SYNC_STATE { key, stateChanged }               │
//! │                                                                         │
//! │  DIRECTION                                                             │
//! │  ─────────                                                             │
//! │  master: outgoing = master_to_slave, incoming = slave_to_master        │
//! │  slave:  outgoing = slave_to_master, incoming = master_to_slave        │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Remote diffs are merged without touching `updateAt` and never echo back:
//! the debounce loop only reacts to local writes. Writes made while the link
//! is down are held against the last sent baseline and go out through
//! [`StateSyncEngine::flush_outgoing`] on reconnect.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use tandem_core::protocol::{message_types, SyncStatePayload, SyncStateRequestPayload};
use tandem_core::state::{changed_properties, collect_summary, compute_diff};
use tandem_core::{Bucket, MessageEnvelope, Role, StateDiff, StateSummary};

use crate::config::SyncSettings;
use crate::connection::ConnectionManager;
use crate::error::SyncResult;
use crate::state_store::{ChangeOrigin, StateStore};

// =============================================================================
// Configuration
// =============================================================================

#[derive(Debug, Clone)]
pub struct StateSyncConfig {
    pub debounce: Duration,
    /// Keys this side owns and sends.
    pub outgoing: Vec<String>,
    /// Keys this side mirrors from the peer.
    pub incoming: Vec<String>,
}

impl StateSyncConfig {
    pub fn for_role(role: Role, settings: &SyncSettings) -> Self {
        let (outgoing, incoming) = match role {
            Role::Master => (settings.master_to_slave.clone(), settings.slave_to_master.clone()),
            Role::Slave => (settings.slave_to_master.clone(), settings.master_to_slave.clone()),
        };
        StateSyncConfig {
            debounce: Duration::from_millis(settings.debounce_ms),
            outgoing,
            incoming,
        }
    }
}

// =============================================================================
// Engine
// =============================================================================

pub struct StateSyncEngine {
    config: StateSyncConfig,
    local_id: String,
    store: StateStore,
    link: ConnectionManager,
    /// Last state of each outgoing bucket that was sent incrementally.
    baseline: Mutex<HashMap<String, Bucket>>,
}

impl StateSyncEngine {
    pub fn new(
        config: StateSyncConfig,
        local_id: impl Into<String>,
        store: StateStore,
        link: ConnectionManager,
    ) -> Self {
        let baseline = store.snapshot(&config.outgoing);
        StateSyncEngine {
            config,
            local_id: local_id.into(),
            store,
            link,
            baseline: Mutex::new(baseline),
        }
    }

    pub fn config(&self) -> &StateSyncConfig {
        &self.config
    }

    fn is_outgoing(&self, key: &str) -> bool {
        self.config.outgoing.iter().any(|k| k == key)
    }

    fn is_incoming(&self, key: &str) -> bool {
        self.config.incoming.iter().any(|k| k == key)
    }

    /// Summary of the buckets this side needs from the peer.
    pub fn collect_summary(&self) -> StateSummary {
        collect_summary(&self.store.snapshot(&self.config.incoming), &self.config.incoming)
    }

    /// Diff of the owned buckets named in `remote` against it.
    pub fn compute_diff(&self, remote: &StateSummary) -> StateDiff {
        let requested: Vec<&String> = remote.keys().filter(|key| self.is_outgoing(key)).collect();
        let mut local = self.store.snapshot(&requested);
        for key in requested {
            local.entry(key.clone()).or_default();
        }
        compute_diff(&local, remote)
    }

    /// Sends `SYNC_STATE_REQUEST` with this side's summary.
    pub fn request_full_sync(&self, target: Option<&str>) -> SyncResult<()> {
        if self.config.incoming.is_empty() {
            return Ok(());
        }
        let payload = SyncStateRequestPayload {
            summary: self.collect_summary(),
            target_device: target.map(str::to_string),
        };
        let mut envelope = MessageEnvelope::with_payload(&self.local_id, message_types::SYNC_STATE_REQUEST, &payload)?;
        if let Some(target) = target {
            envelope = envelope.targeting(target);
        }
        debug!(keys = payload.summary.len(), target = ?target, "Requesting full state sync");
        self.link.send(&envelope)
    }

    /// Handles sync traffic. Returns false for unrelated messages.
    pub fn handle_message(&self, envelope: &MessageEnvelope) -> SyncResult<bool> {
        match envelope.message_type.as_str() {
            message_types::SYNC_STATE_REQUEST => {
                let request: SyncStateRequestPayload = envelope.data_as()?;
                self.answer_request(&envelope.from, &request.summary)?;
                Ok(true)
            }
            message_types::SYNC_STATE => {
                let payload: SyncStatePayload = envelope.data_as()?;
                if let Some(target) = payload.target_device.as_deref() {
                    if target != self.local_id {
                        return Ok(true);
                    }
                }
                self.apply_remote_diff(&payload.key, &payload.state_changed);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn answer_request(&self, requester: &str, summary: &StateSummary) -> SyncResult<usize> {
        let diff = self.compute_diff(summary);
        for (key, changes) in &diff {
            let payload = SyncStatePayload {
                key: key.clone(),
                state_changed: changes.clone(),
                target_device: Some(requester.to_string()),
            };
            let envelope =
                MessageEnvelope::with_payload(&self.local_id, message_types::SYNC_STATE, &payload)?.targeting(requester);
            self.link.send(&envelope)?;
        }
        info!(requester, buckets = diff.len(), "Answered full state sync");
        Ok(diff.len())
    }

    /// Merges a peer diff into an incoming bucket.
    pub fn apply_remote_diff(&self, key: &str, changes: &tandem_core::BucketDiff) -> bool {
        if !self.is_incoming(key) {
            debug!(key, "Ignoring diff for untracked state key");
            return false;
        }
        let changed = self.store.apply_remote(key, changes);
        if changed && self.is_outgoing(key) {
            let current = self.store.get_state_snapshot(key).unwrap_or_default();
            self.lock_baseline().insert(key.to_string(), current);
        }
        changed
    }

    /// Sends the incremental diff of each key against its baseline.
    ///
    /// While the link is down nothing is sent and the baselines stay put, so
    /// the next flush after reconnecting carries every change since the last
    /// send.
    pub fn flush(&self, keys: &BTreeSet<String>) -> SyncResult<usize> {
        if !self.link.is_connected() {
            debug!(keys = keys.len(), "Link down, holding state diffs");
            return Ok(0);
        }

        let mut sent = 0;
        for key in keys {
            let current = self.store.get_state_snapshot(key).unwrap_or_default();
            let changes = {
                let baseline = self.lock_baseline();
                let previous = baseline.get(key).cloned().unwrap_or_default();
                changed_properties(&previous, &current)
            };
            if changes.is_empty() {
                continue;
            }

            let payload = SyncStatePayload {
                key: key.clone(),
                state_changed: changes,
                target_device: None,
            };
            let envelope = MessageEnvelope::with_payload(&self.local_id, message_types::SYNC_STATE, &payload)?;
            self.link.send(&envelope)?;
            self.lock_baseline().insert(key.clone(), current);
            sent += 1;
        }
        Ok(sent)
    }

    /// Flushes every outgoing key. Called once the link is (re)connected.
    pub fn flush_outgoing(&self) -> SyncResult<usize> {
        let keys: BTreeSet<String> = self.config.outgoing.iter().cloned().collect();
        self.flush(&keys)
    }

    /// Spawns the debounce loop watching local writes to outgoing keys.
    pub fn spawn(self: Arc<Self>) -> JoinHandle<()> {
        let mut changes = self.store.subscribe();
        tokio::spawn(async move {
            let debounce = self.config.debounce;
            let mut pending = BTreeSet::new();
            let mut deadline: Option<Instant> = None;

            loop {
                tokio::select! {
                    change = changes.recv() => match change {
                        Ok(change) => {
                            if change.origin == ChangeOrigin::Local && self.is_outgoing(&change.key) {
                                pending.insert(change.key);
                                deadline = Some(Instant::now() + debounce);
                            }
                        }
                        Err(RecvError::Lagged(skipped)) => {
                            warn!(skipped, "State change stream lagged, resyncing all outgoing keys");
                            pending.extend(self.config.outgoing.iter().cloned());
                            deadline = Some(Instant::now() + debounce);
                        }
                        Err(RecvError::Closed) => break,
                    },

                    _ = tokio::time::sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                        deadline = None;
                        let keys = std::mem::take(&mut pending);
                        match self.flush(&keys) {
                            Ok(sent) if sent > 0 => debug!(sent, "Sent incremental state diffs"),
                            Ok(_) => {}
                            Err(e) => warn!("Incremental state sync failed: {}", e),
                        }
                    }
                }
            }
            debug!("State sync loop stopped");
        })
    }

    fn lock_baseline(&self) -> std::sync::MutexGuard<'_, HashMap<String, Bucket>> {
        self.baseline.lock().unwrap_or_else(|p| p.into_inner())
    }
}

impl std::fmt::Debug for StateSyncEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateSyncEngine")
            .field("outgoing", &self.config.outgoing)
            .field("incoming", &self.config.incoming)
            .finish()
    }
}
