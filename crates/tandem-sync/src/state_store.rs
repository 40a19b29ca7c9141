//! # State Store
//!
//! Named state buckets shared by feature actors and the sync engine.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                          State Store                                    │
//! │                                                                         │
//! │   "cart"     ──► { "line-1": { updateAt: 1700000000000, sku, qty },     │
//! │                    "line-2": { updateAt: ... } }                        │
//! │   "customer" ──► { "current": { updateAt: ..., name } }                 │
//! │                                                                         │
//! │   upsert / remove        ──► StateChange { key, origin: Local }        │
//! │   apply_remote(diff)     ──► StateChange { key, origin: Remote }       │
//! │                              (only when the bucket actually changed)   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Local writes stamp `updateAt`; remote diffs are merged verbatim so the
//! sender's timestamp stays authoritative.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use serde_json::Value;
use tokio::sync::broadcast;
use tracing::debug;

use tandem_core::state::{apply_diff, UPDATE_AT};
use tandem_core::{Bucket, BucketDiff};

use crate::error::{SyncError, SyncResult};

const CHANGE_BUFFER: usize = 256;

/// Who caused a bucket change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeOrigin {
    Local,
    Remote,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateChange {
    pub key: String,
    pub origin: ChangeOrigin,
}

#[derive(Clone)]
pub struct StateStore {
    buckets: Arc<RwLock<HashMap<String, Bucket>>>,
    changes: broadcast::Sender<StateChange>,
}

impl Default for StateStore {
    fn default() -> Self {
        Self::new()
    }
}

impl StateStore {
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(CHANGE_BUFFER);
        StateStore {
            buckets: Arc::new(RwLock::new(HashMap::new())),
            changes,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StateChange> {
        self.changes.subscribe()
    }

    /// Copy of one bucket, if it exists.
    pub fn get_state_snapshot(&self, key: &str) -> Option<Bucket> {
        self.read().get(key).cloned()
    }

    /// Copies of the requested buckets. Missing buckets are left out.
    pub fn snapshot<S: AsRef<str>>(&self, keys: &[S]) -> HashMap<String, Bucket> {
        let buckets = self.read();
        keys.iter()
            .filter_map(|key| {
                let key = key.as_ref();
                buckets.get(key).map(|bucket| (key.to_string(), bucket.clone()))
            })
            .collect()
    }

    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<_> = self.read().keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Writes a property, stamping `updateAt` with the current time.
    ///
    /// Syncable properties are JSON objects; anything else is rejected.
    pub fn upsert(&self, key: &str, prop: &str, value: Value) -> SyncResult<i64> {
        let Value::Object(mut fields) = value else {
            return Err(SyncError::InvalidStateValue(format!(
                "property {}.{} must be a JSON object",
                key, prop
            )));
        };

        let previous = self
            .read()
            .get(key)
            .and_then(|bucket| bucket.get(prop))
            .and_then(tandem_core::state::update_at_of)
            .unwrap_or(i64::MIN);
        // updateAt never moves backwards for a property.
        let now = chrono::Utc::now().timestamp_millis().max(previous.saturating_add(1));
        fields.insert(UPDATE_AT.to_string(), Value::from(now));

        self.write()
            .entry(key.to_string())
            .or_default()
            .insert(prop.to_string(), Value::Object(fields));
        self.notify(key, ChangeOrigin::Local);
        Ok(now)
    }

    /// Deletes a property. Returns true if it existed.
    pub fn remove(&self, key: &str, prop: &str) -> bool {
        let removed = self
            .write()
            .get_mut(key)
            .is_some_and(|bucket| bucket.remove(prop).is_some());
        if removed {
            self.notify(key, ChangeOrigin::Local);
        }
        removed
    }

    /// Replaces a whole bucket without stamping (initial load).
    pub fn replace_bucket(&self, key: &str, bucket: Bucket) {
        self.write().insert(key.to_string(), bucket);
        self.notify(key, ChangeOrigin::Local);
    }

    /// Merges a peer's diff: non-null upserts, null deletes.
    pub fn apply_remote(&self, key: &str, changes: &BucketDiff) -> bool {
        let changed = {
            let mut buckets = self.write();
            let bucket = buckets.entry(key.to_string()).or_default();
            apply_diff(bucket, changes)
        };
        if changed {
            debug!(key, props = changes.len(), "Applied remote state diff");
            self.notify(key, ChangeOrigin::Remote);
        }
        changed
    }

    fn notify(&self, key: &str, origin: ChangeOrigin) {
        let _ = self.changes.send(StateChange {
            key: key.to_string(),
            origin,
        });
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, Bucket>> {
        self.buckets.read().unwrap_or_else(|p| p.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<String, Bucket>> {
        self.buckets.write().unwrap_or_else(|p| p.into_inner())
    }
}

impl std::fmt::Debug for StateStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateStore").field("keys", &self.keys()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tandem_core::state::update_at_of;

    #[test]
    fn test_upsert_stamps_update_at() {
        let store = StateStore::new();
        let at = store.upsert("cart", "line-1", json!({ "sku": "COKE" })).unwrap();

        let bucket = store.get_state_snapshot("cart").unwrap();
        assert_eq!(update_at_of(&bucket["line-1"]), Some(at));
        assert_eq!(bucket["line-1"]["sku"], "COKE");
    }

    #[test]
    fn test_update_at_is_monotonic() {
        let store = StateStore::new();
        let first = store.upsert("cart", "line-1", json!({ "qty": 1 })).unwrap();
        let second = store.upsert("cart", "line-1", json!({ "qty": 2 })).unwrap();
        assert!(second > first);
    }

    #[test]
    fn test_rejects_non_object() {
        let store = StateStore::new();
        assert!(matches!(
            store.upsert("cart", "line-1", json!(5)),
            Err(SyncError::InvalidStateValue(_))
        ));
        assert!(store.get_state_snapshot("cart").is_none());
    }

    #[test]
    fn test_remote_apply_keeps_sender_timestamp() {
        let store = StateStore::new();
        let mut rx = store.subscribe();

        let mut diff = BucketDiff::new();
        diff.insert("line-1".into(), Some(json!({ "updateAt": 5, "qty": 1 })));
        assert!(store.apply_remote("cart", &diff));
        assert!(!store.apply_remote("cart", &diff));

        let bucket = store.get_state_snapshot("cart").unwrap();
        assert_eq!(update_at_of(&bucket["line-1"]), Some(5));
        assert_eq!(
            rx.try_recv().unwrap(),
            StateChange {
                key: "cart".into(),
                origin: ChangeOrigin::Remote
            }
        );
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_remove_and_snapshot() {
        let store = StateStore::new();
        store.upsert("cart", "line-1", json!({})).unwrap();
        store.upsert("customer", "current", json!({ "name": "Ana" })).unwrap();

        assert!(store.remove("cart", "line-1"));
        assert!(!store.remove("cart", "line-1"));

        let snap = store.snapshot(&["cart", "customer", "payment"]);
        assert_eq!(snap.len(), 2);
        assert!(snap["cart"].is_empty());
    }
}
