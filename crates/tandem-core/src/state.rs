//! # State Buckets and Diffs
//!
//! A bucket is a flat JSON object whose entries are *syncable properties*:
//! objects shaped `{ "updateAt": <millis>, ...fields }`.
//!
//! ## Last-Writer-Wins Diff
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                 compute_diff(local, remote_summary)                     │
//! │                                                                         │
//! │  property in remote summary:                                           │
//! │    local lacks it                    ──► null   (delete on remote)     │
//! │    local lacks updateAt              ──► local value                   │
//! │    local.updateAt > remote.updateAt  ──► local value                   │
//! │    otherwise                         ──► omitted                       │
//! │                                                                         │
//! │  property only in local             ──► local value                    │
//! │  property in neither                ──► omitted                        │
//! │                                                                         │
//! │  apply_diff: non-null = upsert, null = delete. updateAt is never       │
//! │  recomputed; the sender's timestamp stays authoritative.               │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Field carrying the last-modified timestamp of a property.
pub const UPDATE_AT: &str = "updateAt";

/// One named state bucket: property key → property value.
pub type Bucket = Map<String, Value>;

/// Per-property summary sent so the peer can compute what it is missing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PropertySummary {
    #[serde(rename = "updateAt", default, skip_serializing_if = "Option::is_none")]
    pub update_at: Option<i64>,
}

/// propKey → summary.
pub type BucketSummary = BTreeMap<String, PropertySummary>;

/// stateKey → bucket summary.
pub type StateSummary = BTreeMap<String, BucketSummary>;

/// propKey → new value, `None` (wire `null`) meaning delete.
pub type BucketDiff = BTreeMap<String, Option<Value>>;

/// stateKey → bucket diff. Buckets with no changes are absent.
pub type StateDiff = BTreeMap<String, BucketDiff>;

/// Reads `updateAt` from a property, accepting integer or float encodings.
pub fn update_at_of(value: &Value) -> Option<i64> {
    let raw = value.get(UPDATE_AT)?;
    raw.as_i64().or_else(|| raw.as_f64().map(|f| f as i64))
}

/// Summarizes one bucket.
pub fn summarize_bucket(bucket: &Bucket) -> BucketSummary {
    bucket
        .iter()
        .map(|(key, value)| {
            (
                key.clone(),
                PropertySummary {
                    update_at: update_at_of(value),
                },
            )
        })
        .collect()
}

/// Summarizes the requested buckets. Missing buckets summarize as empty.
pub fn collect_summary<S: AsRef<str>>(state: &HashMap<String, Bucket>, keys: &[S]) -> StateSummary {
    keys.iter()
        .map(|key| {
            let key = key.as_ref();
            let summary = state.get(key).map(summarize_bucket).unwrap_or_default();
            (key.to_string(), summary)
        })
        .collect()
}

/// Diffs one local bucket against the peer's summary of it.
pub fn compute_bucket_diff(local: Option<&Bucket>, remote: Option<&BucketSummary>) -> BucketDiff {
    let mut diff = BucketDiff::new();

    if let Some(remote) = remote {
        for (prop, remote_summary) in remote {
            match local.and_then(|bucket| bucket.get(prop)) {
                None => {
                    diff.insert(prop.clone(), None);
                }
                Some(value) => {
                    let newer = match (update_at_of(value), remote_summary.update_at) {
                        (None, _) => true,
                        (Some(_), None) => true,
                        (Some(local_at), Some(remote_at)) => local_at > remote_at,
                    };
                    if newer {
                        diff.insert(prop.clone(), Some(value.clone()));
                    }
                }
            }
        }
    }

    if let Some(local) = local {
        for (prop, value) in local {
            let known_remotely = remote.is_some_and(|summary| summary.contains_key(prop));
            if !known_remotely {
                diff.insert(prop.clone(), Some(value.clone()));
            }
        }
    }

    diff
}

/// Diffs every local bucket in `local_full` against the peer's summary.
///
/// Only keys present in `local_full` are considered tracked.
pub fn compute_diff(local_full: &HashMap<String, Bucket>, remote: &StateSummary) -> StateDiff {
    local_full
        .iter()
        .filter_map(|(key, bucket)| {
            let diff = compute_bucket_diff(Some(bucket), remote.get(key));
            (!diff.is_empty()).then(|| (key.clone(), diff))
        })
        .collect()
}

/// Properties whose value changed between two snapshots of the same bucket.
///
/// Used for incremental sync: removed properties map to `None`.
pub fn changed_properties(previous: &Bucket, current: &Bucket) -> BucketDiff {
    let mut diff = BucketDiff::new();
    for (prop, value) in current {
        if previous.get(prop) != Some(value) {
            diff.insert(prop.clone(), Some(value.clone()));
        }
    }
    for prop in previous.keys() {
        if !current.contains_key(prop) {
            diff.insert(prop.clone(), None);
        }
    }
    diff
}

/// Merges a remote diff into a bucket. Returns true if anything changed.
pub fn apply_diff(bucket: &mut Bucket, changes: &BucketDiff) -> bool {
    let mut changed = false;
    for (prop, change) in changes {
        match change {
            Some(value) => {
                if bucket.get(prop) != Some(value) {
                    bucket.insert(prop.clone(), value.clone());
                    changed = true;
                }
            }
            None => {
                if bucket.remove(prop).is_some() {
                    changed = true;
                }
            }
        }
    }
    changed
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn bucket(value: Value) -> Bucket {
        value.as_object().cloned().unwrap()
    }

    fn cart_state() -> HashMap<String, Bucket> {
        let mut state = HashMap::new();
        state.insert(
            "cart".to_string(),
            bucket(json!({
                "item-1": { "updateAt": 100, "sku": "COKE", "qty": 2 },
                "item-2": { "updateAt": 200, "sku": "CHIPS", "qty": 1 },
            })),
        );
        state
    }

    #[test]
    fn test_diff_against_own_summary_is_empty() {
        let state = cart_state();
        let summary = collect_summary(&state, &["cart"]);
        assert!(compute_diff(&state, &summary).is_empty());
    }

    #[test]
    fn test_newer_local_property_is_sent() {
        let state = cart_state();
        let mut summary = collect_summary(&state, &["cart"]);
        summary
            .get_mut("cart")
            .unwrap()
            .insert("item-2".into(), PropertySummary { update_at: Some(150) });

        let diff = compute_diff(&state, &summary);
        let cart = diff.get("cart").unwrap();
        assert_eq!(cart.len(), 1);
        assert_eq!(cart["item-2"].as_ref().unwrap()["sku"], "CHIPS");
    }

    #[test]
    fn test_older_local_property_is_omitted() {
        let state = cart_state();
        let mut summary = collect_summary(&state, &["cart"]);
        summary
            .get_mut("cart")
            .unwrap()
            .insert("item-1".into(), PropertySummary { update_at: Some(500) });

        assert!(compute_diff(&state, &summary).is_empty());
    }

    #[test]
    fn test_missing_locally_becomes_delete() {
        let state = cart_state();
        let mut summary = collect_summary(&state, &["cart"]);
        summary
            .get_mut("cart")
            .unwrap()
            .insert("item-9".into(), PropertySummary { update_at: Some(1) });

        let diff = compute_diff(&state, &summary);
        assert_eq!(diff["cart"].get("item-9"), Some(&None));
    }

    #[test]
    fn test_unknown_to_remote_is_sent() {
        let state = cart_state();
        let summary = StateSummary::new();
        let diff = compute_diff(&state, &summary);
        assert_eq!(diff["cart"].len(), 2);
    }

    #[test]
    fn test_property_without_update_at_is_always_sent() {
        let mut state = HashMap::new();
        state.insert("flags".to_string(), bucket(json!({ "locked": { "value": true } })));
        let summary = collect_summary(&state, &["flags"]);
        let diff = compute_diff(&state, &summary);
        assert!(diff["flags"].contains_key("locked"));
    }

    #[test]
    fn test_apply_diff_is_idempotent() {
        let mut diff = BucketDiff::new();
        diff.insert("item-3".into(), Some(json!({ "updateAt": 300, "sku": "GUM" })));
        diff.insert("item-1".into(), None);

        let mut once = cart_state().remove("cart").unwrap();
        assert!(apply_diff(&mut once, &diff));

        let mut twice = once.clone();
        assert!(!apply_diff(&mut twice, &diff));
        assert_eq!(once, twice);
        assert!(!once.contains_key("item-1"));
        assert_eq!(once["item-3"]["updateAt"], 300);
    }

    #[test]
    fn test_diff_wire_format_uses_null_for_delete() {
        let mut diff = BucketDiff::new();
        diff.insert("gone".into(), None);
        assert_eq!(serde_json::to_string(&diff).unwrap(), r#"{"gone":null}"#);

        let parsed: BucketDiff = serde_json::from_str(r#"{"gone":null,"kept":{"updateAt":1}}"#).unwrap();
        assert_eq!(parsed["gone"], None);
        assert!(parsed["kept"].is_some());
    }

    #[test]
    fn test_changed_properties() {
        let previous = bucket(json!({ "a": { "updateAt": 1 }, "b": { "updateAt": 1 } }));
        let current = bucket(json!({ "a": { "updateAt": 2 }, "c": { "updateAt": 1 } }));
        let diff = changed_properties(&previous, &current);
        assert_eq!(diff.len(), 3);
        assert_eq!(diff["b"], None);
    }
}
