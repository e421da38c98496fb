//! # Result Cache
//!
//! Write-through cache of successful task results, keyed by a canonical
//! digest over `(task_type, payload, params)`. A submit that finds a fresh
//! entry is answered immediately without consulting any peer.
//!
//! The cache also owns the **single-flight** groups: while a digest is being
//! computed, further identical submits attach as followers of the leader task
//! and share its terminal outcome, so the same work is never executed twice
//! concurrently.
//!
//! Eviction: least-recently-used once over capacity, plus a periodic TTL
//! sweep.

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::sync::Mutex;

use sha2::{Digest, Sha256};

use crate::common::messages::now_ts;

/// Canonical digest over a task's identity-for-caching.
///
/// Params are rendered with recursively sorted object keys so that two
/// submits with the same logical content always produce the same digest,
/// regardless of construction order.
pub fn task_digest(
    task_type: &str,
    data: &[u8],
    params: &BTreeMap<String, serde_json::Value>,
) -> String {
    let mut hasher = Sha256::new();
    hasher.update(task_type.as_bytes());
    hasher.update([0u8]);
    hasher.update(data);
    hasher.update([0u8]);

    let mut canonical = String::new();
    write_canonical_map(&mut canonical, params.iter().map(|(k, v)| (k.as_str(), v)));
    hasher.update(canonical.as_bytes());

    hex::encode(hasher.finalize())
}

/// Render a JSON value with all object keys sorted.
pub fn canonical_json(value: &serde_json::Value) -> String {
    let mut out = String::new();
    write_canonical_value(&mut out, value);
    out
}

fn write_canonical_value(out: &mut String, value: &serde_json::Value) {
    match value {
        serde_json::Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            write_canonical_map(out, keys.iter().map(|k| (k.as_str(), &map[*k])));
        }
        serde_json::Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical_value(out, item);
            }
            out.push(']');
        }
        other => out.push_str(&other.to_string()),
    }
}

fn write_canonical_map<'a>(
    out: &mut String,
    entries: impl Iterator<Item = (&'a str, &'a serde_json::Value)>,
) {
    out.push('{');
    for (i, (key, value)) in entries.enumerate() {
        if i > 0 {
            out.push(',');
        }
        out.push_str(&serde_json::Value::String(key.to_string()).to_string());
        out.push(':');
        write_canonical_value(out, value);
    }
    out.push('}');
}

/// A cached successful result.
#[derive(Debug, Clone)]
pub struct CachedResult {
    pub result: Vec<u8>,
    pub processing_time_ms: f64,
    pub completed_at: f64,
    pub expires_at: f64,
}

/// A submit waiting on another task's in-flight computation.
#[derive(Debug, Clone)]
pub struct Follower {
    pub task_id: String,
    pub requester_id: String,
}

/// Outcome of admitting a submit against the cache.
pub enum Admission {
    /// Fresh cached result; answer immediately, schedule nothing.
    CacheHit(CachedResult),
    /// First in-flight submit for this digest; schedule it.
    Leader,
    /// Identical submit while the leader is in flight; attached as follower.
    Follower,
}

struct CacheSlot {
    entry: CachedResult,
    last_used: f64,
}

struct Flight {
    leader_task: String,
    followers: Vec<Follower>,
}

struct CacheInner {
    entries: HashMap<String, CacheSlot>,
    flights: HashMap<String, Flight>,
}

/// Bounded, TTL'd result cache plus per-digest single-flight groups.
pub struct ResultCache {
    inner: Mutex<CacheInner>,
    ttl_s: f64,
    capacity: usize,
}

impl ResultCache {
    pub fn new(capacity: usize, ttl_s: u64) -> Self {
        Self {
            inner: Mutex::new(CacheInner {
                entries: HashMap::new(),
                flights: HashMap::new(),
            }),
            ttl_s: ttl_s as f64,
            capacity: capacity.max(1),
        }
    }

    /// Admit one submit: cache hit, new leader, or follower of an in-flight
    /// leader. Atomic, so two racing identical submits can never both become
    /// leaders.
    pub fn admit(&self, digest: &str, task_id: &str, requester_id: &str) -> Admission {
        let now = now_ts();
        let mut inner = self.inner.lock().unwrap();

        let mut stale = false;
        if let Some(slot) = inner.entries.get_mut(digest) {
            if slot.entry.expires_at > now {
                slot.last_used = now;
                return Admission::CacheHit(slot.entry.clone());
            }
            stale = true;
        }
        if stale {
            inner.entries.remove(digest);
        }

        match inner.flights.get_mut(digest) {
            Some(flight) => {
                flight.followers.push(Follower {
                    task_id: task_id.to_string(),
                    requester_id: requester_id.to_string(),
                });
                Admission::Follower
            }
            None => {
                inner.flights.insert(
                    digest.to_string(),
                    Flight {
                        leader_task: task_id.to_string(),
                        followers: Vec::new(),
                    },
                );
                Admission::Leader
            }
        }
    }

    /// Close a single-flight group after its leader reached a terminal state.
    ///
    /// On success the result is written through to the cache. Returns the
    /// followers awaiting the outcome, in attach order.
    pub fn complete_flight(
        &self,
        digest: &str,
        result: Option<(&[u8], f64)>,
    ) -> Vec<Follower> {
        let now = now_ts();
        let mut inner = self.inner.lock().unwrap();

        if let Some((output, processing_time_ms)) = result {
            inner.entries.insert(
                digest.to_string(),
                CacheSlot {
                    entry: CachedResult {
                        result: output.to_vec(),
                        processing_time_ms,
                        completed_at: now,
                        expires_at: now + self.ttl_s,
                    },
                    last_used: now,
                },
            );
            // LRU eviction once over capacity.
            while inner.entries.len() > self.capacity {
                let oldest = inner
                    .entries
                    .iter()
                    .min_by(|a, b| a.1.last_used.total_cmp(&b.1.last_used))
                    .map(|(k, _)| k.clone());
                match oldest {
                    Some(key) => {
                        inner.entries.remove(&key);
                    }
                    None => break,
                }
            }
        }

        inner
            .flights
            .remove(digest)
            .map(|f| f.followers)
            .unwrap_or_default()
    }

    /// Abort a flight whose leader was rejected before scheduling (e.g.
    /// queue_full). Any followers that raced in are returned so the caller
    /// can reject them too.
    pub fn abort_flight(&self, digest: &str) -> Vec<Follower> {
        let mut inner = self.inner.lock().unwrap();
        inner
            .flights
            .remove(digest)
            .map(|f| f.followers)
            .unwrap_or_default()
    }

    /// Leader task id of an in-flight digest, if one exists.
    pub fn flight_leader(&self, digest: &str) -> Option<String> {
        self.inner
            .lock()
            .unwrap()
            .flights
            .get(digest)
            .map(|f| f.leader_task.clone())
    }

    /// Drop expired entries; returns how many were removed.
    pub fn sweep_expired(&self) -> usize {
        let now = now_ts();
        let mut inner = self.inner.lock().unwrap();
        let before = inner.entries.len();
        inner.entries.retain(|_, slot| slot.entry.expires_at > now);
        before - inner.entries.len()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn params_of(pairs: &[(&str, serde_json::Value)]) -> BTreeMap<String, serde_json::Value> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn digest_ignores_param_construction_order() {
        let a = params_of(&[("x", json!(1)), ("y", json!({"b": 2, "a": 1}))]);
        let b = params_of(&[("y", json!({"a": 1, "b": 2})), ("x", json!(1))]);
        assert_eq!(
            task_digest("upscale", b"frame", &a),
            task_digest("upscale", b"frame", &b)
        );
    }

    #[test]
    fn digest_separates_type_payload_and_params() {
        let p = params_of(&[("quality", json!("balanced"))]);
        let base = task_digest("upscale", b"frame", &p);
        assert_ne!(base, task_digest("raytracing", b"frame", &p));
        assert_ne!(base, task_digest("upscale", b"other", &p));
        assert_ne!(
            base,
            task_digest("upscale", b"frame", &params_of(&[("quality", json!("fast"))]))
        );
    }

    #[test]
    fn canonical_json_sorts_nested_keys() {
        let v = json!({"b": {"z": 1, "a": [1, {"k": 2, "c": 3}]}, "a": true});
        assert_eq!(
            canonical_json(&v),
            r#"{"a":true,"b":{"a":[1,{"c":3,"k":2}],"z":1}}"#
        );
    }

    #[test]
    fn admit_leader_then_hit_after_completion() {
        let cache = ResultCache::new(16, 3600);

        match cache.admit("d1", "t1", "gamer_1") {
            Admission::Leader => {}
            _ => panic!("first submit must lead"),
        }
        let followers = cache.complete_flight("d1", Some((b"out", 12.0)));
        assert!(followers.is_empty());

        match cache.admit("d1", "t2", "gamer_1") {
            Admission::CacheHit(hit) => {
                assert_eq!(hit.result, b"out");
                assert_eq!(hit.processing_time_ms, 12.0);
            }
            _ => panic!("second submit must hit the cache"),
        }
    }

    #[test]
    fn concurrent_identical_submits_share_one_flight() {
        let cache = ResultCache::new(16, 3600);

        assert!(matches!(cache.admit("d1", "t1", "g1"), Admission::Leader));
        assert!(matches!(cache.admit("d1", "t2", "g2"), Admission::Follower));
        assert!(matches!(cache.admit("d1", "t3", "g1"), Admission::Follower));
        assert_eq!(cache.flight_leader("d1").as_deref(), Some("t1"));

        let followers = cache.complete_flight("d1", Some((b"out", 5.0)));
        let ids: Vec<&str> = followers.iter().map(|f| f.task_id.as_str()).collect();
        assert_eq!(ids, vec!["t2", "t3"]);
    }

    #[test]
    fn failed_flight_caches_nothing() {
        let cache = ResultCache::new(16, 3600);
        assert!(matches!(cache.admit("d1", "t1", "g1"), Admission::Leader));
        cache.complete_flight("d1", None);

        assert!(cache.is_empty());
        // Digest can be retried fresh afterwards.
        assert!(matches!(cache.admit("d1", "t2", "g1"), Admission::Leader));
    }

    #[test]
    fn expired_entries_miss_and_get_swept() {
        let cache = ResultCache::new(16, 0); // everything expires immediately
        assert!(matches!(cache.admit("d1", "t1", "g1"), Admission::Leader));
        cache.complete_flight("d1", Some((b"out", 1.0)));

        // TTL of zero: the stored entry is already stale.
        assert!(matches!(cache.admit("d1", "t2", "g1"), Admission::Leader));
        cache.complete_flight("d1", Some((b"out", 1.0)));
        assert_eq!(cache.sweep_expired(), 1);
        assert!(cache.is_empty());
    }

    #[test]
    fn lru_eviction_keeps_recently_used() {
        let cache = ResultCache::new(2, 3600);
        for (digest, task) in [("d1", "t1"), ("d2", "t2")] {
            assert!(matches!(cache.admit(digest, task, "g"), Admission::Leader));
            cache.complete_flight(digest, Some((b"out", 1.0)));
        }
        // Touch d1 so d2 becomes the LRU victim.
        assert!(matches!(cache.admit("d1", "t3", "g"), Admission::CacheHit(_)));

        assert!(matches!(cache.admit("d3", "t4", "g"), Admission::Leader));
        cache.complete_flight("d3", Some((b"out", 1.0)));

        assert_eq!(cache.len(), 2);
        assert!(matches!(cache.admit("d1", "t5", "g"), Admission::CacheHit(_)));
        assert!(matches!(cache.admit("d2", "t6", "g"), Admission::Leader));
    }
}
