//! C2 — fingerprinted read-through cache for idempotent stage outputs.
//! Grounded on `original_source/backend/src/services/cache.py`.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};

/// Re-serializes a `serde_json::Value` with object keys sorted and no
/// insignificant whitespace, independent of whether `serde_json`'s
/// `preserve_order` feature is enabled upstream.
pub fn canonical_json(value: &serde_json::Value) -> String {
    fn canonicalize(value: &serde_json::Value) -> serde_json::Value {
        match value {
            serde_json::Value::Object(map) => {
                let sorted: BTreeMap<String, serde_json::Value> =
                    map.iter().map(|(k, v)| (k.clone(), canonicalize(v))).collect();
                serde_json::to_value(sorted).unwrap_or(serde_json::Value::Null)
            }
            serde_json::Value::Array(items) => {
                serde_json::Value::Array(items.iter().map(canonicalize).collect())
            }
            other => other.clone(),
        }
    }
    serde_json::to_string(&canonicalize(value)).unwrap_or_default()
}

/// `"council:" + hex(sha256(canonical_json(parts)))`.
pub fn make_cache_key(parts: &serde_json::Value) -> String {
    let canonical = canonical_json(parts);
    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    format!("council:{}", hex::encode(hasher.finalize()))
}

#[derive(Debug, Clone)]
struct Entry {
    value: serde_json::Value,
    created_at: DateTime<Utc>,
    expires_at: Option<DateTime<Utc>>,
}

/// In-memory implementation. `enabled=false` makes `get` always miss and
/// `set` a no-op, matching the disabled-cache mode in spec §4.2.
pub struct CacheStore {
    enabled: bool,
    default_ttl: Option<chrono::Duration>,
    entries: RwLock<HashMap<String, Entry>>,
}

impl CacheStore {
    pub fn new(enabled: bool, default_ttl_seconds: Option<u64>) -> Self {
        Self {
            enabled,
            default_ttl: default_ttl_seconds.map(|s| chrono::Duration::seconds(s as i64)),
            entries: RwLock::new(HashMap::new()),
        }
    }

    pub fn get(&self, key: &str) -> Option<serde_json::Value> {
        if !self.enabled {
            return None;
        }
        {
            let entries = self.entries.read();
            match entries.get(key) {
                None => return None,
                Some(entry) => {
                    if let Some(expires_at) = entry.expires_at {
                        if Utc::now() >= expires_at {
                            drop(entries);
                            self.entries.write().remove(key);
                            return None;
                        }
                    }
                    return Some(entry.value.clone());
                }
            }
        }
    }

    pub fn set(&self, key: String, value: serde_json::Value, ttl_seconds: Option<u64>) {
        if !self.enabled {
            return;
        }
        let ttl = ttl_seconds
            .map(|s| chrono::Duration::seconds(s as i64))
            .or(self.default_ttl);
        let now = Utc::now();
        let entry = Entry {
            value,
            created_at: now,
            expires_at: ttl.map(|d| now + d),
        };
        self.entries.write().insert(key, entry);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_json_is_order_independent() {
        let a = serde_json::json!({"b": 1, "a": 2});
        let b = serde_json::json!({"a": 2, "b": 1});
        assert_eq!(canonical_json(&a), canonical_json(&b));
    }

    #[test]
    fn cache_key_is_deterministic_for_identical_inputs() {
        let parts = serde_json::json!({"stage": "stage1", "model": "m1", "user_query": "hi"});
        assert_eq!(make_cache_key(&parts), make_cache_key(&parts));
    }

    #[test]
    fn cache_key_differs_for_different_inputs() {
        let a = serde_json::json!({"stage": "stage1", "model": "m1"});
        let b = serde_json::json!({"stage": "stage1", "model": "m2"});
        assert_ne!(make_cache_key(&a), make_cache_key(&b));
    }

    #[test]
    fn disabled_cache_always_misses() {
        let cache = CacheStore::new(false, None);
        cache.set("k".into(), serde_json::json!("v"), None);
        assert!(cache.get("k").is_none());
    }

    #[test]
    fn set_then_get_round_trips() {
        let cache = CacheStore::new(true, None);
        cache.set("k".into(), serde_json::json!({"x": 1}), None);
        assert_eq!(cache.get("k"), Some(serde_json::json!({"x": 1})));
    }

    #[test]
    fn expired_entry_is_evicted_on_read() {
        let cache = CacheStore::new(true, Some(0));
        cache.set("k".into(), serde_json::json!("v"), Some(0));
        std::thread::sleep(std::time::Duration::from_millis(5));
        assert!(cache.get("k").is_none());
    }

    #[test]
    fn overwrite_resets_created_at() {
        let cache = CacheStore::new(true, None);
        cache.set("k".into(), serde_json::json!(1), None);
        let first_created = cache.entries.read().get("k").unwrap().created_at;
        std::thread::sleep(std::time::Duration::from_millis(5));
        cache.set("k".into(), serde_json::json!(2), None);
        let second_created = cache.entries.read().get("k").unwrap().created_at;
        assert!(second_created > first_created);
    }
}
