//! In-process broker backend. Backs tests and single-node deployments;
//! semantics mirror the Redis backend (fan-out in publish order, lazy TTL
//! expiry, hash-level TTLs).

use std::collections::HashMap;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio::time::Instant;

struct ValueEntry {
    value: String,
    expires_at: Option<Instant>,
}

struct HashEntry {
    fields: HashMap<String, String>,
    expires_at: Option<Instant>,
}

/// Shared in-process bus. All clones of a memory [`super::Broker`] point
/// at one of these.
pub struct MemoryBus {
    subscribers: DashMap<String, Vec<mpsc::UnboundedSender<String>>>,
    values: DashMap<String, ValueEntry>,
    hashes: DashMap<String, HashEntry>,
}

impl MemoryBus {
    pub(super) fn new() -> Self {
        Self {
            subscribers: DashMap::new(),
            values: DashMap::new(),
            hashes: DashMap::new(),
        }
    }

    pub(super) fn publish(&self, channel: &str, payload: &str) {
        if let Some(mut subs) = self.subscribers.get_mut(channel) {
            subs.retain(|tx| tx.send(payload.to_string()).is_ok());
        }
    }

    pub(super) fn add_subscriber(&self, channel: &str, tx: mpsc::UnboundedSender<String>) {
        self.subscribers
            .entry(channel.to_string())
            .or_default()
            .push(tx);
    }

    pub(super) fn set(&self, key: &str, value: String, ttl: Duration) {
        self.values.insert(
            key.to_string(),
            ValueEntry {
                value,
                expires_at: Some(Instant::now() + ttl),
            },
        );
    }

    pub(super) fn get(&self, key: &str) -> Option<String> {
        if self.value_expired(key) {
            self.values.remove(key);
            return None;
        }
        self.values.get(key).map(|e| e.value.clone())
    }

    pub(super) fn delete(&self, key: &str) {
        self.values.remove(key);
        self.hashes.remove(key);
    }

    pub(super) fn hset(&self, key: &str, field: &str, value: &str) {
        self.drop_if_hash_expired(key);
        self.hashes
            .entry(key.to_string())
            .or_insert_with(|| HashEntry {
                fields: HashMap::new(),
                expires_at: None,
            })
            .fields
            .insert(field.to_string(), value.to_string());
    }

    pub(super) fn hdel(&self, key: &str, field: &str) {
        if let Some(mut entry) = self.hashes.get_mut(key) {
            entry.fields.remove(field);
        }
    }

    pub(super) fn hgetall(&self, key: &str) -> HashMap<String, String> {
        self.drop_if_hash_expired(key);
        self.hashes
            .get(key)
            .map(|e| e.fields.clone())
            .unwrap_or_default()
    }

    pub(super) fn expire(&self, key: &str, ttl: Duration) {
        let deadline = Instant::now() + ttl;
        if let Some(mut entry) = self.hashes.get_mut(key) {
            entry.expires_at = Some(deadline);
        }
        if let Some(mut entry) = self.values.get_mut(key) {
            entry.expires_at = Some(deadline);
        }
    }

    fn value_expired(&self, key: &str) -> bool {
        self.values
            .get(key)
            .and_then(|e| e.expires_at)
            .is_some_and(|at| Instant::now() >= at)
    }

    fn drop_if_hash_expired(&self, key: &str) {
        let expired = self
            .hashes
            .get(key)
            .and_then(|e| e.expires_at)
            .is_some_and(|at| Instant::now() >= at);
        if expired {
            self.hashes.remove(key);
        }
    }
}
