use std::collections::{HashMap, HashSet};
use std::sync::{Arc, PoisonError, RwLock};

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info};

use super::entry::PersistedBlob;
use super::{
    CacheEntry, Freshness, MemoryPersistentStore, PersistentKeyValueStore, StalenessPolicy,
    StoreError, Tier, TtlClass,
};
use crate::clock::Clock;
use crate::config::CacheConfig;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS))]
#[serde(rename_all = "camelCase")]
pub struct CacheStats {
    pub memory_items: usize,
    pub persistent_items: usize,
    /// Bytes held by this store's namespace in the persistent tier, keys
    /// included.
    pub total_size_bytes: usize,
}

/// Process-wide cache with a memory tier and a best-effort persistent mirror.
///
/// Readers always see one logical entry per key: memory is authoritative and
/// the persistent tier is only read to restore an entry after a reload.
/// Writes are last-writer-wins per key.
pub struct TieredCacheStore {
    memory: RwLock<HashMap<String, CacheEntry>>,
    persistent: Arc<dyn PersistentKeyValueStore>,
    policy: StalenessPolicy,
    clock: Arc<dyn Clock>,
    namespace: String,
}

impl TieredCacheStore {
    pub fn new(
        config: &CacheConfig,
        persistent: Arc<dyn PersistentKeyValueStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            memory: RwLock::new(HashMap::new()),
            persistent,
            policy: StalenessPolicy::from_config(config),
            clock,
            namespace: config.namespace.clone(),
        }
    }

    /// Store whose persistent tier lives only as long as the process.
    pub fn in_memory(config: &CacheConfig, clock: Arc<dyn Clock>) -> Self {
        Self::new(config, Arc::new(MemoryPersistentStore::new()), clock)
    }

    pub fn policy(&self) -> &StalenessPolicy {
        &self.policy
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    fn persisted_key(&self, key: &str) -> String {
        format!("{}:{}", self.namespace, key)
    }

    fn namespace_keys(&self) -> Vec<String> {
        let prefix = format!("{}:", self.namespace);
        match self.persistent.keys() {
            Ok(keys) => keys.into_iter().filter(|k| k.starts_with(&prefix)).collect(),
            Err(e) => {
                debug!(error = %e, "Failed to list persistent cache keys");
                Vec::new()
            }
        }
    }

    // ===== Reads =====

    pub fn get(&self, key: &str) -> Option<CacheEntry> {
        let cached = self
            .memory
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned();
        cached.or_else(|| self.hydrate(key))
    }

    /// Entry together with its classification at the current time.
    pub fn lookup(&self, key: &str) -> Option<(CacheEntry, Freshness)> {
        let entry = self.get(key)?;
        let freshness = self.policy.classify(&entry, self.clock.now());
        Some((entry, freshness))
    }

    pub fn has(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    /// Restore an entry from the persistent tier into memory.
    fn hydrate(&self, key: &str) -> Option<CacheEntry> {
        let persisted_key = self.persisted_key(key);
        let raw = match self.persistent.get(&persisted_key) {
            Ok(Some(raw)) => raw,
            Ok(None) => return None,
            Err(e) => {
                debug!(cache = key, error = %e, "Failed to read persistent cache entry");
                return None;
            }
        };

        let blob: PersistedBlob = match serde_json::from_str(&raw) {
            Ok(blob) => blob,
            Err(e) => {
                debug!(cache = key, error = %e, "Discarding malformed persistent cache entry");
                self.remove_persisted(&persisted_key);
                return None;
            }
        };

        let entry = blob.into_entry(key);
        if self.policy.classify(&entry, self.clock.now()) == Freshness::Expired {
            debug!(cache = key, "Evicting expired persistent cache entry");
            self.remove_persisted(&persisted_key);
            return None;
        }

        debug!(cache = key, "Restored cache entry from persistent tier");
        let mut memory = self.memory.write().unwrap_or_else(PoisonError::into_inner);
        // A concurrent set may have landed first; it is newer than the blob.
        Some(memory.entry(key.to_string()).or_insert(entry).clone())
    }

    // ===== Writes =====

    pub fn set(&self, key: &str, value: Value, ttl_class: TtlClass) -> CacheEntry {
        let previous_class = self
            .memory
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .map(|e| e.ttl_class);
        if let Some(previous) = previous_class.filter(|c| *c != ttl_class) {
            debug!(cache = key, from = %previous, to = %ttl_class, "TTL class changed, evicting entry");
            self.invalidate(key);
        }

        let mut entry = CacheEntry {
            key: key.to_string(),
            value,
            stored_at: self.clock.now(),
            ttl_class,
            tier: Tier::Memory,
        };
        if self.persist(&entry) {
            entry.tier = Tier::Persistent;
        }

        self.memory
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.to_string(), entry.clone());
        entry
    }

    /// Mirror an entry to the persistent tier. Returns whether it stuck.
    fn persist(&self, entry: &CacheEntry) -> bool {
        let persisted_key = self.persisted_key(&entry.key);
        let serialized = match serde_json::to_string(&PersistedBlob::from(entry)) {
            Ok(s) => s,
            Err(e) => {
                debug!(cache = %entry.key, error = %e, "Failed to serialize cache entry");
                return false;
            }
        };

        // Each victim is tried at most once per write
        let mut evicted = HashSet::new();
        loop {
            match self.persistent.set(&persisted_key, &serialized) {
                Ok(()) => return true,
                Err(StoreError::QuotaExceeded { .. }) => {
                    if !self.evict_oldest_persisted(&persisted_key, &mut evicted) {
                        debug!(cache = %entry.key, "Persistent quota exhausted, keeping entry in memory only");
                        return false;
                    }
                }
                Err(e) => {
                    debug!(cache = %entry.key, error = %e, "Failed to persist cache entry");
                    return false;
                }
            }
        }
    }

    /// Drop the oldest persisted entry in this namespace other than `except`
    /// and not already in `evicted`. Returns false once nothing is left to
    /// try.
    fn evict_oldest_persisted(&self, except: &str, evicted: &mut HashSet<String>) -> bool {
        let mut candidates: Vec<(DateTime<Utc>, String)> = self
            .namespace_keys()
            .into_iter()
            .filter(|k| k != except && !evicted.contains(k))
            .map(|k| {
                let stored_at = self
                    .persistent
                    .get(&k)
                    .ok()
                    .flatten()
                    .and_then(|raw| serde_json::from_str::<PersistedBlob>(&raw).ok())
                    .map(|blob| blob.stored_at)
                    .unwrap_or(DateTime::<Utc>::MIN_UTC);
                (stored_at, k)
            })
            .collect();
        candidates.sort();

        for (_, victim) in candidates {
            evicted.insert(victim.clone());
            if let Err(e) = self.persistent.remove(&victim) {
                debug!(evicted = %victim, error = %e, "Failed to evict persistent cache entry");
                continue;
            }
            debug!(evicted = %victim, "Evicted oldest persistent cache entry to free quota");

            if let Some(key) = victim.strip_prefix(&format!("{}:", self.namespace)) {
                let mut memory = self.memory.write().unwrap_or_else(PoisonError::into_inner);
                if let Some(entry) = memory.get_mut(key) {
                    entry.tier = Tier::Memory;
                }
            }
            return true;
        }
        false
    }

    fn remove_persisted(&self, persisted_key: &str) {
        if let Err(e) = self.persistent.remove(persisted_key) {
            debug!(key = persisted_key, error = %e, "Failed to remove persistent cache entry");
        }
    }

    pub fn invalidate(&self, key: &str) {
        self.memory
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key);
        self.remove_persisted(&self.persisted_key(key));
    }

    /// Empty both tiers. Only for user-triggered cache resets.
    pub fn clear(&self) {
        self.memory
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        for key in self.namespace_keys() {
            self.remove_persisted(&key);
        }
        info!("Cache cleared");
    }

    pub fn stats(&self) -> CacheStats {
        let memory_items = self
            .memory
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len();
        let keys = self.namespace_keys();
        let total_size_bytes = keys
            .iter()
            .filter_map(|k| {
                let value = self.persistent.get(k).ok().flatten()?;
                Some(k.len() + value.len())
            })
            .sum();

        CacheStats {
            memory_items,
            persistent_items: keys.len(),
            total_size_bytes,
        }
    }
}
