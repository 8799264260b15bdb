use crate::core::config::{CacheConfig, EvictionPolicy};
use crate::core::errors::{MaestroError, Result};
use crate::storage::SledStore;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::{debug, error, info, warn};

const CACHE_TREE: &str = "cache";
const ENTRIES_KEY: &str = "entries";
const METADATA_KEY: &str = "metadata";
const STATS_KEY: &str = "stats";

/// Bookkeeping kept next to every cached value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntryMeta {
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub last_access: DateTime<Utc>,
    /// Estimated size in bytes
    pub size: usize,
}

impl CacheEntryMeta {
    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }
}

#[derive(Debug, Clone)]
struct CacheEntry {
    value: Value,
    meta: CacheEntryMeta,
    /// Position in the recency order
    seq: u64,
}

/// Hit/miss/eviction counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheCounters {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
}

impl CacheCounters {
    /// Percentage of reads that hit, 0 when nothing was read yet
    pub fn hit_ratio(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64 * 100.0
        }
    }
}

/// Point-in-time view returned by [`CacheManager::get_stats`]
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CacheStats {
    pub size: usize,
    pub memory_usage: usize,
    pub hits: u64,
    pub misses: u64,
    pub hit_ratio: f64,
    pub evictions: u64,
    /// Age of the oldest entry
    pub oldest_item: Option<Duration>,
    /// Age of the newest entry
    pub newest_item: Option<Duration>,
}

#[derive(Debug, Default)]
struct CacheState {
    entries: HashMap<String, CacheEntry>,
    /// seq -> key, ascending seq is least to most recently used
    recency: BTreeMap<u64, String>,
    next_seq: u64,
    memory_usage: usize,
    counters: CacheCounters,
}

impl CacheState {
    fn bump_seq(&mut self) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        seq
    }

    fn touch(&mut self, key: &str, now: DateTime<Utc>) {
        let seq = self.bump_seq();
        if let Some(entry) = self.entries.get_mut(key) {
            self.recency.remove(&entry.seq);
            entry.seq = seq;
            entry.meta.last_access = now;
            self.recency.insert(seq, key.to_string());
        }
    }

    fn insert(&mut self, key: String, value: Value, meta: CacheEntryMeta) {
        self.remove(&key);
        let seq = self.bump_seq();
        self.memory_usage += meta.size;
        self.recency.insert(seq, key.clone());
        self.entries.insert(key, CacheEntry { value, meta, seq });
    }

    fn remove(&mut self, key: &str) -> Option<CacheEntry> {
        let entry = self.entries.remove(key)?;
        self.recency.remove(&entry.seq);
        self.memory_usage = self.memory_usage.saturating_sub(entry.meta.size);
        Some(entry)
    }

    /// Picks the eviction victim, never `exclude`
    fn victim(&self, policy: EvictionPolicy, exclude: Option<&str>) -> Option<String> {
        let mut candidates = self
            .recency
            .values()
            .filter(|key| Some(key.as_str()) != exclude);
        match policy {
            EvictionPolicy::Lru => candidates.next().cloned(),
            EvictionPolicy::Largest => {
                let mut largest: Option<(&String, usize)> = None;
                for key in candidates {
                    let size = self.entries.get(key).map(|e| e.meta.size).unwrap_or(0);
                    if largest.map_or(true, |(_, best)| size > best) {
                        largest = Some((key, size));
                    }
                }
                largest.map(|(key, _)| key.clone())
            }
        }
    }

    fn evict_one(&mut self, policy: EvictionPolicy, exclude: Option<&str>) -> bool {
        match self.victim(policy, exclude) {
            Some(key) => {
                self.remove(&key);
                self.counters.evictions += 1;
                debug!("Evicted cache entry {}", key);
                true
            }
            None => false,
        }
    }

    fn purge_expired(&mut self, now: DateTime<Utc>) -> usize {
        let expired: Vec<String> = self
            .entries
            .iter()
            .filter(|(_, entry)| entry.meta.is_expired(now))
            .map(|(key, _)| key.clone())
            .collect();
        for key in &expired {
            self.remove(key);
        }
        expired.len()
    }
}

/// What gets written to durable storage
struct CacheSnapshot {
    entries: Vec<(String, Value)>,
    metadata: Vec<(String, CacheEntryMeta)>,
    counters: CacheCounters,
}

#[derive(Debug)]
struct CacheInner {
    config: CacheConfig,
    state: Mutex<CacheState>,
    store: Option<SledStore>,
    is_shutdown: AtomicBool,
}

/// Bounded key/value memoization store with TTL expiry and eviction
///
/// All state sits behind one mutex that is never held across an await, so
/// the manager can be shared freely between concurrently running task
/// bodies. Public operations never return errors: failures are logged and
/// surface as `None` or `false`.
#[derive(Debug)]
pub struct CacheManager {
    inner: Arc<CacheInner>,
    maintenance_handle: Mutex<Option<JoinHandle<()>>>,
}

impl CacheManager {
    /// Builds a cache; with `persistent` set the sled database at
    /// `storage_path` is opened and any previous snapshot reloaded
    pub fn new(config: CacheConfig) -> Result<Self> {
        config.validate()?;
        let store = if config.persistent {
            Some(SledStore::open(&config.storage_path)?)
        } else {
            None
        };
        Ok(Self::build(config, store))
    }

    /// Like `new`, but persists to an already opened store
    ///
    /// The store is ignored unless `persistent` is set.
    pub fn with_store(config: CacheConfig, store: SledStore) -> Result<Self> {
        config.validate()?;
        let store = if config.persistent {
            Some(store)
        } else {
            debug!("Cache is not persistent, ignoring the given store");
            None
        };
        Ok(Self::build(config, store))
    }

    fn build(config: CacheConfig, store: Option<SledStore>) -> Self {
        let inner = CacheInner {
            config,
            state: Mutex::new(CacheState::default()),
            store,
            is_shutdown: AtomicBool::new(false),
        };
        if let Some(store) = &inner.store {
            match load_snapshot(store) {
                Ok(Some(snapshot)) => restore(&inner, snapshot),
                Ok(None) => debug!("No persisted cache snapshot found"),
                Err(e) => warn!("Ignoring unreadable cache snapshot: {}", e),
            }
        }
        Self {
            inner: Arc::new(inner),
            maintenance_handle: Mutex::new(None),
        }
    }

    /// Starts the periodic maintenance sweep
    pub fn with_maintenance(self) -> Self {
        self.start_maintenance();
        self
    }

    pub fn start_maintenance(&self) {
        let mut handle = self.maintenance_handle.lock();
        if handle.is_some() {
            return;
        }
        let inner = Arc::clone(&self.inner);
        *handle = Some(tokio::spawn(async move {
            let mut ticker = interval(inner.config.maintenance_interval);
            // the first tick completes immediately
            ticker.tick().await;
            while !inner.is_shutdown.load(Ordering::Relaxed) {
                ticker.tick().await;
                if let Err(e) = maintain(&inner) {
                    warn!("Cache maintenance failed: {}", e);
                }
            }
            info!("Cache maintenance task terminated");
        }));
    }

    pub fn config(&self) -> &CacheConfig {
        &self.inner.config
    }

    /// Returns the live value for `key`, purging it first if it expired
    pub fn get(&self, key: &str) -> Option<Value> {
        let now = Utc::now();
        let mut state = self.inner.state.lock();
        match state.entries.get(key).map(|entry| entry.meta.is_expired(now)) {
            None => {
                state.counters.misses += 1;
                None
            }
            Some(true) => {
                state.remove(key);
                state.counters.misses += 1;
                debug!("Cache entry {} expired on access", key);
                None
            }
            Some(false) => {
                state.counters.hits += 1;
                state.touch(key, now);
                state.entries.get(key).map(|entry| entry.value.clone())
            }
        }
    }

    /// Stores `value`; `ttl` falls back to the configured default
    pub fn set(&self, key: &str, value: Value, ttl: Option<Duration>) -> bool {
        match self.try_set(key, value, ttl) {
            Ok(()) => true,
            Err(e) => {
                error!("Failed to cache {}: {}", key, e);
                false
            }
        }
    }

    fn try_set(&self, key: &str, value: Value, ttl: Option<Duration>) -> Result<()> {
        let size = estimate_size(&value);
        let config = &self.inner.config;
        if size > config.max_memory {
            return Err(MaestroError::validation_field(
                format!("value of {} bytes exceeds max_memory {}", size, config.max_memory),
                "value",
            ));
        }
        let ttl = chrono::Duration::from_std(ttl.unwrap_or(config.ttl))
            .map_err(|e| MaestroError::validation_field(e.to_string(), "ttl"))?;
        let now = Utc::now();
        let expires_at = now
            .checked_add_signed(ttl)
            .ok_or_else(|| MaestroError::validation_field("ttl out of range", "ttl"))?;
        let meta = CacheEntryMeta {
            created_at: now,
            expires_at,
            last_access: now,
            size,
        };

        let mut state = self.inner.state.lock();
        if !state.entries.contains_key(key) && state.entries.len() >= config.max_size {
            state.evict_one(config.eviction_policy, None);
        }
        state.insert(key.to_string(), value, meta);
        while state.memory_usage > config.max_memory {
            if !state.evict_one(config.eviction_policy, Some(key)) {
                break;
            }
        }
        Ok(())
    }

    pub fn delete(&self, key: &str) -> bool {
        self.inner.state.lock().remove(key).is_some()
    }

    /// Drops every entry and zeroes the counters
    pub fn clear(&self) -> bool {
        let mut state = self.inner.state.lock();
        *state = CacheState::default();
        true
    }

    pub fn len(&self) -> usize {
        self.inner.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get_stats(&self) -> CacheStats {
        let now = Utc::now();
        let state = self.inner.state.lock();
        let created = state.entries.values().map(|e| e.meta.created_at);
        let oldest = created.clone().min();
        let newest = created.max();
        let age = |at: DateTime<Utc>| (now - at).to_std().ok();
        CacheStats {
            size: state.entries.len(),
            memory_usage: state.memory_usage,
            hits: state.counters.hits,
            misses: state.counters.misses,
            hit_ratio: state.counters.hit_ratio(),
            evictions: state.counters.evictions,
            oldest_item: oldest.and_then(age),
            newest_item: newest.and_then(age),
        }
    }

    /// Returns the cached value for `key` or computes, stores and returns it
    pub async fn get_or_insert_with<F, Fut>(
        &self,
        key: &str,
        ttl: Option<Duration>,
        compute: F,
    ) -> anyhow::Result<Value>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<Value>>,
    {
        if let Some(value) = self.get(key) {
            return Ok(value);
        }
        let value = compute().await?;
        self.set(key, value.clone(), ttl);
        Ok(value)
    }

    /// One maintenance pass: expiry sweep, memory enforcement, persistence
    pub fn run_maintenance(&self) -> Result<()> {
        maintain(&self.inner)
    }

    /// Stops the sweep and writes a final snapshot when persistent
    pub fn shutdown(&self) -> Result<()> {
        self.inner.is_shutdown.store(true, Ordering::Relaxed);
        if let Some(handle) = self.maintenance_handle.lock().take() {
            handle.abort();
        }
        persist(&self.inner)
    }
}

impl Drop for CacheManager {
    fn drop(&mut self) {
        self.inner.is_shutdown.store(true, Ordering::Relaxed);
        if let Some(handle) = self.maintenance_handle.get_mut().take() {
            handle.abort();
        }
    }
}

/// Best-effort size: serialized JSON length, structural estimate as fallback
fn estimate_size(value: &Value) -> usize {
    match serde_json::to_vec(value) {
        Ok(bytes) => bytes.len(),
        Err(_) => structural_size(value),
    }
}

fn structural_size(value: &Value) -> usize {
    match value {
        Value::Null | Value::Bool(_) => 8,
        Value::Number(_) => 16,
        Value::String(s) => s.len() + 24,
        Value::Array(items) => items.iter().map(structural_size).sum::<usize>() + 24,
        Value::Object(map) => {
            map.iter()
                .map(|(k, v)| k.len() + 24 + structural_size(v))
                .sum::<usize>()
                + 24
        }
    }
}

fn maintain(inner: &CacheInner) -> Result<()> {
    let now = Utc::now();
    {
        let mut state = inner.state.lock();
        let purged = state.purge_expired(now);
        let mut evicted = 0;
        while state.memory_usage > inner.config.max_memory {
            if !state.evict_one(inner.config.eviction_policy, None) {
                break;
            }
            evicted += 1;
        }
        if purged > 0 || evicted > 0 {
            debug!(purged, evicted, "Cache maintenance pass");
        }
    }
    persist(inner)
}

fn persist(inner: &CacheInner) -> Result<()> {
    let Some(store) = &inner.store else {
        return Ok(());
    };
    let snapshot = {
        let state = inner.state.lock();
        let mut entries = Vec::with_capacity(state.entries.len());
        let mut metadata = Vec::with_capacity(state.entries.len());
        for key in state.recency.values() {
            if let Some(entry) = state.entries.get(key) {
                entries.push((key.clone(), entry.value.clone()));
                metadata.push((key.clone(), entry.meta.clone()));
            }
        }
        CacheSnapshot {
            entries,
            metadata,
            counters: state.counters,
        }
    };

    store.put_json(CACHE_TREE, ENTRIES_KEY, &snapshot.entries)?;
    store.put(CACHE_TREE, METADATA_KEY, &bincode::serialize(&snapshot.metadata)?)?;
    store.put_json(CACHE_TREE, STATS_KEY, &snapshot.counters)?;
    store.flush()?;
    debug!("Persisted {} cache entries", snapshot.entries.len());
    Ok(())
}

fn load_snapshot(store: &SledStore) -> Result<Option<CacheSnapshot>> {
    let Some(entries) = store.get_json::<Vec<(String, Value)>>(CACHE_TREE, ENTRIES_KEY)? else {
        return Ok(None);
    };
    let metadata: Vec<(String, CacheEntryMeta)> = match store.get(CACHE_TREE, METADATA_KEY)? {
        Some(bytes) => bincode::deserialize(&bytes)?,
        None => Vec::new(),
    };
    let counters = store
        .get_json::<CacheCounters>(CACHE_TREE, STATS_KEY)?
        .unwrap_or_default();
    Ok(Some(CacheSnapshot {
        entries,
        metadata,
        counters,
    }))
}

fn restore(inner: &CacheInner, snapshot: CacheSnapshot) {
    let now = Utc::now();
    let mut metadata: HashMap<String, CacheEntryMeta> = snapshot.metadata.into_iter().collect();
    let mut state = inner.state.lock();
    state.counters = snapshot.counters;
    for (key, value) in snapshot.entries {
        let Some(meta) = metadata.remove(&key) else {
            warn!("Skipping persisted cache entry {} without metadata", key);
            continue;
        };
        if meta.is_expired(now) || state.entries.len() >= inner.config.max_size {
            continue;
        }
        state.insert(key, value, meta);
    }
    info!("Restored {} cache entries", state.entries.len());
}
