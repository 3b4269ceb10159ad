//! State mirror - write-through cache over the storage adapter.
//!
//! Reads are served from memory when possible and fall through to storage on a
//! miss, populating the cache. Writes go to storage first and only touch the
//! cache once storage has accepted them, so the mirror never presents a value
//! that was not durably persisted.
//!
//! Namespaces are hydrated lazily: per-key reads never need a full load, and a
//! namespace is loaded in bulk only on the first namespace-level access
//! ([`StateMirror::keys`], [`StateMirror::snapshot`]) or an explicit
//! [`StateMirror::hydrate`].
//!
//! Namespaces under [`RESERVED_NAMESPACE_PREFIX`] hold credentials and the
//! audit trail; the mirror refuses them with `Forbidden`.
//!
//! Every cached value carries a generation tag. Generations increase
//! monotonically across the mirror, so a caller holding a [`MirrorEntry`] can
//! ask [`StateMirror::is_current`] whether a later write has superseded it.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};

use crate::storage::{is_reserved_namespace, StorageAdapter, RESERVED_NAMESPACE_PREFIX};
use crate::types::{Error, Result};

/// A cached value with its generation tag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MirrorEntry {
    pub namespace: String,
    pub key: String,
    pub value: Value,
    pub generation: u64,
}

#[derive(Debug, Clone)]
struct Cached {
    value: Value,
    generation: u64,
}

/// Counters describing mirror behavior.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct MirrorStats {
    pub hits: u64,
    pub misses: u64,
    pub writes: u64,
    pub write_failures: u64,
    pub cached_keys: usize,
    pub hydrated_namespaces: usize,
}

#[derive(Debug, Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    writes: AtomicU64,
    write_failures: AtomicU64,
}

/// Write-through cache keyed by `(namespace, key)`.
#[derive(Debug)]
pub struct StateMirror {
    storage: Arc<dyn StorageAdapter>,
    cache: RwLock<HashMap<String, HashMap<String, Cached>>>,
    hydrated: RwLock<HashSet<String>>,
    /// One lock per namespace. Serializes miss fills, hydration and writes
    /// within a namespace so that a slow read-through can never overwrite a
    /// newer local write.
    fill_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    generation: AtomicU64,
    counters: Counters,
}

impl StateMirror {
    pub fn new(storage: Arc<dyn StorageAdapter>) -> Self {
        Self {
            storage,
            cache: RwLock::new(HashMap::new()),
            hydrated: RwLock::new(HashSet::new()),
            fill_locks: Mutex::new(HashMap::new()),
            generation: AtomicU64::new(0),
            counters: Counters::default(),
        }
    }

    /// The adapter this mirror writes through to.
    pub fn storage(&self) -> &Arc<dyn StorageAdapter> {
        &self.storage
    }

    fn check_namespace(namespace: &str) -> Result<()> {
        if is_reserved_namespace(namespace) {
            return Err(Error::forbidden(format!(
                "namespace {} is reserved ({}*)",
                namespace, RESERVED_NAMESPACE_PREFIX
            )));
        }
        Ok(())
    }

    async fn fill_lock(&self, namespace: &str) -> Arc<Mutex<()>> {
        self.fill_locks
            .lock()
            .await
            .entry(namespace.to_string())
            .or_default()
            .clone()
    }

    fn next_generation(&self) -> u64 {
        self.generation.fetch_add(1, Ordering::SeqCst) + 1
    }

    async fn cached(&self, namespace: &str, key: &str) -> Option<Cached> {
        self.cache
            .read()
            .await
            .get(namespace)
            .and_then(|ns| ns.get(key))
            .cloned()
    }

    async fn insert_cached(&self, namespace: &str, key: &str, value: Value, generation: u64) {
        self.cache
            .write()
            .await
            .entry(namespace.to_string())
            .or_default()
            .insert(key.to_string(), Cached { value, generation });
    }

    /// Read a value, falling through to storage on a cache miss.
    ///
    /// Absent keys are not cached; the next `get` asks storage again.
    pub async fn get(&self, namespace: &str, key: &str) -> Result<Option<Value>> {
        Ok(self.entry(namespace, key).await?.map(|entry| entry.value))
    }

    /// Read a value together with its generation tag.
    pub async fn entry(&self, namespace: &str, key: &str) -> Result<Option<MirrorEntry>> {
        Self::check_namespace(namespace)?;
        if let Some(hit) = self.cached(namespace, key).await {
            self.counters.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(Some(MirrorEntry {
                namespace: namespace.to_string(),
                key: key.to_string(),
                value: hit.value,
                generation: hit.generation,
            }));
        }

        let lock = self.fill_lock(namespace).await;
        let _fill = lock.lock().await;

        // A writer or another miss may have populated the key while we waited.
        if let Some(hit) = self.cached(namespace, key).await {
            self.counters.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(Some(MirrorEntry {
                namespace: namespace.to_string(),
                key: key.to_string(),
                value: hit.value,
                generation: hit.generation,
            }));
        }

        self.counters.misses.fetch_add(1, Ordering::Relaxed);
        let Some(value) = self.storage.get(namespace, key).await? else {
            return Ok(None);
        };

        let generation = self.next_generation();
        self.insert_cached(namespace, key, value.clone(), generation)
            .await;
        tracing::trace!(namespace, key, generation, "state_mirror_read_through");

        Ok(Some(MirrorEntry {
            namespace: namespace.to_string(),
            key: key.to_string(),
            value,
            generation,
        }))
    }

    /// Persist a value, then cache it. Returns the new generation.
    ///
    /// On storage failure the cache is left untouched and the error propagates.
    pub async fn set(&self, namespace: &str, key: &str, value: Value) -> Result<u64> {
        Self::check_namespace(namespace)?;
        let lock = self.fill_lock(namespace).await;
        let _fill = lock.lock().await;

        if let Err(e) = self.storage.set(namespace, key, value.clone()).await {
            self.counters.write_failures.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(namespace, key, error = %e, "state_mirror_write_failed");
            return Err(e);
        }

        let generation = self.next_generation();
        self.insert_cached(namespace, key, value, generation).await;
        self.counters.writes.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(namespace, key, generation, "state_mirror_write");
        Ok(generation)
    }

    /// Delete from storage, then evict from the cache.
    pub async fn delete(&self, namespace: &str, key: &str) -> Result<()> {
        Self::check_namespace(namespace)?;
        let lock = self.fill_lock(namespace).await;
        let _fill = lock.lock().await;

        if let Err(e) = self.storage.delete(namespace, key).await {
            self.counters.write_failures.fetch_add(1, Ordering::Relaxed);
            return Err(e);
        }

        let mut cache = self.cache.write().await;
        if let Some(ns) = cache.get_mut(namespace) {
            ns.remove(key);
        }
        self.counters.writes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Load every key of a namespace into the cache. Idempotent.
    ///
    /// Returns the number of keys read from storage by this call.
    pub async fn hydrate(&self, namespace: &str) -> Result<usize> {
        Self::check_namespace(namespace)?;
        if self.hydrated.read().await.contains(namespace) {
            return Ok(0);
        }

        let lock = self.fill_lock(namespace).await;
        let _fill = lock.lock().await;
        if self.hydrated.read().await.contains(namespace) {
            return Ok(0);
        }

        let mut loaded = 0;
        for (key, value) in self.storage.scan(namespace).await? {
            if self.cached(namespace, &key).await.is_some() {
                continue;
            }
            let generation = self.next_generation();
            self.insert_cached(namespace, &key, value, generation).await;
            loaded += 1;
        }

        self.hydrated.write().await.insert(namespace.to_string());
        tracing::debug!(namespace, loaded, "state_mirror_hydrated");
        Ok(loaded)
    }

    /// Sorted keys of a namespace, hydrating it on first access.
    pub async fn keys(&self, namespace: &str) -> Result<Vec<String>> {
        self.hydrate(namespace).await?;
        let cache = self.cache.read().await;
        let mut keys: Vec<String> = cache
            .get(namespace)
            .map(|ns| ns.keys().cloned().collect())
            .unwrap_or_default();
        keys.sort();
        Ok(keys)
    }

    /// All values of a namespace, hydrating it on first access.
    pub async fn snapshot(&self, namespace: &str) -> Result<BTreeMap<String, Value>> {
        self.hydrate(namespace).await?;
        let cache = self.cache.read().await;
        Ok(cache
            .get(namespace)
            .map(|ns| {
                ns.iter()
                    .map(|(k, v)| (k.clone(), v.value.clone()))
                    .collect()
            })
            .unwrap_or_default())
    }

    /// True if no write or reload has replaced `entry` since it was read.
    pub async fn is_current(&self, entry: &MirrorEntry) -> bool {
        self.cached(&entry.namespace, &entry.key)
            .await
            .is_some_and(|c| c.generation == entry.generation)
    }

    /// Drop one cached key so the next read goes to storage.
    ///
    /// Used when something other than this mirror wrote the key. The namespace
    /// loses its hydrated mark because its cached view may now be incomplete.
    pub async fn invalidate(&self, namespace: &str, key: &str) {
        let lock = self.fill_lock(namespace).await;
        let _fill = lock.lock().await;
        if let Some(ns) = self.cache.write().await.get_mut(namespace) {
            ns.remove(key);
        }
        self.hydrated.write().await.remove(namespace);
    }

    /// Drop a whole namespace from the cache.
    pub async fn invalidate_namespace(&self, namespace: &str) {
        let lock = self.fill_lock(namespace).await;
        let _fill = lock.lock().await;
        self.cache.write().await.remove(namespace);
        self.hydrated.write().await.remove(namespace);
    }

    pub async fn stats(&self) -> MirrorStats {
        MirrorStats {
            hits: self.counters.hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            writes: self.counters.writes.load(Ordering::Relaxed),
            write_failures: self.counters.write_failures.load(Ordering::Relaxed),
            cached_keys: self.cache.read().await.values().map(HashMap::len).sum(),
            hydrated_namespaces: self.hydrated.read().await.len(),
        }
    }
}
