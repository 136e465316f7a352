//! Ephemeral Registry - process-wide key/value store with expiry and locking
//!
//! Holds transient engine and session state. Each entry may carry a TTL
//! (checked lazily on access) and a `locked` flag fixed at registration.
//! Locked entries survive overwrites, removals and non-forced clears.
//!
//! All operations run under a single mutex, so no partial update is ever
//! observable. There are no cross-key transactions.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info, warn};

/// Registry key for the loaded language model handle
pub const REGISTRY_MODEL: &str = "llm_model";
/// Registry key for the tokenizer handle
pub const REGISTRY_TOKENIZER: &str = "llm_tokenizer";
/// Registry key for the inference engine state
pub const REGISTRY_ENGINE: &str = "inference_engine";
/// Registry key for the semantic memory handle
pub const REGISTRY_MEMORY: &str = "semantic_memory";
/// Registry key for the vector store handle
pub const REGISTRY_VECTOR_DB: &str = "vector_store";
/// Lease held while a scheduled retraining cycle is running
pub const REGISTRY_RETRAIN_LEASE: &str = "retrain_lease";

/// Errors raised by registry operations.
///
/// These signal caller mistakes, not operational failures.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("key '{0}' is locked")]
    Locked(String),
    #[error("invalid registry snapshot: {0}")]
    InvalidSnapshot(String),
    #[error("registry serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type RegistryResult<T> = std::result::Result<T, RegistryError>;

/// Source of "now" for TTL checks
pub type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

/// A stored value plus its metadata.
///
/// This is also the per-key shape of an exported snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegistryEntry {
    pub value: serde_json::Value,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub ttl_seconds: Option<u64>,
    #[serde(default)]
    pub locked: bool,
}

impl RegistryEntry {
    /// Whether the TTL has elapsed at `now`.
    ///
    /// Strictly greater: an access at exactly `ttl_seconds` is still live.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        match self.ttl_seconds {
            Some(ttl) => {
                // A TTL too large to express in milliseconds never elapses
                let Some(ttl_ms) = i64::try_from(ttl).ok().and_then(|s| s.checked_mul(1000)) else {
                    return false;
                };
                let elapsed_ms = (now - self.created_at).num_milliseconds();
                elapsed_ms > ttl_ms
            }
            None => false,
        }
    }

    fn metadata(&self) -> EntryMetadata {
        EntryMetadata {
            created_at: self.created_at,
            ttl_seconds: self.ttl_seconds,
            locked: self.locked,
        }
    }
}

/// Metadata of an entry, without its value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryMetadata {
    pub created_at: DateTime<Utc>,
    pub ttl_seconds: Option<u64>,
    pub locked: bool,
}

/// Non-mutating view of an entry, see [`Registry::peek`]
#[derive(Debug, Clone, PartialEq)]
pub struct PeekedEntry {
    pub value: serde_json::Value,
    pub metadata: EntryMetadata,
    pub expired: bool,
}

/// How imported entries are timestamped
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ImportPolicy {
    /// Keep the recorded `created_at`; stale entries expire on next access
    #[default]
    AsRecorded,
    /// Restamp every entry with the current time, treating it as fresh
    Refresh,
}

/// Process-wide ephemeral key/value store
pub struct Registry {
    entries: Mutex<HashMap<String, RegistryEntry>>,
    clock: Clock,
}

impl Registry {
    /// Create an empty registry using the system clock
    pub fn new() -> Self {
        Self::with_clock(Arc::new(Utc::now))
    }

    /// Create an empty registry with a custom clock
    pub fn with_clock(clock: Clock) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            clock,
        }
    }

    fn now(&self) -> DateTime<Utc> {
        (self.clock)()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, RegistryEntry>> {
        // A panic while holding the guard cannot leave an entry half-written
        self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Insert or overwrite `key`.
    ///
    /// Fails with [`RegistryError::Locked`] if the existing entry is locked.
    pub fn register(
        &self,
        key: &str,
        value: serde_json::Value,
        ttl_seconds: Option<u64>,
        locked: bool,
    ) -> RegistryResult<()> {
        let now = self.now();
        let mut entries = self.lock();
        if entries.get(key).map(|e| e.locked).unwrap_or(false) {
            warn!(source = "registry", "Refused to overwrite locked key '{}'", key);
            return Err(RegistryError::Locked(key.to_string()));
        }

        entries.insert(
            key.to_string(),
            RegistryEntry {
                value,
                created_at: now,
                ttl_seconds,
                locked,
            },
        );
        debug!(source = "registry", "Registered '{}' (ttl: {:?}, locked: {})", key, ttl_seconds, locked);
        Ok(())
    }

    /// Register any serializable value
    pub fn register_as<T: Serialize>(
        &self,
        key: &str,
        value: &T,
        ttl_seconds: Option<u64>,
        locked: bool,
    ) -> RegistryResult<()> {
        let value = serde_json::to_value(value)?;
        self.register(key, value, ttl_seconds, locked)
    }

    /// Insert `key` only if it is absent or expired, in one step.
    ///
    /// Returns `Ok(false)` when a live entry already holds the key. Used
    /// for leases that must not be taken twice.
    pub fn try_acquire(
        &self,
        key: &str,
        value: serde_json::Value,
        ttl_seconds: Option<u64>,
    ) -> RegistryResult<bool> {
        let now = self.now();
        let mut entries = self.lock();
        if let Some(existing) = entries.get(key) {
            if existing.locked {
                return Err(RegistryError::Locked(key.to_string()));
            }
            if !existing.is_expired_at(now) {
                return Ok(false);
            }
        }

        entries.insert(
            key.to_string(),
            RegistryEntry {
                value,
                created_at: now,
                ttl_seconds,
                locked: false,
            },
        );
        Ok(true)
    }

    /// Read the value for `key`.
    ///
    /// Side effect: an expired unlocked entry is evicted before `None` is
    /// returned. An expired locked entry reads as `None` but stays stored.
    pub fn get(&self, key: &str) -> Option<serde_json::Value> {
        let now = self.now();
        let mut entries = self.lock();
        let entry = entries.get(key)?;
        if !entry.is_expired_at(now) {
            return Some(entry.value.clone());
        }

        if !entry.locked {
            entries.remove(key);
            debug!(source = "registry", "Evicted expired key '{}'", key);
        }
        None
    }

    /// Read and deserialize the value for `key`
    pub fn get_as<T: DeserializeOwned>(&self, key: &str) -> RegistryResult<Option<T>> {
        match self.get(key) {
            Some(value) => Ok(Some(serde_json::from_value(value)?)),
            None => Ok(None),
        }
    }

    /// Whether `key` holds a live value. Same eviction side effect as `get`.
    pub fn exists(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    /// Remove `key`. No-op if absent, fails if locked.
    pub fn unregister(&self, key: &str) -> RegistryResult<()> {
        let mut entries = self.lock();
        match entries.get(key) {
            Some(entry) if entry.locked => Err(RegistryError::Locked(key.to_string())),
            Some(_) => {
                entries.remove(key);
                debug!(source = "registry", "Unregistered '{}'", key);
                Ok(())
            }
            None => Ok(()),
        }
    }

    /// Remove `key` only if its live, unlocked entry satisfies `pred`.
    ///
    /// The check and the removal happen under one lock. Returns whether
    /// the entry was removed. Expired entries are never handed to `pred`.
    pub fn remove_if<F>(&self, key: &str, pred: F) -> bool
    where
        F: FnOnce(&serde_json::Value) -> bool,
    {
        let now = self.now();
        let mut entries = self.lock();
        let matches = entries
            .get(key)
            .map(|entry| !entry.locked && !entry.is_expired_at(now) && pred(&entry.value))
            .unwrap_or(false);
        if matches {
            entries.remove(key);
            debug!(source = "registry", "Removed '{}' conditionally", key);
        }
        matches
    }

    /// Remove every unlocked entry, or every entry when `force` is set.
    ///
    /// Returns the number of entries removed.
    pub fn clear(&self, force: bool) -> usize {
        let mut entries = self.lock();
        let before = entries.len();
        if force {
            entries.clear();
        } else {
            entries.retain(|_, entry| entry.locked);
        }
        let removed = before - entries.len();
        info!(source = "registry", "Cleared {} registry entries (force: {})", removed, force);
        removed
    }

    /// Keys currently stored, sorted.
    ///
    /// Expiry is not checked here: an expired entry that no `get` has
    /// evicted yet is still listed.
    pub fn list_keys(&self, include_locked: bool) -> Vec<String> {
        let entries = self.lock();
        let mut keys: Vec<String> = entries
            .iter()
            .filter(|(_, entry)| include_locked || !entry.locked)
            .map(|(key, _)| key.clone())
            .collect();
        keys.sort();
        keys
    }

    /// Metadata for `key` without reading the value or checking expiry
    pub fn get_metadata(&self, key: &str) -> Option<EntryMetadata> {
        self.lock().get(key).map(RegistryEntry::metadata)
    }

    /// Inspect an entry without evicting it, reporting whether it is expired
    pub fn peek(&self, key: &str) -> Option<PeekedEntry> {
        let now = self.now();
        self.lock().get(key).map(|entry| PeekedEntry {
            value: entry.value.clone(),
            metadata: entry.metadata(),
            expired: entry.is_expired_at(now),
        })
    }

    /// Evict every expired unlocked entry. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = self.now();
        let mut entries = self.lock();
        let before = entries.len();
        entries.retain(|_, entry| entry.locked || !entry.is_expired_at(now));
        let removed = before - entries.len();
        if removed > 0 {
            debug!(source = "registry", "Purged {} expired entries", removed);
        }
        removed
    }

    /// Number of stored entries, expired or not
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Serialize the full state as a JSON object keyed by entry key.
    ///
    /// No expiry check is performed; expired entries are exported as-is.
    pub fn export_snapshot(&self) -> RegistryResult<String> {
        let entries = self.lock();
        let ordered: BTreeMap<&String, &RegistryEntry> = entries.iter().collect();
        Ok(serde_json::to_string_pretty(&ordered)?)
    }

    /// Replace the full state with a snapshot produced by `export_snapshot`.
    ///
    /// TTLs are not revalidated. With [`ImportPolicy::AsRecorded`] entries
    /// that were already stale come back and expire on their next access;
    /// [`ImportPolicy::Refresh`] restamps them as created now. Returns the
    /// number of entries imported.
    pub fn import_snapshot(&self, json: &str, policy: ImportPolicy) -> RegistryResult<usize> {
        let raw: serde_json::Value = serde_json::from_str(json)?;
        if !raw.is_object() {
            return Err(RegistryError::InvalidSnapshot(
                "expected a JSON object keyed by entry key".to_string(),
            ));
        }
        let mut imported: HashMap<String, RegistryEntry> = serde_json::from_value(raw)
            .map_err(|e| RegistryError::InvalidSnapshot(e.to_string()))?;

        if policy == ImportPolicy::Refresh {
            let now = self.now();
            for entry in imported.values_mut() {
                entry.created_at = now;
            }
        }

        let count = imported.len();
        *self.lock() = imported;
        info!(source = "registry", "Imported {} registry entries ({:?})", count, policy);
        Ok(count)
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}
