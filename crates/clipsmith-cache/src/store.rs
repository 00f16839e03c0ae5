//! Cache store trait and the in-memory store.

use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, Instant};

use parking_lot::RwLock;

use clipsmith_core::Result;

use crate::fingerprint::Fingerprint;

/// Key-value store for serialized stage results.
///
/// Entries are immutable once written; a `put` on a live key is ignored and
/// only an expired entry may be replaced. Read failures are reported as a
/// miss, never as an error.
pub trait ResultStore: Send + Sync {
    fn get(&self, key: &Fingerprint) -> Option<serde_json::Value>;

    fn put(
        &self,
        key: &Fingerprint,
        stage: &str,
        value: &serde_json::Value,
        ttl: Duration,
    ) -> Result<()>;

    /// Live entry count per stage.
    fn entries_by_stage(&self) -> Result<BTreeMap<String, u64>>;

    /// Drop every entry. Returns how many were removed.
    fn clear(&self) -> Result<u64>;
}

struct MemoryEntry {
    stage: String,
    value: serde_json::Value,
    inserted_at: Instant,
    ttl: Duration,
}

impl MemoryEntry {
    fn is_expired(&self) -> bool {
        self.inserted_at.elapsed() >= self.ttl
    }
}

/// Process-local store with a capacity bound.
pub struct MemoryStore {
    entries: RwLock<HashMap<Fingerprint, MemoryEntry>>,
    max_size: usize,
}

impl MemoryStore {
    pub fn new(max_size: usize) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            max_size: max_size.max(1),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new(10_000)
    }
}

impl ResultStore for MemoryStore {
    fn get(&self, key: &Fingerprint) -> Option<serde_json::Value> {
        {
            let entries = self.entries.read();
            match entries.get(key) {
                Some(e) if !e.is_expired() => return Some(e.value.clone()),
                Some(_) => {}
                None => return None,
            }
        }
        // Expired: remove under the write lock, re-checking in case a
        // concurrent put already replaced it.
        let mut entries = self.entries.write();
        if entries.get(key).map(|e| e.is_expired()).unwrap_or(false) {
            entries.remove(key);
        }
        None
    }

    fn put(
        &self,
        key: &Fingerprint,
        stage: &str,
        value: &serde_json::Value,
        ttl: Duration,
    ) -> Result<()> {
        let mut entries = self.entries.write();
        if let Some(existing) = entries.get(key) {
            if !existing.is_expired() {
                return Ok(());
            }
        }
        if entries.len() >= self.max_size && !entries.contains_key(key) {
            entries.retain(|_, e| !e.is_expired());
            while entries.len() >= self.max_size {
                let oldest = entries
                    .iter()
                    .min_by_key(|(_, e)| e.inserted_at)
                    .map(|(k, _)| k.clone());
                match oldest {
                    Some(k) => {
                        entries.remove(&k);
                    }
                    None => break,
                }
            }
        }
        entries.insert(
            key.clone(),
            MemoryEntry {
                stage: stage.to_string(),
                value: value.clone(),
                inserted_at: Instant::now(),
                ttl,
            },
        );
        Ok(())
    }

    fn entries_by_stage(&self) -> Result<BTreeMap<String, u64>> {
        let mut counts = BTreeMap::new();
        for entry in self.entries.read().values().filter(|e| !e.is_expired()) {
            *counts.entry(entry.stage.clone()).or_insert(0) += 1;
        }
        Ok(counts)
    }

    fn clear(&self) -> Result<u64> {
        let mut entries = self.entries.write();
        let removed = entries.len() as u64;
        entries.clear();
        Ok(removed)
    }
}
