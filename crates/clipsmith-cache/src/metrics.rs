//! Per-stage hit/miss counters.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

#[derive(Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    corrupt: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheStageStats {
    pub hits: u64,
    pub misses: u64,
    /// Entries that existed but could not be decoded (also counted as misses).
    pub corrupt: u64,
}

impl CacheStageStats {
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

#[derive(Default)]
pub struct CacheMetrics {
    stages: DashMap<String, Counters>,
}

impl CacheMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_hit(&self, stage: &str) {
        self.counters(stage, |c| c.hits.fetch_add(1, Ordering::Relaxed));
    }

    pub fn record_miss(&self, stage: &str) {
        self.counters(stage, |c| c.misses.fetch_add(1, Ordering::Relaxed));
    }

    pub fn record_corrupt(&self, stage: &str) {
        self.counters(stage, |c| {
            c.corrupt.fetch_add(1, Ordering::Relaxed);
            c.misses.fetch_add(1, Ordering::Relaxed)
        });
    }

    fn counters(&self, stage: &str, f: impl FnOnce(&Counters) -> u64) {
        if let Some(c) = self.stages.get(stage) {
            f(&c);
            return;
        }
        let entry = self.stages.entry(stage.to_string()).or_default();
        f(&entry);
    }

    pub fn stage(&self, stage: &str) -> CacheStageStats {
        self.stages
            .get(stage)
            .map(|c| CacheStageStats {
                hits: c.hits.load(Ordering::Relaxed),
                misses: c.misses.load(Ordering::Relaxed),
                corrupt: c.corrupt.load(Ordering::Relaxed),
            })
            .unwrap_or_default()
    }

    pub fn snapshot(&self) -> BTreeMap<String, CacheStageStats> {
        self.stages
            .iter()
            .map(|entry| (entry.key().clone(), self.stage(entry.key())))
            .collect()
    }
}
