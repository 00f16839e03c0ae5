//! Typed cache facade over a [`ResultStore`], recording hit/miss per stage.

use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, warn};

use crate::fingerprint::Fingerprint;
use crate::metrics::CacheMetrics;
use crate::store::{MemoryStore, ResultStore};

pub struct ResultCache {
    store: Arc<dyn ResultStore>,
    metrics: CacheMetrics,
    ttl: Duration,
}

impl ResultCache {
    pub fn new(store: Arc<dyn ResultStore>, ttl: Duration) -> Self {
        Self {
            store,
            metrics: CacheMetrics::new(),
            ttl,
        }
    }

    /// In-memory cache, for tests and dry runs.
    pub fn in_memory(ttl: Duration) -> Self {
        Self::new(Arc::new(MemoryStore::default()), ttl)
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn metrics(&self) -> &CacheMetrics {
        &self.metrics
    }

    pub fn store(&self) -> &Arc<dyn ResultStore> {
        &self.store
    }

    /// Look up and decode a result. Anything that cannot be decoded is a miss.
    pub fn get<T: DeserializeOwned>(&self, stage: &str, key: &Fingerprint) -> Option<T> {
        let Some(value) = self.store.get(key) else {
            self.metrics.record_miss(stage);
            return None;
        };
        match serde_json::from_value(value) {
            Ok(decoded) => {
                debug!(stage, key = %key, "cache hit");
                self.metrics.record_hit(stage);
                Some(decoded)
            }
            Err(e) => {
                warn!(stage, key = %key, "Cache entry does not decode, recomputing: {}", e);
                self.metrics.record_corrupt(stage);
                None
            }
        }
    }

    /// Store a result with the configured ttl. Failures are logged, never returned.
    pub fn put<T: Serialize>(&self, stage: &str, key: &Fingerprint, value: &T) {
        self.put_with_ttl(stage, key, value, self.ttl)
    }

    pub fn put_with_ttl<T: Serialize>(
        &self,
        stage: &str,
        key: &Fingerprint,
        value: &T,
        ttl: Duration,
    ) {
        let encoded = match serde_json::to_value(value) {
            Ok(v) => v,
            Err(e) => {
                warn!(stage, "Cannot encode result for cache: {}", e);
                return;
            }
        };
        if let Err(e) = self.store.put(key, stage, &encoded, ttl) {
            warn!(stage, key = %key, "Cache write failed: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use serde_json::json;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Boundaries {
        start: f64,
        end: f64,
    }

    #[test]
    fn test_typed_round_trip_and_metrics() {
        let cache = ResultCache::in_memory(Duration::from_secs(60));
        let key = Fingerprint::compute("refine_boundaries", 1, "m", &json!({"id": "x"}));
        assert!(cache.get::<Boundaries>("refine_boundaries", &key).is_none());
        let value = Boundaries {
            start: 1.0,
            end: 9.5,
        };
        cache.put("refine_boundaries", &key, &value);
        assert_eq!(cache.get("refine_boundaries", &key), Some(value));
        let stats = cache.metrics().stage("refine_boundaries");
        assert_eq!((stats.hits, stats.misses), (1, 1));
    }

    #[test]
    fn test_undecodable_entry_is_a_miss() {
        let cache = ResultCache::in_memory(Duration::from_secs(60));
        let key = Fingerprint::compute("gate", 1, "m", &json!(1));
        cache.put("gate", &key, &json!({"unexpected": "shape"}));
        assert!(cache.get::<Boundaries>("gate", &key).is_none());
        assert_eq!(cache.metrics().stage("gate").corrupt, 1);
    }
}
