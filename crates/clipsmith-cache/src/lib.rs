//! Clipsmith Cache: content-addressed memoization of stage results.

pub mod cache;
pub mod fingerprint;
pub mod metrics;
pub mod sqlite;
pub mod store;

pub use cache::ResultCache;
pub use fingerprint::{ensemble_model_key, Fingerprint};
pub use metrics::{CacheMetrics, CacheStageStats};
pub use sqlite::SqliteStore;
pub use store::{MemoryStore, ResultStore};
