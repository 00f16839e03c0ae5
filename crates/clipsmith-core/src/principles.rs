//! Learned editing principles, loaded once per run as an immutable snapshot.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::info;

use crate::error::Result;

/// Versioned, read-only view of `principles.json`.
///
/// Updates happen out of band and produce a new snapshot with a new digest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PrinciplesSnapshot {
    entries: BTreeMap<String, serde_json::Value>,
    digest: String,
}

impl PrinciplesSnapshot {
    pub fn empty() -> Self {
        Self::from_entries(BTreeMap::new())
    }

    pub fn from_entries(entries: BTreeMap<String, serde_json::Value>) -> Self {
        let canonical = serde_json::to_string(&entries).unwrap_or_default();
        let digest = hex::encode(Sha256::digest(canonical.as_bytes()));
        Self {
            entries,
            digest: digest[..16].to_string(),
        }
    }

    /// Load from disk. A missing file yields the empty snapshot.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::empty());
        }
        let data = std::fs::read_to_string(path)?;
        let entries: BTreeMap<String, serde_json::Value> = serde_json::from_str(&data)?;
        let snapshot = Self::from_entries(entries);
        info!(
            "Loaded {} principles from {} (digest {})",
            snapshot.entries.len(),
            path.display(),
            snapshot.digest
        );
        Ok(snapshot)
    }

    /// Content digest; part of every model-backed stage fingerprint.
    pub fn digest(&self) -> &str {
        &self.digest
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, key: &str) -> Option<&serde_json::Value> {
        self.entries.get(key)
    }

    /// Bullet list of up to `limit` principle statements for prompt context.
    pub fn prompt_context(&self, limit: usize) -> String {
        self.entries
            .values()
            .filter_map(|value| match value {
                serde_json::Value::String(s) => Some(s.as_str()),
                serde_json::Value::Object(map) => map.get("principle").and_then(|p| p.as_str()),
                _ => None,
            })
            .take(limit)
            .map(|p| format!("- {}", p))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let snapshot = PrinciplesSnapshot::load(&dir.path().join("principles.json")).unwrap();
        assert!(snapshot.is_empty());
        assert_eq!(snapshot.digest(), PrinciplesSnapshot::empty().digest());
    }

    #[test]
    fn test_digest_changes_with_content() {
        let mut entries = BTreeMap::new();
        entries.insert("hooks".to_string(), json!({"principle": "Open with tension"}));
        let a = PrinciplesSnapshot::from_entries(entries.clone());
        entries.insert("pacing".to_string(), json!("Cut dead air"));
        let b = PrinciplesSnapshot::from_entries(entries);
        assert_ne!(a.digest(), b.digest());
        assert_eq!(a.digest().len(), 16);
    }

    #[test]
    fn test_prompt_context_reads_strings_and_objects() {
        let mut entries = BTreeMap::new();
        entries.insert("a".to_string(), json!({"principle": "Open with tension"}));
        entries.insert("b".to_string(), json!("Cut dead air"));
        entries.insert("c".to_string(), json!(42));
        let snapshot = PrinciplesSnapshot::from_entries(entries);
        assert_eq!(
            snapshot.prompt_context(5),
            "- Open with tension\n- Cut dead air"
        );
        assert_eq!(snapshot.prompt_context(1), "- Open with tension");
    }
}
