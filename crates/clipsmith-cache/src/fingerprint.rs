//! Cache keys: a pure function of stage, stage version, model identity, and
//! the canonical input payload.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Hex-encoded SHA-256 cache key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    /// `payload` must already exclude fields that do not affect the result
    /// (provenance, scores). `serde_json` maps are key-sorted, so equal
    /// values always serialize identically.
    pub fn compute(
        stage: &str,
        stage_version: u32,
        model_key: &str,
        payload: &serde_json::Value,
    ) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(stage.as_bytes());
        hasher.update([0u8]);
        hasher.update(stage_version.to_le_bytes());
        hasher.update([0u8]);
        hasher.update(model_key.as_bytes());
        hasher.update([0u8]);
        hasher.update(payload.to_string().as_bytes());
        Self(hex::encode(hasher.finalize()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Wrap a stored key (e.g. read back from disk).
    pub fn from_hex(hex: impl Into<String>) -> Self {
        Self(hex.into())
    }
}

impl std::fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0[..self.0.len().min(16)])
    }
}

/// Model identity of an ensemble: `"ensemble:"` plus the sorted
/// `provider=model` list, so the same panel in any order shares entries.
pub fn ensemble_model_key<'a>(members: impl IntoIterator<Item = (&'a str, &'a str)>) -> String {
    let mut parts: Vec<String> = members
        .into_iter()
        .map(|(provider, model)| format!("{}={}", provider, model))
        .collect();
    parts.sort();
    parts.dedup();
    format!("ensemble:{}", parts.join(","))
}
