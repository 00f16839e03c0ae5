//! Newtype identifiers for items and stages.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

macro_rules! string_id {
    (
        $(#[$attr:meta])*
        $name:ident
    ) => {
        $(#[$attr])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Returns the identifier as a string slice.
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value)
            }
        }
    };
}

string_id! {
    /// Stable identity of a candidate item: a hash of its source and the
    /// time range it was discovered with. Never changes when the span moves.
    ItemId
}

string_id! {
    /// Name of a pipeline stage (e.g. `"refine_boundaries"`).
    StageId
}

impl ItemId {
    /// Derive the id from the source identifier and the original time range.
    pub fn derive(source_id: &str, start: f64, end: f64) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(source_id.as_bytes());
        hasher.update(format!("|{:.3}-{:.3}", start, end).as_bytes());
        let digest = hex::encode(hasher.finalize());
        Self(digest[..16].to_string())
    }
}

impl StageId {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_item_id_is_deterministic() {
        let a = ItemId::derive("talk.mp4", 12.0, 48.5);
        let b = ItemId::derive("talk.mp4", 12.0, 48.5);
        assert_eq!(a, b);
        assert_eq!(a.as_str().len(), 16);
    }

    #[test]
    fn test_item_id_depends_on_source_and_range() {
        let base = ItemId::derive("talk.mp4", 12.0, 48.5);
        assert_ne!(base, ItemId::derive("other.mp4", 12.0, 48.5));
        assert_ne!(base, ItemId::derive("talk.mp4", 12.0, 49.0));
    }
}
