//! Model capability table: capability tiers mapped to concrete model ids.
//!
//! The table is resolved once per run into a [`ResolvedModels`] snapshot, so
//! every stage of one run sees the same models even if the table changes.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::config::{ProviderKind, ProviderSpec};
use crate::error::{Error, Result};

/// Per-provider-family tier table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapabilityTable {
    /// `kind -> tier -> model id`.
    pub tiers: BTreeMap<String, BTreeMap<String, String>>,
    /// `kind -> tier` used when a provider names neither model nor tier.
    pub default_tier: BTreeMap<String, String>,
}

impl CapabilityTable {
    /// Table shipped with the binary.
    pub fn builtin() -> Self {
        let entries: &[(ProviderKind, &str, &[(&str, &str)])] = &[
            (
                ProviderKind::Anthropic,
                "sonnet",
                &[
                    ("opus", "claude-opus-4-20250514"),
                    ("sonnet", "claude-sonnet-4-5-20250929"),
                    ("haiku", "claude-3-5-haiku-20241022"),
                ],
            ),
            (
                ProviderKind::OpenAI,
                "flagship",
                &[
                    ("flagship", "gpt-4o"),
                    ("pro", "gpt-4o"),
                    ("mini", "gpt-4o-mini"),
                ],
            ),
            (
                ProviderKind::Google,
                "flash",
                &[("pro", "gemini-1.5-pro"), ("flash", "gemini-2.0-flash")],
            ),
            (
                ProviderKind::Xai,
                "flagship",
                &[("flagship", "grok-4-1-fast-reasoning"), ("standard", "grok-3")],
            ),
            (
                ProviderKind::DeepSeek,
                "chat",
                &[("chat", "deepseek-chat"), ("reasoner", "deepseek-reasoner")],
            ),
            (
                ProviderKind::Groq,
                "versatile",
                &[
                    ("versatile", "llama-3.3-70b-versatile"),
                    ("instant", "llama-3.1-8b-instant"),
                ],
            ),
            (ProviderKind::Scripted, "default", &[("default", "scripted")]),
        ];

        let mut tiers = BTreeMap::new();
        let mut default_tier = BTreeMap::new();
        for (kind, default, models) in entries {
            let map = models
                .iter()
                .map(|(tier, model)| (tier.to_string(), model.to_string()))
                .collect();
            tiers.insert(kind.as_str().to_string(), map);
            default_tier.insert(kind.as_str().to_string(), default.to_string());
        }
        Self {
            tiers,
            default_tier,
        }
    }

    /// Overlay `other` on top of this table; `other` wins per tier.
    pub fn merge(&mut self, other: CapabilityTable) {
        for (kind, models) in other.tiers {
            self.tiers.entry(kind).or_default().extend(models);
        }
        self.default_tier.extend(other.default_tier);
    }

    pub fn lookup(&self, kind: ProviderKind, tier: &str) -> Option<&str> {
        self.tiers
            .get(kind.as_str())
            .and_then(|m| m.get(tier))
            .map(|s| s.as_str())
    }

    fn resolve(&self, spec: &ProviderSpec) -> Result<String> {
        if let Some(model) = &spec.model {
            return Ok(model.clone());
        }
        let tier = match &spec.tier {
            Some(t) => t.as_str(),
            None => self
                .default_tier
                .get(spec.kind.as_str())
                .map(|s| s.as_str())
                .ok_or_else(|| {
                    Error::Config(format!("no default tier for provider kind {}", spec.kind))
                })?,
        };
        self.lookup(spec.kind, tier)
            .map(str::to_string)
            .ok_or_else(|| {
                Error::Config(format!(
                    "provider '{}': unknown tier '{}' for {}",
                    spec.id, tier, spec.kind
                ))
            })
    }
}

/// Concrete model per provider id, fixed for one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolvedModels {
    pub models: BTreeMap<String, String>,
    pub resolved_at: DateTime<Utc>,
}

impl ResolvedModels {
    pub fn model_for(&self, provider_id: &str) -> Option<&str> {
        self.models.get(provider_id).map(|s| s.as_str())
    }
}

/// Caches the capability table for a bounded time.
pub struct ModelResolver {
    table_path: Option<PathBuf>,
    ttl: Duration,
    cached: Mutex<Option<(Instant, CapabilityTable)>>,
}

impl ModelResolver {
    pub const DEFAULT_TTL: Duration = Duration::from_secs(24 * 3600);

    /// `table_path` is an optional JSON override merged over the builtin table.
    pub fn new(table_path: Option<PathBuf>) -> Self {
        Self {
            table_path,
            ttl: Self::DEFAULT_TTL,
            cached: Mutex::new(None),
        }
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    /// Current table, reloaded when the cached copy is older than the ttl.
    pub fn table(&self) -> CapabilityTable {
        let mut cached = self.cached.lock();
        if let Some((loaded_at, table)) = cached.as_ref() {
            if loaded_at.elapsed() < self.ttl {
                return table.clone();
            }
        }
        let table = self.load();
        *cached = Some((Instant::now(), table.clone()));
        table
    }

    /// Drop the cached table so the next lookup reloads it.
    pub fn invalidate(&self) {
        *self.cached.lock() = None;
    }

    fn load(&self) -> CapabilityTable {
        let mut table = CapabilityTable::builtin();
        let Some(path) = &self.table_path else {
            return table;
        };
        if !path.exists() {
            return table;
        }
        match std::fs::read_to_string(path)
            .map_err(Error::from)
            .and_then(|s| serde_json::from_str::<CapabilityTable>(&s).map_err(Error::from))
        {
            Ok(overlay) => {
                info!("Loaded model table overrides from {}", path.display());
                table.merge(overlay);
            }
            Err(e) => warn!("Ignoring model table {}: {}", path.display(), e),
        }
        table
    }

    pub fn resolve(&self, spec: &ProviderSpec) -> Result<String> {
        self.table().resolve(spec)
    }

    /// Resolve every provider against one table snapshot.
    pub fn resolve_all(&self, providers: &[ProviderSpec]) -> Result<ResolvedModels> {
        let table = self.table();
        let mut models = BTreeMap::new();
        for spec in providers {
            models.insert(spec.id.clone(), table.resolve(spec)?);
        }
        Ok(ResolvedModels {
            models,
            resolved_at: Utc::now(),
        })
    }
}
