//! Pipeline configuration and data directory management.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{Error, Result};

/// Built-in stage names.
pub mod stages {
    pub const DISCOVER: &str = "discover";
    pub const REFINE_BOUNDARIES: &str = "refine_boundaries";
    pub const BRIDGE_OPEN_LOOPS: &str = "bridge_open_loops";
    pub const RESTRUCTURE: &str = "restructure";
    pub const SELECT_HOOK: &str = "select_hook";
    pub const COMPLETENESS: &str = "completeness";
    pub const GATE: &str = "gate";

    /// Stages that call models. `restructure` is optional; the rest are
    /// required when enabled.
    pub const AI_STAGES: &[&str] = &[
        DISCOVER,
        REFINE_BOUNDARIES,
        RESTRUCTURE,
        SELECT_HOOK,
        COMPLETENESS,
        GATE,
    ];
}

/// Paths under the Clipsmith data directory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataPaths {
    /// Root data directory (e.g., `data/`).
    pub root: PathBuf,
    /// Persisted result cache (`data/cache/`).
    pub cache_dir: PathBuf,
    /// SQLite cache file (`data/cache/results.db`).
    pub cache_db: PathBuf,
    /// Run reports (`data/reports/`).
    pub reports: PathBuf,
    /// Principles snapshot source (`data/principles.json`).
    pub principles_file: PathBuf,
    /// Model capability table override (`data/models.json`).
    pub models_file: PathBuf,
}

impl DataPaths {
    /// Create data paths from a root directory. Creates directories if needed.
    pub fn new(root: impl AsRef<Path>) -> std::io::Result<Self> {
        let root = root.as_ref().to_path_buf();
        let cache_dir = root.join("cache");
        let paths = Self {
            cache_db: cache_dir.join("results.db"),
            cache_dir,
            reports: root.join("reports"),
            principles_file: root.join("principles.json"),
            models_file: root.join("models.json"),
            root,
        };
        std::fs::create_dir_all(&paths.cache_dir)?;
        std::fs::create_dir_all(&paths.reports)?;
        Ok(paths)
    }
}

/// Provider families the gateway knows how to talk to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    Anthropic,
    OpenAI,
    Google,
    Xai,
    DeepSeek,
    Groq,
    /// In-process deterministic provider, used for dry runs and tests.
    Scripted,
}

impl ProviderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Anthropic => "anthropic",
            Self::OpenAI => "openai",
            Self::Google => "google",
            Self::Xai => "xai",
            Self::DeepSeek => "deepseek",
            Self::Groq => "groq",
            Self::Scripted => "scripted",
        }
    }

    /// Conventional environment variable holding the API key.
    pub fn api_key_env(&self) -> Option<&'static str> {
        match self {
            Self::Anthropic => Some("ANTHROPIC_API_KEY"),
            Self::OpenAI => Some("OPENAI_API_KEY"),
            Self::Google => Some("GOOGLE_API_KEY"),
            Self::Xai => Some("XAI_API_KEY"),
            Self::DeepSeek => Some("DEEPSEEK_API_KEY"),
            Self::Groq => Some("GROQ_API_KEY"),
            Self::Scripted => None,
        }
    }
}

impl std::fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One ensemble participant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderSpec {
    /// Unique name within the config; also the tie-break priority (earlier wins).
    pub id: String,
    pub kind: ProviderKind,
    /// Exact model id. Takes precedence over `tier`.
    #[serde(default)]
    pub model: Option<String>,
    /// Capability tier (e.g. `"sonnet"`, `"flagship"`), resolved once per run.
    #[serde(default)]
    pub tier: Option<String>,
    /// Stages this provider votes in. Empty means all AI stages.
    #[serde(default)]
    pub stages: Vec<String>,
}

impl ProviderSpec {
    pub fn participates_in(&self, stage: &str) -> bool {
        self.stages.is_empty() || self.stages.iter().any(|s| s == stage)
    }
}

/// What to do when an ensemble call misses quorum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuorumPolicy {
    /// Keep the low-confidence result.
    BestEffort,
    /// Re-issue the missing votes once against `fallback_provider`.
    #[default]
    RetryWithFallback,
}

/// How the quality gate computes its score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GateMode {
    #[default]
    Ensemble,
    /// Deterministic average of upstream scores, no model call.
    Formula,
}

/// Top-level pipeline configuration (JSON).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    #[serde(default)]
    pub providers: Vec<ProviderSpec>,
    /// Minimum successful votes. Defaults to a majority of requested providers.
    #[serde(default)]
    pub min_quorum: Option<usize>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Accept threshold on the 0-100 gate scale.
    #[serde(default = "default_gate_threshold")]
    pub gate_threshold: f64,
    #[serde(default)]
    pub gate_mode: GateMode,
    #[serde(default = "default_cache_ttl_secs")]
    pub cache_ttl_secs: u64,
    /// Per-stage switches. Stages not listed are enabled.
    #[serde(default)]
    pub stage_enabled: BTreeMap<String, bool>,
    #[serde(default)]
    pub budget_cap_usd: Option<f64>,
    /// Corrective retries after a schema violation.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_max_transient_retries")]
    pub max_transient_retries: u32,
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    #[serde(default = "default_call_timeout_secs")]
    pub call_timeout_secs: f64,
    #[serde(default = "default_stage_timeout_secs")]
    pub stage_timeout_secs: f64,
    #[serde(default = "default_max_concurrent_batches")]
    pub max_concurrent_batches: usize,
    #[serde(default = "default_bridge_max_gap_secs")]
    pub bridge_max_gap_secs: f64,
    #[serde(default = "default_merge_overlap")]
    pub merge_overlap: f64,
    #[serde(default = "default_trim_fraction")]
    pub trim_fraction: f64,
    #[serde(default = "default_restructure_filler_threshold")]
    pub restructure_filler_threshold: f64,
    #[serde(default)]
    pub fallback_provider: Option<String>,
    #[serde(default)]
    pub quorum_policy: QuorumPolicy,
    #[serde(default = "default_discover_window_secs")]
    pub discover_window_secs: f64,
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

fn default_batch_size() -> usize {
    5
}
fn default_gate_threshold() -> f64 {
    70.0
}
fn default_cache_ttl_secs() -> u64 {
    7 * 24 * 3600
}
fn default_max_retries() -> u32 {
    2
}
fn default_max_transient_retries() -> u32 {
    3
}
fn default_backoff_base_ms() -> u64 {
    500
}
fn default_call_timeout_secs() -> f64 {
    60.0
}
fn default_stage_timeout_secs() -> f64 {
    600.0
}
fn default_max_concurrent_batches() -> usize {
    4
}
fn default_bridge_max_gap_secs() -> f64 {
    5.0
}
fn default_merge_overlap() -> f64 {
    0.5
}
fn default_trim_fraction() -> f64 {
    0.2
}
fn default_restructure_filler_threshold() -> f64 {
    0.3
}
fn default_discover_window_secs() -> f64 {
    600.0
}
fn default_data_dir() -> PathBuf {
    PathBuf::from("data")
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            providers: Vec::new(),
            min_quorum: None,
            batch_size: default_batch_size(),
            gate_threshold: default_gate_threshold(),
            gate_mode: GateMode::default(),
            cache_ttl_secs: default_cache_ttl_secs(),
            stage_enabled: BTreeMap::new(),
            budget_cap_usd: None,
            max_retries: default_max_retries(),
            max_transient_retries: default_max_transient_retries(),
            backoff_base_ms: default_backoff_base_ms(),
            call_timeout_secs: default_call_timeout_secs(),
            stage_timeout_secs: default_stage_timeout_secs(),
            max_concurrent_batches: default_max_concurrent_batches(),
            bridge_max_gap_secs: default_bridge_max_gap_secs(),
            merge_overlap: default_merge_overlap(),
            trim_fraction: default_trim_fraction(),
            restructure_filler_threshold: default_restructure_filler_threshold(),
            fallback_provider: None,
            quorum_policy: QuorumPolicy::default(),
            discover_window_secs: default_discover_window_secs(),
            data_dir: default_data_dir(),
        }
    }
}

impl PipelineConfig {
    /// Load a config file. Missing fields take their defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("cannot read {}: {}", path.display(), e)))?;
        let config: PipelineConfig = serde_json::from_str(&data)
            .map_err(|e| Error::Config(format!("invalid {}: {}", path.display(), e)))?;
        info!(
            "Loaded pipeline config from {} ({} providers)",
            path.display(),
            config.providers.len()
        );
        Ok(config)
    }

    /// Override selected knobs from `CLIPSMITH_*` environment variables.
    pub fn apply_env(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    /// Same as [`apply_env`](Self::apply_env) with an explicit lookup.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(cap) = lookup("CLIPSMITH_BUDGET_CAP").and_then(|v| v.parse().ok()) {
            self.budget_cap_usd = Some(cap);
        }
        if let Some(size) = lookup("CLIPSMITH_BATCH_SIZE").and_then(|v| v.parse().ok()) {
            self.batch_size = size;
        }
        if let Some(t) = lookup("CLIPSMITH_GATE_THRESHOLD").and_then(|v| v.parse().ok()) {
            self.gate_threshold = t;
        }
        if let Some(dir) = lookup("CLIPSMITH_DATA_DIR") {
            self.data_dir = PathBuf::from(dir);
        }
    }

    pub fn is_stage_enabled(&self, stage: &str) -> bool {
        self.stage_enabled.get(stage).copied().unwrap_or(true)
    }

    /// Providers voting in `stage`, in priority order.
    pub fn providers_for(&self, stage: &str) -> Vec<&ProviderSpec> {
        self.providers
            .iter()
            .filter(|p| p.participates_in(stage))
            .collect()
    }

    pub fn provider(&self, id: &str) -> Option<&ProviderSpec> {
        self.providers.iter().find(|p| p.id == id)
    }

    /// Votes needed out of `requested`.
    pub fn quorum_for(&self, requested: usize) -> usize {
        let wanted = self.min_quorum.unwrap_or(requested / 2 + 1);
        wanted.clamp(1, requested.max(1))
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.call_timeout_secs)
    }

    pub fn stage_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.stage_timeout_secs)
    }

    /// Start-time checks. Any error here is fatal for the run.
    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(Error::Config("batch_size must be at least 1".into()));
        }
        if self.min_quorum == Some(0) {
            return Err(Error::Config("min_quorum must be at least 1".into()));
        }
        if self.max_concurrent_batches == 0 {
            return Err(Error::Config(
                "max_concurrent_batches must be at least 1".into(),
            ));
        }
        if !(0.0..=100.0).contains(&self.gate_threshold) {
            return Err(Error::Config(format!(
                "gate_threshold {} outside 0-100",
                self.gate_threshold
            )));
        }
        for (name, value) in [
            ("merge_overlap", self.merge_overlap),
            ("restructure_filler_threshold", self.restructure_filler_threshold),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(Error::Config(format!("{} {} outside 0-1", name, value)));
            }
        }
        if !(0.0..0.5).contains(&self.trim_fraction) {
            return Err(Error::Config(format!(
                "trim_fraction {} must be in [0, 0.5)",
                self.trim_fraction
            )));
        }
        if self.call_timeout_secs <= 0.0 || self.stage_timeout_secs <= 0.0 {
            return Err(Error::Config("timeouts must be positive".into()));
        }
        if self.discover_window_secs <= 0.0 || self.bridge_max_gap_secs < 0.0 {
            return Err(Error::Config(
                "discover_window_secs must be positive and bridge_max_gap_secs non-negative"
                    .into(),
            ));
        }
        if let Some(cap) = self.budget_cap_usd {
            if cap < 0.0 {
                return Err(Error::Config("budget_cap_usd must not be negative".into()));
            }
        }

        let mut seen = std::collections::HashSet::new();
        for p in &self.providers {
            if !seen.insert(p.id.as_str()) {
                return Err(Error::Config(format!("duplicate provider id '{}'", p.id)));
            }
        }
        if let Some(fallback) = &self.fallback_provider {
            if self.provider(fallback).is_none() {
                return Err(Error::Config(format!(
                    "fallback_provider '{}' is not a configured provider",
                    fallback
                )));
            }
        }

        for stage in stages::AI_STAGES {
            if *stage == stages::RESTRUCTURE || !self.is_stage_enabled(stage) {
                continue;
            }
            if *stage == stages::GATE && self.gate_mode == GateMode::Formula {
                continue;
            }
            if self.providers_for(stage).is_empty() {
                return Err(Error::Config(format!(
                    "no providers configured for required stage '{}'",
                    stage
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn provider(id: &str, stages: &[&str]) -> ProviderSpec {
        ProviderSpec {
            id: id.into(),
            kind: ProviderKind::Scripted,
            model: Some("scripted-1".into()),
            tier: None,
            stages: stages.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[test]
    fn test_empty_json_takes_defaults() {
        let config: PipelineConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config.batch_size, 5);
        assert_eq!(config.gate_threshold, 70.0);
        assert_eq!(config.bridge_max_gap_secs, 5.0);
        assert!(config.is_stage_enabled(stages::RESTRUCTURE));
    }

    #[test]
    fn test_validate_requires_providers_for_required_stages() {
        let mut config = PipelineConfig::default();
        assert!(matches!(config.validate(), Err(Error::Config(_))));
        config.providers.push(provider("a", &[]));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_restructure_may_have_no_providers() {
        let mut config = PipelineConfig::default();
        config.providers.push(provider(
            "a",
            &[
                stages::DISCOVER,
                stages::REFINE_BOUNDARIES,
                stages::SELECT_HOOK,
                stages::COMPLETENESS,
                stages::GATE,
            ],
        ));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_zero_batch_and_unknown_fallback() {
        let mut config = PipelineConfig::default();
        config.providers.push(provider("a", &[]));
        config.batch_size = 0;
        assert!(config.validate().is_err());
        config.batch_size = 3;
        config.fallback_provider = Some("missing".into());
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_quorum_defaults_to_majority() {
        let mut config = PipelineConfig::default();
        assert_eq!(config.quorum_for(3), 2);
        assert_eq!(config.quorum_for(4), 3);
        assert_eq!(config.quorum_for(1), 1);
        config.min_quorum = Some(10);
        assert_eq!(config.quorum_for(3), 3);
    }

    #[test]
    fn test_overrides_from_lookup() {
        let mut config = PipelineConfig::default();
        config.apply_overrides(|key| match key {
            "CLIPSMITH_BUDGET_CAP" => Some("2.5".into()),
            "CLIPSMITH_BATCH_SIZE" => Some("8".into()),
            "CLIPSMITH_GATE_THRESHOLD" => Some("not a number".into()),
            _ => None,
        });
        assert_eq!(config.budget_cap_usd, Some(2.5));
        assert_eq!(config.batch_size, 8);
        assert_eq!(config.gate_threshold, 70.0);
    }

    #[test]
    fn test_data_paths_creates_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let paths = DataPaths::new(dir.path()).unwrap();
        assert!(paths.cache_dir.is_dir());
        assert!(paths.reports.is_dir());
        assert_eq!(paths.cache_db, dir.path().join("cache").join("results.db"));
    }
}
