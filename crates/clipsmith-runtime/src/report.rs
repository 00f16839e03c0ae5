//! Run summary: final item sets, per-stage counters, cost, and cache use.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use clipsmith_cache::CacheStageStats;
use clipsmith_core::{CandidateItem, ItemStatus, ResolvedModels, Result, Span, SegmentRole};
use clipsmith_gateway::BudgetReport;

/// What happened in one stage.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StageSummary {
    pub stage: String,
    pub processed: usize,
    pub skipped: usize,
    pub discarded: usize,
    pub rolled_back: usize,
    pub retried_alone: usize,
    pub timed_out: usize,
    pub low_confidence_batches: usize,
    pub cached_batches: usize,
    pub calls: u64,
    pub cost_usd: f64,
    pub duration_ms: u64,
}

impl StageSummary {
    pub fn new(stage: &str) -> Self {
        Self {
            stage: stage.to_string(),
            ..Default::default()
        }
    }
}

/// Export view of one sub-segment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExportSegment {
    pub span: Span,
    pub role: SegmentRole,
}

/// Compounding figures reported alongside the gate decision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GateAnalysis {
    /// Assumed per-gate false-negative probability.
    pub per_gate_false_negative: f64,
    pub gates_in_path: usize,
    pub compounded_false_negative: f64,
    /// The same figure had a second hard gate been placed in the path.
    pub with_extra_gate: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineReport {
    pub run_id: Uuid,
    pub source_id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub principles_digest: String,
    pub models: ResolvedModels,
    pub accepted: Vec<CandidateItem>,
    pub rejected: Vec<CandidateItem>,
    pub discarded: Vec<CandidateItem>,
    /// Items that finished without reaching a gate (gate disabled).
    pub ungated: Vec<CandidateItem>,
    pub stages: Vec<StageSummary>,
    pub budget: BudgetReport,
    pub cache: BTreeMap<String, CacheStageStats>,
    pub gate: GateAnalysis,
}

impl PipelineReport {
    /// Sort final items into their buckets.
    pub fn partition(items: Vec<CandidateItem>) -> [Vec<CandidateItem>; 4] {
        let mut accepted = Vec::new();
        let mut rejected = Vec::new();
        let mut discarded = Vec::new();
        let mut ungated = Vec::new();
        for item in items {
            match item.status() {
                ItemStatus::GatedAccept => accepted.push(item),
                ItemStatus::GatedReject => rejected.push(item),
                ItemStatus::Discarded => discarded.push(item),
                ItemStatus::Candidate | ItemStatus::Refined => ungated.push(item),
            }
        }
        [accepted, rejected, discarded, ungated]
    }

    /// Ordered (span, role) list per accepted item, for the export step.
    pub fn export(&self) -> BTreeMap<String, Vec<ExportSegment>> {
        self.accepted
            .iter()
            .map(|item| {
                let mut segments: Vec<ExportSegment> = item
                    .segments()
                    .iter()
                    .map(|s| ExportSegment {
                        span: s.span,
                        role: s.role,
                    })
                    .collect();
                segments.sort_by(|a, b| a.span.start().total_cmp(&b.span.start()));
                (item.id().to_string(), segments)
            })
            .collect()
    }

    /// Write `<dir>/<run_id>.json` and return its path.
    pub fn write_to(&self, dir: &Path) -> Result<PathBuf> {
        std::fs::create_dir_all(dir)?;
        let path = dir.join(format!("{}.json", self.run_id));
        std::fs::write(&path, serde_json::to_string_pretty(self)?)?;
        info!("Wrote run report to {}", path.display());
        Ok(path)
    }

    pub fn summary_line(&self) -> String {
        format!(
            "{} accepted, {} rejected, {} discarded, {} ungated, ${:.4} spent",
            self.accepted.len(),
            self.rejected.len(),
            self.discarded.len(),
            self.ungated.len(),
            self.budget.spent_usd
        )
    }
}
