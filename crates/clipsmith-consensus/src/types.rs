//! Stage payloads, votes, and reconciled results.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use clipsmith_core::ItemId;

/// A span proposed during discovery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProposedSpan {
    pub start: f64,
    pub end: f64,
    /// Estimated potential, 0-10.
    #[serde(default)]
    pub potential: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    /// Number of votes that proposed this span (filled in by reconciliation).
    #[serde(default = "one")]
    pub support: usize,
}

fn one() -> usize {
    1
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoundaryVote {
    pub item_id: ItemId,
    pub start: f64,
    pub end: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemScore {
    pub item_id: ItemId,
    pub score: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemChoice {
    pub item_id: ItemId,
    pub choice: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemKeep {
    pub item_id: ItemId,
    /// Indices into the item's current sub-segments, ascending.
    pub keep: Vec<usize>,
}

/// Closed set of structured results a model-backed stage can produce.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StagePayload {
    Discovery { candidates: Vec<ProposedSpan> },
    Boundaries { items: Vec<BoundaryVote> },
    Scores { items: Vec<ItemScore> },
    Choices { items: Vec<ItemChoice> },
    Restructure { items: Vec<ItemKeep> },
}

impl StagePayload {
    pub fn kind(&self) -> &'static str {
        match self {
            StagePayload::Discovery { .. } => "discovery",
            StagePayload::Boundaries { .. } => "boundaries",
            StagePayload::Scores { .. } => "scores",
            StagePayload::Choices { .. } => "choices",
            StagePayload::Restructure { .. } => "restructure",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum VoteOutcome {
    Parsed { payload: StagePayload },
    Failed { error: String },
}

/// One provider's answer to one consensus request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnsembleVote {
    pub provider: String,
    pub model: String,
    pub outcome: VoteOutcome,
    pub cost_usd: f64,
    pub latency_ms: u64,
    /// Cast by the fallback provider in place of a missing vote.
    #[serde(default)]
    pub substitute: bool,
}

impl EnsembleVote {
    pub fn payload(&self) -> Option<&StagePayload> {
        match &self.outcome {
            VoteOutcome::Parsed { payload } => Some(payload),
            VoteOutcome::Failed { .. } => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Confidence {
    Full,
    /// Fewer successful votes than the quorum.
    Low,
}

/// Reconciled decision plus every vote that went into it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsensusResult {
    pub stage: String,
    pub payload: StagePayload,
    /// Overall spread across votes; 0 means unanimous.
    pub disagreement: f64,
    #[serde(default)]
    pub item_disagreement: BTreeMap<ItemId, f64>,
    pub confidence: Confidence,
    pub votes: Vec<EnsembleVote>,
    pub requested: usize,
    pub received: usize,
    #[serde(default)]
    pub cached: bool,
}

impl ConsensusResult {
    pub fn is_low_confidence(&self) -> bool {
        self.confidence == Confidence::Low
    }

    pub fn cost_usd(&self) -> f64 {
        self.votes.iter().map(|v| v.cost_usd).sum()
    }

    pub fn disagreement_for(&self, item: &ItemId) -> Option<f64> {
        self.item_disagreement.get(item).copied()
    }
}
