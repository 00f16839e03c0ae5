//! Stage abstraction and the per-run context stages read from.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use clipsmith_consensus::{ConsensusEngine, ConsensusResult};
use clipsmith_core::{
    CandidateItem, ItemId, PipelineConfig, PrinciplesSnapshot, ResolvedModels, Result, StageId,
    Transcript,
};
use clipsmith_gateway::{BudgetTracker, ModelProvider};

/// How far a failure inside a batch reaches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureScope {
    /// Only the failing item is affected.
    #[default]
    Item,
    /// Partial application is impossible; the whole batch rolls back.
    Batch,
}

/// What a stage declares about itself to the orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StageTraits {
    /// Items per stage call.
    pub batch_size: usize,
    pub failure_scope: FailureScope,
    /// Skipped for remaining items once the budget cap is reached.
    pub optional: bool,
    /// Can still grow or move an item's span.
    pub extends_span: bool,
    /// Asks whether an item is whole; must follow every span extender.
    pub completeness_dependent: bool,
    /// The single accept/reject decision.
    pub is_gate: bool,
}

impl Default for StageTraits {
    fn default() -> Self {
        Self {
            batch_size: 1,
            failure_scope: FailureScope::Item,
            optional: false,
            extends_span: false,
            completeness_dependent: false,
            is_gate: false,
        }
    }
}

/// Result of one stage call over one batch.
#[derive(Debug, Clone, Default)]
pub struct BatchOutcome {
    /// Items the stage could not process, with the reason.
    pub failed: BTreeMap<ItemId, String>,
    /// The ensemble fell short of quorum.
    pub low_confidence: bool,
    pub cached: bool,
}

impl BatchOutcome {
    pub fn from_consensus(result: &ConsensusResult) -> Self {
        Self {
            failed: BTreeMap::new(),
            low_confidence: result.is_low_confidence(),
            cached: result.cached,
        }
    }

    pub fn fail(&mut self, item: &ItemId, reason: impl Into<String>) {
        self.failed.insert(item.clone(), reason.into());
    }
}

/// One step of the pipeline.
///
/// `apply` receives working copies of the batch's items and mutates them in
/// place. The orchestrator keeps the originals until the batch succeeds, so a
/// stage never has to undo its own changes.
#[async_trait]
pub trait Stage: Send + Sync {
    fn id(&self) -> &StageId;

    /// Bump when the prompt or the logic changes; part of every cache key.
    fn version(&self) -> u32;

    fn traits(&self) -> StageTraits;

    /// Zero-cost predicate; items it rejects skip this stage.
    fn applies_to(&self, _item: &CandidateItem) -> bool {
        true
    }

    async fn apply(&self, batch: &mut [CandidateItem], ctx: &RunContext) -> Result<BatchOutcome>;
}

/// Everything a stage may read during one run. Immutable for the run.
pub struct RunContext {
    pub run_id: Uuid,
    pub config: Arc<PipelineConfig>,
    pub transcript: Arc<Transcript>,
    pub principles: Arc<PrinciplesSnapshot>,
    pub models: Arc<ResolvedModels>,
    pub engine: Arc<ConsensusEngine>,
    providers: BTreeMap<String, Vec<Arc<dyn ModelProvider>>>,
}

impl RunContext {
    pub fn new(
        config: Arc<PipelineConfig>,
        transcript: Arc<Transcript>,
        principles: Arc<PrinciplesSnapshot>,
        models: Arc<ResolvedModels>,
        engine: Arc<ConsensusEngine>,
        providers: BTreeMap<String, Vec<Arc<dyn ModelProvider>>>,
    ) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            config,
            transcript,
            principles,
            models,
            engine,
            providers,
        }
    }

    /// Ensemble members for `stage`, in priority order.
    pub fn providers_for(&self, stage: &str) -> &[Arc<dyn ModelProvider>] {
        self.providers
            .get(stage)
            .map(|p| p.as_slice())
            .unwrap_or(&[])
    }

    pub fn budget(&self) -> &Arc<BudgetTracker> {
        self.engine.gateway().budget()
    }
}
