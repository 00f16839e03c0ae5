//! Conditional restructure: only items the zero-cost predicate flags are
//! sent to the ensemble, which votes on the sub-segments to keep.

use async_trait::async_trait;

use clipsmith_consensus::{SegmentMajority, StagePayload};
use clipsmith_core::{stages, CandidateItem, PipelineConfig, Result, StageId, SubSegment};
use clipsmith_transform::needs_restructure;

use crate::prompts::StageTask;
use crate::stage::{BatchOutcome, RunContext, Stage, StageTraits};
use crate::stages::{ensemble, unexpected_payload};

pub struct Restructure {
    id: StageId,
    batch_size: usize,
    threshold: f64,
}

impl Restructure {
    pub fn new(config: &PipelineConfig) -> Self {
        Self {
            id: StageId::new(stages::RESTRUCTURE),
            batch_size: config.batch_size,
            threshold: config.restructure_filler_threshold,
        }
    }
}

#[async_trait]
impl Stage for Restructure {
    fn id(&self) -> &StageId {
        &self.id
    }

    fn version(&self) -> u32 {
        1
    }

    fn traits(&self) -> StageTraits {
        StageTraits {
            batch_size: self.batch_size,
            optional: true,
            ..Default::default()
        }
    }

    fn applies_to(&self, item: &CandidateItem) -> bool {
        needs_restructure(item, self.threshold)
    }

    async fn apply(&self, batch: &mut [CandidateItem], ctx: &RunContext) -> Result<BatchOutcome> {
        let task = StageTask::restructure(self.id.as_str(), self.version(), batch, &ctx.principles);
        let result = ensemble(ctx, &self.id, &task, &SegmentMajority).await?;
        let StagePayload::Restructure { items: votes } = &result.payload else {
            return Err(unexpected_payload(&self.id, &result));
        };

        let mut outcome = BatchOutcome::from_consensus(&result);
        for item in batch.iter_mut() {
            let Some(vote) = votes.iter().find(|v| v.item_id == *item.id()) else {
                outcome.fail(item.id(), "no keep list returned");
                continue;
            };
            let kept: Vec<SubSegment> = item
                .segments()
                .iter()
                .enumerate()
                .filter(|(i, _)| vote.keep.contains(i))
                .map(|(_, s)| s.clone())
                .collect();
            if kept.is_empty() {
                outcome.fail(item.id(), "restructure would drop every segment");
                continue;
            }
            if kept.len() == item.segments().len() {
                continue;
            }
            if let Err(e) = item.replace_segments(&self.id, kept) {
                outcome.fail(item.id(), e.to_string());
            }
        }
        Ok(outcome)
    }
}
