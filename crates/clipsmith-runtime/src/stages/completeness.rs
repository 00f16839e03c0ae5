//! Completeness: is the clip a whole thought? Runs after every span extender
//! and locks the span once scored.

use async_trait::async_trait;

use clipsmith_consensus::{RobustMean, StagePayload};
use clipsmith_core::{stages, CandidateItem, PipelineConfig, Result, ScoreMethod, StageId};

use crate::prompts::StageTask;
use crate::stage::{BatchOutcome, RunContext, Stage, StageTraits};
use crate::stages::{ensemble, unexpected_payload};

/// Score name written by this stage.
pub const COMPLETENESS_SCORE: &str = "completeness";

const INSTRUCTIONS: &str = "For each item, score from 0 to 100 how complete it is as a \
stand-alone clip: a clear setup, no dangling question, and an ending that resolves.";

pub struct Completeness {
    id: StageId,
    batch_size: usize,
    trim: f64,
}

impl Completeness {
    pub fn new(config: &PipelineConfig) -> Self {
        Self {
            id: StageId::new(stages::COMPLETENESS),
            batch_size: config.batch_size,
            trim: config.trim_fraction,
        }
    }
}

#[async_trait]
impl Stage for Completeness {
    fn id(&self) -> &StageId {
        &self.id
    }

    fn version(&self) -> u32 {
        1
    }

    fn traits(&self) -> StageTraits {
        StageTraits {
            batch_size: self.batch_size,
            completeness_dependent: true,
            ..Default::default()
        }
    }

    async fn apply(&self, batch: &mut [CandidateItem], ctx: &RunContext) -> Result<BatchOutcome> {
        let task = StageTask::scores(
            self.id.as_str(),
            self.version(),
            INSTRUCTIONS,
            batch,
            &ctx.principles,
        );
        let result = ensemble(ctx, &self.id, &task, &RobustMean { trim: self.trim }).await?;
        let StagePayload::Scores { items: scores } = &result.payload else {
            return Err(unexpected_payload(&self.id, &result));
        };

        let mut outcome = BatchOutcome::from_consensus(&result);
        for item in batch.iter_mut() {
            let Some(score) = scores.iter().find(|s| s.item_id == *item.id()) else {
                outcome.fail(item.id(), "no completeness score returned");
                continue;
            };
            let spread = result.disagreement_for(item.id());
            item.set_score(
                &self.id,
                COMPLETENESS_SCORE,
                score.score,
                ScoreMethod::Ensemble,
                spread,
            );
            item.lock_span(&self.id);
        }
        Ok(outcome)
    }
}
