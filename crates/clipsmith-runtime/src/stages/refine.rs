//! Boundary refinement: the ensemble proposes exact start/end times per item,
//! reconciled by trimmed mean.

use async_trait::async_trait;
use tracing::debug;

use clipsmith_consensus::{RobustMean, StagePayload};
use clipsmith_core::{stages, CandidateItem, PipelineConfig, Result, Span, StageId};

use crate::prompts::StageTask;
use crate::stage::{BatchOutcome, RunContext, Stage, StageTraits};
use crate::stages::{ensemble, unexpected_payload};

pub struct RefineBoundaries {
    id: StageId,
    batch_size: usize,
    trim: f64,
}

impl RefineBoundaries {
    pub fn new(config: &PipelineConfig) -> Self {
        Self {
            id: StageId::new(stages::REFINE_BOUNDARIES),
            batch_size: config.batch_size,
            trim: config.trim_fraction,
        }
    }
}

#[async_trait]
impl Stage for RefineBoundaries {
    fn id(&self) -> &StageId {
        &self.id
    }

    fn version(&self) -> u32 {
        1
    }

    fn traits(&self) -> StageTraits {
        StageTraits {
            batch_size: self.batch_size,
            extends_span: true,
            ..Default::default()
        }
    }

    fn applies_to(&self, item: &CandidateItem) -> bool {
        !item.is_span_locked()
    }

    async fn apply(&self, batch: &mut [CandidateItem], ctx: &RunContext) -> Result<BatchOutcome> {
        let task = StageTask::boundaries(
            self.id.as_str(),
            self.version(),
            batch,
            &ctx.transcript,
            &ctx.principles,
        );
        let result = ensemble(ctx, &self.id, &task, &RobustMean { trim: self.trim }).await?;
        let StagePayload::Boundaries { items: votes } = &result.payload else {
            return Err(unexpected_payload(&self.id, &result));
        };

        let mut outcome = BatchOutcome::from_consensus(&result);
        let duration = ctx.transcript.duration();
        for item in batch.iter_mut() {
            let Some(vote) = votes.iter().find(|v| v.item_id == *item.id()) else {
                outcome.fail(item.id(), "no boundaries returned");
                continue;
            };
            let start = vote.start.max(0.0);
            let end = if duration > 0.0 {
                vote.end.min(duration)
            } else {
                vote.end
            };
            let span = match Span::new(start, end) {
                Ok(span) => span,
                Err(e) => {
                    outcome.fail(item.id(), e.to_string());
                    continue;
                }
            };
            if span == item.span() {
                continue;
            }
            let segments = ctx.transcript.slice(&span);
            if segments.is_empty() {
                outcome.fail(item.id(), "refined span holds no transcript");
                continue;
            }
            debug!(
                item_id = %item.id(),
                "Refined {} -> {} (spread {:.2})",
                item.span(),
                span,
                result.disagreement_for(item.id()).unwrap_or(0.0)
            );
            if let Err(e) = item.set_span(&self.id, span, segments) {
                outcome.fail(item.id(), e.to_string());
            }
        }
        Ok(outcome)
    }
}
